use serde::{Deserialize, Serialize};

use crate::types::item::ConcurrencyScope;

/// Current constraint configuration of a partition, as known to the host.
///
/// A zero concurrency means "unset" and falls back to the enclosing scope;
/// a negative value disables the check.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionConstraintConfig {
    #[serde(default)]
    pub function_version: i32,
    #[serde(default)]
    pub concurrency: ConcurrencyConstraints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleConstraint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConcurrencyConstraints {
    #[serde(default)]
    pub system_concurrency: i64,
    #[serde(default)]
    pub account_concurrency: i64,
    #[serde(default)]
    pub function_concurrency: i64,
    #[serde(default)]
    pub account_run_concurrency: i64,
    #[serde(default)]
    pub function_run_concurrency: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_concurrency_keys: Vec<CustomConcurrencyLimit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomConcurrencyLimit {
    pub scope: ConcurrencyScope,
    pub hashed_key_expression: String,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConstraint {
    pub limit: i64,
    #[serde(default)]
    pub burst: i64,
    /// Period in seconds
    pub period: i64,
    pub throttle_key_expression_hash: String,
}

impl PartitionConstraintConfig {
    pub fn with_account_concurrency(mut self, limit: i64) -> Self {
        self.concurrency.account_concurrency = limit;
        self
    }

    pub fn with_function_concurrency(mut self, limit: i64) -> Self {
        self.concurrency.function_concurrency = limit;
        self
    }

    pub fn with_system_concurrency(mut self, limit: i64) -> Self {
        self.concurrency.system_concurrency = limit;
        self
    }

    pub fn with_custom_key(mut self, scope: ConcurrencyScope, hashed_key_expression: impl Into<String>, limit: i64) -> Self {
        self.concurrency.custom_concurrency_keys.push(CustomConcurrencyLimit {
            scope,
            hashed_key_expression: hashed_key_expression.into(),
            limit,
        });
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleConstraint) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Limit configured for a custom key expression.
    pub fn custom_key_limit(&self, scope: ConcurrencyScope, hashed_key_expression: &str) -> Option<i64> {
        self.concurrency
            .custom_concurrency_keys
            .iter()
            .find(|k| k.scope == scope && k.hashed_key_expression == hashed_key_expression)
            .map(|k| k.limit)
    }
}
