//! Combines an item with the partition's constraint configuration into the
//! set of limits a lease must respect.

use crate::config::constants::NO_CONCURRENCY_LIMIT;
use crate::gcra::GcraParams;
use crate::keys::KeyGenerator;
use crate::types::{PartitionConstraintConfig, QueueItem};

/// Limit of one custom concurrency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCustomKey {
    /// Evaluated item key, `<scope>:<scope-id>:<value-hash>`
    pub key: String,
    /// In-progress set key
    pub in_progress_key: String,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedThrottle {
    pub key: String,
    pub params: GcraParams,
    /// The item's throttle was built from an older key expression
    pub outdated: bool,
}

/// Binding limits for one item. `-1` disables a concurrency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConstraints {
    pub is_system: bool,
    pub account_key: Option<String>,
    pub account_limit: i64,
    pub partition_key: String,
    pub partition_limit: i64,
    pub custom: [Option<ResolvedCustomKey>; 2],
    pub throttle: Option<ResolvedThrottle>,
}

/// Per-item key limit overrides supplied by a refresher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomKeyLimit {
    pub key: String,
    pub limit: i64,
}

/// Zero means unset and takes the fallback; negative disables the check.
fn effective(limit: i64, fallback: i64) -> i64 {
    match limit {
        l if l < 0 => NO_CONCURRENCY_LIMIT,
        0 => fallback,
        l => l,
    }
}

/// Account and partition limits of a partition, before any item is known.
/// System partitions have no account limit.
pub fn partition_limits(
    config: &PartitionConstraintConfig,
    is_system: bool,
    default_concurrency: i64,
) -> (i64, i64) {
    let concurrency = &config.concurrency;
    if is_system {
        return (
            NO_CONCURRENCY_LIMIT,
            effective(concurrency.system_concurrency, default_concurrency),
        );
    }
    let account_limit = effective(concurrency.account_concurrency, default_concurrency);
    let function_fallback = if account_limit < 0 {
        default_concurrency
    } else {
        account_limit
    };
    (
        account_limit,
        effective(concurrency.function_concurrency, function_fallback),
    )
}

impl ResolvedConstraints {
    pub fn resolve(
        kg: &KeyGenerator,
        item: &QueueItem,
        config: &PartitionConstraintConfig,
        default_concurrency: i64,
        overrides: &[CustomKeyLimit],
    ) -> Self {
        let partition_id = item.partition_id();

        if item.is_system() {
            return Self {
                is_system: true,
                account_key: None,
                account_limit: NO_CONCURRENCY_LIMIT,
                partition_key: kg.in_progress_partition(&partition_id),
                partition_limit: partition_limits(config, true, default_concurrency).1,
                custom: [None, None],
                throttle: None,
            };
        }

        let (account_limit, partition_limit) = partition_limits(config, false, default_concurrency);

        let mut custom: [Option<ResolvedCustomKey>; 2] = [None, None];
        for (slot, key) in custom.iter_mut().zip(item.data.custom_concurrency_keys.iter()) {
            let configured = key
                .scope()
                .and_then(|scope| config.custom_key_limit(scope, &key.hash));
            let refreshed = overrides.iter().find(|o| o.key == key.key).map(|o| o.limit);
            let limit = refreshed.or(configured).unwrap_or(key.limit);
            *slot = Some(ResolvedCustomKey {
                key: key.key.clone(),
                in_progress_key: kg.in_progress_custom(&key.key),
                limit: if limit > 0 { limit } else { NO_CONCURRENCY_LIMIT },
            });
        }

        let throttle = match (&item.data.throttle, item.is_start()) {
            (Some(t), true) => {
                let (params, outdated) = match &config.throttle {
                    Some(c) => (
                        GcraParams::from_constraint(c),
                        t.key_expression_hash.as_deref() != Some(c.throttle_key_expression_hash.as_str()),
                    ),
                    None => (GcraParams::from_throttle(t), false),
                };
                Some(ResolvedThrottle {
                    key: kg.throttle_key(Some(t)),
                    params,
                    outdated,
                })
            }
            _ => None,
        };

        Self {
            is_system: false,
            account_key: Some(kg.in_progress_account(item.account_id())),
            account_limit,
            partition_key: kg.in_progress_partition(&partition_id),
            partition_limit,
            custom,
            throttle,
        }
    }

    /// Limit of the partition's own in-progress set.
    pub fn function_limit(&self) -> i64 {
        self.partition_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ConcurrencyScope, CustomConcurrency, Identifier, Kind, Throttle, ThrottleConstraint,
    };
    use ulid::Ulid;
    use uuid::Uuid;

    fn item(kind: Kind) -> QueueItem {
        let ident = Identifier::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Ulid::new());
        QueueItem::new("i", ident, kind, 0)
    }

    #[test]
    fn test_unset_limits_fall_back() {
        let kg = KeyGenerator::default();
        let it = item(Kind::Edge);

        let r = ResolvedConstraints::resolve(&kg, &it, &PartitionConstraintConfig::default(), 1000, &[]);
        assert_eq!(r.account_limit, 1000);
        assert_eq!(r.partition_limit, 1000);

        let config = PartitionConstraintConfig::default().with_account_concurrency(20);
        let r = ResolvedConstraints::resolve(&kg, &it, &config, 1000, &[]);
        assert_eq!(r.account_limit, 20);
        assert_eq!(r.partition_limit, 20);

        let config = config.with_function_concurrency(-1);
        let r = ResolvedConstraints::resolve(&kg, &it, &config, 1000, &[]);
        assert_eq!(r.partition_limit, NO_CONCURRENCY_LIMIT);
    }

    #[test]
    fn test_system_items_skip_account_accounting() {
        let kg = KeyGenerator::default();
        let it = item(Kind::Pause).with_queue_name("pauses");
        let config = PartitionConstraintConfig::default().with_system_concurrency(3);

        let r = ResolvedConstraints::resolve(&kg, &it, &config, 1000, &[]);
        assert!(r.is_system);
        assert!(r.account_key.is_none());
        assert_eq!(r.account_limit, NO_CONCURRENCY_LIMIT);
        assert_eq!(r.partition_limit, 3);
        assert_eq!(r.partition_key, kg.in_progress_partition("pauses"));
    }

    #[test]
    fn test_custom_key_limit_precedence() {
        let kg = KeyGenerator::default();
        let mut it = item(Kind::Edge);
        let env = it.data.identifier.env_id;
        let key = CustomConcurrency::new(ConcurrencyScope::Env, env, "expr", "v", 7);
        it = it.with_custom_concurrency_key(key.clone());

        let r = ResolvedConstraints::resolve(&kg, &it, &PartitionConstraintConfig::default(), 1000, &[]);
        assert_eq!(r.custom[0].as_ref().unwrap().limit, 7);

        let overrides = vec![CustomKeyLimit { key: key.key.clone(), limit: 4 }];
        let r = ResolvedConstraints::resolve(&kg, &it, &PartitionConstraintConfig::default(), 1000, &overrides);
        assert_eq!(r.custom[0].as_ref().unwrap().limit, 4);

        let config = PartitionConstraintConfig::default().with_custom_key(ConcurrencyScope::Env, "expr", 2);
        let r = ResolvedConstraints::resolve(&kg, &it, &config, 1000, &[]);
        assert_eq!(r.custom[0].as_ref().unwrap().limit, 2);

        // A refreshed limit wins over the configured one
        let r = ResolvedConstraints::resolve(&kg, &it, &config, 1000, &overrides);
        assert_eq!(r.custom[0].as_ref().unwrap().limit, 4);
        assert_eq!(r.custom[0].as_ref().unwrap().in_progress_key, kg.in_progress_custom(&key.key));
        assert!(r.custom[1].is_none());
    }

    #[test]
    fn test_throttle_prefers_configuration() {
        let kg = KeyGenerator::default();
        let it = item(Kind::Start).with_throttle(Throttle::new("k", 1, 0, 60));

        let r = ResolvedConstraints::resolve(&kg, &it, &PartitionConstraintConfig::default(), 1000, &[]);
        let throttle = r.throttle.unwrap();
        assert_eq!(throttle.params, GcraParams::new(1, 0, 60));
        assert!(!throttle.outdated);

        let config = PartitionConstraintConfig::default().with_throttle(ThrottleConstraint {
            limit: 10,
            burst: 1,
            period: 30,
            throttle_key_expression_hash: "h".to_string(),
        });
        let throttle = ResolvedConstraints::resolve(&kg, &it, &config, 1000, &[]).throttle.unwrap();
        assert_eq!(throttle.params, GcraParams::new(10, 1, 30));
        assert!(throttle.outdated);
        assert_eq!(throttle.key, "{queue}:throttle:k");
    }

    #[test]
    fn test_throttle_only_applies_to_starts() {
        let kg = KeyGenerator::default();
        let it = item(Kind::Edge).with_throttle(Throttle::new("k", 1, 0, 60));
        let r = ResolvedConstraints::resolve(&kg, &it, &PartitionConstraintConfig::default(), 1000, &[]);
        assert!(r.throttle.is_none());
    }
}
