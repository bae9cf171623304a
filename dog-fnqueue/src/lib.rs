//! # dog-fnqueue: Multi-tenant function execution queue
//!
//! **Leased, constraint-checked work items over a sorted-set store**
//!
//! dog-fnqueue schedules function runs for many tenants on top of a
//! key-value store with sorted sets. Every state change runs as one atomic
//! script, so any number of workers can share a store without in-process
//! locking.
//!
//! ## Features
//!
//! - **Partitions**: one ready set per function or system queue, with a
//!   global and per-account pointer for fair selection
//! - **Leases**: time-ordered lease ids whose timestamp is the expiry, for
//!   items, partitions, shadow partitions and singleton config roles
//! - **Constraints**: account, function and custom-key concurrency plus
//!   GCRA throttles, enforced at lease time
//! - **Key queues**: backlogs sharded by throttle and custom key that are
//!   refilled into the ready set as capacity frees up
//! - **Recovery**: a scavenger requeues items whose worker disappeared
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use dog_fnqueue::prelude::*;
//! use ulid::Ulid;
//! use uuid::Uuid;
//!
//! # async fn run() -> QueueResult<()> {
//! let queue = Queue::new(Arc::new(MemoryStore::new()));
//!
//! let ident = Identifier::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Ulid::new());
//! let item = QueueItem::new("job-1", ident, Kind::Start, 0);
//! let enqueued = queue.enqueue(item, queue.now_ms(), EnqueueOptions::default()).await?;
//!
//! let partition = QueuePartition::for_item(&enqueued.item);
//! for item in queue.peek(&partition, queue.now_ms(), 10).await? {
//!     let lease = queue.lease(&item, Duration::from_secs(30), LeaseOptions::default()).await?;
//!     // run the function, then
//!     queue.dequeue(&item).await?;
//!     # let _ = lease;
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod constraints;
pub mod continuations;
pub mod decode;
pub mod deny;
pub mod error;
pub mod ewma;
pub mod gcra;
pub mod keys;
pub mod observability;
pub mod processor;
pub mod queue;
pub mod scavenger;
pub mod shuffle;
pub mod store;
pub mod types;

pub(crate) mod scripts;

// Re-export core types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use deny::LeaseDenies;
pub use error::{MultiError, QueueError, QueueResult};
pub use keys::{KeyGenerator, KeyScope};
pub use observability::{MetricsSnapshot, QueueMetrics};
pub use processor::{LeasedItem, ShadowPass};
pub use queue::{
    BacklogRefill, ConfigLeaseHolder, ConfigLeaseRole, EnqueueOptions, Enqueued, LeaseOptions,
    PartitionLease, Queue, RefillConstraint, ShadowPartitionPeek,
};
pub use scavenger::Scavenger;
pub use store::{Store, StoreError, StoreResult, Txn};
pub use types::*;

#[cfg(feature = "memory")]
pub use store::MemoryStore;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Clock, EnqueueOptions, Enqueued, Identifier, Kind, LeaseDenies, LeaseOptions, LeasedItem,
        ManualClock, Queue, QueueConfig, QueueError, QueueItem, QueuePartition, QueueResult,
        QueueShadowPartition, Scavenger, Store, Throttle,
    };

    #[cfg(feature = "memory")]
    pub use crate::MemoryStore;

    pub use crate::collaborators::{
        CapacityManager, PartitionConstraintConfigGetter, QueueLifecycleListener,
    };

    pub use async_trait::async_trait;
}
