use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ulid::Ulid;
use uuid::Uuid;

use dog_fnqueue::collaborators::{
    CapacityAcquireRequest, CapacityAcquireResponse, CapacityCheckRequest, CapacityCheckResponse,
    CapacityExtendLeaseRequest, CapacityGrant, CapacityManager, CapacityReleaseRequest,
    RefreshItemThrottle,
};
use dog_fnqueue::prelude::async_trait;
use dog_fnqueue::{
    lease_expiry_ms, new_lease_id, CapacityLease, ConfigLeaseHolder, ConfigLeaseRole,
    EnqueueOptions, Identifier, KeyScope, Kind, LeaseOptions, ManualClock, MemoryStore,
    PartitionConstraintConfig, Queue, QueueConfig, QueueError, QueueItem, QueuePartition,
    QueueResult, Store, Throttle,
};

const LEASE: Duration = Duration::from_secs(30);

/// Test factory functions
fn create_test_queue(config: QueueConfig) -> (Arc<ManualClock>, Arc<MemoryStore>, Queue<MemoryStore>) {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let queue = Queue::with_config(store.clone(), config).with_clock(clock.clone());
    (clock, store, queue)
}

fn create_test_item(id: &str, function_id: Uuid) -> QueueItem {
    let ident = Identifier::new(Uuid::new_v4(), Uuid::new_v4(), function_id, Ulid::new());
    QueueItem::new(id, ident, Kind::Edge, 0)
}

async fn enqueue(queue: &Queue<MemoryStore>, item: QueueItem, at_ms: i64) -> QueueItem {
    queue
        .enqueue(item, at_ms, EnqueueOptions::default())
        .await
        .unwrap()
        .item
}

// ============================================================================
// Item lifecycle
// ============================================================================

/// I1. Dequeued Ids Cannot Be Enqueued Again
#[tokio::test]
async fn test_enqueue_is_idempotent() {
    let (_clock, _store, queue) = create_test_queue(QueueConfig::default());
    let function = Uuid::new_v4();

    // Arrange: run one item to completion
    let item = enqueue(&queue, create_test_item("job-1", function), 0).await;
    queue.lease(&item, LEASE, LeaseOptions::default()).await.unwrap();
    queue.dequeue(&item).await.unwrap();

    // Act: enqueue the same job id
    let again = queue
        .enqueue(create_test_item("job-1", function), 0, EnqueueOptions::default())
        .await;

    // Assert: the idempotency key rejects it
    assert!(matches!(again, Err(QueueError::ItemExists)));
}

/// I2. Live Items Cannot Be Enqueued Twice
#[tokio::test]
async fn test_enqueue_rejects_duplicate() {
    let (_clock, _store, queue) = create_test_queue(QueueConfig::default());
    let function = Uuid::new_v4();
    enqueue(&queue, create_test_item("job-1", function), 0).await;

    let again = queue
        .enqueue(create_test_item("job-1", function), 0, EnqueueOptions::default())
        .await;

    assert!(matches!(again, Err(QueueError::ItemExists)));
}

/// I3. A Held Lease Cannot Be Taken
#[tokio::test]
async fn test_lease_held_item() {
    let (clock, _store, queue) = create_test_queue(QueueConfig::default());
    let item = enqueue(&queue, create_test_item("i1", Uuid::new_v4()), 0).await;
    queue.lease(&item, Duration::from_secs(5), LeaseOptions::default()).await.unwrap();

    // Act + Assert: a second worker is turned away
    let second = queue.lease(&item, LEASE, LeaseOptions::default()).await;
    assert!(matches!(second, Err(QueueError::ItemAlreadyLeased)));
    assert_eq!(queue.metrics().snapshot().lease_contention, 1);

    // Act + Assert: once expired anyone may lease it
    clock.set(6_000);
    assert!(queue.lease(&item, LEASE, LeaseOptions::default()).await.is_ok());
}

/// I4. Lease Durations Are Bounded
#[tokio::test]
async fn test_lease_duration_limit() {
    let (_clock, store, queue) = create_test_queue(QueueConfig::default());
    let item = enqueue(&queue, create_test_item("i1", Uuid::new_v4()), 0).await;

    let result = queue.lease(&item, Duration::from_secs(31), LeaseOptions::default()).await;

    assert!(matches!(
        result,
        Err(QueueError::LeaseDurationExceedsLimits { duration_ms: 31_000, max_ms: 30_000 })
    ));
    assert_eq!(store.script_calls("lease"), 0);
}

/// I5. Requeue Releases The Lease And Reschedules
#[tokio::test]
async fn test_requeue_reschedules() {
    let (_clock, store, queue) = create_test_queue(QueueConfig::default());
    let item = enqueue(&queue, create_test_item("i1", Uuid::new_v4()), 0).await;
    let partition = QueuePartition::for_item(&item);
    queue.lease(&item, LEASE, LeaseOptions::default()).await.unwrap();

    // Act: requeue twice
    queue.requeue(&item, 5_000).await.unwrap();
    queue.requeue(&item, 7_000).await.unwrap();

    // Assert: unleased, due at the latest time, not in progress
    let stored = queue.item_by_id(&item.id).await.unwrap().unwrap();
    assert_eq!(stored.lease_id, None);
    assert_eq!(stored.at_ms, 7_000);
    assert!(queue.peek(&partition, 6_000, 10).await.unwrap().is_empty());
    assert_eq!(queue.peek(&partition, 7_000, 10).await.unwrap().len(), 1);

    let in_progress = queue.keys().in_progress_partition(&partition.id);
    let leased = store
        .atomic("testZCard", move |tx| tx.zcard(&in_progress))
        .await
        .unwrap();
    assert_eq!(leased, 0);
}

/// I6. Removed Items Are Not Found
#[tokio::test]
async fn test_missing_item_operations() {
    let (_clock, _store, queue) = create_test_queue(QueueConfig::default());
    let item = create_test_item("ghost", Uuid::new_v4());

    assert!(matches!(queue.requeue(&item, 0).await, Err(QueueError::ItemNotFound)));
    assert!(matches!(queue.dequeue(&item).await, Err(QueueError::ItemNotFound)));
    assert!(matches!(
        queue.lease(&item, LEASE, LeaseOptions::default()).await,
        Err(QueueError::ItemNotFound)
    ));
    assert!(queue.dequeue_by_job_id("ghost").await.is_ok());
    assert!(!queue.remove_queue_item("ghost").await.unwrap());
}

/// I7. Run Index Tracks Outstanding Jobs
#[tokio::test]
async fn test_run_jobs() {
    let (_clock, _store, queue) = create_test_queue(QueueConfig::default());
    let ident = Identifier::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Ulid::new());

    // Arrange: two jobs of one run
    let first = enqueue(&queue, QueueItem::new("a", ident, Kind::Start, 0), 100).await;
    enqueue(&queue, QueueItem::new("b", ident, Kind::Edge, 0), 200).await;

    // Assert: listed earliest first
    let jobs = queue.run_jobs(ident.run_id, 10, 0).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id, first.id);
    assert_eq!(queue.outstanding_job_count(ident.run_id).await.unwrap(), 2);

    // Act: finish one by job id
    queue.dequeue_by_job_id("a").await.unwrap();

    // Assert: one left
    assert_eq!(queue.outstanding_job_count(ident.run_id).await.unwrap(), 1);
    assert_eq!(queue.run_jobs(ident.run_id, 10, 1).await.unwrap().len(), 0);
}

// ============================================================================
// Limits and routing
// ============================================================================

/// I8. Peek Limits Are Enforced
#[tokio::test]
async fn test_peek_limits() {
    let (_clock, _store, queue) = create_test_queue(QueueConfig::default());
    let item = enqueue(&queue, create_test_item("i1", Uuid::new_v4()), 0).await;
    let partition = QueuePartition::for_item(&item);

    assert!(matches!(
        queue.peek(&partition, 0, 5_001).await,
        Err(QueueError::PeekMaxExceedsLimits { .. })
    ));
    assert!(matches!(
        queue.partition_peek(true, 0, 301).await,
        Err(QueueError::PartitionPeekMaxExceedsLimits { .. })
    ));
    assert!(matches!(
        queue.account_peek(true, 0, 31).await,
        Err(QueueError::AccountPeekMaxExceedsLimits { .. })
    ));

    // A negative limit peeks one item
    assert_eq!(queue.peek(&partition, 0, -1).await.unwrap().len(), 1);
}

/// I9. Owned Items Only
#[tokio::test]
async fn test_unknown_shard() {
    let (_clock, _store, queue) = create_test_queue(QueueConfig::default());
    let queue = queue.with_shard_selector(Arc::new(|_: Uuid, _: Option<&str>| "east".to_string()));

    let result = queue
        .enqueue(create_test_item("i1", Uuid::new_v4()), 0, EnqueueOptions::default())
        .await;

    match result {
        Err(QueueError::UnknownShard { shard, primary }) => {
            assert_eq!(shard, "east");
            assert_eq!(primary, "default");
        }
        other => panic!("expected UnknownShard, got {:?}", other.map(|e| e.item.id)),
    }
}

/// I10. Item Kinds Can Be Routed To System Queues
#[tokio::test]
async fn test_queue_kind_mapping() {
    let mut config = QueueConfig::default();
    config
        .queue_kind_mapping
        .insert("edge".to_string(), "edges".to_string());
    let (_clock, _store, queue) = create_test_queue(config);

    let item = enqueue(&queue, create_test_item("i1", Uuid::new_v4()), 0).await;

    assert_eq!(item.queue_name.as_deref(), Some("edges"));
    assert_eq!(item.partition_id(), "edges");
    let partition = queue.partition_by_id("edges").await.unwrap().unwrap();
    assert!(partition.is_system());
}

/// I11. Denied Queues Are Left Out Of Partition Peeks
#[tokio::test]
async fn test_deny_queues() {
    let allowed_fn = Uuid::new_v4();
    let denied_fn = Uuid::new_v4();
    let config = QueueConfig {
        deny_queues: vec![denied_fn.to_string()],
        ..Default::default()
    };
    let (_clock, _store, queue) = create_test_queue(config);
    enqueue(&queue, create_test_item("a", allowed_fn), 0).await;
    enqueue(&queue, create_test_item("b", denied_fn), 0).await;

    let peeked = queue.partition_peek(true, 1_000, 100).await.unwrap();

    assert_eq!(peeked.len(), 1);
    assert_eq!(peeked[0].id, allowed_fn.to_string());
}

/// I12. Priorities Stay Within Bounds
#[tokio::test]
async fn test_partition_reprioritize() {
    let (_clock, _store, queue) = create_test_queue(QueueConfig::default());
    let item = enqueue(&queue, create_test_item("i1", Uuid::new_v4()), 0).await;
    let pid = item.partition_id();

    assert!(matches!(
        queue.partition_reprioritize(&pid, -1).await,
        Err(QueueError::PriorityTooHigh(-1))
    ));
    assert!(matches!(
        queue.partition_reprioritize(&pid, 10).await,
        Err(QueueError::PriorityTooLow(10))
    ));
    assert!(matches!(
        queue.partition_reprioritize("missing", 3).await,
        Err(QueueError::PartitionNotFound)
    ));

    queue.partition_reprioritize(&pid, 2).await.unwrap();
    let partition = queue.partition_by_id(&pid).await.unwrap().unwrap();
    assert_eq!(partition.priority, 2);
}

// ============================================================================
// Config leases
// ============================================================================

/// I13. One Holder Per Config Lease Role
#[tokio::test]
async fn test_config_lease_singleton() {
    let (clock, _store, queue) = create_test_queue(QueueConfig::default());
    let a = ConfigLeaseHolder::new(ConfigLeaseRole::Scavenger);
    let b = ConfigLeaseHolder::new(ConfigLeaseRole::Scavenger);
    let ttl = Duration::from_secs(10);

    // Act + Assert: the first worker wins, the second is refused
    assert!(a.renew(&queue, ttl).await.unwrap());
    assert!(!b.renew(&queue, ttl).await.unwrap());
    assert!(b.current().is_none());

    // Act + Assert: the holder renews, then loses it after expiry
    clock.set(5_000);
    assert!(a.renew(&queue, ttl).await.unwrap());
    clock.set(16_000);
    assert!(b.renew(&queue, ttl).await.unwrap());
    assert!(b.is_held(16_000));

    // Verify the maximum duration
    let too_long = queue
        .config_lease(ConfigLeaseRole::Sequential, Duration::from_secs(21), None)
        .await;
    assert!(matches!(too_long, Err(QueueError::ConfigLeaseExceedsLimits { max_ms: 20_000 })));
}

// ============================================================================
// Processing
// ============================================================================

/// I14. Paused Functions Are Pushed Back
#[tokio::test]
async fn test_paused_partition() {
    let (_clock, _store, queue) = create_test_queue(QueueConfig::default());
    let function = Uuid::new_v4();
    let item = enqueue(&queue, create_test_item("i1", function), 0).await;
    let partition = queue.partition_by_id(&item.partition_id()).await.unwrap().unwrap();

    // Arrange: pause the function
    queue.set_function_paused(function, true).await.unwrap();

    // Assert: the partition cannot be leased
    let lease = queue.partition_lease(&partition, Duration::from_secs(4)).await;
    assert!(matches!(lease, Err(QueueError::PartitionPaused)));

    // Act: a processing pass
    let leased = queue.process_partition(&partition, 0).await.unwrap();

    // Assert: nothing leased, partition requeued minutes ahead
    assert!(leased.is_empty());
    assert!(queue.partition_peek(true, 1_000, 100).await.unwrap().is_empty());
    assert_eq!(queue.partition_peek(true, 300_000, 100).await.unwrap().len(), 1);
}

/// I15. Processing A Partition Leases Its Due Items
#[tokio::test]
async fn test_process_partition() {
    let (_clock, _store, queue) = create_test_queue(QueueConfig::default());
    let function = Uuid::new_v4();
    enqueue(&queue, create_test_item("a", function), 0).await;
    enqueue(&queue, create_test_item("b", function), 0).await;
    enqueue(&queue, create_test_item("later", function), 60_000).await;
    let pid = function.to_string();
    let partition = queue.partition_by_id(&pid).await.unwrap().unwrap();

    // Act
    let leased = queue.process_partition(&partition, 0).await.unwrap();

    // Assert: the due items are leased, the partition continues
    assert_eq!(leased.len(), 2);
    assert!(leased.iter().all(|l| l.item.lease_id == Some(l.lease_id)));
    let continuation = queue.continuations().get(&pid).unwrap();
    assert_eq!(continuation.count, 1);
    assert_eq!(queue.metrics().snapshot().items_leased, 2);

    // Verify the partition lease was released
    assert!(queue.partition_lease(&partition, Duration::from_secs(4)).await.is_ok());
}

/// I16. Scanning Processes Every Due Partition
#[tokio::test]
async fn test_scan_partitions() {
    let (_clock, _store, queue) = create_test_queue(QueueConfig::default());
    for id in ["a", "b", "c"] {
        enqueue(&queue, create_test_item(id, Uuid::new_v4()), 0).await;
    }

    let leased = queue.scan_partitions(false).await.unwrap();

    assert_eq!(leased.len(), 3);
    assert_eq!(queue.continuations().len(), 3);
}

/// I17. Valid Leases Are Not Scavenged
#[tokio::test]
async fn test_scavenger_keeps_valid_leases() {
    let (clock, _store, queue) = create_test_queue(QueueConfig::default());
    let item = enqueue(&queue, create_test_item("i1", Uuid::new_v4()), 0).await;
    let lease_id = queue.lease(&item, LEASE, LeaseOptions::default()).await.unwrap();

    clock.set(10_000);
    assert_eq!(queue.scavenge(100).await.unwrap(), 0);

    let stored = queue.item_by_id(&item.id).await.unwrap().unwrap();
    assert_eq!(stored.lease_id, Some(lease_id));
}

/// I18. Requeueing Twice Leaves One Entry
#[tokio::test]
async fn test_requeue_is_idempotent() {
    let (_clock, store, queue) = create_test_queue(QueueConfig::default());
    let item = enqueue(&queue, create_test_item("i1", Uuid::new_v4()), 0).await;
    let ready_set = queue.keys().ready_set(&item.partition_id());

    // Act: the same requeue, twice
    queue.requeue(&item, 5_000).await.unwrap();
    queue.requeue(&item, 5_000).await.unwrap();

    // Assert: one ready entry at the requeued time
    let (count, score) = {
        let (key, id) = (ready_set.clone(), item.id.clone());
        store
            .atomic("testReady", move |tx| Ok((tx.zcard(&key)?, tx.zscore(&key, &id)?)))
            .await
            .unwrap()
    };
    assert_eq!(count, 1);
    assert_eq!(score, Some(5_000));
}

/// Triggering event store that has lost every event
struct EventGone;

#[async_trait]
impl RefreshItemThrottle for EventGone {
    async fn refresh(&self, _item: &QueueItem) -> QueueResult<Option<Throttle>> {
        Err(QueueError::EventNotFound)
    }
}

/// I19. Requeueing An Item Whose Event Is Gone Drops It
#[tokio::test]
async fn test_requeue_without_event() {
    let (_clock, _store, queue) = create_test_queue(QueueConfig::default());
    let queue = queue
        .with_allow_key_queues(Arc::new(|_: Uuid| true))
        .with_refresh_item_throttle(Arc::new(EventGone));
    let ident = Identifier::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Ulid::new());
    let item = QueueItem::new("i1", ident, Kind::Start, 0).with_throttle(Throttle::new("k", 1, 0, 60));
    let item = enqueue(&queue, item, 0).await;

    // Act + Assert: the item is dequeued instead
    queue.requeue(&item, 5_000).await.unwrap();
    assert!(queue.item_by_id(&item.id).await.unwrap().is_none());

    // Act + Assert: a repeat finds nothing and still succeeds
    assert!(queue.requeue(&item, 5_000).await.is_ok());
}

/// I20. Idempotency Window Comes From The Host First
#[tokio::test]
async fn test_idempotency_ttl_fn() {
    let (clock, _store, queue) = create_test_queue(QueueConfig::default());
    let queue = queue.with_idempotency_ttl_fn(Arc::new(|item: &QueueItem| {
        (item.data.kind == Kind::Edge).then_some(Duration::from_secs(1))
    }));
    let function = Uuid::new_v4();

    // Arrange: finish an edge with a one second window
    let item = enqueue(&queue, create_test_item("job-1", function), 0).await;
    queue.dequeue(&item).await.unwrap();

    // Assert: rejected inside the window
    let again = queue
        .enqueue(create_test_item("job-1", function), 0, EnqueueOptions::default())
        .await;
    assert!(matches!(again, Err(QueueError::ItemExists)));

    // Assert: accepted once it passed, well before the default window
    clock.set(2_000);
    assert!(queue
        .enqueue(create_test_item("job-1", function), 2_000, EnqueueOptions::default())
        .await
        .is_ok());
}

/// I21. Removing An Item Clears Its Constraint State
#[tokio::test]
async fn test_remove_leased_item() {
    let (_clock, store, queue) = create_test_queue(QueueConfig::default());
    let item = enqueue(&queue, create_test_item("i1", Uuid::new_v4()), 0).await;
    let pid = item.partition_id();
    queue.lease(&item, LEASE, LeaseOptions::default()).await.unwrap();

    // Act
    assert!(queue.remove_queue_item(&item.id).await.unwrap());

    // Assert: no in-progress, scavenger, concurrency or active entry is left
    let kg = queue.keys().clone();
    let left = store
        .atomic("testRemoved", move |tx| {
            Ok((
                tx.zcard(&kg.in_progress_partition(&pid))?,
                tx.zcard(&kg.partition_scavenger_index(&pid))?,
                tx.zscore(&kg.concurrency_index(), &pid)?,
                tx.scard(&kg.active_set(KeyScope::Partition, &pid))?,
            ))
        })
        .await
        .unwrap();
    assert_eq!(left, (0, 0, None, 0));
    assert!(queue.item_by_id(&item.id).await.unwrap().is_none());
}

// ============================================================================
// Partition selection
// ============================================================================

/// I22. Pushed-Forward Partitions Are Not Peeked Early
#[tokio::test]
async fn test_partition_peek_skips_forced_partitions() {
    let (_clock, store, queue) = create_test_queue(QueueConfig::default());
    let item = enqueue(&queue, create_test_item("i1", Uuid::new_v4()), 0).await;
    let partition = QueuePartition::for_item(&item);

    // Arrange: push the partition a minute ahead
    queue.partition_requeue(&partition, 60_000, true).await.unwrap();
    assert!(queue.partition_peek(true, 30_000, 100).await.unwrap().is_empty());

    // Arrange: another writer moves the pointer back to now
    let (index, pid) = (queue.keys().global_partition_index(), partition.id.clone());
    store
        .atomic("testLowerPointer", move |tx| tx.zadd(&index, &pid, 0))
        .await
        .unwrap();

    // Assert: still skipped until the forced time
    assert!(queue.partition_peek(true, 30_000, 100).await.unwrap().is_empty());
    let due = queue.partition_peek(true, 60_000, 100).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, partition.id);
}

/// I23. Higher Priority Partitions Are Picked First More Often
#[tokio::test]
async fn test_partition_peek_is_weighted() {
    let urgent = Uuid::new_v4();
    let (_clock, _store, queue) = create_test_queue(QueueConfig::default());
    let queue = queue.with_partition_priority_finder(Arc::new(move |p: &QueuePartition| {
        if p.function_id == Some(urgent) {
            0
        } else {
            9
        }
    }));
    enqueue(&queue, create_test_item("a", urgent), 0).await;
    enqueue(&queue, create_test_item("b", Uuid::new_v4()), 0).await;

    // Act: many independent peeks
    let mut urgent_first = 0;
    for _ in 0..400 {
        let peeked = queue.partition_peek(false, 1_000, 100).await.unwrap();
        assert_eq!(peeked.len(), 2);
        if peeked[0].function_id == Some(urgent) {
            urgent_first += 1;
        }
    }

    // Assert: weights 10 and 1 put it first about 10 times in 11
    assert!(urgent_first > 300, "urgent first {} times", urgent_first);
    assert!(urgent_first < 400, "order is not random");
}

// ============================================================================
// Capacity manager
// ============================================================================

/// Capacity manager that grants every request, or none, and records calls
#[derive(Default)]
struct FixedCapacity {
    grant: bool,
    extended: Mutex<Vec<Ulid>>,
    released: Mutex<Vec<String>>,
}

const RENEWED_UNTIL: i64 = 120_000;

#[async_trait]
impl CapacityManager for FixedCapacity {
    async fn acquire(&self, req: CapacityAcquireRequest) -> QueueResult<CapacityAcquireResponse> {
        if !self.grant {
            return Ok(CapacityAcquireResponse {
                leases: Vec::new(),
                retry_after_ms: Some(1_000),
            });
        }
        let leases = req
            .lease_idempotency_keys
            .into_iter()
            .map(|key| CapacityGrant {
                idempotency_key: key,
                lease_id: new_lease_id(60_000),
            })
            .collect();
        Ok(CapacityAcquireResponse {
            leases,
            retry_after_ms: None,
        })
    }

    async fn check(&self, _req: CapacityCheckRequest) -> QueueResult<CapacityCheckResponse> {
        Ok(CapacityCheckResponse {
            available: if self.grant { 10 } else { 0 },
        })
    }

    async fn extend_lease(&self, req: CapacityExtendLeaseRequest) -> QueueResult<Option<Ulid>> {
        self.extended.lock().push(req.lease_id);
        Ok(Some(new_lease_id(RENEWED_UNTIL)))
    }

    async fn release(&self, req: CapacityReleaseRequest) -> QueueResult<()> {
        self.released.lock().push(req.idempotency_key);
        Ok(())
    }
}

fn capacity_queue(grant: bool) -> (Arc<MemoryStore>, Arc<FixedCapacity>, Queue<MemoryStore>) {
    let (_clock, store, queue) = create_test_queue(QueueConfig::default());
    let manager = Arc::new(FixedCapacity {
        grant,
        ..Default::default()
    });
    let queue = queue.with_capacity_manager(
        manager.clone(),
        Arc::new(|_: Uuid, _: Uuid, _: Uuid| (true, false)),
    );
    (store, manager, queue)
}

async fn in_progress_count(store: &MemoryStore, queue: &Queue<MemoryStore>, pid: &str) -> usize {
    let key = queue.keys().in_progress_partition(pid);
    store
        .atomic("testZCard", move |tx| tx.zcard(&key))
        .await
        .unwrap()
}

/// I24. Capacity Manager Grants Are Stored On The Item
#[tokio::test]
async fn test_capacity_manager_grants() {
    let (store, _manager, queue) = capacity_queue(true);
    let function = Uuid::new_v4();
    enqueue(&queue, create_test_item("a", function), 0).await;
    enqueue(&queue, create_test_item("b", function), 0).await;
    let pid = function.to_string();
    let partition = queue.partition_by_id(&pid).await.unwrap().unwrap();

    // Act
    let leased = queue.process_partition(&partition, 0).await.unwrap();

    // Assert: both leased, tracked by the manager instead of the store
    assert_eq!(leased.len(), 2);
    for l in &leased {
        assert!(l.item.capacity_lease.is_some());
        let stored = queue.item_by_id(&l.item.id).await.unwrap().unwrap();
        assert_eq!(stored.capacity_lease, l.item.capacity_lease);
    }
    assert_eq!(in_progress_count(&store, &queue, &pid).await, 0);
}

/// I25. Without Granted Capacity Nothing Is Leased
#[tokio::test]
async fn test_capacity_manager_denies() {
    let (_store, _manager, queue) = capacity_queue(false);
    let function = Uuid::new_v4();
    enqueue(&queue, create_test_item("a", function), 0).await;
    let partition = queue.partition_by_id(&function.to_string()).await.unwrap().unwrap();

    let leased = queue.process_partition(&partition, 0).await.unwrap();

    assert!(leased.is_empty());
    assert!(queue.continuations().is_empty());
    assert_eq!(queue.metrics().snapshot().items_leased, 0);
}

/// I26. Capacity Leases Are Renewed And Released With The Item
#[tokio::test]
async fn test_capacity_lease_extend_and_release() {
    let (store, manager, queue) = capacity_queue(true);
    let function = Uuid::new_v4();
    enqueue(&queue, create_test_item("a", function), 0).await;
    let pid = function.to_string();
    let partition = queue.partition_by_id(&pid).await.unwrap().unwrap();
    let leased = queue.process_partition(&partition, 0).await.unwrap().remove(0);
    let granted = leased.item.capacity_lease.unwrap();

    // Act: extend the queue lease
    queue.extend_lease(&leased.item, leased.lease_id, LEASE).await.unwrap();

    // Assert: the manager renewed the reservation and the item keeps the new one
    assert_eq!(*manager.extended.lock(), vec![granted.lease_id]);
    let stored = queue.item_by_id(&leased.item.id).await.unwrap().unwrap();
    let renewed = stored.capacity_lease.unwrap();
    assert_ne!(renewed, granted);
    assert_eq!(lease_expiry_ms(&renewed.lease_id), RENEWED_UNTIL);
    assert!(stored.has_valid_capacity_lease(RENEWED_UNTIL - 10_000));
    assert_eq!(in_progress_count(&store, &queue, &pid).await, 0);

    // Act: finish the item
    queue.dequeue(&leased.item).await.unwrap();

    // Assert: the reservation went back to the manager
    assert_eq!(*manager.released.lock(), vec![leased.item.id.clone()]);
}

/// I27. Expiring Capacity Leases Fall Back To Local Checks
#[tokio::test]
async fn test_expiring_capacity_lease_is_not_trusted() {
    let (store, _manager, queue) = capacity_queue(true);
    let queue = queue.with_constraint_config_getter(Arc::new(|_: &str| {
        PartitionConstraintConfig::default().with_function_concurrency(1)
    }));
    let function = Uuid::new_v4();
    let first = enqueue(&queue, create_test_item("a", function), 0).await;
    let second = enqueue(&queue, create_test_item("b", function), 0).await;
    let expiring = || LeaseOptions {
        disable_constraint_checks: true,
        capacity_lease: Some(CapacityLease { lease_id: new_lease_id(1_000) }),
        ..Default::default()
    };

    // Act: lease both with a reservation that ends inside the buffer
    queue.lease(&first, LEASE, expiring()).await.unwrap();
    let blocked = queue.lease(&second, LEASE, expiring()).await;

    // Assert: the first is tracked locally, the second hits the limit
    let stored = queue.item_by_id(&first.id).await.unwrap().unwrap();
    assert!(stored.capacity_lease.is_none());
    assert_eq!(in_progress_count(&store, &queue, &first.partition_id()).await, 1);
    assert!(matches!(blocked, Err(QueueError::PartitionConcurrencyLimit { .. })));
}
