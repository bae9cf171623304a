use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ulid::Ulid;
use uuid::Uuid;

use dog_fnqueue::{
    ConcurrencyScope, CustomConcurrency, EnqueueOptions, Identifier, Kind, LeaseOptions,
    ManualClock, MemoryStore, PartitionConstraintConfig, Queue, QueueConfig, QueueItem,
    QueuePartition, QueueShadowPartition, RefillConstraint, Throttle,
};

const NOW: i64 = 10_000;

/// Test factory functions
fn create_key_queue(config: Arc<Mutex<PartitionConstraintConfig>>) -> (Arc<ManualClock>, Queue<MemoryStore>) {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let queue = Queue::with_config(store, QueueConfig::default())
        .with_clock(clock.clone())
        .with_allow_key_queues(Arc::new(|_: Uuid| true))
        .with_constraint_config_getter(Arc::new(move |_: &str| config.lock().clone()));
    (clock, queue)
}

fn shared_config(config: PartitionConstraintConfig) -> Arc<Mutex<PartitionConstraintConfig>> {
    Arc::new(Mutex::new(config))
}

fn create_test_item(id: &str, ident: Identifier) -> QueueItem {
    QueueItem::new(id, ident, Kind::Edge, 0)
}

fn identifier() -> Identifier {
    Identifier::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Ulid::new())
}

async fn only_shadow_partition(queue: &Queue<MemoryStore>) -> QueueShadowPartition {
    let mut partitions = queue.global_shadow_partition_peek(NOW + 2_000, 10).await.unwrap();
    assert_eq!(partitions.len(), 1);
    partitions.remove(0)
}

/// K1. Key Queue Items Wait In A Backlog Until Refilled
#[tokio::test]
async fn test_backlog_refill_moves_items_to_ready_set() {
    let (_clock, queue) = create_key_queue(shared_config(PartitionConstraintConfig::default()));

    // Arrange: enqueue through the key queue
    let enqueued = queue
        .enqueue(create_test_item("i1", identifier()), NOW, EnqueueOptions::default())
        .await
        .unwrap();
    let partition = QueuePartition::for_item(&enqueued.item);

    // Assert: nothing is ready yet, the item is due soon
    assert!(enqueued.continuation_hint);
    assert!(queue.peek(&partition, NOW, 10).await.unwrap().is_empty());

    // Act: refill the only backlog
    let sp = only_shadow_partition(&queue).await;
    assert_eq!(sp.partition_id, partition.id);
    let peeked = queue.shadow_partition_peek(&sp, true, NOW, 10).await.unwrap();
    assert_eq!(peeked.total_count, 1);
    let backlog = &peeked.backlogs[0];
    assert!(backlog.is_default());
    let refill = queue.backlog_refill(backlog, &sp, NOW).await.unwrap();

    // Assert: the item moved and carries its origin
    assert_eq!(refill.refilled, 1);
    assert_eq!(refill.constraint, RefillConstraint::None);
    assert_eq!(refill.refilled_items, vec![enqueued.item.id.clone()]);
    let ready = queue.peek(&partition, NOW, 10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].refilled_from.as_deref(), Some(backlog.backlog_id.as_str()));
    assert_eq!(ready[0].refilled_at_ms, Some(NOW));

    // Verify the drained backlog left the shadow indexes
    assert!(queue.global_shadow_partition_peek(NOW + 2_000, 10).await.unwrap().is_empty());
    assert_eq!(queue.metrics().snapshot().backlog_refills, 1);
}

/// K2. Refill Stops At The Function Concurrency Limit
#[tokio::test]
async fn test_backlog_refill_respects_function_limit() {
    let config = PartitionConstraintConfig::default().with_function_concurrency(1);
    let (_clock, queue) = create_key_queue(shared_config(config));
    let ident = identifier();

    // Arrange: two items of one function
    for id in ["i1", "i2"] {
        queue
            .enqueue(create_test_item(id, ident), NOW, EnqueueOptions::default())
            .await
            .unwrap();
    }
    let sp = only_shadow_partition(&queue).await;
    let backlog = queue.shadow_partition_peek(&sp, true, NOW, 10).await.unwrap().backlogs.remove(0);

    // Act: refill twice
    let first = queue.backlog_refill(&backlog, &sp, NOW).await.unwrap();
    let second = queue.backlog_refill(&backlog, &sp, NOW).await.unwrap();

    // Assert: one item fits, the rest waits for capacity
    assert_eq!(first.refilled, 1);
    assert_eq!(first.constraint, RefillConstraint::Function);
    assert_eq!(first.backlog_count_until, 2);
    assert_eq!(second.refilled, 0);
    assert_eq!(second.capacity, 0);
    assert_eq!(second.total_backlog_count, 1);
}

/// K3. Shadow Partition Pass Refills And Backs Off Constrained Backlogs
#[tokio::test]
async fn test_process_shadow_partition() {
    let config = PartitionConstraintConfig::default().with_function_concurrency(2);
    let (_clock, queue) = create_key_queue(shared_config(config));
    let ident = identifier();

    // Arrange: three items, room for two
    for id in ["i1", "i2", "i3"] {
        queue
            .enqueue(create_test_item(id, ident), NOW, EnqueueOptions::default())
            .await
            .unwrap();
    }
    let sp = only_shadow_partition(&queue).await;

    // Act: one shadow pass
    let pass = queue.process_shadow_partition(&sp).await.unwrap();

    // Assert: two refilled, the backlog was pushed back
    assert_eq!(pass.backlogs, 1);
    assert_eq!(pass.refilled, 2);
    assert_eq!(pass.constrained, 1);
    assert!(queue.shadow_partition_peek(&sp, true, NOW, 10).await.unwrap().backlogs.is_empty());
    let later = queue.shadow_partition_peek(&sp, true, NOW + 5_000, 10).await.unwrap();
    assert_eq!(later.backlogs.len(), 1);

    // Verify the shadow lease was released
    assert!(queue.shadow_partition_lease(&sp, std::time::Duration::from_secs(4)).await.is_ok());
}

/// K4. Outdated Backlogs Are Normalized Into Current Backlogs
#[tokio::test]
async fn test_outdated_backlog_is_normalized() {
    let keyed = PartitionConstraintConfig::default().with_custom_key(ConcurrencyScope::Env, "expr", 5);
    let config = shared_config(keyed);
    let (_clock, queue) = create_key_queue(config.clone());
    let ident = identifier();

    // Arrange: an item in a custom key backlog
    let item = create_test_item("i1", ident).with_custom_concurrency_key(CustomConcurrency::new(
        ConcurrencyScope::Env,
        ident.env_id,
        "expr",
        "customer-1",
        5,
    ));
    queue.enqueue(item, NOW, EnqueueOptions::default()).await.unwrap();
    let sp = only_shadow_partition(&queue).await;

    // Act: drop the custom key and run a shadow pass
    *config.lock() = PartitionConstraintConfig::default();
    let pass = queue.process_shadow_partition(&sp).await.unwrap();

    // Assert: the backlog was sent to normalization, nothing refilled
    assert_eq!(pass.normalizing, 1);
    assert_eq!(pass.refilled, 0);

    // Act: normalize
    let moved = queue.normalize_shadow_partition(&sp, 100).await.unwrap();

    // Assert: the item now sits in the default backlog
    assert_eq!(moved, 1);
    let peeked = queue.shadow_partition_peek(&sp, true, NOW + 2_000, 10).await.unwrap();
    assert_eq!(peeked.backlogs.len(), 1);
    assert!(peeked.backlogs[0].is_default());
    assert!(queue
        .shadow_partition_peek_normalize_backlogs(&sp, i64::MAX, 10)
        .await
        .unwrap()
        .is_empty());
}

/// K5. Refilled Items Are Not Throttled Again At Lease Time
#[tokio::test]
async fn test_throttle_counts_once_per_item() {
    let (_clock, queue) = create_key_queue(shared_config(PartitionConstraintConfig::default()));
    let ident = identifier();
    let throttle = Throttle::new("k", 2, 0, 60);
    let start = |id: &str| QueueItem::new(id, ident, Kind::Start, 0).with_throttle(throttle.clone());

    // Arrange: two throttled starts, exactly the throttle's limit
    for id in ["t1", "t2"] {
        queue.enqueue(start(id), NOW, EnqueueOptions::default()).await.unwrap();
    }
    let sp = only_shadow_partition(&queue).await;
    let backlog = queue.shadow_partition_peek(&sp, true, NOW, 10).await.unwrap().backlogs.remove(0);

    // Act: refill, then lease everything that became ready
    let refill = queue.backlog_refill(&backlog, &sp, NOW).await.unwrap();
    let partition = QueuePartition::for_item(&start("t1"));
    let ready = queue.peek(&partition, NOW, 10).await.unwrap();

    // Assert: the refill used the throttle, the leases do not
    assert_eq!(refill.refilled, 2);
    assert_eq!(ready.len(), 2);
    for item in &ready {
        let leased = queue.lease(item, Duration::from_secs(30), LeaseOptions::default()).await;
        assert!(leased.is_ok(), "lease of {} failed: {:?}", item.id, leased);
    }

    // Act: a third start waits in the backlog
    queue.enqueue(start("t3"), NOW, EnqueueOptions::default()).await.unwrap();
    let sp = only_shadow_partition(&queue).await;
    let backlog = queue.shadow_partition_peek(&sp, true, NOW, 10).await.unwrap().backlogs.remove(0);
    let blocked = queue.backlog_refill(&backlog, &sp, NOW).await.unwrap();

    // Assert: throttled until half a period later
    assert_eq!(blocked.refilled, 0);
    assert_eq!(blocked.constraint, RefillConstraint::Throttle);
    assert_eq!(blocked.retry_at_ms, NOW + 30_000);
}
