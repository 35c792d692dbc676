use super::*;
use crate::dlq::{ChannelDeadLetterPublisher, DeadLetterReason};
use crate::event::EventKey;
use crate::message::TraceContext;
use tokio::sync::mpsc;
use tokio::time::advance;

const VISIBILITY: Duration = Duration::from_secs(30);
const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(2);

fn message(n: u64) -> OutboundMessage {
    OutboundMessage::new(
        "new-subscriber",
        EventKey::new("tok", n),
        serde_json::json!({ "n": n }),
        TraceContext::default(),
    )
}

fn config() -> QueueConfig {
    QueueConfig::default()
        .with_visibility_timeout(VISIBILITY)
        .with_nack_backoff(BACKOFF_MIN, BACKOFF_MAX)
        .with_max_receive_count(5)
}

fn queue_with_dlq() -> (InMemoryQueue, mpsc::UnboundedReceiver<DeadLetter>) {
    let (publisher, rx) = ChannelDeadLetterPublisher::new();
    let queue = InMemoryQueue::new("new-subscriber", config()).with_dead_letter(Arc::new(publisher));
    (queue, rx)
}

async fn receive_now(queue: &InMemoryQueue) -> DeliveryBatch {
    queue.receive_batch(10, Duration::ZERO).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_receive_preserves_enqueue_order() {
    let queue = InMemoryQueue::new("q", config());
    for n in 1..=3 {
        queue.enqueue(message(n)).await.unwrap();
    }

    let batch = receive_now(&queue).await;
    let seqs: Vec<u64> = batch.iter().map(|d| d.message.source.sequence_number).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(batch.queue, "q");
    assert!(batch.iter().all(|d| d.receive_count == 0));
}

#[tokio::test(start_paused = true)]
async fn test_receive_respects_max() {
    let queue = InMemoryQueue::new("q", config());
    for n in 1..=15 {
        queue.enqueue(message(n)).await.unwrap();
    }

    assert_eq!(queue.receive_batch(10, Duration::ZERO).await.unwrap().len(), 10);
    assert_eq!(queue.receive_batch(10, Duration::ZERO).await.unwrap().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_zero_batch_rejected() {
    let queue = InMemoryQueue::new("q", config());
    let result = queue.receive_batch(0, Duration::ZERO).await;
    assert!(matches!(result, Err(QueueError::InvalidRequest(_))));
}

#[tokio::test(start_paused = true)]
async fn test_ack_removes_messages() {
    let queue = InMemoryQueue::new("q", config());
    queue.enqueue(message(1)).await.unwrap();
    queue.enqueue(message(2)).await.unwrap();

    let batch = receive_now(&queue).await;
    assert_eq!(queue.ack_batch(&batch.ids()).await.unwrap(), 2);
    assert!(queue.is_empty().await);

    // Acking again is harmless.
    assert_eq!(queue.ack_batch(&batch.ids()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_message_invisible_to_other_receivers() {
    let queue = InMemoryQueue::new("q", config());
    queue.enqueue(message(1)).await.unwrap();

    let first = receive_now(&queue).await;
    assert_eq!(first.len(), 1);
    assert!(receive_now(&queue).await.is_empty());
    assert_eq!(queue.in_flight().await, 1);

    advance(VISIBILITY - Duration::from_millis(1)).await;
    assert!(receive_now(&queue).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_visibility_timeout_redelivers_with_count() {
    let queue = InMemoryQueue::new("q", config());
    let id = queue.enqueue(message(1)).await.unwrap();

    receive_now(&queue).await;
    advance(VISIBILITY).await;

    let batch = receive_now(&queue).await;
    assert_eq!(batch.ids(), vec![id]);
    assert_eq!(batch.deliveries[0].receive_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_nack_increments_once_and_backs_off() {
    let queue = InMemoryQueue::new("q", config());
    let id = queue.enqueue(message(1)).await.unwrap();

    receive_now(&queue).await;
    let outcome = queue.nack_batch(&[id]).await.unwrap();
    assert_eq!(outcome, NackOutcome { requeued: 1, dead_lettered: 0 });
    assert_eq!(queue.receive_count(&id).await, Some(1));

    // Not visible until the backoff elapses.
    assert!(receive_now(&queue).await.is_empty());
    advance(BACKOFF_MIN).await;

    let batch = receive_now(&queue).await;
    assert_eq!(batch.deliveries[0].receive_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_nack_of_message_not_in_flight_is_ignored() {
    let queue = InMemoryQueue::new("q", config());
    let id = queue.enqueue(message(1)).await.unwrap();

    let outcome = queue.nack_batch(&[id]).await.unwrap();
    assert_eq!(outcome, NackOutcome::default());
    assert_eq!(queue.receive_count(&id).await, Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_nack_after_timeout_does_not_double_count() {
    let queue = InMemoryQueue::new("q", config());
    let id = queue.enqueue(message(1)).await.unwrap();

    receive_now(&queue).await;
    advance(VISIBILITY).await;

    // The timeout already counted as the failed delivery.
    queue.nack_batch(&[id]).await.unwrap();
    assert_eq!(queue.receive_count(&id).await, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_late_ack_is_honoured() {
    let queue = InMemoryQueue::new("q", config());
    let id = queue.enqueue(message(1)).await.unwrap();

    receive_now(&queue).await;
    advance(VISIBILITY).await;
    let redelivered = receive_now(&queue).await;
    assert_eq!(redelivered.len(), 1);

    // The first consumer's ack arrives after the redelivery.
    assert_eq!(queue.ack_batch(&[id]).await.unwrap(), 1);
    assert!(queue.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_sixth_failed_delivery_dead_letters() {
    let (queue, mut dead_letters) = queue_with_dlq();
    let id = queue.enqueue(message(1)).await.unwrap();

    for failures in 1..=5u32 {
        let batch = receive_now(&queue).await;
        assert_eq!(batch.ids(), vec![id], "delivery after {} failures", failures - 1);
        assert_eq!(batch.deliveries[0].receive_count, failures - 1);

        let outcome = queue.nack_batch(&[id]).await.unwrap();
        assert_eq!(outcome.requeued, 1);
        assert_eq!(queue.receive_count(&id).await, Some(failures));
        advance(BACKOFF_MAX).await;
    }

    receive_now(&queue).await;
    let outcome = queue.nack_batch(&[id]).await.unwrap();
    assert_eq!(outcome, NackOutcome { requeued: 0, dead_lettered: 1 });
    assert!(queue.is_empty().await);

    let dead = dead_letters.try_recv().unwrap();
    assert_eq!(dead.reason, DeadLetterReason::RedriveExhausted { receive_count: 6 });
    assert_eq!(dead.message().map(|m| m.id), Some(id));
    assert!(dead_letters.try_recv().is_err());

    advance(BACKOFF_MAX).await;
    assert!(receive_now(&queue).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_count_towards_redrive() {
    let (queue, mut dead_letters) = queue_with_dlq();
    let id = queue.enqueue(message(1)).await.unwrap();

    for _ in 0..6 {
        assert_eq!(receive_now(&queue).await.len(), 1);
        advance(VISIBILITY).await;
    }

    // The sixth timeout is detected on the next operation.
    assert!(receive_now(&queue).await.is_empty());
    let dead = dead_letters.try_recv().unwrap();
    assert_eq!(dead.message().map(|m| m.id), Some(id));
}

#[tokio::test(start_paused = true)]
async fn test_without_redrive_messages_are_retried_forever() {
    let queue = InMemoryQueue::new("q", config());
    let id = queue.enqueue(message(1)).await.unwrap();

    for _ in 0..10 {
        receive_now(&queue).await;
        queue.nack_batch(&[id]).await.unwrap();
        advance(BACKOFF_MAX).await;
    }
    assert_eq!(queue.receive_count(&id).await, Some(10));
}

#[tokio::test(start_paused = true)]
async fn test_queue_as_dead_letter_target() {
    let dlq = Arc::new(InMemoryQueue::new("new-subscriber-dlq", QueueConfig::default()));
    let queue = InMemoryQueue::new("q", config().with_max_receive_count(0))
        .with_dead_letter(dlq.clone());
    let id = queue.enqueue(message(1)).await.unwrap();

    receive_now(&queue).await;
    queue.nack_batch(&[id]).await.unwrap();

    let drained = dlq.drain().await;
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].id, id);
    assert!(dlq.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_failed_dead_letter_publish_is_retried() {
    let dlq = Arc::new(InMemoryQueue::new("dlq", QueueConfig::default()));
    let queue = InMemoryQueue::new("q", config().with_max_receive_count(0))
        .with_dead_letter(dlq.clone());
    let id = queue.enqueue(message(1)).await.unwrap();

    dlq.set_available(false);
    receive_now(&queue).await;
    queue.nack_batch(&[id]).await.unwrap();

    // Parked, never redelivered to the primary consumer.
    assert_eq!(queue.len().await, 1);
    assert!(receive_now(&queue).await.is_empty());
    assert!(dlq.is_empty().await);

    dlq.set_available(true);
    receive_now(&queue).await;
    assert!(queue.is_empty().await);
    assert_eq!(dlq.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_at_capacity_times_out() {
    let queue = InMemoryQueue::new(
        "q",
        config()
            .with_capacity(2)
            .with_enqueue_timeout(Duration::from_millis(500)),
    );
    queue.enqueue(message(1)).await.unwrap();
    queue.enqueue(message(2)).await.unwrap();

    let start = Instant::now();
    let result = queue.enqueue(message(3)).await;
    assert!(matches!(result, Err(QueueError::DestinationUnavailable { .. })));
    assert!(start.elapsed() >= Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_blocked_enqueue_resumes_after_ack() {
    let queue = Arc::new(InMemoryQueue::new(
        "q",
        config()
            .with_capacity(1)
            .with_enqueue_timeout(Duration::from_secs(5)),
    ));
    queue.enqueue(message(1)).await.unwrap();

    let producer = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.enqueue(message(2)).await })
    };
    tokio::task::yield_now().await;

    let batch = receive_now(&queue).await;
    queue.ack_batch(&batch.ids()).await.unwrap();

    assert!(producer.await.unwrap().is_ok());
    assert_eq!(queue.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_queue_rejects_enqueue() {
    let queue = InMemoryQueue::new("q", config());
    queue.set_available(false);
    let err = queue.enqueue(message(1)).await.unwrap_err();
    assert!(err.is_transient());

    queue.set_available(true);
    assert!(queue.enqueue(message(1)).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_enqueue_is_ignored() {
    let queue = InMemoryQueue::new("q", config());
    let original = message(1);
    queue.enqueue(original.clone()).await.unwrap();
    queue.enqueue(original).await.unwrap();
    assert_eq!(queue.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_receive_waits_for_enqueue() {
    let queue = Arc::new(InMemoryQueue::new("q", config()));

    let receiver = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.receive_batch(10, Duration::from_secs(5)).await })
    };
    tokio::task::yield_now().await;

    let start = Instant::now();
    queue.enqueue(message(1)).await.unwrap();
    let batch = receiver.await.unwrap().unwrap();

    assert_eq!(batch.len(), 1);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_receive_returns_empty_after_wait() {
    let queue = InMemoryQueue::new("q", config());
    let start = Instant::now();
    let batch = queue.receive_batch(10, Duration::from_secs(2)).await.unwrap();
    assert!(batch.is_empty());
    assert!(start.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_waiting_receiver_picks_up_timed_out_message() {
    let queue = InMemoryQueue::new("q", config());
    let id = queue.enqueue(message(1)).await.unwrap();
    receive_now(&queue).await;

    let batch = queue
        .receive_batch(10, VISIBILITY + Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(batch.ids(), vec![id]);
    assert_eq!(batch.deliveries[0].receive_count, 1);
}

/// Forwards dead letters to a channel after a delay.
struct SlowPublisher {
    delay: Duration,
    inner: ChannelDeadLetterPublisher,
}

#[async_trait]
impl DeadLetterPublisher for SlowPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> std::result::Result<(), DlqError> {
        tokio::time::sleep(self.delay).await;
        self.inner.publish(dead_letter).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_receive_still_dead_letters_and_strands_nothing() {
    let (inner, mut dead_letters) = ChannelDeadLetterPublisher::new();
    let publisher = SlowPublisher {
        delay: Duration::from_secs(1),
        inner,
    };
    let queue = InMemoryQueue::new("q", config().with_max_receive_count(0))
        .with_dead_letter(Arc::new(publisher));
    let exhausted = queue.enqueue(message(1)).await.unwrap();
    assert_eq!(queue.receive_batch(1, Duration::ZERO).await.unwrap().len(), 1);
    let waiting = queue.enqueue(message(2)).await.unwrap();
    advance(VISIBILITY).await;

    // Cancelled while the expired message is being dead-lettered.
    let cancelled =
        tokio::time::timeout(Duration::from_millis(10), queue.receive_batch(10, Duration::ZERO))
            .await;
    assert!(cancelled.is_err());

    let dead = dead_letters.recv().await.unwrap();
    assert_eq!(dead.message().map(|m| m.id), Some(exhausted));

    let batch = receive_now(&queue).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.deliveries[0].message.id, waiting);
    assert_eq!(batch.deliveries[0].receive_count, 0);
}
