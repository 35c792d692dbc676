use super::*;
use crate::dlq::ChannelDeadLetterPublisher;
use crate::event::EventKey;
use crate::queue::{InMemoryQueue, QueueConfig};
use crate::test_utils::{outbound_message, MockMessageHandler};
use tokio::time::advance;

const ROUTE: &str = "new-subscriber";

fn queue() -> Arc<InMemoryQueue> {
    Arc::new(InMemoryQueue::new(
        ROUTE,
        QueueConfig::default()
            .with_visibility_timeout(Duration::from_secs(30))
            .with_nack_backoff(Duration::from_millis(100), Duration::from_secs(2)),
    ))
}

async fn fill(queue: &InMemoryQueue, n: u64) {
    for seq in 1..=n {
        queue.enqueue(outbound_message(ROUTE, "tok", seq)).await.unwrap();
    }
}

fn invoker(queue: Arc<InMemoryQueue>, handler: Arc<dyn BatchHandler>) -> ConsumerInvoker {
    ConsumerInvoker::new(
        queue,
        handler,
        InvokerConfig {
            max_wait: Duration::ZERO,
            invocation_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_partial_failure_nacks_only_failed_message() {
    let queue = queue();
    fill(&queue, 10).await;
    let handler = Arc::new(MockMessageHandler::new());
    handler.fail_on(EventKey::new("tok", 7)).await;
    let invoker = invoker(queue.clone(), Arc::new(PerMessage(handler.clone())));

    let outcome = invoker.poll_once().await.unwrap();
    assert_eq!(outcome.state, BatchState::PartiallyFailed);
    assert_eq!(outcome.received, 10);
    assert_eq!(outcome.acked, 9);
    assert_eq!(outcome.nacked, 1);
    assert_eq!(queue.len().await, 1);

    // Past the first nack backoff step.
    advance(Duration::from_millis(150)).await;
    handler.clear_failures().await;

    let batch = queue.receive_batch(10, Duration::ZERO).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.deliveries[0].message.source, EventKey::new("tok", 7));
    assert_eq!(batch.deliveries[0].receive_count, 1);
    invoker.process(batch).await.unwrap();

    let mut keys = handler.handled_keys().await;
    keys.sort();
    let expected: Vec<EventKey> = (1..=10).map(|seq| EventKey::new("tok", seq)).collect();
    assert_eq!(keys, expected);
    assert!(queue.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_handler_error_fails_whole_batch() {
    struct Broken;

    #[async_trait]
    impl BatchHandler for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn handle(
            &self,
            _batch: &DeliveryBatch,
            _ctx: &BatchContext,
        ) -> Result<BatchItemFailures, HandlerError> {
            Err(HandlerError::Unavailable("smtp".to_string()))
        }
    }

    let queue = queue();
    fill(&queue, 3).await;
    let invoker = invoker(queue.clone(), Arc::new(Broken));

    let outcome = invoker.poll_once().await.unwrap();
    assert_eq!(outcome.state, BatchState::AllFailed);
    assert_eq!(outcome.nacked, 3);
    assert_eq!(outcome.acked, 0);
    assert_eq!(queue.len().await, 3);
    assert_eq!(queue.in_flight().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_failure_ids_are_ignored() {
    struct Confused;

    #[async_trait]
    impl BatchHandler for Confused {
        fn name(&self) -> &str {
            "confused"
        }

        async fn handle(
            &self,
            _batch: &DeliveryBatch,
            _ctx: &BatchContext,
        ) -> Result<BatchItemFailures, HandlerError> {
            Ok([MessageId::new()].into_iter().collect())
        }
    }

    let queue = queue();
    fill(&queue, 2).await;
    let outcome = invoker(queue.clone(), Arc::new(Confused))
        .poll_once()
        .await
        .unwrap();
    assert_eq!(outcome.state, BatchState::AllAcked);
    assert_eq!(outcome.acked, 2);
    assert!(queue.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_keeps_early_acks_and_redelivers_rest() {
    struct Slow;

    #[async_trait]
    impl BatchHandler for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn handle(
            &self,
            batch: &DeliveryBatch,
            ctx: &BatchContext,
        ) -> Result<BatchItemFailures, HandlerError> {
            ctx.ack(&[batch.deliveries[0].id()])
                .await
                .map_err(|e| HandlerError::Failed(e.to_string()))?;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(BatchItemFailures::new())
        }
    }

    let queue = queue();
    fill(&queue, 4).await;
    let invoker = invoker(queue.clone(), Arc::new(Slow));

    let outcome = invoker.poll_once().await.unwrap();
    assert_eq!(outcome.state, BatchState::TimedOut);
    assert_eq!(outcome.early_acked, 1);
    assert_eq!(outcome.acked + outcome.nacked, 0);
    assert_eq!(queue.len().await, 3);
    assert_eq!(queue.in_flight().await, 3);

    advance(Duration::from_secs(30)).await;
    let batch = queue.receive_batch(10, Duration::ZERO).await.unwrap();
    assert_eq!(batch.len(), 3);
    assert!(batch.iter().all(|d| d.receive_count == 1));
    assert_eq!(invoker.stats().timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_dead_letter_after_budget() {
    let (publisher, mut dead_letters) = ChannelDeadLetterPublisher::new();
    let queue = Arc::new(
        InMemoryQueue::new(
            ROUTE,
            QueueConfig::default()
                .with_nack_backoff(Duration::from_millis(10), Duration::from_millis(10))
                .with_max_receive_count(5),
        )
        .with_dead_letter(Arc::new(publisher)),
    );
    fill(&queue, 1).await;
    let handler = Arc::new(MockMessageHandler::new());
    handler.set_fail_all(true).await;
    let invoker = invoker(queue.clone(), Arc::new(PerMessage(handler)));

    let mut dead_lettered = 0;
    for _ in 0..6 {
        let outcome = invoker.poll_once().await.unwrap();
        assert_eq!(outcome.received, 1);
        dead_lettered += outcome.dead_lettered;
        advance(Duration::from_millis(20)).await;
    }

    assert_eq!(dead_lettered, 1);
    assert!(queue.is_empty().await);
    let dead = dead_letters.try_recv().unwrap();
    assert!(matches!(
        dead.reason,
        crate::dlq::DeadLetterReason::RedriveExhausted { receive_count: 6 }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_empty_poll() {
    let queue = queue();
    let invoker = invoker(queue, Arc::new(PerMessage(MockMessageHandler::new())));
    let outcome = invoker.poll_once().await.unwrap();
    assert_eq!(outcome.state, BatchState::Empty);
    assert_eq!(invoker.stats(), InvokerStatsSnapshot::default());
}

#[tokio::test(start_paused = true)]
async fn test_workers_drain_queue() {
    let queue = queue();
    fill(&queue, 25).await;
    let handler = Arc::new(MockMessageHandler::new());
    let invoker = Arc::new(ConsumerInvoker::new(
        queue.clone(),
        Arc::new(PerMessage(handler.clone())),
        InvokerConfig {
            max_wait: Duration::from_millis(50),
            ..Default::default()
        },
    ));

    let handle = invoker.clone().spawn_workers(3);
    assert_eq!(handle.workers(), 3);
    for _ in 0..100 {
        if handler.handled().await.len() == 25 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop().await;

    assert_eq!(handler.handled().await.len(), 25);
    assert!(queue.is_empty().await);
    assert_eq!(invoker.stats().acked, 25);
}

#[test]
fn test_batch_item_failures_dedup() {
    let id = MessageId::new();
    let failures: BatchItemFailures = [id, id, MessageId::new()].into_iter().collect();
    assert_eq!(failures.len(), 2);
    assert!(failures.contains(&id));
}

#[test]
fn test_invoker_config_from_json() {
    let config: InvokerConfig = serde_json::from_value(serde_json::json!({
        "batch_size": 5,
        "max_wait_ms": 250,
        "workers": 2
    }))
    .unwrap();
    assert_eq!(config.batch_size, 5);
    assert_eq!(config.max_wait, Duration::from_millis(250));
    assert_eq!(config.invocation_timeout, Duration::from_secs(30));
    assert_eq!(config.workers, 2);
}
