//! End-to-end pipeline tests.
//!
//! Drives the in-memory change log, router, route queues and invokers
//! together, with mock handlers and a recording email client.
//! Run with: cargo test --test pipeline --features test-utils

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, StatusCode};

use cdc_fanout::dlq::{
    dlq_topic_for_route, ChannelDeadLetterPublisher, DeadLetterReason, NoopDeadLetterPublisher,
};
use cdc_fanout::event::EventKey;
use cdc_fanout::ingress::Ingress;
use cdc_fanout::invoker::{
    BatchHandler, BatchState, ConsumerInvoker, Deduplicating, InvokerConfig, PerMessage,
    StreamInvoker, StreamOutcome,
};
use cdc_fanout::newsletter::{
    newsletter_routes, InMemoryNewsletterStore, InMemorySubscriberDirectory, NewsletterApi,
    SendConfirmationHandler, SendNewsletterHandler, NEW_SUBSCRIBER_ROUTE, SEND_NEWSLETTER_ROUTE,
};
use cdc_fanout::queue::{DurableQueue, InMemoryQueue, QueueConfig};
use cdc_fanout::router::FanoutRouter;
use cdc_fanout::source::{
    ChangeSource, ChangeStream, Checkpoint, InMemoryChangeLog, SubscribeOptions,
};
use cdc_fanout::test_utils::{
    newsletter_issue_event, subscriber_token_event, MockEmailClient, MockEventBatchHandler,
    MockMessageHandler,
};

// ============================================================================
// Test Fixtures
// ============================================================================

/// Route queues and their dead-letter queues for both newsletter routes.
struct Pipeline {
    table: InMemoryChangeLog,
    router: FanoutRouter,
    subscribers: Arc<InMemoryQueue>,
    subscribers_dlq: Arc<InMemoryQueue>,
    issues: Arc<InMemoryQueue>,
}

fn queue_config() -> QueueConfig {
    QueueConfig::default()
        .with_visibility_timeout(Duration::from_secs(30))
        .with_nack_backoff(Duration::from_millis(10), Duration::from_millis(10))
        .with_max_receive_count(5)
}

fn pipeline() -> Pipeline {
    let subscribers_dlq = Arc::new(InMemoryQueue::new(
        dlq_topic_for_route(NEW_SUBSCRIBER_ROUTE),
        queue_config(),
    ));
    let subscribers = Arc::new(
        InMemoryQueue::new(NEW_SUBSCRIBER_ROUTE, queue_config())
            .with_dead_letter(subscribers_dlq.clone()),
    );
    let issues = Arc::new(InMemoryQueue::new(SEND_NEWSLETTER_ROUTE, queue_config()));

    let mut builder = FanoutRouter::builder()
        .dead_letter(Arc::new(NoopDeadLetterPublisher))
        .enqueue_retries(1);
    for route in newsletter_routes(subscribers.clone(), issues.clone()).unwrap() {
        builder = builder.route(route);
    }

    Pipeline {
        table: InMemoryChangeLog::new("newsletter"),
        router: builder.build().unwrap(),
        subscribers,
        subscribers_dlq,
        issues,
    }
}

fn invoker(queue: Arc<InMemoryQueue>, handler: Arc<dyn BatchHandler>) -> ConsumerInvoker {
    ConsumerInvoker::new(
        queue,
        handler,
        InvokerConfig {
            max_wait: Duration::ZERO,
            ..Default::default()
        },
    )
}

async fn subscribe(p: &Pipeline) -> Box<dyn ChangeStream> {
    p.table.subscribe(SubscribeOptions::earliest()).await.unwrap()
}

/// Route everything the stream has not delivered yet.
async fn route_all(p: &Pipeline, stream: &mut Box<dyn ChangeStream>) {
    loop {
        let batch = stream.next_batch(Duration::ZERO).await.unwrap();
        if batch.is_empty() {
            break;
        }
        let report = p.router.route_batch(&batch).await;
        assert!(report.is_clean(), "{:?}", report.failures);
    }
}

fn form(uri: &str, body: &'static str) -> Request<Bytes> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Bytes::from_static(body.as_bytes()))
        .unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_change_events_reach_their_route_queues() {
    let p = pipeline();
    p.router
        .route_batch(&[
            subscriber_token_event("tok1", "a@b.com", 1),
            newsletter_issue_event("Issue 1", "issue-1.json", 1),
            subscriber_token_event("tok2", "c@d.com", 1),
        ])
        .await;

    assert_eq!(p.subscribers.len().await, 2);
    assert_eq!(p.issues.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_confirm_and_publish_over_ingress() {
    let p = pipeline();
    let store = Arc::new(InMemoryNewsletterStore::new("issues"));
    let directory = Arc::new(InMemorySubscriberDirectory::new());
    let email = Arc::new(MockEmailClient::new());
    let ingress = Ingress::new(Arc::new(NewsletterApi::new(
        p.table.clone(),
        store.clone(),
        directory.clone(),
    )));
    let mut stream = subscribe(&p).await;

    let response = ingress
        .forward(form("/subscriptions", "name=le%20guin&email=ursula%40domain.com"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    route_all(&p, &mut stream).await;

    let confirmations = invoker(
        p.subscribers.clone(),
        Arc::new(PerMessage(SendConfirmationHandler::new(
            email.clone(),
            "http://127.0.0.1:8000",
        ))),
    );
    let outcome = confirmations.poll_once().await.unwrap();
    assert_eq!(outcome.state, BatchState::AllAcked);

    let sent = email.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "ursula@domain.com");
    assert_eq!(sent[0].subject, "Welcome!");
    let link = sent[0]
        .text_content
        .split_whitespace()
        .find(|word| word.starts_with("http://"))
        .unwrap()
        .to_string();
    let path = link.trim_start_matches("http://127.0.0.1:8000").to_string();

    let confirm = Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Bytes::new())
        .unwrap();
    assert_eq!(ingress.forward(confirm).await.status(), StatusCode::OK);

    let response = ingress
        .forward(form(
            "/admin/newsletters",
            "title=Issue%201&text_content=hello&html_content=%3Cp%3Ehello%3C%2Fp%3E",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    route_all(&p, &mut stream).await;

    let newsletters = invoker(
        p.issues.clone(),
        Arc::new(PerMessage(SendNewsletterHandler::new(
            email.clone(),
            store,
            directory,
        ))),
    );
    let outcome = newsletters.poll_once().await.unwrap();
    assert_eq!(outcome.state, BatchState::AllAcked);

    let sent = email.sent().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].recipient, "ursula@domain.com");
    assert_eq!(sent[1].subject, "Issue 1");
    assert_eq!(sent[1].html_content, "<p>hello</p>");
}

#[tokio::test(start_paused = true)]
async fn test_one_failure_in_ten_is_redelivered_alone() {
    let p = pipeline();
    let events: Vec<_> = (1..=10)
        .map(|n| subscriber_token_event(&format!("tok{}", n), "a@b.com", 1))
        .collect();
    p.router.route_batch(&events).await;

    let handler = Arc::new(MockMessageHandler::new());
    handler.fail_on(EventKey::new("tok7", 1)).await;
    let invoker = invoker(p.subscribers.clone(), Arc::new(PerMessage(handler.clone())));

    let outcome = invoker.poll_once().await.unwrap();
    assert_eq!(outcome.state, BatchState::PartiallyFailed);
    assert_eq!(outcome.acked, 9);
    assert_eq!(outcome.nacked, 1);

    tokio::time::advance(Duration::from_millis(20)).await;
    handler.clear_failures().await;
    let batch = p.subscribers.receive_batch(10, Duration::ZERO).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.deliveries[0].message.source, EventKey::new("tok7", 1));
    assert_eq!(batch.deliveries[0].receive_count, 1);

    invoker.process(batch).await.unwrap();
    assert_eq!(handler.handled().await.len(), 10);
    assert!(p.subscribers.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_sixth_failure_moves_message_to_dead_letter_queue() {
    let p = pipeline();
    p.router
        .route_batch(&[subscriber_token_event("tok1", "a@b.com", 1)])
        .await;

    let handler = Arc::new(MockMessageHandler::new());
    handler.set_fail_all(true).await;
    let invoker = invoker(p.subscribers.clone(), Arc::new(PerMessage(handler)));

    for attempt in 1..=6 {
        let outcome = invoker.poll_once().await.unwrap();
        assert_eq!(outcome.received, 1, "attempt {}", attempt);
        let expected = if attempt == 6 { 1 } else { 0 };
        assert_eq!(outcome.dead_lettered, expected, "attempt {}", attempt);
        tokio::time::advance(Duration::from_millis(20)).await;
    }

    assert!(p.subscribers.is_empty().await);
    let dead = p.subscribers_dlq.drain().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].source, EventKey::new("tok1", 1));
}

#[tokio::test(start_paused = true)]
async fn test_replayed_events_are_handled_once() {
    let p = pipeline();
    p.table
        .put(
            "tok1",
            cdc_fanout::event::attributes([
                ("PK", "tok1"),
                ("Type", "SubscriberToken"),
                ("EmailAddress", "a@b.com"),
            ]),
        )
        .await;

    // Route the same history twice, as after a restart from an old checkpoint.
    let mut stream = subscribe(&p).await;
    route_all(&p, &mut stream).await;
    let mut replay = p
        .table
        .resume(SubscribeOptions::earliest(), Checkpoint::new())
        .await
        .unwrap();
    let batch = replay.next_batch(Duration::ZERO).await.unwrap();
    p.router.route_batch(&batch).await;
    assert_eq!(p.subscribers.len().await, 2);

    let handler = Arc::new(MockMessageHandler::new());
    let dedup = Arc::new(Deduplicating::new(handler.clone()));
    let invoker = invoker(p.subscribers.clone(), Arc::new(PerMessage(dedup.clone())));

    let outcome = invoker.poll_once().await.unwrap();
    assert_eq!(outcome.acked, 2);
    assert_eq!(handler.handled().await.len(), 1);
    assert!(dedup.has_seen(&EventKey::new("tok1", 1)).await);
}

#[tokio::test(start_paused = true)]
async fn test_queue_outage_does_not_block_other_route() {
    let p = pipeline();
    p.subscribers.set_available(false);

    let report = p
        .router
        .route_batch(&[
            subscriber_token_event("tok1", "a@b.com", 1),
            newsletter_issue_event("Issue 1", "issue-1.json", 1),
        ])
        .await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].route, NEW_SUBSCRIBER_ROUTE);

    let handler = Arc::new(MockMessageHandler::new());
    let issues = invoker(p.issues.clone(), Arc::new(PerMessage(handler.clone())));
    let outcome = issues.poll_once().await.unwrap();
    assert_eq!(outcome.state, BatchState::AllAcked);
    assert_eq!(
        handler.handled_keys().await,
        vec![EventKey::new("Issue 1", 1)]
    );

    assert!(p.subscribers.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_stream_consumer_reads_change_log_directly() {
    let p = pipeline();
    let handler = Arc::new(MockEventBatchHandler::new());
    let (publisher, mut dead_letters) = ChannelDeadLetterPublisher::new();
    let consumer = StreamInvoker::new(handler.clone(), Arc::new(publisher)).with_max_attempts(2);
    let mut stream = subscribe(&p).await;

    p.table
        .put(
            "tok1",
            cdc_fanout::event::attributes([("PK", "tok1"), ("Type", "SubscriberToken")]),
        )
        .await;
    let batch = stream.next_batch(Duration::ZERO).await.unwrap();
    assert_eq!(
        consumer.process(batch).await,
        StreamOutcome::Processed { attempts: 1 }
    );
    assert_eq!(handler.batches().await, vec![vec![EventKey::new("tok1", 1)]]);

    handler.set_fail(true).await;
    p.table
        .put(
            "tok2",
            cdc_fanout::event::attributes([("PK", "tok2"), ("Type", "SubscriberToken")]),
        )
        .await;
    let batch = stream.next_batch(Duration::ZERO).await.unwrap();
    assert_eq!(
        consumer.process(batch).await,
        StreamOutcome::DeadLettered { attempts: 2 }
    );

    let dead = dead_letters.try_recv().unwrap();
    assert!(matches!(
        dead.reason,
        DeadLetterReason::StreamBatchFailed { attempts: 2, .. }
    ));
    assert_eq!(dead.payload.source_keys(), vec![EventKey::new("tok2", 1)]);
}
