//! fanout: CDC fan-out pipeline with the newsletter application
//!
//! Runs the whole pipeline in one process: the HTTP ingress writes rows to
//! the subscriptions table, the router fans its change log out to one
//! queue per route, and the invokers drive the email handlers.
//!
//! ## Architecture
//! ```text
//! HTTP --> [NewsletterApi] --> table change log --> [FanoutRouter]
//!                                                     |        |
//!                                                     v        v
//!                                          new-subscriber   send-newsletter
//!                                                     |        |
//!                                                     v        v
//!                                       [SendConfirmation] [SendNewsletter]
//!                                                     |        |
//!                                                     +---> email client
//! ```
//!
//! Every route queue redrives exhausted messages to `fanout.dlq.<route>`.
//!
//! ## Configuration
//! - First argument: path to a YAML config file (optional)
//! - FANOUT_CONFIG: path to a YAML config file (optional)
//! - FANOUT_LOG: tracing filter, overrides `log.level`
//! - FANOUT_<SECTION>__<KEY>: any setting, e.g. FANOUT_INGRESS__ADDR

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use cdc_fanout::config::{Config, EnvSecretResolver, SecretResolver};
use cdc_fanout::dlq::dlq_topic_for_route;
use cdc_fanout::ingress::Ingress;
use cdc_fanout::invoker::{
    BatchHandler, ConsumerInvoker, Deduplicating, InvokerHandle, PerMessage,
};
use cdc_fanout::newsletter::{
    newsletter_routes, EmailClient, FilesystemNewsletterStore, InMemoryNewsletterStore,
    InMemorySubscriberDirectory, LoggingEmailClient, NewsletterApi, NewsletterStore,
    SendConfirmationHandler, SendNewsletterHandler, SubscriberDirectory, NEW_SUBSCRIBER_ROUTE,
    SEND_NEWSLETTER_ROUTE,
};
use cdc_fanout::queue::{DurableQueue, InMemoryQueue};
use cdc_fanout::router::{FanoutRouter, RouteDefinition};
use cdc_fanout::source::{ChangeSource, InMemoryChangeLog, SubscribeOptions};
use cdc_fanout::utils::bootstrap::init_tracing;

const ROUTER_POLL_WAIT: Duration = Duration::from_secs(1);
const TRIM_INTERVAL: Duration = Duration::from_secs(60);
const ROUTER_DLQ: &str = "fanout.dlq.router";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    init_tracing(&config.log);

    let mut email_client = LoggingEmailClient::new(&config.newsletter.sender);
    if let Some(secret) = &config.secret {
        email_client = email_client.with_api_key(EnvSecretResolver.resolve(secret)?);
        info!(secret = %secret.name, "Secret resolved");
    }
    let email_client: Arc<dyn EmailClient> = Arc::new(email_client);

    let table = InMemoryChangeLog::with_retention(&config.table.name, config.table.retention);
    let store: Arc<dyn NewsletterStore> = match &config.bucket.path {
        Some(path) => Arc::new(FilesystemNewsletterStore::new(path).await?),
        None => Arc::new(InMemoryNewsletterStore::new(&config.bucket.name)),
    };
    let directory: Arc<dyn SubscriberDirectory> = Arc::new(InMemorySubscriberDirectory::new());

    // One queue per destination, each with its own dead-letter queue
    let mut queues: HashMap<String, Arc<InMemoryQueue>> = HashMap::new();
    let mut queue_for = |name: &str| {
        Arc::clone(queues.entry(name.to_string()).or_insert_with(|| {
            let dlq: Arc<InMemoryQueue> = Arc::new(InMemoryQueue::new(
                dlq_topic_for_route(name),
                config.queue.clone(),
            ));
            Arc::new(InMemoryQueue::new(name, config.queue.clone()).with_dead_letter(dlq))
        }))
    };

    let routes = if config.routes.is_empty() {
        newsletter_routes(
            queue_for(NEW_SUBSCRIBER_ROUTE),
            queue_for(SEND_NEWSLETTER_ROUTE),
        )?
    } else {
        config
            .routes
            .iter()
            .map(|route| {
                RouteDefinition::from_template(
                    route.id.as_str(),
                    &route.pattern,
                    &route.template,
                    queue_for(route.destination()),
                )
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut builder = FanoutRouter::builder().dead_letter(Arc::new(InMemoryQueue::new(
        ROUTER_DLQ,
        config.queue.clone(),
    )));
    for route in routes {
        builder = builder.route(route);
    }
    let router = Arc::new(builder.build()?);

    let stream = table
        .subscribe(SubscribeOptions::earliest().with_batch_size(config.invoker.batch_size))
        .await?;
    let router_handle = Arc::clone(&router).spawn(stream, ROUTER_POLL_WAIT);

    let mut handlers: HashMap<&str, Arc<dyn BatchHandler>> = HashMap::new();
    handlers.insert(
        NEW_SUBSCRIBER_ROUTE,
        Arc::new(PerMessage(Deduplicating::new(SendConfirmationHandler::new(
            Arc::clone(&email_client),
            &config.newsletter.base_url,
        )))),
    );
    handlers.insert(
        SEND_NEWSLETTER_ROUTE,
        Arc::new(PerMessage(Deduplicating::new(SendNewsletterHandler::new(
            Arc::clone(&email_client),
            Arc::clone(&store),
            Arc::clone(&directory),
        )))),
    );

    let mut invokers: Vec<InvokerHandle> = Vec::new();
    for (name, queue) in &queues {
        let Some(handler) = handlers.get(name.as_str()) else {
            warn!(queue = %name, "No consumer registered for queue");
            continue;
        };
        let queue: Arc<dyn DurableQueue> = Arc::clone(queue) as Arc<dyn DurableQueue>;
        let invoker = Arc::new(ConsumerInvoker::new(
            queue,
            Arc::clone(handler),
            config.invoker.clone(),
        ));
        invokers.push(invoker.spawn_workers(config.invoker.workers));
    }

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let trimmer = {
        let table = table.clone();
        let mut stop = stop_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TRIM_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {
                        let trimmed = table.trim_expired().await;
                        if trimmed > 0 {
                            info!(trimmed, "Trimmed expired change records");
                        }
                    }
                }
            }
        })
    };

    info!(
        table = %table.name(),
        routes = ?router.route_ids(),
        addr = %config.ingress.addr,
        "fanout started"
    );

    let api = NewsletterApi::new(table.clone(), Arc::clone(&store), Arc::clone(&directory));
    let ingress = Ingress::new(Arc::new(api));
    let addr = config.ingress.addr.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = stop_rx.changed().await;
        };
        ingress.serve(&addr, shutdown).await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");
    let _ = stop_tx.send(true);

    match server.await {
        Ok(Err(e)) => error!(error = %e, "Ingress failed"),
        Err(e) => error!(error = %e, "Ingress task panicked"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = router_handle.stop().await {
        error!(error = %e, "Router stopped with error");
    }
    for invoker in invokers {
        invoker.stop().await;
    }
    let _ = trimmer.await;

    for (name, queue) in &queues {
        let pending = queue.len().await;
        if pending > 0 {
            warn!(queue = %name, pending, "Queue not drained at shutdown");
        }
    }
    info!("fanout stopped");
    Ok(())
}
