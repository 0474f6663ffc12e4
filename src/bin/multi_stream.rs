//! Multi-stream trade feed
//!
//! Opens one WebSocket connection per configured topic, spread over a pool of
//! engine threads, and logs trade prices from a consumer thread.
//!
//! Usage:
//!   cargo run --bin multi_stream [config.yaml]

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use serde_json::Value;
use std::time::Duration;
use streamplex::{
    ChannelHandler, CloseReason, EnginePool, JsonMethodSubscription, MetricsSnapshot, StreamEvent,
};
use streamplex_feed::bin_common::{
    init_tracing, load_config_from_env, parse_args, BinaryRunner, ConfigType, FeedConfig,
    RunConfig,
};
use tokio::signal;
use tracing::{debug, error, info, warn};

struct MultiStreamApp {
    run_config: RunConfig,
    feed: FeedConfig,
}

impl MultiStreamApp {
    fn new(feed: FeedConfig) -> Self {
        Self {
            run_config: RunConfig::new("Multi-stream feed")
                .with_stats_interval(feed.stats_interval_secs),
            feed,
        }
    }
}

impl BinaryRunner for MultiStreamApp {
    async fn run(&mut self) -> Result<()> {
        let (handler, events) = ChannelHandler::unbounded();
        let feed = &self.feed;

        let mut pool = EnginePool::spawn(feed.shards, |_shard| {
            streamplex::builder()
                .url(&feed.url)
                .handler(handler.clone())
                .subscription(JsonMethodSubscription::new(&feed.stream_suffix))
                .config(feed.engine.clone())
                .build()
        })
        .context("Failed to start engine pool")?;
        // Engines hold the remaining senders; the consumer stops once they exit
        drop(handler);

        let consumer = std::thread::Builder::new()
            .name("stream-consumer".to_string())
            .spawn(move || consume(events))
            .context("Failed to start consumer thread")?;

        for topic in &feed.topics {
            let shard = pool.subscribe(topic.as_str())?;
            debug!("[{}] Subscribed on shard {}", topic, shard);
        }
        info!("Per-shard topics: {:?}", pool.topics_per_shard());

        let mut stats = tokio::time::interval(Duration::from_secs(self.run_config.stats_interval_secs));
        stats.tick().await;

        let ctrl_c = signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                result = &mut ctrl_c => {
                    if let Err(err) = result {
                        error!("Unable to listen for shutdown signal: {}", err);
                    }
                    info!("");
                    info!("Received shutdown signal (Ctrl+C)");
                    break;
                }
                _ = stats.tick() => log_stats(&pool),
            }
        }

        // Joining shard and consumer threads blocks
        let total = tokio::task::block_in_place(|| {
            pool.shutdown();
            let total = pool.metrics();
            match consumer.join() {
                Ok(trades) => info!("Consumer handled {} trade message(s)", trades),
                Err(_) => warn!("Consumer thread panicked"),
            }
            total
        });
        info!("Final totals: {}", describe(&total));
        Ok(())
    }

    fn config(&self) -> &RunConfig {
        &self.run_config
    }
}

/// Drain events until every engine has dropped its sender
fn consume(events: Receiver<StreamEvent>) -> u64 {
    let mut trades = 0u64;

    for event in events.iter() {
        match event {
            StreamEvent::Opened { topic } => info!("[{}] Stream open", topic),
            StreamEvent::Message { topic, message } => {
                let Some(text) = message.as_text() else {
                    debug!("[{}] Binary message ({} bytes)", topic, message.len());
                    continue;
                };
                match serde_json::from_str::<Value>(text) {
                    Ok(value) => {
                        if let Some(price) = value.get("p").and_then(Value::as_str) {
                            trades += 1;
                            info!("[{}] price {}", topic, price);
                        }
                    }
                    Err(e) => warn!("[{}] Unparseable message: {}", topic, e),
                }
            }
            StreamEvent::Closed { topic, reason } => match reason {
                CloseReason::RetryExhausted { .. } => {
                    error!("[{}] Subscription failed: {}", topic, reason)
                }
                CloseReason::Shutdown | CloseReason::Unsubscribed => {
                    info!("[{}] Stream closed: {}", topic, reason)
                }
                _ => warn!("[{}] Stream dropped: {}", topic, reason),
            },
        }
    }

    trades
}

fn describe(metrics: &MetricsSnapshot) -> String {
    format!(
        "open={} messages={} pings={} pongs={} reconnects={} violations={} overflows={} failed={}",
        metrics.connections_open,
        metrics.messages_received,
        metrics.pings_sent,
        metrics.pongs_received,
        metrics.reconnect_attempts,
        metrics.protocol_violations,
        metrics.buffer_overflows,
        metrics.failed_subscriptions
    )
}

fn log_stats(pool: &EnginePool) {
    for (shard, metrics) in pool.shard_metrics().iter().enumerate() {
        info!("Shard {}: {}", shard, describe(metrics));
    }
    info!("Total: {}", describe(&pool.metrics()));
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenv::dotenv().ok();

    let config_path = load_config_from_env(ConfigType::from_args(parse_args()));

    let feed = FeedConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    init_tracing(&feed.log_level);
    feed.log();

    let mut app = MultiStreamApp::new(feed);
    app.execute().await
}
