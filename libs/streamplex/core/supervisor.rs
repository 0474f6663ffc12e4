//! Connection establishment and reconnection
//!
//! Each subscription that is not `Open` has a record here. The supervisor
//! runs the lifecycle one stage at a time as independent futures, so the event
//! loop keeps serving other connections while a topic resolves, connects or
//! handshakes:
//!
//! ```text
//!  start / reconnect
//!        │
//!        ▼
//!  [backoff sleep] ─> resolve ─> connect ─> secure ─> handshake ─> Ready
//!        ▲               │          │          │           │
//!        └───────────────┴──────────┴──────────┴───────────┘
//!                 failure: next_delay(attempt) or Exhausted
//! ```
//!
//! Every record carries a generation number. Outcomes from a superseded
//! generation (e.g. after an unsubscribe) are dropped when they arrive.

use crate::core::connection::ConnectionStatus;
use crate::core::handshake;
use crate::core::metrics::EngineMetrics;
use crate::traits::{Connector, Endpoint, ReconnectionStrategy, StreamError};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of one lifecycle stage
pub enum Stage<C: Connector> {
    BackoffElapsed,
    Resolved(SocketAddr),
    Connected(C::Tcp),
    Secured(C::Stream),
    Upgraded { stream: C::Stream, leftover: Vec<u8> },
    Failed(StreamError),
}

pub struct StageOutcome<C: Connector> {
    topic: String,
    generation: u64,
    stage: Stage<C>,
}

/// What the event loop must act on after [`Supervisor::handle`]
pub enum SupervisorEvent<S> {
    /// Handshake done; register a connection for `topic`
    Ready {
        topic: String,
        stream: S,
        leftover: Vec<u8>,
    },
    /// The backoff strategy gave up; the topic is now `Failed`
    Exhausted {
        topic: String,
        attempts: usize,
        last_error: String,
    },
}

#[derive(Debug)]
struct TopicRecord {
    status: ConnectionStatus,
    attempt: usize,
    generation: u64,
}

pub struct Supervisor<C: Connector> {
    connector: Arc<C>,
    endpoint: Arc<Endpoint>,
    strategy: Box<dyn ReconnectionStrategy>,
    handshake_timeout: Duration,
    metrics: Arc<EngineMetrics>,
    records: HashMap<String, TopicRecord>,
    in_flight: FuturesUnordered<BoxFuture<'static, StageOutcome<C>>>,
    next_generation: u64,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: Arc<C>,
        endpoint: Arc<Endpoint>,
        strategy: Box<dyn ReconnectionStrategy>,
        handshake_timeout: Duration,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            connector,
            endpoint,
            strategy,
            handshake_timeout,
            metrics,
            records: HashMap::new(),
            in_flight: FuturesUnordered::new(),
            next_generation: 0,
        }
    }

    /// Current status of a topic that is not `Open`
    pub fn status(&self, topic: &str) -> Option<ConnectionStatus> {
        self.records.get(topic).map(|r| r.status)
    }

    /// True while the topic is being established or waiting to retry
    pub fn is_pending(&self, topic: &str) -> bool {
        self.records
            .get(topic)
            .map_or(false, |r| r.status != ConnectionStatus::Failed)
    }

    /// Topics being established or waiting to retry
    pub fn pending_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status != ConnectionStatus::Failed)
            .count()
    }

    /// No stage or backoff is running
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Begin establishing `topic` right away with a fresh attempt counter
    pub fn start(&mut self, topic: &str) {
        let generation = self.bump_generation();
        self.records.insert(
            topic.to_string(),
            TopicRecord {
                status: ConnectionStatus::Resolving,
                attempt: 0,
                generation,
            },
        );
        debug!("[{}] Resolving {}", topic, self.endpoint.host());
        self.push_resolve(topic.to_string(), generation);
    }

    /// An `Open` connection for `topic` died; retry after backoff
    ///
    /// Returns `Exhausted` when the strategy allows no attempt at all.
    pub fn reconnect(&mut self, topic: &str, reason: &str) -> Option<SupervisorEvent<C::Stream>> {
        let generation = self.bump_generation();
        self.records.insert(
            topic.to_string(),
            TopicRecord {
                status: ConnectionStatus::Closed,
                attempt: 0,
                generation,
            },
        );
        self.retry(topic, reason.to_string())
    }

    /// Forget a topic; its in-flight stage is dropped when it completes
    pub fn cancel(&mut self, topic: &str) -> bool {
        self.records.remove(topic).is_some()
    }

    /// Drop every record and every in-flight stage
    pub fn clear(&mut self) {
        self.records.clear();
        self.in_flight = FuturesUnordered::new();
    }

    /// Wait for the next stage to finish
    ///
    /// Resolves to `None` immediately when nothing is in flight.
    pub async fn next_outcome(&mut self) -> Option<StageOutcome<C>> {
        self.in_flight.next().await
    }

    /// Advance a topic past a finished stage
    pub fn handle(&mut self, outcome: StageOutcome<C>) -> Option<SupervisorEvent<C::Stream>> {
        let StageOutcome {
            topic,
            generation,
            stage,
        } = outcome;

        let current = self.records.get(&topic).map(|r| r.generation);
        if current != Some(generation) {
            debug!("[{}] Dropping stale stage outcome (generation {})", topic, generation);
            return None;
        }

        match stage {
            Stage::BackoffElapsed => {
                self.set_status(&topic, ConnectionStatus::Resolving);
                self.push_resolve(topic, generation);
                None
            }
            Stage::Resolved(addr) => {
                debug!("[{}] Connecting to {}", topic, addr);
                self.set_status(&topic, ConnectionStatus::Connecting);
                self.push_connect(topic, generation, addr);
                None
            }
            Stage::Connected(tcp) => {
                self.set_status(&topic, ConnectionStatus::TlsHandshake);
                self.push_secure(topic, generation, tcp);
                None
            }
            Stage::Secured(stream) => {
                self.set_status(&topic, ConnectionStatus::WsHandshake);
                self.push_handshake(topic, generation, stream);
                None
            }
            Stage::Upgraded { stream, leftover } => {
                if let Some(record) = self.records.remove(&topic) {
                    if record.attempt > 0 {
                        info!("[{}] Reconnected after {} attempt(s)", topic, record.attempt);
                    }
                }
                Some(SupervisorEvent::Ready {
                    topic,
                    stream,
                    leftover,
                })
            }
            Stage::Failed(err) => {
                let status = self.status(&topic);
                warn!(
                    "[{}] Connection failed while {}: {}",
                    topic,
                    status.map(|s| s.to_string()).unwrap_or_default(),
                    err
                );
                self.retry(&topic, err.to_string())
            }
        }
    }

    fn retry(&mut self, topic: &str, last_error: String) -> Option<SupervisorEvent<C::Stream>> {
        let record = self.records.get_mut(topic)?;
        let attempt = record.attempt;

        match self.strategy.next_delay(attempt) {
            Some(delay) => {
                record.attempt += 1;
                record.status = ConnectionStatus::Closed;
                let generation = record.generation;
                self.metrics.record_reconnect_attempt();
                info!(
                    "[{}] Reconnect attempt {} in {:?}",
                    topic,
                    attempt + 1,
                    delay
                );

                let topic = topic.to_string();
                self.in_flight.push(
                    async move {
                        tokio::time::sleep(delay).await;
                        StageOutcome {
                            topic,
                            generation,
                            stage: Stage::BackoffElapsed,
                        }
                    }
                    .boxed(),
                );
                None
            }
            None => {
                record.status = ConnectionStatus::Failed;
                self.metrics.record_failed_subscription();
                let exhausted = StreamError::RetryExhausted {
                    attempts: attempt,
                    reason: last_error.clone(),
                };
                error!("[{}] {}", topic, exhausted);
                Some(SupervisorEvent::Exhausted {
                    topic: topic.to_string(),
                    attempts: attempt,
                    last_error,
                })
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn set_status(&mut self, topic: &str, status: ConnectionStatus) {
        if let Some(record) = self.records.get_mut(topic) {
            record.status = status;
        }
    }

    fn push_resolve(&mut self, topic: String, generation: u64) {
        let connector = Arc::clone(&self.connector);
        let endpoint = Arc::clone(&self.endpoint);
        self.in_flight.push(
            async move {
                let stage = match connector.resolve(&endpoint).await {
                    Ok(addr) => Stage::Resolved(addr),
                    Err(e) => Stage::Failed(e),
                };
                StageOutcome {
                    topic,
                    generation,
                    stage,
                }
            }
            .boxed(),
        );
    }

    fn push_connect(&mut self, topic: String, generation: u64, addr: SocketAddr) {
        let connector = Arc::clone(&self.connector);
        self.in_flight.push(
            async move {
                let stage = match connector.connect(addr).await {
                    Ok(tcp) => Stage::Connected(tcp),
                    Err(e) => Stage::Failed(e),
                };
                StageOutcome {
                    topic,
                    generation,
                    stage,
                }
            }
            .boxed(),
        );
    }

    fn push_secure(&mut self, topic: String, generation: u64, tcp: C::Tcp) {
        let connector = Arc::clone(&self.connector);
        let endpoint = Arc::clone(&self.endpoint);
        self.in_flight.push(
            async move {
                let stage = match connector.secure(&endpoint, tcp).await {
                    Ok(stream) => Stage::Secured(stream),
                    Err(e) => Stage::Failed(e),
                };
                StageOutcome {
                    topic,
                    generation,
                    stage,
                }
            }
            .boxed(),
        );
    }

    fn push_handshake(&mut self, topic: String, generation: u64, stream: C::Stream) {
        let endpoint = Arc::clone(&self.endpoint);
        let timeout = self.handshake_timeout;
        self.in_flight.push(
            async move {
                let mut stream = stream;
                let stage = match handshake::perform(&mut stream, &endpoint, timeout).await {
                    Ok(leftover) => Stage::Upgraded { stream, leftover },
                    Err(e) => Stage::Failed(e),
                };
                StageOutcome {
                    topic,
                    generation,
                    stage,
                }
            }
            .boxed(),
        );
    }
}
