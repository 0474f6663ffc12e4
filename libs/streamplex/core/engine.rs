//! The event loop
//!
//! # Architecture
//!
//! One engine is one tokio task that owns every connection it manages. No
//! locks are taken inside the loop; the outside world talks to it through an
//! [`EngineHandle`]:
//!
//! ```text
//!  EngineHandle ──commands──┐
//!  EngineHandle ──wake──────┤
//!                           ▼
//!                 ┌───────────────────────┐        ┌──────────────┐
//!                 │  select! (biased)     │<──────>│  Supervisor  │  resolve/connect/
//!                 │   1. wake (shutdown)  │        └──────────────┘  tls/handshake
//!                 │   2. commands         │
//!                 │   3. stage outcomes   │        ┌──────────────┐
//!                 │   4. socket reads ────┼───────>│  Registry    │──> StreamHandler
//!                 │   5. keepalive timer  │        └──────────────┘
//!                 └───────────────────────┘
//! ```
//!
//! Reads from every connection are merged into one `SelectAll`; each read
//! stream is abortable so evicting a connection also stops its reads.

use crate::core::config::EngineConfig;
use crate::core::connection::{ConnectionId, ConnectionStatus, Connection, Dispatch};
use crate::core::keepalive::KeepaliveScheduler;
use crate::core::metrics::{EngineMetrics, MetricsSnapshot};
use crate::core::registry::Registry;
use crate::core::supervisor::{Supervisor, SupervisorEvent};
use crate::traits::{
    CloseReason, Connector, Endpoint, Message, ReconnectionStrategy, Result, StreamError,
    StreamHandler, SubscriptionFormatter,
};
use futures::future::AbortHandle;
use futures::stream::{self, Abortable, BoxStream, SelectAll, StreamExt};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, WriteHalf};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound on a best-effort Close handshake write
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Requests from an [`EngineHandle`] to the loop
#[derive(Debug)]
pub enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Status(String, oneshot::Sender<Option<ConnectionStatus>>),
}

/// Cloneable control surface for a running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    wake: Arc<Notify>,
    metrics: Arc<EngineMetrics>,
}

impl EngineHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| StreamError::ChannelSend("Engine has stopped".to_string()))
    }

    /// Open a connection for `topic` (no-op if it is already subscribed)
    pub fn subscribe(&self, topic: impl Into<String>) -> Result<()> {
        self.send(Command::Subscribe(topic.into()))
    }

    /// Close the connection for `topic` and stop reconnecting it
    pub fn unsubscribe(&self, topic: impl Into<String>) -> Result<()> {
        self.send(Command::Unsubscribe(topic.into()))
    }

    /// Lifecycle status of `topic`, or None if the engine does not know it
    pub async fn status(&self, topic: impl Into<String>) -> Result<Option<ConnectionStatus>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(topic.into(), tx))?;
        rx.await
            .map_err(|_| StreamError::ChannelSend("Engine stopped before replying".to_string()))
    }

    /// Ask the loop to close every connection and return
    pub fn shutdown(&self) {
        self.wake.notify_one();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

enum ReadOutcome {
    Data(Vec<u8>),
    Eof,
    Error(io::Error),
}

type ReadStream = Abortable<BoxStream<'static, (ConnectionId, ReadOutcome)>>;

/// One read of up to `chunk` bytes per item; ends after EOF or an error
fn read_stream<R>(id: ConnectionId, reader: R, chunk: usize) -> (ReadStream, AbortHandle)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reads = stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; chunk];
        match reader.read(&mut buf).await {
            Ok(0) => Some(((id, ReadOutcome::Eof), None)),
            Ok(n) => {
                buf.truncate(n);
                Some(((id, ReadOutcome::Data(buf)), Some(reader)))
            }
            Err(e) => Some(((id, ReadOutcome::Error(e)), None)),
        }
    })
    .boxed();
    stream::abortable(reads)
}

/// A write that timed out may have left a partial frame on the wire
fn is_stalled(error: &StreamError) -> bool {
    matches!(error, StreamError::Timeout(_))
}

/// Multi-connection WebSocket engine for one endpoint
pub struct Engine<C: Connector, H: StreamHandler> {
    endpoint: Arc<Endpoint>,
    config: EngineConfig,
    handler: H,
    formatter: Box<dyn SubscriptionFormatter>,
    supervisor: Supervisor<C>,
    registry: Registry<WriteHalf<C::Stream>>,
    reads: SelectAll<ReadStream>,
    keepalive: KeepaliveScheduler,
    commands: mpsc::UnboundedReceiver<Command>,
    wake: Arc<Notify>,
    metrics: Arc<EngineMetrics>,
    initial_topics: Vec<String>,
    request_id: u64,
}

impl<C: Connector, H: StreamHandler> Engine<C, H> {
    pub(crate) fn new(
        connector: C,
        endpoint: Endpoint,
        handler: H,
        formatter: Box<dyn SubscriptionFormatter>,
        strategy: Box<dyn ReconnectionStrategy>,
        config: EngineConfig,
        initial_topics: Vec<String>,
    ) -> Result<(Self, EngineHandle)> {
        config.validate()?;

        let endpoint = Arc::new(endpoint);
        let metrics = Arc::new(EngineMetrics::new());
        let wake = Arc::new(Notify::new());
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor::new(
            Arc::new(connector),
            Arc::clone(&endpoint),
            strategy,
            config.handshake_timeout(),
            Arc::clone(&metrics),
        );
        let keepalive = KeepaliveScheduler::new(
            Instant::now(),
            config.idle_tick(),
            config.ping_broadcast_interval(),
            config.liveness_check_interval(),
        );

        let handle = EngineHandle {
            commands: command_tx,
            wake: Arc::clone(&wake),
            metrics: Arc::clone(&metrics),
        };

        let engine = Self {
            endpoint,
            config,
            handler,
            formatter,
            supervisor,
            registry: Registry::new(),
            reads: SelectAll::new(),
            keepalive,
            commands: command_rx,
            wake,
            metrics,
            initial_topics,
            request_id: 0,
        };

        Ok((engine, handle))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run on a new tokio task
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drive every connection until shutdown
    ///
    /// Also returns once every [`EngineHandle`] is dropped and no
    /// subscription is open or being established.
    pub async fn run(mut self) {
        info!(
            "Engine starting for {} with {} initial topic(s)",
            self.endpoint.url(),
            self.initial_topics.len()
        );

        let now = Instant::now();
        self.keepalive = KeepaliveScheduler::new(
            now,
            self.config.idle_tick(),
            self.config.ping_broadcast_interval(),
            self.config.liveness_check_interval(),
        );

        for topic in std::mem::take(&mut self.initial_topics) {
            self.subscribe(topic);
        }

        let mut commands_open = true;

        loop {
            if !commands_open && self.registry.is_empty() && self.supervisor.is_idle() {
                info!("All handles dropped and no subscriptions remain, stopping");
                break;
            }

            let deadline = self.keepalive.next_deadline();

            tokio::select! {
                biased;

                _ = self.wake.notified() => {
                    self.shutdown().await;
                    break;
                }

                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => {
                        self.keepalive.on_activity(Instant::now());
                        self.handle_command(command).await;
                    }
                    None => {
                        debug!("Command channel closed");
                        commands_open = false;
                    }
                },

                Some(outcome) = self.supervisor.next_outcome(), if !self.supervisor.is_idle() => {
                    self.keepalive.on_activity(Instant::now());
                    if let Some(event) = self.supervisor.handle(outcome) {
                        self.on_supervisor_event(event).await;
                    }
                }

                Some((id, read)) = self.reads.next(), if !self.reads.is_empty() => {
                    self.keepalive.on_activity(Instant::now());
                    self.on_read(id, read).await;
                }

                _ = tokio::time::sleep_until(deadline) => {
                    self.on_keepalive().await;
                }
            }
        }

        info!("Engine stopped ({:?})", self.metrics.snapshot());
    }

    fn subscribe(&mut self, topic: String) {
        if self.registry.id_for_topic(&topic).is_some() || self.supervisor.is_pending(&topic) {
            debug!("[{}] Already subscribed", topic);
            return;
        }
        self.supervisor.start(&topic);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe(topic) => self.subscribe(topic),
            Command::Unsubscribe(topic) => self.unsubscribe(&topic).await,
            Command::Status(topic, reply) => {
                let status = self
                    .registry
                    .id_for_topic(&topic)
                    .and_then(|id| self.registry.get(id))
                    .map(|conn| conn.status())
                    .or_else(|| self.supervisor.status(&topic));
                let _ = reply.send(status);
            }
        }
    }

    async fn unsubscribe(&mut self, topic: &str) {
        let was_pending = self.supervisor.is_pending(topic);
        let was_known = self.supervisor.cancel(topic);

        if let Some(mut conn) = self.registry.remove_topic(topic) {
            self.request_id += 1;
            if let Some(message) = self.formatter.unsubscribe(topic, self.request_id) {
                if conn.send_message(&message).await.is_ok() {
                    self.metrics.record_frame_sent();
                }
            }
            if tokio::time::timeout(CLOSE_TIMEOUT, conn.close(Some(1000), "unsubscribe"))
                .await
                .is_err()
            {
                conn.release();
            }
            self.metrics.connection_closed();
            info!("[{} {}] Unsubscribed", topic, conn.id());
            self.handler.on_closed(topic, &CloseReason::Unsubscribed);
        } else if was_pending {
            info!("[{}] Unsubscribed before the connection opened", topic);
            self.handler.on_closed(topic, &CloseReason::Unsubscribed);
        } else if !was_known {
            debug!("[{}] Unsubscribe for unknown topic", topic);
        }
    }

    async fn on_supervisor_event(&mut self, event: SupervisorEvent<C::Stream>) {
        match event {
            SupervisorEvent::Ready {
                topic,
                stream,
                leftover,
            } => self.on_open(topic, stream, leftover).await,
            SupervisorEvent::Exhausted {
                topic,
                attempts,
                last_error,
            } => {
                self.handler.on_closed(
                    &topic,
                    &CloseReason::RetryExhausted {
                        attempts,
                        last_error,
                    },
                );
            }
        }
    }

    async fn on_open(&mut self, topic: String, stream: C::Stream, leftover: Vec<u8>) {
        let id = self.registry.allocate_id();
        let (read_half, write_half) = tokio::io::split(stream);
        let (reads, abort) = read_stream(id, read_half, self.config.read_chunk_size);
        self.reads.push(reads);

        let has_leftover = !leftover.is_empty();
        let mut conn = Connection::open(
            id,
            topic.clone(),
            write_half,
            abort,
            leftover,
            Instant::now(),
            self.config.dead_peer_timeout(),
        )
        .with_write_timeout(self.config.write_timeout());

        self.metrics.connection_opened();
        info!("[{} {}] Open", topic, id);

        self.request_id += 1;
        let mut stalled = None;
        if let Some(message) = self.formatter.subscribe(&topic, self.request_id) {
            match conn.send_message(&message).await {
                Ok(()) => {
                    self.metrics.record_frame_sent();
                    debug!("[{} {}] Subscription request {} sent", topic, id, self.request_id);
                }
                Err(e) => {
                    warn!("[{} {}] Failed to send subscription: {}", topic, id, e);
                    if is_stalled(&e) {
                        stalled = Some(e);
                    }
                }
            }
        }

        if let Some(mut stale) = self.registry.insert(conn) {
            warn!("[{} {}] Replacing connection {}", topic, id, stale.id());
            stale.release();
            self.metrics.connection_closed();
        }

        self.handler.on_open(&topic);

        if let Some(e) = stalled {
            self.evict(id, CloseReason::Transport(e.to_string())).await;
            return;
        }

        if has_leftover {
            self.process_bytes(id, &[]).await;
        }
    }

    async fn on_read(&mut self, id: ConnectionId, read: ReadOutcome) {
        if !self.registry.contains(id) {
            debug!("Ignoring read event for released connection {}", id);
            return;
        }

        match read {
            ReadOutcome::Data(bytes) => self.process_bytes(id, &bytes).await,
            ReadOutcome::Eof => self.evict(id, CloseReason::Hangup).await,
            ReadOutcome::Error(e) => self.evict(id, CloseReason::Transport(e.to_string())).await,
        }
    }

    async fn process_bytes(&mut self, id: ConnectionId, data: &[u8]) {
        let ceiling = self.config.receive_buffer_ceiling;
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        let topic = conn.topic().to_string();
        let dispatches = conn.ingest(data, Instant::now(), ceiling);

        for dispatch in dispatches {
            match dispatch {
                Dispatch::Deliver(message) => self.deliver(&topic, message),
                Dispatch::Reply(bytes) => {
                    let Some(conn) = self.registry.get_mut(id) else {
                        return;
                    };
                    match conn.send_raw(&bytes).await {
                        Ok(()) => self.metrics.record_frame_sent(),
                        Err(e) if is_stalled(&e) => {
                            // Peer stopped reading; later dispatches die with it
                            self.evict(id, CloseReason::Transport(e.to_string())).await;
                            return;
                        }
                        Err(e) => warn!("[{} {}] Failed to answer Ping: {}", topic, id, e),
                    }
                }
                Dispatch::PongReceived => self.metrics.record_pong(),
                Dispatch::Violation(detail) => {
                    self.metrics.record_violation();
                    debug!("[{} {}] Protocol violation: {}", topic, id, detail);
                }
                Dispatch::Overflow { .. } => self.metrics.record_overflow(),
                Dispatch::Closed { code, reason } => {
                    if let Some(mut conn) = self.registry.remove(id) {
                        // Echo the peer's status code
                        if tokio::time::timeout(CLOSE_TIMEOUT, conn.close(code, ""))
                            .await
                            .is_err()
                        {
                            conn.release();
                        }
                        self.metrics.connection_closed();
                    }
                    info!("[{} {}] Closed by peer (code: {:?})", topic, id, code);

                    let reason = CloseReason::PeerClosed { code, reason };
                    self.handler.on_closed(&topic, &reason);
                    self.schedule_reconnect(&topic, &reason);
                }
            }
        }
    }

    fn deliver(&mut self, topic: &str, message: Message) {
        if let Some(request_id) = self.formatter.acknowledged_id(&message) {
            debug!("[{}] Request {} acknowledged", topic, request_id);
            return;
        }
        self.metrics.record_message();
        self.handler
            .on_message(topic, &message.payload, message.is_text());
    }

    /// Release a dead connection and hand its topic to the supervisor
    async fn evict(&mut self, id: ConnectionId, reason: CloseReason) {
        let Some(mut conn) = self.registry.remove(id) else {
            return;
        };
        conn.release();
        self.metrics.connection_closed();

        let topic = conn.topic().to_string();
        warn!("[{} {}] Connection lost: {}", topic, id, reason);
        self.handler.on_closed(&topic, &reason);

        if reason.should_reconnect() {
            self.schedule_reconnect(&topic, &reason);
        }
    }

    fn schedule_reconnect(&mut self, topic: &str, reason: &CloseReason) {
        if let Some(SupervisorEvent::Exhausted {
            topic,
            attempts,
            last_error,
        }) = self.supervisor.reconnect(topic, &reason.to_string())
        {
            self.handler.on_closed(
                &topic,
                &CloseReason::RetryExhausted {
                    attempts,
                    last_error,
                },
            );
        }
    }

    async fn on_keepalive(&mut self) {
        let now = Instant::now();
        let due = self.keepalive.poll(now);

        if due.ping {
            self.ping_all(now).await;
        }

        if due.check {
            for id in self.registry.dead_peers(now) {
                if let Some(conn) = self.registry.get(id) {
                    let liveness = conn.liveness();
                    let last_pong = liveness
                        .time_since_last_pong(now)
                        .map_or_else(|| "never".to_string(), |age| format!("{:?} ago", age));
                    warn!(
                        "[{} {}] Ping unanswered for {:?} (last Pong {}, last data {:?} ago)",
                        conn.topic(),
                        id,
                        liveness.awaiting_for(now).unwrap_or_default(),
                        last_pong,
                        now.saturating_duration_since(liveness.last_activity())
                    );
                }
                self.evict(id, CloseReason::DeadPeer).await;
            }
        }
    }

    async fn ping_all(&mut self, now: Instant) {
        let mut failed = Vec::new();

        for conn in self.registry.iter_mut() {
            if !conn.is_open() {
                continue;
            }
            match conn.send_ping(now).await {
                Ok(()) => {
                    self.metrics.record_ping();
                    self.metrics.record_frame_sent();
                }
                Err(e) => {
                    warn!("[{} {}] Ping failed: {}", conn.topic(), conn.id(), e);
                    failed.push((conn.id(), e.to_string()));
                }
            }
        }

        debug!("Pinged {} connection(s)", self.registry.len() - failed.len());

        for (id, error) in failed {
            self.evict(id, CloseReason::Transport(error)).await;
        }
    }

    async fn shutdown(&mut self) {
        info!(
            "Shutting down: closing {} connection(s), dropping {} pending",
            self.registry.len(),
            self.supervisor.pending_count()
        );
        self.supervisor.clear();

        for mut conn in self.registry.drain() {
            if tokio::time::timeout(CLOSE_TIMEOUT, conn.close(Some(1000), "shutdown"))
                .await
                .is_err()
            {
                conn.release();
            }
            self.metrics.connection_closed();
            self.handler.on_closed(conn.topic(), &CloseReason::Shutdown);
        }

        self.reads = SelectAll::new();
    }
}
