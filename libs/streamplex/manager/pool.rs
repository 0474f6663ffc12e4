use crate::core::{Engine, EngineHandle, MetricsSnapshot};
use crate::traits::{Connector, Result, StreamError, StreamHandler};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

struct Shard {
    handle: EngineHandle,
    thread: Option<JoinHandle<()>>,
}

/// Several engines, each on a dedicated OS thread with its own
/// current-thread runtime
///
/// Topics are pinned to the shard that first received them; a new topic goes
/// to the shard with the fewest topics. Shards share nothing but this
/// assignment table.
///
/// # Example
/// ```ignore
/// let (handler, events) = ChannelHandler::unbounded();
///
/// let pool = EnginePool::spawn(4, |_shard| {
///     streamplex::builder()
///         .url("wss://stream.binance.com:9443/ws")
///         .handler(handler.clone())
///         .build()
/// })?;
///
/// for symbol in ["btcusdt", "ethusdt", "solusdt"] {
///     pool.subscribe(symbol)?;
/// }
/// ```
pub struct EnginePool {
    shards: Vec<Shard>,
    assignments: RwLock<HashMap<String, usize>>,
}

impl EnginePool {
    /// Build `shards` engines with `factory` and start each on its own thread
    ///
    /// If any engine fails to build, the ones already started are shut down.
    pub fn spawn<F, C, H>(shards: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<(Engine<C, H>, EngineHandle)>,
        C: Connector,
        H: StreamHandler,
    {
        if shards == 0 {
            return Err(StreamError::Configuration(
                "EnginePool needs at least one shard".to_string(),
            ));
        }

        let mut pool = Self {
            shards: Vec::with_capacity(shards),
            assignments: RwLock::new(HashMap::new()),
        };

        for index in 0..shards {
            let (engine, handle) = factory(index)?;

            let thread = std::thread::Builder::new()
                .name(format!("streamplex-shard-{}", index))
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            error!("Shard {}: failed to build runtime: {}", index, e);
                            return;
                        }
                    };
                    runtime.block_on(engine.run());
                    debug!("Shard {} thread exiting", index);
                })?;

            pool.shards.push(Shard {
                handle,
                thread: Some(thread),
            });
        }

        info!("Engine pool started with {} shard(s)", shards);
        Ok(pool)
    }

    /// Number of shards
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Subscribe `topic` on its shard, assigning one if it is new
    ///
    /// Returns the shard index.
    pub fn subscribe(&self, topic: impl Into<String>) -> Result<usize> {
        let topic = topic.into();

        let shard = {
            let mut assignments = self.assignments.write();
            match assignments.get(&topic) {
                Some(&shard) => shard,
                None => {
                    let shard = least_loaded(self.shards.len(), &assignments);
                    assignments.insert(topic.clone(), shard);
                    shard
                }
            }
        };

        debug!("[{}] Assigned to shard {}", topic, shard);
        self.shards[shard].handle.subscribe(topic)?;
        Ok(shard)
    }

    /// Unsubscribe `topic`; returns false if the pool never saw it
    pub fn unsubscribe(&self, topic: &str) -> Result<bool> {
        let shard = self.assignments.write().remove(topic);
        match shard {
            Some(shard) => {
                self.shards[shard].handle.unsubscribe(topic)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn shard_of(&self, topic: &str) -> Option<usize> {
        self.assignments.read().get(topic).copied()
    }

    /// Topic count for every shard, by index
    pub fn topics_per_shard(&self) -> Vec<usize> {
        let assignments = self.assignments.read();
        let mut counts = vec![0; self.shards.len()];
        for &shard in assignments.values() {
            counts[shard] += 1;
        }
        counts
    }

    pub fn handle(&self, shard: usize) -> Option<&EngineHandle> {
        self.shards.get(shard).map(|s| &s.handle)
    }

    pub fn shard_metrics(&self) -> Vec<MetricsSnapshot> {
        self.shards.iter().map(|s| s.handle.metrics()).collect()
    }

    /// Counters summed over every shard
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shard_metrics().into_iter().sum()
    }

    /// Stop every engine and join its thread
    pub fn shutdown(&mut self) {
        for shard in &self.shards {
            shard.handle.shutdown();
        }

        for (index, shard) in self.shards.iter_mut().enumerate() {
            if let Some(thread) = shard.thread.take() {
                if thread.join().is_err() {
                    warn!("Shard {} thread panicked", index);
                }
            }
        }

        self.assignments.write().clear();
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Lowest topic count wins; ties go to the lowest index
fn least_loaded(shards: usize, assignments: &HashMap<String, usize>) -> usize {
    let mut counts = vec![0usize; shards];
    for &shard in assignments.values() {
        counts[shard] += 1;
    }
    counts
        .iter()
        .enumerate()
        .min_by_key(|&(index, count)| (*count, index))
        .map(|(index, _)| index)
        .unwrap_or(0)
}
