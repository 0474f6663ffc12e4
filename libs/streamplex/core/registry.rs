use crate::core::connection::{Connection, ConnectionId};
use std::collections::HashMap;
use tokio::time::Instant;

/// Open connections keyed by id, with a topic index
///
/// Owned by the event loop; an id is removed the moment its transport is
/// released, so late events for it are simply not found.
pub struct Registry<W> {
    connections: HashMap<ConnectionId, Connection<W>>,
    by_topic: HashMap<String, ConnectionId>,
    next_id: u64,
}

impl<W> Default for Registry<W> {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            by_topic: HashMap::new(),
            next_id: 1,
        }
    }
}

impl<W> Registry<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id for a transport about to be registered
    pub fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register a connection, returning any previous one for the same topic
    pub fn insert(&mut self, connection: Connection<W>) -> Option<Connection<W>> {
        let id = connection.id();
        let previous = self
            .by_topic
            .insert(connection.topic().to_string(), id)
            .and_then(|old| self.connections.remove(&old));
        self.connections.insert(id, connection);
        previous
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection<W>> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<W>> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn id_for_topic(&self, topic: &str) -> Option<ConnectionId> {
        self.by_topic.get(topic).copied()
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection<W>> {
        let connection = self.connections.remove(&id)?;
        if self.by_topic.get(connection.topic()) == Some(&id) {
            self.by_topic.remove(connection.topic());
        }
        Some(connection)
    }

    pub fn remove_topic(&mut self, topic: &str) -> Option<Connection<W>> {
        let id = self.by_topic.remove(topic)?;
        self.connections.remove(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection<W>> {
        self.connections.values_mut()
    }

    pub fn drain(&mut self) -> Vec<Connection<W>> {
        self.by_topic.clear();
        self.connections.drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Open connections whose oldest Ping has gone unanswered too long
    pub fn dead_peers(&self, now: Instant) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.is_open() && !c.liveness().is_healthy(now))
            .map(|c| c.id())
            .collect()
    }
}
