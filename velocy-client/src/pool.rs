//! Per-host connection pool.

use crate::connection::{Connection, ConnectionFactory};
use crate::host::HostDescription;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

#[derive(Default)]
struct PoolState {
    connections: Vec<Arc<dyn Connection>>,
    next: usize,
}

impl PoolState {
    fn rotate(&mut self) -> usize {
        let next = self.next;
        self.next = self.next.wrapping_add(1);
        next
    }
}

/// A bounded set of connections for one host.
///
/// Connections are created lazily up to `max_connections` and then handed
/// out in rotation. Closed connections are dropped, never handed out.
pub struct ConnectionPool {
    host: HostDescription,
    max_connections: usize,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    /// Creates an empty pool. `max_connections` is raised to at least 1.
    pub fn new(
        host: HostDescription,
        max_connections: usize,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            host,
            max_connections: max_connections.max(1),
            factory,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn host(&self) -> &HostDescription {
        &self.host
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands out a connection.
    ///
    /// Without a pin, a new connection is created while below the bound,
    /// otherwise existing ones are reused in rotation. With a pin, a
    /// connection bound to the pinned endpoint is reused if one exists;
    /// otherwise one is created, replacing the next slot in rotation when the
    /// pool is full. A replaced connection stays usable by whoever still
    /// holds it and closes once they drop it.
    pub fn connection(&self, pinned: Option<&HostDescription>) -> Arc<dyn Connection> {
        let target = pinned.unwrap_or(&self.host);
        let mut state = self.state.lock();
        state.connections.retain(|c| !c.is_closed());

        let matching: Vec<usize> = state
            .connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.host() == target)
            .map(|(i, _)| i)
            .collect();
        let below_bound = state.connections.len() < self.max_connections;

        if below_bound && (pinned.is_none() || matching.is_empty()) {
            let connection = self.factory.create(target);
            tracing::debug!(
                "Pool {}: created connection {} to {} ({}/{})",
                self.host,
                connection.id(),
                target,
                state.connections.len() + 1,
                self.max_connections
            );
            state.connections.push(connection.clone());
            return connection;
        }

        if !matching.is_empty() {
            let index = matching[state.rotate() % matching.len()];
            return state.connections[index].clone();
        }

        let slot = state.rotate() % state.connections.len();
        let connection = self.factory.create(target);
        tracing::debug!(
            "Pool {}: replacing connection {} with {} to {}",
            self.host,
            state.connections[slot].id(),
            connection.id(),
            target
        );
        let _replaced = std::mem::replace(&mut state.connections[slot], connection.clone());
        drop(state);
        connection
    }

    /// Closes and removes every connection. The pool stays usable.
    pub async fn close(&self) {
        for connection in self.take_all() {
            connection.close().await;
        }
    }

    /// Like [`close`](Self::close), after a failure on this host.
    pub async fn close_on_error(&self) {
        for connection in self.take_all() {
            connection.close_on_error().await;
        }
    }

    fn take_all(&self) -> Vec<Arc<dyn Connection>> {
        let mut state = self.state.lock();
        state.next = 0;
        std::mem::take(&mut state.connections)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("host", &self.host)
            .field("max_connections", &self.max_connections)
            .field("connections", &self.len())
            .finish()
    }
}
