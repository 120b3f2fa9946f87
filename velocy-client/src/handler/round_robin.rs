//! Round-robin selection.

use super::{AccessType, HostHandler};
use crate::host::Host;
use crate::resolver::HostResolver;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct RoundRobinState {
    next: usize,
    fails: usize,
    current: Option<Arc<Host>>,
    resolved: bool,
}

/// Moves to the next host on every `get`, regardless of outcome.
///
/// Gives up once more consecutive failures than hosts have been reported.
pub struct RoundRobinHostHandler {
    resolver: Arc<dyn HostResolver>,
    state: Mutex<RoundRobinState>,
}

impl RoundRobinHostHandler {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver,
            state: Mutex::new(RoundRobinState::default()),
        }
    }

    /// Consecutive failures since the last success or reset.
    pub fn fails(&self) -> usize {
        self.state.lock().fails
    }
}

#[async_trait]
impl HostHandler for RoundRobinHostHandler {
    async fn get(&self, _access: AccessType) -> Option<Arc<Host>> {
        let initial = !self.state.lock().resolved;
        let hosts = self.resolver.resolve(initial, false).await;

        let mut state = self.state.lock();
        state.resolved = true;
        if hosts.is_empty() || state.fails > hosts.len() {
            return None;
        }

        let host = hosts[state.next % hosts.len()].clone();
        state.next = state.next.wrapping_add(1);
        state.current = Some(host.clone());
        Some(host)
    }

    fn success(&self) {
        self.state.lock().fails = 0;
    }

    fn fail(&self) {
        let mut state = self.state.lock();
        state.fails += 1;
        if let Some(ref host) = state.current {
            tracing::warn!("Host {} failed ({} consecutive)", host.description(), state.fails);
        }
    }

    fn reset(&self) {
        self.state.lock().fails = 0;
    }

    async fn close(&self) {
        self.resolver.close().await;
    }

    async fn close_current_on_error(&self) {
        let current = self.state.lock().current.clone();
        if let Some(host) = current {
            host.close_on_error().await;
        }
    }
}
