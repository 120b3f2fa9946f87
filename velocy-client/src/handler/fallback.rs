//! Sequential failover.

use super::{position, AccessType, HostHandler};
use crate::host::{Host, HostDescription};
use crate::resolver::HostResolver;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Full passes over the host list before giving up.
pub const MAX_ITERATIONS: usize = 3;

#[derive(Default)]
struct FallbackState {
    hosts: Vec<Arc<Host>>,
    current: Option<Arc<Host>>,
    last_success: Option<HostDescription>,
    iterations: usize,
    resolved: bool,
}

impl FallbackState {
    /// Adopts a freshly resolved host list, restarting from its first host
    /// if the current one is gone.
    fn update_hosts(&mut self, hosts: Vec<Arc<Host>>) {
        let current = self
            .current
            .as_ref()
            .and_then(|c| position(&hosts, c.description()))
            .map(|i| hosts[i].clone());
        self.hosts = hosts;

        match current {
            Some(current) => self.current = Some(current),
            None => {
                self.current = self.hosts.first().cloned();
                self.last_success = self.current.as_ref().map(|h| h.description().clone());
                self.iterations = 0;
            }
        }
    }

    fn seed(&mut self, host: Arc<Host>) {
        self.last_success = Some(host.description().clone());
        self.current = Some(host);
        self.iterations = 0;
    }
}

/// Uses one host until it fails, then moves to the next in list order.
///
/// Gives up once the failover has wrapped around [`MAX_ITERATIONS`] times
/// and is back at the last host that answered.
pub struct FallbackHostHandler {
    resolver: Arc<dyn HostResolver>,
    state: Mutex<FallbackState>,
}

impl FallbackHostHandler {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver,
            state: Mutex::new(FallbackState::default()),
        }
    }

    /// Makes `host` the current and last successful host, so failover
    /// starts from it.
    pub fn seed(&self, host: Arc<Host>) {
        self.state.lock().seed(host);
    }

    fn current(&self) -> Option<Arc<Host>> {
        self.state.lock().current.clone()
    }
}

#[async_trait]
impl HostHandler for FallbackHostHandler {
    async fn get(&self, _access: AccessType) -> Option<Arc<Host>> {
        let initial = !self.state.lock().resolved;
        let hosts = self.resolver.resolve(initial, false).await;

        let mut state = self.state.lock();
        state.resolved = true;
        state.update_hosts(hosts);

        let current = state.current.clone()?;
        if state.last_success.as_ref() == Some(current.description())
            && state.iterations >= MAX_ITERATIONS
        {
            tracing::debug!("Fallback exhausted after {} iterations", state.iterations);
            return None;
        }
        Some(current)
    }

    fn success(&self) {
        let mut state = self.state.lock();
        state.last_success = state.current.as_ref().map(|h| h.description().clone());
        state.iterations = 0;
    }

    fn fail(&self) {
        let mut state = self.state.lock();
        let len = state.hosts.len();
        if len == 0 {
            return;
        }

        let index = state
            .current
            .as_ref()
            .and_then(|c| position(&state.hosts, c.description()))
            .unwrap_or(0);
        let next = index + 1;
        let next = if next < len {
            next
        } else {
            state.iterations += 1;
            0
        };

        let host = state.hosts[next].clone();
        tracing::warn!(
            "Failing over from {} to {}",
            state.hosts[index].description(),
            host.description()
        );
        state.current = Some(host);
    }

    fn reset(&self) {
        self.state.lock().iterations = 0;
    }

    async fn close(&self) {
        self.resolver.close().await;
    }

    async fn close_current_on_error(&self) {
        if let Some(current) = self.current() {
            current.close_on_error().await;
        }
    }
}
