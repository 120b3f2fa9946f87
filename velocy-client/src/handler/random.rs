//! Random starting host with sequential failover.

use super::{AccessType, FallbackHostHandler, HostHandler};
use crate::host::Host;
use crate::resolver::HostResolver;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Starts from a uniformly random host and fails over from there the way
/// [`FallbackHostHandler`] does.
pub struct RandomHostHandler {
    resolver: Arc<dyn HostResolver>,
    fallback: FallbackHostHandler,
    seeded: Mutex<bool>,
}

impl RandomHostHandler {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            fallback: FallbackHostHandler::new(resolver.clone()),
            resolver,
            seeded: Mutex::new(false),
        }
    }
}

#[async_trait]
impl HostHandler for RandomHostHandler {
    async fn get(&self, access: AccessType) -> Option<Arc<Host>> {
        let seeded = *self.seeded.lock();
        if !seeded {
            let hosts = self.resolver.resolve(true, false).await;
            let chosen = hosts.choose(&mut rand::thread_rng()).cloned();
            if let Some(host) = chosen {
                tracing::debug!("Randomly chose host {}", host.description());
                self.fallback.seed(host);
                *self.seeded.lock() = true;
            }
        }
        self.fallback.get(access).await
    }

    fn success(&self) {
        self.fallback.success();
    }

    fn fail(&self) {
        self.fallback.fail();
    }

    /// Restores the failover budget and draws a new starting host on the
    /// next `get`.
    fn reset(&self) {
        self.fallback.reset();
        *self.seeded.lock() = false;
    }

    async fn close(&self) {
        self.fallback.close().await;
    }

    async fn close_current_on_error(&self) {
        self.fallback.close_current_on_error().await;
    }
}
