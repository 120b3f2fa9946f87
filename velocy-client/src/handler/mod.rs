//! Host selection strategies.
//!
//! A [`HostHandler`] picks the host for the next attempt and is told how the
//! attempt went. `get()` returning `None` means no viable host remains for
//! this request. All handler state sits behind one mutex per handler.

mod dirty_read;
mod fallback;
mod random;
mod round_robin;

pub use dirty_read::DirtyReadHostHandler;
pub use fallback::FallbackHostHandler;
pub use random::RandomHostHandler;
pub use round_robin::RoundRobinHostHandler;

use crate::config::LoadBalancingStrategy;
use crate::host::{Host, HostDescription};
use crate::resolver::HostResolver;
use async_trait::async_trait;
use std::sync::Arc;
use velocy_protocol::Request;

/// How a request accesses data, which decides the handler consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Write,
    Read,
    /// A read that may be served by a follower.
    DirtyRead,
}

impl AccessType {
    pub fn of(request: &Request) -> Self {
        if request.allows_dirty_read() {
            AccessType::DirtyRead
        } else if request.request_type.is_read() {
            AccessType::Read
        } else {
            AccessType::Write
        }
    }
}

/// Selects hosts and tracks the outcome of attempts on them.
#[async_trait]
pub trait HostHandler: Send + Sync {
    /// Returns the host for the next attempt, or `None` when exhausted.
    async fn get(&self, access: AccessType) -> Option<Arc<Host>>;

    /// The last host returned by `get` answered.
    fn success(&self);

    /// The last host returned by `get` could not be reached.
    fn fail(&self);

    /// Restores the full failover budget.
    fn reset(&self);

    /// Closes every host.
    async fn close(&self);

    /// Closes the connections of the last host returned by `get`.
    async fn close_current_on_error(&self);
}

/// Builds the handler stack for a strategy: the strategy's handler serves
/// normal requests, a round-robin handler serves dirty reads.
pub fn create_host_handler(
    strategy: LoadBalancingStrategy,
    resolver: Arc<dyn HostResolver>,
) -> Arc<dyn HostHandler> {
    let master: Arc<dyn HostHandler> = match strategy {
        LoadBalancingStrategy::None => Arc::new(FallbackHostHandler::new(resolver.clone())),
        LoadBalancingStrategy::OneRandom => Arc::new(RandomHostHandler::new(resolver.clone())),
        LoadBalancingStrategy::RoundRobin => {
            Arc::new(RoundRobinHostHandler::new(resolver.clone()))
        }
    };
    let follower = Arc::new(RoundRobinHostHandler::new(resolver));
    Arc::new(DirtyReadHostHandler::new(master, follower))
}

fn position(hosts: &[Arc<Host>], description: &HostDescription) -> Option<usize> {
    hosts.iter().position(|h| h.description() == description)
}
