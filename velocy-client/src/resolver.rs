//! Host resolvers: where the current host list comes from.

use crate::error::DriverError;
use crate::host::{Host, HostDescription, HostSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Default refresh interval of the cluster host list.
pub const DEFAULT_HOST_LIST_TTL: Duration = Duration::from_secs(3600);

/// Builds the host for a newly discovered endpoint.
pub type HostFactory = Arc<dyn Fn(&HostDescription) -> Arc<Host> + Send + Sync>;

/// Lists the endpoints a cluster currently knows about, as location strings
/// such as `tcp://10.0.0.1:8529`.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve_endpoints(&self) -> Result<Vec<String>, DriverError>;
}

/// Produces the current list of hosts.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Installs the endpoint resolver used for refreshing. Only the first
    /// call has an effect; static resolvers ignore it.
    fn init(&self, _endpoint_resolver: Arc<dyn EndpointResolver>) {}

    /// Returns the current hosts. `initial` marks the first resolution of a
    /// handler; `close_connections` closes the hosts' connections afterwards.
    async fn resolve(&self, initial: bool, close_connections: bool) -> Vec<Arc<Host>>;

    /// Closes every host.
    async fn close(&self);
}

async fn close_all(hosts: &[Arc<Host>]) {
    for host in hosts {
        host.close().await;
    }
}

/// A fixed host list.
#[derive(Debug)]
pub struct SimpleHostResolver {
    hosts: Mutex<HostSet>,
}

impl SimpleHostResolver {
    pub fn new(hosts: impl IntoIterator<Item = Arc<Host>>) -> Self {
        Self {
            hosts: Mutex::new(HostSet::from_hosts(hosts)),
        }
    }
}

#[async_trait]
impl HostResolver for SimpleHostResolver {
    async fn resolve(&self, _initial: bool, close_connections: bool) -> Vec<Arc<Host>> {
        let hosts = self.hosts.lock().hosts().to_vec();
        if close_connections {
            close_all(&hosts).await;
        }
        hosts
    }

    async fn close(&self) {
        let hosts = self.hosts.lock().hosts().to_vec();
        close_all(&hosts).await;
    }
}

/// A host list refreshed from the cluster's endpoint list.
///
/// Refreshes happen on non-initial resolutions once the list is older than
/// the TTL; a zero TTL refreshes on every such resolution. A refresh that
/// yields no usable endpoint keeps the current list. Only one refresh runs
/// at a time, and resolutions made while it runs use the current list.
pub struct ExtendedHostResolver {
    hosts: Mutex<HostSet>,
    host_factory: HostFactory,
    ttl: Duration,
    last_update: Mutex<Option<Instant>>,
    refreshing: AtomicBool,
    endpoint_resolver: OnceLock<Arc<dyn EndpointResolver>>,
}

impl ExtendedHostResolver {
    pub fn new(
        hosts: impl IntoIterator<Item = Arc<Host>>,
        host_factory: HostFactory,
        ttl: Duration,
    ) -> Self {
        Self {
            hosts: Mutex::new(HostSet::from_hosts(hosts)),
            host_factory,
            ttl,
            last_update: Mutex::new(None),
            refreshing: AtomicBool::new(false),
            endpoint_resolver: OnceLock::new(),
        }
    }

    /// Claims the refresh if the list is stale and no refresh is running.
    /// The endpoint request resolves hosts through this resolver, so the
    /// claim must hold until the refresh completes.
    fn claim_refresh(&self) -> Option<RefreshGuard<'_>> {
        let mut last_update = self.last_update.lock();
        if matches!(*last_update, Some(at) if at.elapsed() < self.ttl) {
            return None;
        }
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        *last_update = Some(Instant::now());
        Some(RefreshGuard(&self.refreshing))
    }

    async fn refresh(&self, endpoint_resolver: &dyn EndpointResolver) {
        let endpoints = match endpoint_resolver.resolve_endpoints().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::warn!("Failed to refresh host list: {}", e);
                return;
            }
        };

        let descriptions: Vec<HostDescription> = endpoints
            .iter()
            .filter_map(|endpoint| match HostDescription::parse_location(endpoint) {
                Ok(description) => Some(description),
                Err(e) => {
                    tracing::warn!("Ignoring endpoint: {}", e);
                    None
                }
            })
            .collect();
        if descriptions.is_empty() {
            tracing::debug!("Endpoint list empty, keeping current hosts");
            return;
        }

        let (retired, current) = {
            let mut hosts = self.hosts.lock();
            let before = hosts.len();
            hosts.mark_all_for_deletion();
            for description in &descriptions {
                hosts.add_or_retain(description, |d| (self.host_factory)(d));
            }
            let retired = hosts.clear_all_marked_for_deletion();
            let changed = !retired.is_empty() || hosts.len() != before;
            let current: Vec<String> = hosts
                .hosts()
                .iter()
                .map(|h| h.description().to_string())
                .collect();
            (retired, changed.then_some(current))
        };

        if let Some(current) = current {
            tracing::info!("Host list updated: [{}]", current.join(", "));
        }
        retired.close().await;
    }
}

/// Releases the refresh claim, also when the refresh future is dropped.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl HostResolver for ExtendedHostResolver {
    fn init(&self, endpoint_resolver: Arc<dyn EndpointResolver>) {
        let _ = self.endpoint_resolver.set(endpoint_resolver);
    }

    async fn resolve(&self, initial: bool, close_connections: bool) -> Vec<Arc<Host>> {
        if !initial {
            if let Some(endpoint_resolver) = self.endpoint_resolver.get() {
                if let Some(_guard) = self.claim_refresh() {
                    self.refresh(endpoint_resolver.as_ref()).await;
                }
            }
        }

        let hosts = self.hosts.lock().hosts().to_vec();
        if close_connections {
            close_all(&hosts).await;
        }
        hosts
    }

    async fn close(&self) {
        let hosts = self.hosts.lock().hosts().to_vec();
        close_all(&hosts).await;
    }
}
