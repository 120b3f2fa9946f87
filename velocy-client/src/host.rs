//! Hosts, host descriptions and host sets.

use crate::connection::Connection;
use crate::error::DriverError;
use crate::pool::ConnectionPool;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use velocy_protocol::DEFAULT_PORT;

/// Address of a server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostDescription {
    host: String,
    port: u16,
}

impl HostDescription {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parses an endpoint location such as `tcp://db1:8529`,
    /// `ssl://[::1]:8530` or `http://db1:8529/_db/_system`.
    ///
    /// The scheme and any path are ignored; a missing port defaults to the
    /// VelocyStream port.
    pub fn parse_location(location: &str) -> Result<Self, DriverError> {
        let invalid = || DriverError::InvalidEndpoint(location.to_string());

        let rest = match location.split_once("://") {
            Some((_, rest)) => rest,
            None => location,
        };
        let authority = rest.split('/').next().unwrap_or_default().trim();
        if authority.is_empty() {
            return Err(invalid());
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match tail {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(invalid)?),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => return Err(invalid()),
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for HostDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostDescription {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_location(s)
    }
}

impl Serialize for HostDescription {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HostDescription {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Caller-owned pin to a host.
///
/// After a successful request the handle holds the host that served it;
/// passing it to the next request routes that request to the same host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostHandle {
    host: Option<HostDescription>,
}

impl HostHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pinned(host: HostDescription) -> Self {
        Self { host: Some(host) }
    }

    pub fn host(&self) -> Option<&HostDescription> {
        self.host.as_ref()
    }

    pub fn set_host(&mut self, host: HostDescription) {
        self.host = Some(host);
    }

    pub fn clear(&mut self) {
        self.host = None;
    }
}

/// A server endpoint together with its connection pool.
pub struct Host {
    description: HostDescription,
    pool: ConnectionPool,
    marked_for_deletion: AtomicBool,
}

impl Host {
    pub fn new(description: HostDescription, pool: ConnectionPool) -> Self {
        Self {
            description,
            pool,
            marked_for_deletion: AtomicBool::new(false),
        }
    }

    pub fn description(&self) -> &HostDescription {
        &self.description
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Returns a connection from the pool, bound to `pinned` when given.
    pub fn connection(&self, pinned: Option<&HostDescription>) -> Arc<dyn Connection> {
        self.pool.connection(pinned)
    }

    /// Closes every pooled connection. The pool reopens on the next request.
    pub async fn close(&self) {
        tracing::debug!("Closing host {}", self.description);
        self.pool.close().await;
    }

    /// Closes every pooled connection after a failure on this host.
    pub async fn close_on_error(&self) {
        tracing::warn!("Closing connections to {} after error", self.description);
        self.pool.close_on_error().await;
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::SeqCst)
    }

    pub fn set_marked_for_deletion(&self, marked: bool) {
        self.marked_for_deletion.store(marked, Ordering::SeqCst);
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("description", &self.description)
            .field("connections", &self.pool.len())
            .field("marked_for_deletion", &self.is_marked_for_deletion())
            .finish()
    }
}

/// Hosts removed from a [`HostSet`] that still need closing.
#[must_use = "retired hosts keep their connections until closed"]
#[derive(Debug, Default)]
pub struct RetiredHosts(Vec<Arc<Host>>);

impl RetiredHosts {
    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Closes every retired host.
    pub async fn close(self) {
        for host in self.0 {
            host.close().await;
        }
    }
}

/// An ordered set of hosts, unique by description.
///
/// Refreshing is two-phase: [`mark_all_for_deletion`](Self::mark_all_for_deletion),
/// then [`add_or_retain`](Self::add_or_retain) for every live endpoint, then
/// [`clear_all_marked_for_deletion`](Self::clear_all_marked_for_deletion).
/// Hosts that are re-added keep their pools untouched.
#[derive(Debug, Default)]
pub struct HostSet {
    hosts: Vec<Arc<Host>>,
}

impl HostSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hosts(hosts: impl IntoIterator<Item = Arc<Host>>) -> Self {
        let mut set = Self::new();
        for host in hosts {
            set.add_host(host);
        }
        set
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get(&self, description: &HostDescription) -> Option<&Arc<Host>> {
        self.hosts.iter().find(|h| h.description() == description)
    }

    /// Adds a host. An existing host with the same description is kept (and
    /// unmarked) instead; returns whether `host` was inserted.
    pub fn add_host(&mut self, host: Arc<Host>) -> bool {
        if let Some(existing) = self.get(host.description()) {
            existing.set_marked_for_deletion(false);
            return false;
        }
        self.hosts.push(host);
        true
    }

    /// Returns the host for `description`, unmarking it, or inserts the host
    /// built by `make`.
    pub fn add_or_retain<F>(&mut self, description: &HostDescription, make: F) -> Arc<Host>
    where
        F: FnOnce(&HostDescription) -> Arc<Host>,
    {
        if let Some(existing) = self.get(description) {
            existing.set_marked_for_deletion(false);
            return existing.clone();
        }
        let host = make(description);
        self.hosts.push(host.clone());
        host
    }

    pub fn mark_all_for_deletion(&self) {
        for host in &self.hosts {
            host.set_marked_for_deletion(true);
        }
    }

    /// Removes every host still marked for deletion and hands them back for
    /// closing.
    pub fn clear_all_marked_for_deletion(&mut self) -> RetiredHosts {
        let (retired, kept) = std::mem::take(&mut self.hosts)
            .into_iter()
            .partition(|h| h.is_marked_for_deletion());
        self.hosts = kept;
        RetiredHosts(retired)
    }

    /// Removes every host, handing them back for closing.
    pub fn drain(&mut self) -> RetiredHosts {
        RetiredHosts(std::mem::take(&mut self.hosts))
    }
}
