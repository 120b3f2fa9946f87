//! # velocy-client
//!
//! Client driver transport for VelocyStream.
//!
//! This crate provides:
//! - VelocyStream and HTTP connections with lazy open and optional TLS
//! - Bounded per-host connection pools
//! - Static and cluster-discovered host lists
//! - Host selection strategies with failover
//! - A request executor following redirects and failing over between hosts
//!
//! The usual entry point is [`Driver`]:
//!
//! ```no_run
//! # async fn run() -> Result<(), velocy_client::DriverError> {
//! use velocy_client::{Driver, DriverConfig};
//!
//! let driver = Driver::new(DriverConfig::load()?)?;
//! let version = driver.version().await?;
//! println!("{} {}", version.server, version.version);
//! driver.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod communication;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod handler;
pub mod host;
pub mod meta;
pub mod pool;
pub mod resolver;
pub mod serializer;
pub mod stream;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;

pub use communication::{Communication, Outcome, RequestExecutor};
pub use config::{ConfigError, DriverConfig, LoadBalancingStrategy, Protocol};
pub use connection::{
    Connection, ConnectionConfig, ConnectionFactory, ConnectionState, Credentials,
    PendingResponse,
};
pub use driver::{Driver, ServerVersion};
pub use error::DriverError;
pub use handler::{AccessType, HostHandler};
pub use host::{Host, HostDescription, HostHandle, HostSet};
pub use meta::{ApplyMeta, DocumentMeta};
pub use pool::ConnectionPool;
pub use resolver::{EndpointResolver, HostResolver};
pub use serializer::{JsonSerializer, Serializer};
pub use tls::TlsClientConfig;

pub use velocy_protocol::{Request, RequestType, Response};
