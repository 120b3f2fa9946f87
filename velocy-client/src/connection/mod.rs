//! Connections to a single server endpoint.
//!
//! Two transports implement [`Connection`]: [`VstConnection`] multiplexes
//! many in-flight requests over one socket by message id, [`HttpConnection`]
//! sends one HTTP/1.1 request at a time. Both open lazily on first write.

mod http;
mod vst;

pub use http::{HttpConnection, HttpConnectionFactory};
pub use vst::{VstConnection, VstConnectionFactory};

use crate::error::DriverError;
use crate::host::HostDescription;
use crate::tls::TlsClientConfig;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use velocy_protocol::{AuthenticationRequest, Request, Response, DEFAULT_CHUNK_SIZE};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created but never opened.
    Idle = 0,
    Open = 1,
    /// Terminal.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// Atomic cell holding a [`ConnectionState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Idle as u8))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves to `Open` unless already closed.
    pub(crate) fn open(&self) -> bool {
        self.0
            .compare_exchange(
                ConnectionState::Idle as u8,
                ConnectionState::Open as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Moves to `Closed`; returns whether this call closed it.
    pub(crate) fn close(&self) -> bool {
        self.0.swap(ConnectionState::Closed as u8, Ordering::SeqCst) != ConnectionState::Closed as u8
    }
}

/// Credentials presented when a connection opens.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { user: String, password: String },
    Jwt(String),
}

impl Credentials {
    pub fn to_authentication(&self) -> AuthenticationRequest {
        match self {
            Credentials::Basic { user, password } => AuthenticationRequest::Plain {
                user: user.clone(),
                password: password.clone(),
            },
            Credentials::Jwt(token) => AuthenticationRequest::Jwt {
                token: token.clone(),
            },
        }
    }

    /// Value of the HTTP `Authorization` header.
    pub fn authorization_header(&self) -> String {
        use base64::Engine;
        match self {
            Credentials::Basic { user, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", user, password));
                format!("Basic {}", encoded)
            }
            Credentials::Jwt(token) => format!("bearer {}", token),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { user, .. } => f
                .debug_struct("Basic")
                .field("user", user)
                .field("password", &"***")
                .finish(),
            Credentials::Jwt(_) => f.debug_tuple("Jwt").field(&"***").finish(),
        }
    }
}

/// Settings shared by every connection a factory creates.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    /// Bound on waiting for a response; `None` waits until the connection
    /// closes.
    pub request_timeout: Option<Duration>,
    /// Maximum chunk content size for outgoing messages.
    pub chunk_size: usize,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsClientConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            credentials: None,
            tls: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub(crate) fn tls_enabled(&self) -> Option<&TlsClientConfig> {
        self.tls.as_ref().filter(|t| t.enabled)
    }
}

type TimeoutHook = Box<dyn FnOnce(u64) + Send>;

/// A response that has been requested but not yet received.
#[must_use = "a pending response does nothing unless waited on"]
pub struct PendingResponse {
    message_id: u64,
    rx: oneshot::Receiver<Result<Response, DriverError>>,
    timeout: Option<Duration>,
    on_timeout: Option<TimeoutHook>,
}

impl PendingResponse {
    pub fn new(message_id: u64, rx: oneshot::Receiver<Result<Response, DriverError>>) -> Self {
        Self {
            message_id,
            rx,
            timeout: None,
            on_timeout: None,
        }
    }

    /// A pending response that is already resolved.
    pub fn ready(message_id: u64, result: Result<Response, DriverError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(message_id, rx)
    }

    /// Bounds [`wait`](Self::wait) by `timeout`; `on_timeout` runs with the
    /// message id when it expires.
    pub fn with_timeout<F>(mut self, timeout: Option<Duration>, on_timeout: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.timeout = timeout;
        self.on_timeout = Some(Box::new(on_timeout));
        self
    }

    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Waits for the response.
    ///
    /// Fails with [`DriverError::ConnectionClosed`] if the connection closes
    /// first.
    pub async fn wait(self) -> Result<Response, DriverError> {
        let received = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::debug!("Message id={} timed out", self.message_id);
                    if let Some(hook) = self.on_timeout {
                        hook(self.message_id);
                    }
                    return Err(DriverError::Timeout);
                }
            },
            None => self.rx.await,
        };
        received.map_err(|_| DriverError::ConnectionClosed)?
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("message_id", &self.message_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A connection to one server endpoint.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Process-unique connection id, for logging.
    fn id(&self) -> u64;

    /// The endpoint this connection is bound to.
    fn host(&self) -> &HostDescription;

    fn state(&self) -> ConnectionState;

    fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Sends a request, opening the connection first if needed. Returns once
    /// the request is fully written.
    async fn write(&self, request: &Request) -> Result<PendingResponse, DriverError>;

    /// Sends a request and waits for its response.
    async fn execute(&self, request: &Request) -> Result<Response, DriverError> {
        self.write(request).await?.wait().await
    }

    /// Closes the connection, failing every pending request.
    async fn close(&self);

    /// Closes the connection after a failure.
    async fn close_on_error(&self) {
        tracing::warn!(
            "Closing connection {} to {} on error",
            self.id(),
            self.host()
        );
        self.close().await;
    }
}

/// Creates connections bound to an endpoint.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, host: &HostDescription) -> Arc<dyn Connection>;
}

/// Allocates process-unique connection ids.
pub(crate) fn next_connection_id() -> u64 {
    use std::sync::atomic::AtomicU64;
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Builds the error for a rejected authentication response.
pub(crate) fn authentication_error(response: &Response) -> DriverError {
    let message = response
        .body
        .as_deref()
        .and_then(|body| serde_json::from_slice::<serde_json::Value>(body).ok())
        .and_then(|v| v.get("errorMessage")?.as_str().map(str::to_string))
        .unwrap_or_else(|| "unauthorized".to_string());
    DriverError::Authentication {
        code: response.response_code,
        message,
    }
}
