//! Driver error types.

use crate::host::HostDescription;
use thiserror::Error;

/// Driver errors.
///
/// Transport failures are reported through this single type so callers see
/// one error kind; the inner cause is kept as the error source.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] velocy_protocol::ProtocolError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect to {0} timed out")]
    ConnectTimeout(HostDescription),

    #[error("request timeout")]
    Timeout,

    #[error("HTTP transport error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid HTTP request: {0}")]
    HttpRequest(String),

    #[error("no host available")]
    NoHostAvailable {
        #[source]
        last_error: Option<Box<DriverError>>,
    },

    #[error("redirect limit of {limit} exceeded")]
    TooManyRedirects { limit: usize },

    #[error("authentication failed ({code}): {message}")]
    Authentication { code: u16, message: String },

    #[error("server error {code}: {message}")]
    Server {
        code: u16,
        error_num: Option<i64>,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl DriverError {
    /// Returns whether this error came from the transport, i.e. whether the
    /// host may be unreachable and another host should be tried.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DriverError::Io(_)
                | DriverError::Protocol(_)
                | DriverError::ConnectionClosed
                | DriverError::ConnectTimeout(_)
                | DriverError::Timeout
                | DriverError::Http(_)
                | DriverError::TlsHandshake(_)
        )
    }

    /// Returns the server response code, if the error carries one.
    pub fn response_code(&self) -> Option<u16> {
        match self {
            DriverError::Authentication { code, .. } | DriverError::Server { code, .. } => {
                Some(*code)
            }
            _ => None,
        }
    }

    /// Returns the server error number, if the error carries one.
    pub fn error_num(&self) -> Option<i64> {
        match self {
            DriverError::Server { error_num, .. } => *error_num,
            _ => None,
        }
    }
}
