//! HTTP/1.1 connection.

use super::{
    next_connection_id, Connection, ConnectionConfig, ConnectionFactory, ConnectionState,
    PendingResponse, StateCell,
};
use crate::error::DriverError;
use crate::host::HostDescription;
use crate::stream;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use hyper::Method;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use velocy_protocol::{Request, RequestType, Response};

struct Shared {
    id: u64,
    host: HostDescription,
    state: StateCell,
}

/// An HTTP/1.1 connection.
///
/// One request is on the wire at a time; later writes wait until the
/// connection is ready again.
pub struct HttpConnection {
    shared: Arc<Shared>,
    config: Arc<ConnectionConfig>,
    sender: tokio::sync::Mutex<Option<SendRequest<Full<Bytes>>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    next_request_id: AtomicU64,
}

impl HttpConnection {
    pub fn new(host: HostDescription, config: Arc<ConnectionConfig>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: next_connection_id(),
                host,
                state: StateCell::new(),
            }),
            config,
            sender: tokio::sync::Mutex::new(None),
            driver: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
        }
    }

    async fn open(&self) -> Result<SendRequest<Full<Bytes>>, DriverError> {
        let stream = stream::connect(&self.shared.host, &self.config).await?;
        let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;

        let shared = self.shared.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::warn!("Connection {} to {} failed: {}", shared.id, shared.host, e);
            }
            shared.state.close();
        });
        *self.driver.lock() = Some(driver);

        if !self.shared.state.open() {
            return Err(DriverError::ConnectionClosed);
        }
        tracing::debug!("Connection {} to {} open", self.id(), self.host());
        Ok(sender)
    }

    fn build_request(&self, request: &Request) -> Result<hyper::Request<Full<Bytes>>, DriverError> {
        let method = match request.request_type {
            RequestType::Delete => Method::DELETE,
            RequestType::Get => Method::GET,
            RequestType::Post => Method::POST,
            RequestType::Put => Method::PUT,
            RequestType::Head => Method::HEAD,
            RequestType::Patch => Method::PATCH,
            RequestType::Options => Method::OPTIONS,
        };

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(request_uri(request))
            .header(HOST, self.shared.host.to_string());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(ref credentials) = self.config.credentials {
            builder = builder.header(AUTHORIZATION, credentials.authorization_header());
        }
        if request.body.is_some() && !request.headers.contains_key(CONTENT_TYPE.as_str()) {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }

        builder
            .body(Full::new(request.body.clone().unwrap_or_default()))
            .map_err(|e| DriverError::HttpRequest(e.to_string()))
    }

    fn stop_driver(&self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

/// Builds `/_db/{database}{path}?{query}`.
fn request_uri(request: &Request) -> String {
    let mut uri = format!(
        "/_db/{}{}",
        urlencoding::encode(&request.database),
        request.path
    );
    let mut separator = '?';
    for (key, value) in &request.query_params {
        uri.push(separator);
        uri.push_str(&urlencoding::encode(key));
        uri.push('=');
        uri.push_str(&urlencoding::encode(value));
        separator = '&';
    }
    uri
}

async fn into_response(response: hyper::Response<hyper::body::Incoming>) -> Result<Response, DriverError> {
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();

    let mut out = Response::new(parts.status.as_u16());
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            out.meta.insert(name.as_str().to_string(), value.to_string());
        }
    }
    if !body.is_empty() {
        out.body = Some(body);
    }
    Ok(out)
}

#[async_trait]
impl Connection for HttpConnection {
    fn id(&self) -> u64 {
        self.shared.id
    }

    fn host(&self) -> &HostDescription {
        &self.shared.host
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    async fn write(&self, request: &Request) -> Result<PendingResponse, DriverError> {
        let mut guard = self.sender.lock().await;
        match self.shared.state.get() {
            ConnectionState::Closed => return Err(DriverError::ConnectionClosed),
            ConnectionState::Idle => match self.open().await {
                Ok(sender) => *guard = Some(sender),
                Err(e) => {
                    self.stop_driver();
                    self.shared.state.close();
                    return Err(e);
                }
            },
            ConnectionState::Open => {}
        }
        let sender = guard.as_mut().ok_or(DriverError::ConnectionClosed)?;

        if let Err(e) = sender.ready().await {
            drop(guard);
            self.close_on_error().await;
            return Err(e.into());
        }

        let http_request = self.build_request(request)?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            "Connection {}: sending {} {}",
            self.id(),
            http_request.method(),
            http_request.uri()
        );
        let response_future = sender.send_request(http_request);
        drop(guard);

        let (tx, rx) = oneshot::channel();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = match response_future.await {
                Ok(response) => into_response(response).await,
                Err(e) => Err(DriverError::from(e)),
            };
            if result.is_err() {
                shared.state.close();
            }
            let _ = tx.send(result);
        });

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        Ok(
            PendingResponse::new(request_id, rx).with_timeout(self.config.request_timeout, move |_| {
                // The exchange cannot be resumed after a timeout.
                if let Some(shared) = shared.upgrade() {
                    shared.state.close();
                }
            }),
        )
    }

    async fn close(&self) {
        let first = self.shared.state.close();
        self.sender.lock().await.take();
        self.stop_driver();
        if first {
            tracing::debug!("Connection {} to {} closed", self.id(), self.host());
        }
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.stop_driver();
        self.shared.state.close();
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("id", &self.shared.id)
            .field("host", &self.shared.host)
            .field("state", &self.shared.state.get())
            .finish()
    }
}

/// Creates [`HttpConnection`]s sharing one configuration.
#[derive(Debug, Clone)]
pub struct HttpConnectionFactory {
    config: Arc<ConnectionConfig>,
}

impl HttpConnectionFactory {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl ConnectionFactory for HttpConnectionFactory {
    fn create(&self, host: &HostDescription) -> Arc<dyn Connection> {
        Arc::new(HttpConnection::new(host.clone(), self.config.clone()))
    }
}
