//! Test support: mock connections, a recording host handler and an
//! in-process VelocyStream server.

use crate::connection::{
    next_connection_id, Connection, ConnectionFactory, ConnectionState, PendingResponse,
    StateCell,
};
use crate::error::DriverError;
use crate::handler::{AccessType, HostHandler};
use crate::host::{Host, HostDescription};
use crate::pool::ConnectionPool;
use crate::resolver::{HostResolver, SimpleHostResolver};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use velocy_protocol::{
    AuthenticationRequest, ChunkDecoder, ChunkEncoder, ChunkStore, Message, Request, Response,
    PROTOCOL_HEADER,
};

type Responder = dyn Fn(&HostDescription, &Request) -> Result<Response, DriverError> + Send + Sync;

struct MockShared {
    created: AtomicUsize,
    responder: Box<Responder>,
    requests: Mutex<Vec<(HostDescription, Request)>>,
}

/// Creates [`MockConnection`]s answering through a shared responder.
pub(crate) struct MockConnectionFactory {
    shared: Arc<MockShared>,
}

impl MockConnectionFactory {
    /// Every request succeeds with an empty 200.
    pub fn new() -> Arc<Self> {
        Self::with_responder(|_, _| Ok(Response::new(200)))
    }

    pub fn with_responder<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&HostDescription, &Request) -> Result<Response, DriverError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            shared: Arc::new(MockShared {
                created: AtomicUsize::new(0),
                responder: Box::new(responder),
                requests: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Connections created so far.
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// Hosts written to, in order.
    pub fn requested_hosts(&self) -> Vec<String> {
        self.shared
            .requests
            .lock()
            .iter()
            .map(|(host, _)| host.host().to_string())
            .collect()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.shared
            .requests
            .lock()
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn create(&self, host: &HostDescription) -> Arc<dyn Connection> {
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(MockConnection {
            id: next_connection_id(),
            host: host.clone(),
            state: StateCell::new(),
            shared: self.shared.clone(),
        })
    }
}

/// Connection answering synchronously. Opens on first write; a transport
/// error from the responder closes it.
pub(crate) struct MockConnection {
    id: u64,
    host: HostDescription,
    state: StateCell,
    shared: Arc<MockShared>,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("state", &self.state.get())
            .finish()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn host(&self) -> &HostDescription {
        &self.host
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn write(&self, request: &Request) -> Result<PendingResponse, DriverError> {
        if self.state.get() == ConnectionState::Closed {
            return Err(DriverError::ConnectionClosed);
        }
        self.state.open();
        self.shared
            .requests
            .lock()
            .push((self.host.clone(), request.clone()));

        let result = (self.shared.responder)(&self.host, request);
        if matches!(result, Err(ref e) if e.is_transport()) {
            self.state.close();
        }
        Ok(PendingResponse::ready(0, result))
    }

    async fn close(&self) {
        self.state.close();
    }
}

/// Hosts named `names` on port 8529, backed by single-connection mock pools.
pub(crate) fn mock_hosts(factory: &Arc<MockConnectionFactory>, names: &[&str]) -> Vec<Arc<Host>> {
    names
        .iter()
        .map(|name| {
            let description = HostDescription::new(*name, 8529);
            Arc::new(Host::new(
                description.clone(),
                ConnectionPool::new(description, 1, factory.clone()),
            ))
        })
        .collect()
}

/// A fixed resolver over mock hosts, plus the hosts themselves.
pub(crate) fn static_resolver(names: &[&str]) -> (Arc<dyn HostResolver>, Vec<Arc<Host>>) {
    let hosts = mock_hosts(&MockConnectionFactory::new(), names);
    (Arc::new(SimpleHostResolver::new(hosts.clone())), hosts)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandlerEvent {
    Get,
    Success,
    Fail,
    Reset,
    Close,
    CloseCurrentOnError,
}

/// Wraps a handler and records every call made to it.
pub(crate) struct RecordingHostHandler {
    inner: Arc<dyn HostHandler>,
    events: Mutex<Vec<HandlerEvent>>,
    current: Mutex<Option<HostDescription>>,
    failed: Mutex<Vec<HostDescription>>,
}

impl RecordingHostHandler {
    pub fn wrap(inner: Arc<dyn HostHandler>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            events: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            failed: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<HandlerEvent> {
        self.events.lock().clone()
    }

    pub fn gets(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| **e == HandlerEvent::Get)
            .count()
    }

    /// Hosts current at each `fail`, in order.
    pub fn failed_hosts(&self) -> Vec<String> {
        self.failed
            .lock()
            .iter()
            .map(|h| h.host().to_string())
            .collect()
    }

    fn record(&self, event: HandlerEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl HostHandler for RecordingHostHandler {
    async fn get(&self, access: AccessType) -> Option<Arc<Host>> {
        self.record(HandlerEvent::Get);
        let host = self.inner.get(access).await;
        *self.current.lock() = host.as_ref().map(|h| h.description().clone());
        host
    }

    fn success(&self) {
        self.record(HandlerEvent::Success);
        self.inner.success();
    }

    fn fail(&self) {
        self.record(HandlerEvent::Fail);
        if let Some(host) = self.current.lock().clone() {
            self.failed.lock().push(host);
        }
        self.inner.fail();
    }

    fn reset(&self) {
        self.record(HandlerEvent::Reset);
        self.inner.reset();
    }

    async fn close(&self) {
        self.record(HandlerEvent::Close);
        self.inner.close().await;
    }

    async fn close_current_on_error(&self) {
        self.record(HandlerEvent::CloseCurrentOnError);
        self.inner.close_current_on_error().await;
    }
}

/// What the test server does with a request.
pub(crate) enum Reply {
    Respond(Response),
    /// Never answer.
    Ignore,
    /// Drop the socket.
    Hangup,
    /// Send a chunk header whose declared length is shorter than the header.
    Garbage,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerOptions {
    /// Chunk content size for responses.
    pub chunk_size: usize,
    /// Answer every authentication with 401.
    pub reject_auth: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            chunk_size: velocy_protocol::DEFAULT_CHUNK_SIZE,
            reject_auth: false,
        }
    }
}

type Handler = dyn Fn(&Request) -> Reply + Send + Sync;

struct ServerState {
    options: ServerOptions,
    handler: Box<Handler>,
    accepted: AtomicUsize,
    authentications: Mutex<Vec<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// In-process VelocyStream server on an ephemeral localhost port.
pub(crate) struct TestServer {
    host: HostDescription,
    state: Arc<ServerState>,
    accept: JoinHandle<()>,
}

impl TestServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        Self::start_with(ServerOptions::default(), handler).await
    }

    pub async fn start_with<F>(options: ServerOptions, handler: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState {
            options,
            handler: Box::new(handler),
            accepted: AtomicUsize::new(0),
            authentications: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let conn_state = accept_state.clone();
                let task = tokio::spawn(async move {
                    let _ = serve(socket, conn_state).await;
                });
                accept_state.tasks.lock().push(task);
            }
        });

        Self {
            host: HostDescription::new("127.0.0.1", port),
            state,
            accept,
        }
    }

    pub fn host(&self) -> HostDescription {
        self.host.clone()
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Users (or `"jwt"`) that authenticated, in order.
    pub fn authentications(&self) -> Vec<String> {
        self.state.authentications.lock().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept.abort();
        for task in self.state.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn serve(mut socket: TcpStream, state: Arc<ServerState>) -> Result<(), DriverError> {
    let mut preamble = [0u8; PROTOCOL_HEADER.len()];
    socket.read_exact(&mut preamble).await?;
    if &preamble != PROTOCOL_HEADER {
        return Ok(());
    }

    let encoder = ChunkEncoder::new(state.options.chunk_size)?;
    let mut decoder = ChunkDecoder::new();
    let mut store = ChunkStore::new();
    let mut buf = vec![0u8; 4096];

    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        decoder.extend(&buf[..n]);

        while let Some(chunk) = decoder.decode_chunk()? {
            let Some(message) = store.store_chunk(chunk)? else {
                continue;
            };
            match answer(&state, &message)? {
                Reply::Respond(response) => {
                    let out = encoder.encode_message(message.id, &response.encode()?)?;
                    socket.write_all(&out).await?;
                }
                Reply::Ignore => {}
                Reply::Hangup => return Ok(()),
                Reply::Garbage => {
                    let mut out = Vec::with_capacity(24);
                    out.extend_from_slice(&8u32.to_le_bytes());
                    out.extend_from_slice(&3u32.to_le_bytes());
                    out.extend_from_slice(&message.id.to_le_bytes());
                    out.extend_from_slice(&0u64.to_le_bytes());
                    socket.write_all(&out).await?;
                }
            }
        }
    }
}

fn answer(state: &ServerState, message: &Message) -> Result<Reply, DriverError> {
    if AuthenticationRequest::is_authentication(&message.payload) {
        let user = match AuthenticationRequest::decode(&message.payload)? {
            AuthenticationRequest::Plain { user, .. } => user,
            AuthenticationRequest::Jwt { .. } => "jwt".to_string(),
        };
        state.authentications.lock().push(user);

        let response = if state.options.reject_auth {
            Response::new(401).with_body(
                r#"{"error":true,"code":401,"errorNum":11,"errorMessage":"not authorized to execute this request"}"#,
            )
        } else {
            Response::new(200)
        };
        return Ok(Reply::Respond(response));
    }

    let request = Request::decode(&message.payload)?;
    Ok((state.handler)(&request))
}
