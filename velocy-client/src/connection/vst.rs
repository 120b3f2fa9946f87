//! VelocyStream connection.

use super::{
    authentication_error, next_connection_id, Connection, ConnectionConfig, ConnectionFactory,
    ConnectionState, Credentials, PendingResponse, StateCell,
};
use crate::error::DriverError;
use crate::host::HostDescription;
use crate::stream::{self, ClientStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use velocy_protocol::{
    ChunkDecoder, ChunkEncoder, ChunkStore, Message, Request, Response, PROTOCOL_HEADER,
};

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

type ResponseSender = oneshot::Sender<Result<Response, DriverError>>;

/// State shared between the connection and its reader task.
struct Shared {
    id: u64,
    host: HostDescription,
    state: StateCell,
    pending: Mutex<HashMap<u64, ResponseSender>>,
}

impl Shared {
    /// Adds a pending request. Fails once the connection is closed:
    /// `close` sets the state before draining under the same lock, so a
    /// request registered here is always either drained or rejected.
    fn register(
        &self,
        message_id: u64,
    ) -> Result<oneshot::Receiver<Result<Response, DriverError>>, DriverError> {
        let mut pending = self.pending.lock();
        if self.state.get() == ConnectionState::Closed {
            return Err(DriverError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(message_id, tx);
        Ok(rx)
    }

    fn remove(&self, message_id: u64) {
        self.pending.lock().remove(&message_id);
    }

    fn complete(&self, message: Message) {
        let Some(tx) = self.pending.lock().remove(&message.id) else {
            tracing::debug!(
                "Connection {}: no pending request for message id={}",
                self.id,
                message.id
            );
            return;
        };
        let response = Response::decode(&message.payload).map_err(DriverError::from);
        let _ = tx.send(response);
    }

    /// Marks the connection closed and fails every pending request.
    fn close(&self) {
        self.state.close();
        let pending: Vec<_> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            tracing::debug!(
                "Connection {}: failing {} pending requests",
                self.id,
                pending.len()
            );
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(DriverError::ConnectionClosed));
        }
    }
}

/// A VelocyStream connection.
///
/// Requests are multiplexed by message id: any number may be in flight, and
/// a dedicated reader task completes them as their responses arrive.
pub struct VstConnection {
    shared: Arc<Shared>,
    config: Arc<ConnectionConfig>,
    encoder: ChunkEncoder,
    writer: tokio::sync::Mutex<Option<WriteHalf<ClientStream>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_message_id: AtomicU64,
}

impl VstConnection {
    /// Creates a connection to `host`. Nothing is opened until the first
    /// write.
    pub fn new(host: HostDescription, config: Arc<ConnectionConfig>) -> Self {
        let encoder = match ChunkEncoder::new(config.chunk_size) {
            Ok(encoder) => encoder,
            Err(e) => {
                let encoder = ChunkEncoder::default();
                tracing::warn!(
                    "Invalid chunk size {} ({}), using {}",
                    config.chunk_size,
                    e,
                    encoder.max_content_size()
                );
                encoder
            }
        };
        Self {
            shared: Arc::new(Shared {
                id: next_connection_id(),
                host,
                state: StateCell::new(),
                pending: Mutex::new(HashMap::new()),
            }),
            config,
            encoder,
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            next_message_id: AtomicU64::new(1),
        }
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    async fn open(&self, writer: &mut Option<WriteHalf<ClientStream>>) -> Result<(), DriverError> {
        match self.try_open().await {
            Ok(write_half) => {
                *writer = Some(write_half);
                tracing::debug!("Connection {} to {} open", self.id(), self.host());
                Ok(())
            }
            Err(e) => {
                tracing::debug!(
                    "Connection {} to {} failed to open: {}",
                    self.id(),
                    self.host(),
                    e
                );
                self.stop_reader();
                self.shared.close();
                Err(e)
            }
        }
    }

    async fn try_open(&self) -> Result<WriteHalf<ClientStream>, DriverError> {
        let stream = stream::connect(&self.shared.host, &self.config).await?;
        let (read_half, mut write_half) = tokio::io::split(stream);

        write_half.write_all(PROTOCOL_HEADER).await?;
        write_half.flush().await?;

        if !self.shared.state.open() {
            return Err(DriverError::ConnectionClosed);
        }
        let handle = tokio::spawn(read_loop(read_half, self.shared.clone()));
        *self.reader.lock() = Some(handle);

        if let Some(ref credentials) = self.config.credentials {
            self.authenticate(&mut write_half, credentials).await?;
        }
        Ok(write_half)
    }

    async fn authenticate(
        &self,
        writer: &mut WriteHalf<ClientStream>,
        credentials: &Credentials,
    ) -> Result<(), DriverError> {
        tracing::debug!("Connection {}: authenticating", self.id());
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let wire = self
            .encoder
            .encode_message(message_id, &credentials.to_authentication().encode()?)?;

        let rx = self.shared.register(message_id)?;
        writer.write_all(&wire).await?;
        writer.flush().await?;

        let response = PendingResponse::new(message_id, rx)
            .with_timeout(Some(self.config.connect_timeout), self.remove_hook())
            .wait()
            .await?;
        if !response.is_success() {
            return Err(authentication_error(&response));
        }
        Ok(())
    }

    fn remove_hook(&self) -> impl FnOnce(u64) + Send + 'static {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        move |message_id| {
            if let Some(shared) = shared.upgrade() {
                shared.remove(message_id);
            }
        }
    }

    fn stop_reader(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

async fn read_loop(mut reader: ReadHalf<ClientStream>, shared: Arc<Shared>) {
    tracing::debug!("Connection {}: reader started", shared.id);
    match read_messages(&mut reader, &shared).await {
        Ok(()) => tracing::debug!("Connection {}: closed by {}", shared.id, shared.host),
        Err(e) if shared.state.get() != ConnectionState::Closed => {
            tracing::warn!("Connection {} to {} failed: {}", shared.id, shared.host, e);
        }
        Err(_) => {}
    }
    shared.close();
}

/// Reads chunks until end of stream, completing messages as they finish.
async fn read_messages(
    reader: &mut ReadHalf<ClientStream>,
    shared: &Shared,
) -> Result<(), DriverError> {
    let mut decoder = ChunkDecoder::new();
    let mut store = ChunkStore::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            decoder.finish()?;
            return Ok(());
        }

        decoder.extend(&buf[..n]);
        while let Some(chunk) = decoder.decode_chunk()? {
            if let Some(message) = store.store_chunk(chunk)? {
                shared.complete(message);
            }
        }
    }
}

#[async_trait]
impl Connection for VstConnection {
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
        let mut writer = self.writer.lock().await;
        match self.shared.state.get() {
            ConnectionState::Closed => return Err(DriverError::ConnectionClosed),
            ConnectionState::Idle => self.open(&mut writer).await?,
            ConnectionState::Open => {}
        }

        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let wire = self.encoder.encode_message(message_id, &request.encode()?)?;
        let out = writer.as_mut().ok_or(DriverError::ConnectionClosed)?;

        let rx = self.shared.register(message_id)?;
        tracing::debug!(
            "Connection {}: sending {} {} as message id={} ({} bytes)",
            self.id(),
            request.request_type,
            request.path,
            message_id,
            wire.len()
        );
        let written = match out.write_all(&wire).await {
            Ok(()) => out.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.shared.remove(message_id);
            drop(writer);
            self.close_on_error().await;
            return Err(e.into());
        }

        Ok(PendingResponse::new(message_id, rx)
            .with_timeout(self.config.request_timeout, self.remove_hook()))
    }

    async fn close(&self) {
        let first = self.shared.state.get() != ConnectionState::Closed;
        self.stop_reader();
        self.shared.close();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if first {
            tracing::debug!("Connection {} to {} closed", self.id(), self.host());
        }
    }
}

impl Drop for VstConnection {
    fn drop(&mut self) {
        self.stop_reader();
        self.shared.close();
    }
}

impl fmt::Debug for VstConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VstConnection")
            .field("id", &self.shared.id)
            .field("host", &self.shared.host)
            .field("state", &self.shared.state.get())
            .finish()
    }
}

/// Creates [`VstConnection`]s sharing one configuration.
#[derive(Debug, Clone)]
pub struct VstConnectionFactory {
    config: Arc<ConnectionConfig>,
}

impl VstConnectionFactory {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl ConnectionFactory for VstConnectionFactory {
    fn create(&self, host: &HostDescription) -> Arc<dyn Connection> {
        Arc::new(VstConnection::new(host.clone(), self.config.clone()))
    }
}
