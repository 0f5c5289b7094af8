//! Multiplexed connection to one host.
//!
//! Each connection owns two background tasks: a writer draining an outbound
//! queue of encoded chunk streams, and a reader decoding chunks, reassembling
//! messages and completing the waiter registered under each message id.
//! Many requests can be in flight at once and complete in any order.

use crate::config::CommunicationConfig;
use crate::error::CommError;
use crate::stream::Transport;
use bytes::Bytes;
use dbwire_protocol::{
    ChunkDecoder, Credential, Encoder, HostDescription, MessageAssembler, ProtocolError, Request,
    Response, PREAMBLE,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Socket read buffer size (64 KiB).
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Encoded messages queued for the writer task.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Message id of the authentication exchange; requests start at 1.
const AUTH_MESSAGE_ID: u64 = 0;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type Waiter = oneshot::Sender<Result<Response, CommError>>;

/// Why the I/O path stopped.
#[derive(Debug)]
enum Failure {
    Eof,
    Io(std::io::Error),
    Protocol {
        message_id: Option<u64>,
        error: ProtocolError,
    },
    Closed,
}

#[derive(Default)]
struct Waiters {
    pending: HashMap<u64, Waiter>,
    failed: bool,
}

/// State shared between the connection handle and its I/O tasks.
struct Shared {
    conn_id: u64,
    host: HostDescription,
    waiters: Mutex<Waiters>,
    last_activity: Mutex<Instant>,
}

impl Shared {
    fn register(
        &self,
        message_id: u64,
    ) -> Result<oneshot::Receiver<Result<Response, CommError>>, CommError> {
        let mut waiters = self.waiters.lock();
        if waiters.failed {
            return Err(CommError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        waiters.pending.insert(message_id, tx);
        Ok(rx)
    }

    fn forget(&self, message_id: u64) {
        self.waiters.lock().pending.remove(&message_id);
    }

    fn complete(&self, response: Response) {
        self.touch();
        let waiter = self.waiters.lock().pending.remove(&response.message_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => tracing::debug!(
                "Connection #{}: discarding response to message {} (no waiter)",
                self.conn_id,
                response.message_id
            ),
        }
    }

    /// Marks the connection failed and fails every outstanding waiter.
    fn fail(&self, failure: Failure) {
        let drained: Vec<(u64, Waiter)> = {
            let mut waiters = self.waiters.lock();
            if waiters.failed {
                return;
            }
            waiters.failed = true;
            waiters.pending.drain().collect()
        };

        match &failure {
            Failure::Closed => {}
            Failure::Eof => tracing::debug!(
                "Connection #{} to {} closed by peer",
                self.conn_id,
                self.host
            ),
            Failure::Io(e) => tracing::debug!(
                "Connection #{} to {} failed: {}",
                self.conn_id,
                self.host,
                e
            ),
            Failure::Protocol { error, .. } => tracing::warn!(
                "Connection #{} to {}: protocol error, closing: {}",
                self.conn_id,
                self.host,
                error
            ),
        }

        let (owner, mut error) = match failure {
            Failure::Protocol { message_id, error } => (message_id, Some(error)),
            _ => (None, None),
        };
        for (message_id, tx) in drained {
            let owned = if owner == Some(message_id) {
                error.take()
            } else {
                None
            };
            let err = owned.map_or(CommError::ConnectionClosed, CommError::Protocol);
            let _ = tx.send(Err(err));
        }
    }

    fn is_failed(&self) -> bool {
        self.waiters.lock().failed
    }

    fn in_flight(&self) -> usize {
        self.waiters.lock().pending.len()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

/// Removes the waiter when a send is abandoned before its response arrives.
struct WaiterGuard<'a> {
    shared: &'a Shared,
    message_id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.shared.forget(self.message_id);
    }
}

/// A connection to one cluster host.
pub struct Connection {
    id: u64,
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_message_id: AtomicU64,
    max_chunk_content: usize,
    leases: AtomicUsize,
    reserved: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    /// Opens a connection: transport, optional TLS, preamble and, when a
    /// credential is configured, the authentication exchange. The whole
    /// sequence is bounded by the connect timeout.
    pub async fn open(
        host: HostDescription,
        config: &CommunicationConfig,
    ) -> Result<Self, CommError> {
        let timeout = config.connect_timeout();
        tracing::debug!("Connecting to {}...", host);

        let (transport, decoder) = tokio::time::timeout(timeout, establish(&host, config))
            .await
            .map_err(|_| {
                tracing::debug!("Connecting to {} timed out", host);
                CommError::ConnectTimeout {
                    host: host.clone(),
                    timeout,
                }
            })??;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            conn_id: id,
            host: host.clone(),
            waiters: Mutex::new(Waiters::default()),
            last_activity: Mutex::new(Instant::now()),
        });

        let (read_half, write_half) = tokio::io::split(transport);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let reader = tokio::spawn(read_loop(read_half, decoder, Arc::clone(&shared)));
        tokio::spawn(write_loop(write_half, rx, Arc::clone(&shared)));

        tracing::debug!("Connection #{} to {} established", id, host);
        Ok(Self {
            id,
            shared,
            outbound: Mutex::new(Some(tx)),
            reader: Mutex::new(Some(reader)),
            next_message_id: AtomicU64::new(AUTH_MESSAGE_ID + 1),
            max_chunk_content: config.max_chunk_content(),
            leases: AtomicUsize::new(0),
            reserved: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Sends a request and waits for its response.
    ///
    /// Dropping the returned future abandons only this request; a response
    /// arriving later is discarded and the connection stays usable.
    pub async fn send(&self, request: &Request) -> Result<Response, CommError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CommError::ConnectionClosed);
        }

        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let frames =
            Encoder::encode_message(message_id, request.encode()?, self.max_chunk_content)?;
        let outbound = self
            .outbound
            .lock()
            .clone()
            .ok_or(CommError::ConnectionClosed)?;

        let rx = self.shared.register(message_id)?;
        let _guard = WaiterGuard {
            shared: &self.shared,
            message_id,
        };
        self.shared.touch();

        tracing::debug!(
            "Connection #{}: sending message {} ({} {} {}, {} bytes)",
            self.id,
            message_id,
            request.method,
            request.database,
            request.path,
            frames.len()
        );
        outbound
            .send(frames.freeze())
            .await
            .map_err(|_| CommError::ConnectionClosed)?;

        rx.await.unwrap_or(Err(CommError::ConnectionClosed))
    }

    /// Closes the connection. Outstanding requests fail with
    /// `ConnectionClosed`; calling it again does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Closing connection #{} to {}", self.id, self.shared.host);

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        // The writer flushes what is queued, then shuts the transport down
        self.outbound.lock().take();
        self.shared.fail(Failure::Closed);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &HostDescription {
        &self.shared.host
    }

    /// Returns whether the connection can carry new requests.
    pub fn is_usable(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.shared.is_failed()
    }

    /// Requests waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// Pool leases currently held on this connection.
    pub fn leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    /// Returns whether a conversation holds this connection.
    pub fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::Acquire)
    }

    /// Time since the last request or response.
    pub fn idle_for(&self) -> Duration {
        self.shared.last_activity.lock().elapsed()
    }

    /// Unleased, unreserved and without outstanding requests.
    pub fn is_idle(&self) -> bool {
        self.leases() == 0 && self.in_flight() == 0 && !self.is_reserved()
    }

    pub(crate) fn add_lease(&self) {
        self.leases.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_lease(&self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn set_reserved(&self, reserved: bool) {
        self.reserved.store(reserved, Ordering::Release);
        self.shared.touch();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.shared.host)
            .field("in_flight", &self.in_flight())
            .field("leases", &self.leases())
            .field("reserved", &self.is_reserved())
            .finish()
    }
}

async fn establish(
    host: &HostDescription,
    config: &CommunicationConfig,
) -> Result<(Transport, ChunkDecoder), CommError> {
    let mut transport = Transport::dial(host, config.tls()).await?;
    transport.write_all(PREAMBLE).await?;

    let mut decoder = ChunkDecoder::new();
    match config.credential() {
        Some(credential) => {
            authenticate(&mut transport, &mut decoder, credential, config.max_chunk_content())
                .await?;
            tracing::debug!("Authenticated with {}", host);
        }
        None => transport.flush().await?,
    }
    Ok((transport, decoder))
}

/// Runs the authentication exchange before the I/O tasks start.
async fn authenticate(
    transport: &mut Transport,
    decoder: &mut ChunkDecoder,
    credential: &Credential,
    max_chunk_content: usize,
) -> Result<(), CommError> {
    let frames = Encoder::encode_message(AUTH_MESSAGE_ID, credential.encode()?, max_chunk_content)?;
    transport.write_all(&frames).await?;
    transport.flush().await?;

    let mut assembler = MessageAssembler::new();
    let mut buf = vec![0u8; 4096];
    let message = loop {
        if let Some(chunk) = decoder.decode_chunk()? {
            if let Some(message) = assembler.push(chunk)? {
                break message;
            }
            continue;
        }
        let n = transport.read(&mut buf).await?;
        if n == 0 {
            return Err(CommError::ConnectionClosed);
        }
        decoder.extend(&buf[..n]);
    };

    let response = Response::decode(message.message_id, message.payload)?;
    if !response.is_success() {
        return Err(CommError::AuthFailed(response.status));
    }
    Ok(())
}

async fn read_loop(
    mut reader: ReadHalf<Transport>,
    mut decoder: ChunkDecoder,
    shared: Arc<Shared>,
) {
    let mut assembler = MessageAssembler::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let failure = 'read: loop {
        loop {
            let chunk = match decoder.decode_chunk() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(error) => {
                    break 'read Failure::Protocol {
                        message_id: error.message_id(),
                        error,
                    }
                }
            };
            match assembler.push(chunk) {
                Ok(Some(message)) => {
                    let message_id = message.message_id;
                    match Response::decode(message_id, message.payload) {
                        Ok(response) => shared.complete(response),
                        Err(error) => {
                            break 'read Failure::Protocol {
                                message_id: Some(message_id),
                                error,
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    break 'read Failure::Protocol {
                        message_id: error.message_id(),
                        error,
                    }
                }
            }
        }

        match reader.read(&mut buf).await {
            Ok(0) => break Failure::Eof,
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => break Failure::Io(e),
        }
    };

    let abandoned = assembler.clear();
    if !abandoned.is_empty() {
        tracing::debug!(
            "Connection #{}: dropping {} partially received messages",
            shared.conn_id,
            abandoned.len()
        );
    }
    shared.fail(failure);
}

async fn write_loop(
    mut writer: WriteHalf<Transport>,
    mut outbound: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
) {
    while let Some(frames) = outbound.recv().await {
        let result: std::io::Result<()> = async {
            writer.write_all(&frames).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            shared.fail(Failure::Io(e));
            return;
        }
    }
    let _ = writer.shutdown().await;
}
