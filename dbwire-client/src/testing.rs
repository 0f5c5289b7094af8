//! In-process server speaking the wire protocol, for tests.

use crate::config::{CommunicationConfig, CommunicationConfigBuilder};
use bytes::Bytes;
use dbwire_protocol::{
    Chunk, ChunkDecoder, Credential, Encoder, HostDescription, IncomingMessage, MessageAssembler,
    Request, Response, PREAMBLE,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the server does with one request.
pub(crate) enum Reply {
    Respond {
        status: u16,
        body: Bytes,
        delay: Duration,
    },
    /// Never answer.
    Silent,
    /// Send a chunk stream that collides with itself.
    Corrupt,
    /// Drop the connection.
    Disconnect,
    /// Answer 200 with this body, held back until a second such reply is
    /// ready on the same connection. Both are then sent with their chunks
    /// alternating.
    Interleave(Bytes),
}

impl Reply {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Reply::Respond {
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16, body: impl Into<Bytes>) -> Self {
        Reply::Respond {
            status,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(self, by: Duration) -> Self {
        match self {
            Reply::Respond { status, body, .. } => Reply::Respond {
                status,
                body,
                delay: by,
            },
            other => other,
        }
    }
}

type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

struct Options {
    credential: Option<Credential>,
    chunk_size: usize,
}

pub(crate) struct MockServer {
    host: HostDescription,
    accepted: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(handler: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> Self {
        Self::spawn(
            Options {
                credential: None,
                chunk_size: 30_000,
            },
            Arc::new(handler),
        )
        .await
    }

    /// Responses are split into chunks of at most `chunk_size` bytes.
    pub async fn start_chunked(
        chunk_size: usize,
        handler: impl Fn(&Request) -> Reply + Send + Sync + 'static,
    ) -> Self {
        Self::spawn(
            Options {
                credential: None,
                chunk_size,
            },
            Arc::new(handler),
        )
        .await
    }

    /// Accepts only `credential` in the authentication exchange.
    pub async fn start_with_auth(
        credential: Credential,
        handler: impl Fn(&Request) -> Reply + Send + Sync + 'static,
    ) -> Self {
        Self::spawn(
            Options {
                credential: Some(credential),
                chunk_size: 30_000,
            },
            Arc::new(handler),
        )
        .await
    }

    async fn spawn(options: Options, handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let options = Arc::new(options);

        let task = tokio::spawn({
            let accepted = Arc::clone(&accepted);
            let requests = Arc::clone(&requests);
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        socket,
                        Arc::clone(&options),
                        Arc::clone(&handler),
                        Arc::clone(&requests),
                    ));
                }
            }
        });

        Self {
            host: HostDescription::new("127.0.0.1", port),
            accepted,
            requests,
            task,
        }
    }

    pub fn host(&self) -> HostDescription {
        self.host.clone()
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Requests received so far (authentication excluded).
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Replies with the request path as body.
pub(crate) fn echo_path(request: &Request) -> Reply {
    Reply::ok(request.path.clone())
}

/// Builder preloaded with short timeouts.
pub(crate) fn config_builder(hosts: &[HostDescription]) -> CommunicationConfigBuilder {
    CommunicationConfig::builder()
        .hosts(hosts.iter().cloned())
        .acquire_timeout(Duration::from_millis(500))
        .connect_timeout(Duration::from_millis(500))
}

pub(crate) fn config(hosts: &[HostDescription]) -> CommunicationConfig {
    config_builder(hosts).build().unwrap()
}

pub(crate) fn get(path: &str) -> Request {
    Request::new("_system", dbwire_protocol::Method::Get, path)
}

async fn serve(socket: TcpStream, options: Arc<Options>, handler: Handler, requests: Arc<AtomicUsize>) {
    let (mut rd, mut wr) = socket.into_split();

    let mut preamble = [0u8; PREAMBLE.len()];
    if rd.read_exact(&mut preamble).await.is_err() || preamble[..] != *PREAMBLE {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if wr.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    let mut decoder = ChunkDecoder::new();
    let mut assembler = MessageAssembler::new();
    let mut held: Option<Response> = None;
    let mut buf = vec![0u8; 8192];

    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.extend(&buf[..n]);

        while let Ok(Some(chunk)) = decoder.decode_chunk() {
            let Ok(Some(message)) = assembler.push(chunk) else {
                continue;
            };
            let id = message.message_id;

            match IncomingMessage::decode(message.payload) {
                Ok(IncomingMessage::Authentication(credential)) => {
                    let status = if options.credential.as_ref() == Some(&credential) {
                        200
                    } else {
                        401
                    };
                    respond(&tx, Response::new(id, status), options.chunk_size);
                }
                Ok(IncomingMessage::Request(request)) => {
                    requests.fetch_add(1, Ordering::SeqCst);
                    match handler(&request) {
                        Reply::Respond {
                            status,
                            body,
                            delay,
                        } => {
                            let tx = tx.clone();
                            let chunk_size = options.chunk_size;
                            tokio::spawn(async move {
                                if !delay.is_zero() {
                                    tokio::time::sleep(delay).await;
                                }
                                respond(&tx, Response::new(id, status).with_body(body), chunk_size);
                            });
                        }
                        Reply::Silent => {}
                        Reply::Corrupt => {
                            let first = Chunk::first(id, 2, 8, Bytes::from_static(b"half"));
                            for _ in 0..2 {
                                let _ = tx.send(first.encode().unwrap().freeze());
                            }
                        }
                        Reply::Disconnect => return,
                        Reply::Interleave(body) => {
                            let response = Response::new(id, 200).with_body(body);
                            match held.take() {
                                Some(first) => {
                                    interleave(&tx, [first, response], options.chunk_size)
                                }
                                None => held = Some(response),
                            }
                        }
                    }
                }
                Err(_) => return,
            }
        }
    }
}

fn respond(tx: &mpsc::UnboundedSender<Bytes>, response: Response, chunk_size: usize) {
    let payload = response.encode().unwrap();
    let frames = Encoder::encode_message(response.message_id, payload, chunk_size).unwrap();
    let _ = tx.send(frames.freeze());
}

/// Sends two responses chunk by chunk in alternation, one write per chunk.
fn interleave(tx: &mpsc::UnboundedSender<Bytes>, responses: [Response; 2], chunk_size: usize) {
    let mut streams: Vec<std::vec::IntoIter<Chunk>> = responses
        .iter()
        .map(|r| {
            Encoder::split_message(r.message_id, r.encode().unwrap(), chunk_size)
                .unwrap()
                .into_iter()
        })
        .collect();
    loop {
        let mut sent = false;
        for stream in streams.iter_mut() {
            if let Some(chunk) = stream.next() {
                let _ = tx.send(chunk.encode().unwrap().freeze());
                sent = true;
            }
        }
        if !sent {
            break;
        }
    }
}
