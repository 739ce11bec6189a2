//! RPC transport
//!
//! Symmetric request/response over TCP. Each frame is a u32 little-endian
//! length prefix followed by a bincode-serialized message; the reply to a
//! request is a single framed boolean.
//!
//! The server spawns one task per connection so a slow handler cannot
//! starve other connections. The client connects per call; on timeout or
//! connection loss the caller observes failure and may assume nothing
//! about server-side effects.

use crate::types::{NodeId, SqlValue, TransId, Vote};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on a single frame
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// A protocol request. The `EXECUTE` and `PREPARE` kinds have one payload
/// shape per direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// EXECUTE, client to coordinator
    ClientExecute {
        node_id: NodeId,
        query: String,
        args: Vec<SqlValue>,
    },
    /// EXECUTE, coordinator to participant
    Execute {
        trans_id: TransId,
        query: String,
        args: Vec<SqlValue>,
    },
    /// PREPARE solicitation, coordinator to participant
    Prepare { trans_id: TransId },
    /// PREPARE reply carrying the vote, participant to coordinator
    Vote {
        node_id: NodeId,
        trans_id: TransId,
        vote: Vote,
    },
    /// COMMIT decision, coordinator to participant
    Commit { trans_id: TransId },
    /// ABORT decision, coordinator to participant
    Abort { trans_id: TransId },
    /// Decision acknowledgement, participant to coordinator
    Done { node_id: NodeId, trans_id: TransId },
}

impl Request {
    /// Message kind tag, as it appears on the wire protocol level
    pub fn kind(&self) -> &'static str {
        match self {
            Request::ClientExecute { .. } | Request::Execute { .. } => "EXECUTE",
            Request::Prepare { .. } | Request::Vote { .. } => "PREPARE",
            Request::Commit { .. } => "COMMIT",
            Request::Abort { .. } => "ABORT",
            Request::Done { .. } => "DONE",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("codec: {0}")]
    Codec(String),
    #[error("frame of {0} bytes exceeds limit")]
    Oversized(usize),
    #[error("connection closed before reply")]
    Closed,
    #[error("request timed out")]
    Timeout,
}

/// Server-side dispatch seam. One implementation per role.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> bool;
}

async fn write_frame<S, T>(stream: &mut S, value: &T) -> Result<(), RpcError>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(value).map_err(|e| RpcError::Codec(e.to_string()))?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(RpcError::Oversized(bytes.len()));
    }
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on clean end of stream.
async fn read_frame<S, T>(stream: &mut S) -> Result<Option<T>, RpcError>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::Oversized(len));
    }

    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;

    let value = bincode::deserialize(&bytes).map_err(|e| RpcError::Codec(e.to_string()))?;
    Ok(Some(value))
}

/// Listening side of the transport
pub struct RpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RpcServer {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(RpcServer {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until the returned handle is aborted,
    /// dispatching every request to `handler`.
    pub fn spawn(self, handler: Arc<dyn RequestHandler>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler).await {
                                debug!(%peer_addr, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                    }
                }
            }
        })
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), RpcError> {
    while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
        let kind = request.kind();
        let ok = handler.handle(request).await;
        debug!(kind, ok, "handled request");
        write_frame(&mut stream, &Reply { ok }).await?;
    }
    Ok(())
}

/// Calling side of the transport. Connects per call.
#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        RpcClient {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, request: &Request) -> Result<bool, RpcError> {
        let mut stream =
            TcpStream::connect(&self.addr)
                .await
                .map_err(|source| RpcError::Connect {
                    addr: self.addr.clone(),
                    source,
                })?;

        write_frame(&mut stream, request).await?;
        match read_frame::<_, Reply>(&mut stream).await? {
            Some(reply) => Ok(reply.ok),
            None => Err(RpcError::Closed),
        }
    }

    /// Send a request and wait for the reply with no deadline.
    pub async fn send(&self, request: &Request) -> Result<bool, RpcError> {
        self.call(request).await
    }

    /// Send a request under this client's deadline. Any failure
    /// (connect, write, read, timeout) comes back as `false`; the
    /// state machines treat it like a negative vote from that peer.
    pub async fn send_timeout(&self, request: &Request) -> bool {
        match tokio::time::timeout(self.timeout, self.call(request)).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                debug!(addr = %self.addr, kind = request.kind(), error = %e, "rpc call failed");
                false
            }
            Err(_) => {
                debug!(addr = %self.addr, kind = request.kind(), "rpc call timed out");
                false
            }
        }
    }
}
