//! Session state machine — one client connection from accept to close.
//!
//! A session reads one fixed-size frame, decodes its header, and dispatches
//! on the request code. Uploads pull further frames directly from the
//! connection until the declared ciphertext length has been consumed.
//!
//! No error frame exists in the protocol. A failed Registration, PublicKey,
//! ValidCRC or InvalidCRC request is dropped and the session keeps reading.
//! A failed upload, a connection I/O error, or an undecodable upload request
//! closes the connection: the rest of an aborted upload cannot be told apart
//! from the next request.

mod handlers;
mod upload;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use cask_core::config::{SessionConfig, UploadPadding};
use cask_core::crypto::{ChecksumKind, CryptoError};
use cask_core::wire::{
    pad_to_frames, Frame, Request, RequestCode, RequestHeader, Response, WireError,
    PACKET_SIZE, REQUEST_HEADER_SIZE,
};

use crate::storage::{FileStorage, StorageError};
use crate::store::{RecordStore, StoreError};

// ── Context ───────────────────────────────────────────────────────────────────

/// Per-session behaviour, taken from the `[session]` config section.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub upload_padding: UploadPadding,
    pub checksum: ChecksumKind,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            upload_padding: config.upload_padding,
            checksum: config.checksum,
        }
    }
}

/// Everything a session shares with its siblings.
#[derive(Clone)]
pub struct SessionContext {
    pub store: RecordStore,
    pub storage: FileStorage,
    pub settings: SessionSettings,
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRequest,
    Registering,
    ExchangingKey,
    ReceivingFile,
    ConfirmingCrc,
    Terminated,
}

/// What the session does after a request has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Terminate,
}

pub struct Session<S> {
    stream: S,
    ctx: SessionContext,
    state: SessionState,
    /// Peer label for logs.
    peer: String,
    /// Set once the peer has closed or gone idle; no further reads.
    closed: bool,
    requests: u64,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, ctx: SessionContext, peer: impl Into<String>) -> Self {
        Self {
            stream,
            ctx,
            state: SessionState::AwaitingRequest,
            peer: peer.into(),
            closed: false,
            requests: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve requests until the peer closes, a request ends the session, or
    /// a connection-fatal error occurs. Returns the number of requests read.
    pub async fn run(mut self) -> Result<u64, SessionError> {
        let result = self.serve().await;
        self.state = SessionState::Terminated;
        let _ = self.stream.shutdown().await;
        result.map(|()| self.requests)
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        loop {
            self.state = SessionState::AwaitingRequest;
            let Some((frame, len)) = self.read_frame().await? else {
                tracing::debug!(peer = %self.peer, "peer closed connection");
                return Ok(());
            };
            self.requests += 1;

            match self.handle_frame(&frame, len).await? {
                Flow::Continue => {}
                Flow::Terminate => return Ok(()),
            }
        }
    }

    /// Decode and dispatch one request. Errors returned from here close
    /// the connection; everything else has been logged and dropped.
    async fn handle_frame(&mut self, frame: &Frame, len: usize) -> Result<Flow, SessionError> {
        let header = RequestHeader::decode(frame)?;
        let client = hex::encode(header.client_id);
        let code = match header.request_code() {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!(peer = %self.peer, client = %client, error = %e, "request dropped");
                return Ok(Flow::Continue);
            }
        };
        tracing::debug!(
            peer = %self.peer,
            client = %client,
            version = header.version,
            code = ?code,
            payload = header.payload_size(),
            "request"
        );

        let request = match Request::decode(code, &frame[REQUEST_HEADER_SIZE..]) {
            Ok(request) => request,
            Err(e) if code == RequestCode::SendFile => return Err(e.into()),
            Err(e) => {
                tracing::warn!(peer = %self.peer, client = %client, ?code, error = %e, "request dropped");
                return Ok(Flow::Continue);
            }
        };

        let result = self.dispatch(&header, request, &frame[..len]).await;
        match result {
            Ok(flow) => Ok(flow),
            Err(e) if code == RequestCode::SendFile || e.is_connection_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(peer = %self.peer, client = %client, ?code, error = %e, "request dropped");
                Ok(Flow::Continue)
            }
        }
    }

    async fn dispatch(
        &mut self,
        header: &RequestHeader,
        request: Request,
        received: &[u8],
    ) -> Result<Flow, SessionError> {
        match request {
            Request::Registration { name } => {
                self.state = SessionState::Registering;
                self.register(name).await
            }
            Request::PublicKey { name, public_key } => {
                self.state = SessionState::ExchangingKey;
                self.exchange_key(header, name, public_key).await
            }
            Request::SendFile {
                client_id,
                content_size,
                file_name,
            } => {
                self.state = SessionState::ReceivingFile;
                self.receive_file(header, client_id, content_size, file_name, received)
                    .await
            }
            Request::ValidCrc(crc) => {
                self.state = SessionState::ConfirmingCrc;
                self.crc_valid(header, crc).await
            }
            Request::InvalidCrc(crc) => {
                self.state = SessionState::ConfirmingCrc;
                self.crc_invalid(header, crc).await
            }
            Request::LastInvalidCrc(crc) => {
                self.state = SessionState::ConfirmingCrc;
                self.crc_last_invalid(header, crc).await
            }
        }
    }

    // ── Transport ─────────────────────────────────────────────────────────────

    /// Read one frame and the number of bytes the peer actually sent in it.
    /// A final partial frame before end-of-stream is zero-padded; only the
    /// first `len` bytes are real. The whole frame must arrive within the
    /// idle timeout; otherwise the connection is treated as closed and any
    /// bytes of the unfinished frame are discarded.
    /// Returns `None` once the connection has nothing more to give.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<(Frame, usize)>, SessionError> {
        if self.closed {
            return Ok(None);
        }
        let mut frame = [0u8; PACKET_SIZE];
        let mut filled = 0;
        let deadline = tokio::time::Instant::now() + self.ctx.settings.idle_timeout;
        while filled < PACKET_SIZE {
            let read =
                tokio::time::timeout_at(deadline, self.stream.read(&mut frame[filled..])).await;
            match read {
                Ok(Ok(0)) => {
                    self.closed = true;
                    break;
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(SessionError::Io(e)),
                Err(_) => {
                    tracing::info!(
                        peer = %self.peer,
                        timeout_secs = self.ctx.settings.idle_timeout.as_secs_f64(),
                        discarded = filled,
                        "idle timeout"
                    );
                    self.closed = true;
                    return Ok(None);
                }
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        tracing::trace!(peer = %self.peer, bytes = filled, "frame");
        Ok(Some((frame, filled)))
    }

    /// Encode a response and write it as whole frames.
    pub(crate) async fn send(&mut self, response: Response) -> Result<(), SessionError> {
        let code = response.code();
        let bytes = pad_to_frames(&response.encode()?);
        self.stream
            .write_all(&bytes)
            .await
            .map_err(SessionError::Io)?;
        self.stream.flush().await.map_err(SessionError::Io)?;
        tracing::trace!(peer = %self.peer, ?code, frames = bytes.len() / PACKET_SIZE, "response");
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown client {0}")]
    UnknownClient(String),

    #[error("client {client} has no file {file:?}")]
    UnknownFile { client: String, file: String },

    #[error("client {0} has no session key")]
    NoSessionKey(String),

    #[error("file {file:?} of client {client} is already verified")]
    AlreadyVerified { client: String, file: String },

    #[error("content size {size} is not valid with {padding:?} padding")]
    UnalignedContent { size: u32, padding: UploadPadding },

    #[error("upload truncated: {received} of {expected} bytes")]
    TruncatedUpload { expected: u64, received: u64 },

    #[error("connection: {0}")]
    Io(#[source] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// Errors after which the byte stream can no longer be trusted.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, SessionError::Io(_) | SessionError::TruncatedUpload { .. })
    }
}
