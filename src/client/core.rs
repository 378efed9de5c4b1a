//! Session struct and shared plumbing (output buffering, error reporting).

use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use log::{debug, info};
use lru::LruCache;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::app::state::ServerState;
use crate::compiler::CompiledQueryGroup;
use crate::errors::Error;
use crate::pool::Lease;
use crate::protocol::codec::{read_frame, Frame, FrameDecoder};
use crate::protocol::messages::ServerMessage;
use crate::protocol::types::Capabilities;
use crate::session::SessionState;
use crate::stats::{self, SessionStats};
use crate::utils::cancel::CancelToken;

/// How many prepared statements one session may hold.
const PREPARED_PER_SESSION: usize = 256;

/// The transport a session arrived on; some capabilities are forbidden per
/// transport regardless of what the client asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Binary,
    SimpleHttp,
}

impl Transport {
    /// DDL and explicit transactions are not available over plain HTTP.
    pub fn forbidden_capabilities(&self) -> Capabilities {
        match self {
            Transport::Binary => Capabilities::NONE,
            Transport::SimpleHttp => Capabilities::DDL | Capabilities::TRANSACTION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    New,
    HandshakeWait,
    AuthWait,
    Ready,
    Executing,
    ReadyForSync,
    Closing,
}

/// One frontend session. Created per accepted connection, destroyed on
/// close.
pub struct FrontendSession<S, T> {
    /// The reads are buffered (8K by default).
    pub(crate) read: BufReader<S>,
    pub(crate) write: T,
    pub(crate) decoder: FrameDecoder,
    /// Server messages accumulate here and hit the socket on Flush/Sync
    /// boundaries (or when the buffer grows large mid-stream).
    pub(crate) out: BytesMut,

    pub(crate) id: u64,
    pub(crate) phase: SessionPhase,
    pub(crate) transport: Transport,
    pub(crate) server: Arc<ServerState>,

    pub(crate) username: String,
    pub(crate) branch: String,
    pub(crate) session: SessionState,

    /// Statements described via Parse, by query fingerprint.
    pub(crate) pending_prepared: LruCache<u64, Arc<CompiledQueryGroup>>,

    /// Backend connection held across the Execute..Sync window; pinned for
    /// the whole transaction once one is open.
    pub(crate) lease: Option<Lease>,

    pub(crate) last_capabilities: Capabilities,
    pub(crate) skip_until_sync: bool,

    pub(crate) stats: Arc<SessionStats>,
    /// Fired when the session dies; cancels in-flight pool acquires.
    pub(crate) cancel: CancelToken,
}

impl<S, T> FrontendSession<S, T>
where
    S: AsyncRead + Unpin,
    T: AsyncWrite + Unpin,
{
    pub fn new(read: S, write: T, server: Arc<ServerState>, transport: Transport) -> Self {
        let id = server.next_session_id();
        let max_frame = server.config.general.max_message_size.as_bytes() as u32;
        let branch = server.config.general.default_branch.clone();
        FrontendSession {
            read: BufReader::new(read),
            write,
            decoder: FrameDecoder::new(max_frame),
            out: BytesMut::with_capacity(8192),
            id,
            phase: SessionPhase::New,
            transport,
            server,
            username: String::new(),
            branch,
            session: SessionState::new(),
            pending_prepared: LruCache::new(
                NonZeroUsize::new(PREPARED_PER_SESSION).expect("nonzero capacity"),
            ),
            lease: None,
            last_capabilities: Capabilities::NONE,
            skip_until_sync: false,
            stats: stats::register_session(id),
            cancel: CancelToken::new(),
        }
    }

    /// Drive the whole session: handshake, auth, command loop, cleanup.
    pub async fn run(mut self) -> Result<(), Error> {
        self.phase = SessionPhase::HandshakeWait;
        let handshake_timeout = self.server.config.general.handshake_timeout.as_std();
        let handshake = tokio::time::timeout(handshake_timeout, self.handshake());
        match handshake.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.report_error(&err).await?;
                self.teardown();
                return Err(err);
            }
            Err(_) => {
                let err = Error::SessionIdleTimeout;
                self.report_error(&err).await?;
                self.teardown();
                return Err(err);
            }
        }

        info!(
            "[session: {}] {}@{} ready",
            self.id, self.username, self.branch
        );
        let result = self.ready_loop().await;
        self.teardown();
        result
    }

    /// Release resources. A connection carrying an open transaction is
    /// never re-pooled; it is discarded and replaced by the pool.
    pub(crate) fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(mut lease) = self.lease.take() {
            if self.session.in_transaction() {
                lease.mark_broken();
            }
        }
        self.phase = SessionPhase::Closing;
    }

    pub(crate) fn queue(&mut self, message: &ServerMessage) {
        message.encode_into(&mut self.out);
    }

    pub(crate) async fn flush_out(&mut self) -> Result<(), Error> {
        if self.out.is_empty() {
            return Ok(());
        }
        let buf = self.out.split();
        self.stats
            .bytes_sent
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.write.write_all(&buf).await?;
        self.write.flush().await?;
        Ok(())
    }

    /// Read the next frame; `None` on clean client disconnect.
    pub(crate) async fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let frame = read_frame(&mut self.read, &mut self.decoder).await?;
        if let Some(frame) = &frame {
            self.stats
                .bytes_received
                .fetch_add(frame.payload.len() as u64 + 5, Ordering::Relaxed);
        }
        Ok(frame)
    }

    /// Queue an `ErrorResponse`; fatal errors are flushed right away and
    /// close the session, recoverable ones discard input until Sync.
    pub(crate) async fn report_error(&mut self, err: &Error) -> Result<(), Error> {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        debug!("[session: {}] error: {err}", self.id);
        let message = ServerMessage::ErrorResponse {
            severity: err.severity(),
            code: err.code().0,
            message: err.to_string(),
            attributes: err
                .attributes()
                .into_iter()
                .map(|(code, value)| (code, value.into_bytes()))
                .collect(),
        };
        self.queue(&message);
        if err.is_fatal() {
            self.flush_out().await?;
            self.phase = SessionPhase::Closing;
        } else {
            self.skip_until_sync = true;
            self.phase = SessionPhase::Ready;
        }
        Ok(())
    }
}

impl<S, T> Drop for FrontendSession<S, T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        stats::unregister_session(self.id);
    }
}
