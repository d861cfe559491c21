use std::{io, net::SocketAddr, rc::Rc};
use tokio::{io::{AsyncRead, AsyncWrite}, sync::mpsc, task::JoinHandle};
use crate::{picker::PickerError, torrent::TorrentContext};

mod session;
pub mod message;
pub mod handshake;
pub mod state;
#[cfg(test)]
mod tests;

pub use session::PeerSession;

use self::state::SessionState;

type Result<T, E = PeerError> = std::result::Result<T, E>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;
pub type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;

// Too many open files, same value on linux and macos.
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;

// Anything a peer session can run over.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin> PeerStream for T {}

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("IO: {0}")]
    Io(#[from] io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake recieved")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),

    #[error("receive buffer overflow ({0} bytes)")]
    BufferOverflow(usize),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("bitfield sent after first message")]
    UnexpectedBitfield,

    #[error("connection timeout")]
    Timeout,

    #[error(transparent)]
    Picker(#[from] PickerError),
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// What to do with a peer after its session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {

    // Possibly transient, try again after a backoff.
    Retry,

    // Never going to work, don't try again.
    Blacklist,

    // Local resource trouble, not the peer's fault.
    Ignore,

}

impl PeerError {

    pub fn kind(&self) -> FailureKind {
        match self {
            PeerError::Io(e) => io_failure_kind(e),
            PeerError::IncorrectInfoHash | PeerError::IncorrectProtocol => FailureKind::Blacklist,
            _ => FailureKind::Retry,
        }
    }
}

fn io_failure_kind(e: &io::Error) -> FailureKind {
    use io::ErrorKind::*;
    if matches!(e.raw_os_error(), Some(EMFILE) | Some(ENFILE)) {
        return FailureKind::Ignore;
    }
    match e.kind() {
        HostUnreachable | NetworkUnreachable | NotFound => FailureKind::Blacklist,
        AddrInUse | AddrNotAvailable => FailureKind::Ignore,
        _ => FailureKind::Retry,
    }
}

// Commands that can be sent to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {

    // A piece was verified and saved, tell the peer.
    PieceCompleted(usize),

    // Try to download this piece if the peer has it.
    Request(usize),

    // End the peer session safely.
    Shutdown,

}

#[derive(Debug)]
pub struct PeerHandle {

    // Sends commands to the session.
    pub peer_tx: PeerTx,

    // Last state reported by the session.
    pub state: SessionState,

    pub session_handle: JoinHandle<()>,

}

impl PeerHandle {

    // Spawns an outbound session on the current local set.
    pub fn start_session(address: SocketAddr, ctx: Rc<TorrentContext>) -> PeerHandle {
        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::task::spawn_local(async move {
            session.start().await
        });
        PeerHandle {
            peer_tx,
            state: SessionState::default(),
            session_handle,
        }
    }

    // False once the session has ended.
    pub fn send(&self, cmd: PeerCommand) -> bool {
        self.peer_tx.send(cmd).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.session_handle.is_finished()
    }
}
