//! Multiplexed stream protocol ("mux layer")
//!
//! Provides:
//! - Frame encoding/decoding
//! - Per-stream state machine with window-based flow control
//! - Sessions: one carrier, many streams, one read loop
//! - In-band DNS tunneling on the same carrier

pub mod dns;
mod frame;
mod session;
mod stream;

pub use dns::{DnsMessage, Resolver, UdpResolver};
pub use frame::{
    read_frame, Frame, ERR_AUTH, ERR_CONNFAILED, ERR_IDEXIST, ERR_NONE, ERR_TIMEOUT, HEADER_SIZE,
    MAX_FRAME_PAYLOAD,
};
pub use session::{Role, Session, SessionContext};
pub use stream::{Status, Stream};

use std::time::Duration;

use thiserror::Error;

/// Initial flow-control window granted to each direction of a stream (W0)
pub const WINDOW_SIZE: u32 = 256 * 1024;

/// Largest payload carried by a single DATA frame (sender policy)
pub const MAX_DATA_PAYLOAD: usize = 8 * 1024;

/// Deadline for one frame write on the carrier
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for a stream dial (SYN sent until RESULT received)
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for a tunneled DNS lookup
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the auth handshake on a fresh carrier
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Mux layer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("stream id {0} already in use")]
    IdExist(u16),

    #[error("frame for unknown stream id {0}")]
    StreamNotExist(u16),

    #[error("unknown frame kind {0}")]
    UnexpectedPkg(u8),

    #[error("invalid frame: {0}")]
    BadFrame(String),

    #[error("authentication rejected")]
    Auth,

    #[error("remote dial failed")]
    ConnFailed,

    #[error("malformed dns message")]
    DnsMsgIllegal,

    #[error("no dns resolver available")]
    NoDnsServer,

    #[error("run out of stream ids")]
    RunOutOfStreamId,

    #[error("operation timed out")]
    Timeout,

    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidStatus { from: Status, to: Status },

    #[error("stream closed")]
    StreamClosed,

    #[error("session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MuxError {
    /// Map a non-zero RESULT error code to the error it stands for.
    pub(crate) fn from_errno(errno: u8, streamid: u16) -> MuxError {
        match errno {
            ERR_IDEXIST => MuxError::IdExist(streamid),
            ERR_AUTH => MuxError::Auth,
            ERR_TIMEOUT => MuxError::Timeout,
            _ => MuxError::ConnFailed,
        }
    }
}
