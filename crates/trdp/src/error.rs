//! Error types for TRDP operations.

use std::io;

/// Result type for TRDP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during TRDP operations.
///
/// Every variant corresponds to one of the protocol's stable error codes
/// (see [`Error::code`]); callbacks carry the same taxonomy in their
/// `result_code` field.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Parameter missing or out of range.
    #[error("invalid parameter: {0}")]
    Param(&'static str),

    /// Call without valid initialisation.
    #[error("stack not initialised")]
    Init,

    /// Call with an invalid session handle.
    #[error("session handle invalid")]
    NoInit,

    /// A supervised deadline expired.
    #[error("timeout")]
    Timeout,

    /// Non-blocking mode: no data received.
    #[error("no data received")]
    NoData,

    /// Socket could not be opened or an option is not supported.
    #[error("socket error: {0}")]
    Sock(io::Error),

    /// Socket I/O error, data could not be received or sent.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Out of memory or buffer too small.
    #[error("out of memory: {0}")]
    Mem(&'static str),

    /// Semaphore not available.
    #[error("semaphore not available")]
    Sema,

    /// Queue empty.
    #[error("queue empty")]
    Queue,

    /// Queue full (e.g. socket pool exhausted).
    #[error("queue full: {0}")]
    QueueFull(&'static str),

    /// Mutex not available.
    #[error("mutex not available")]
    Mutex,

    /// No such session.
    #[error("no such session")]
    NoSession,

    /// Session was aborted.
    #[error("session aborted")]
    SessionAbort,

    /// No matching subscription.
    #[error("no such subscription")]
    NoSub,

    /// No matching publication.
    #[error("no such publication")]
    NoPub,

    /// No matching listener.
    #[error("no such listener")]
    NoListener,

    /// Frame check sequence mismatch.
    #[error("CRC error: expected {expected:#010x}, got {actual:#010x}")]
    Crc {
        /// Checksum carried in the frame.
        expected: u32,
        /// Checksum computed over the received bytes.
        actual: u32,
    },

    /// Malformed frame (size, version, message type, length fields).
    #[error("wire format error: {0}")]
    Wire(&'static str),

    /// Topology counter mismatch.
    #[error("topo count mismatch: ours {ours}, frame {theirs}")]
    Topo {
        /// Our current topography counter.
        ours: u32,
        /// The counter carried in the frame.
        theirs: u32,
    },

    /// Unknown ComId.
    #[error("unknown comId {0}")]
    ComId(u32),

    /// Call in the wrong state (e.g. marshalling recursion too deep).
    #[error("state error: {0}")]
    State(&'static str),

    /// Unspecified error.
    #[error("unspecified error")]
    Unknown,
}

impl Error {
    /// The protocol's stable numeric code for this error kind.
    ///
    /// These values are fixed by the wire protocol's status reporting and
    /// must not change between releases.
    pub fn code(&self) -> i32 {
        match self {
            Self::Param(_) => -1,
            Self::Init => -2,
            Self::NoInit => -3,
            Self::Timeout => -4,
            Self::NoData => -5,
            Self::Sock(_) => -6,
            Self::Io(_) => -7,
            Self::Mem(_) => -8,
            Self::Sema => -9,
            Self::Queue => -10,
            Self::QueueFull(_) => -11,
            Self::Mutex => -12,
            Self::NoSession => -13,
            Self::SessionAbort => -14,
            Self::NoSub => -15,
            Self::NoPub => -16,
            Self::NoListener => -17,
            Self::Crc { .. } => -18,
            Self::Wire(_) => -19,
            Self::Topo { .. } => -20,
            Self::ComId(_) => -21,
            Self::State(_) => -22,
            Self::Unknown => -99,
        }
    }

    /// Check whether this error is transient at the socket level
    /// (`EAGAIN`/`EWOULDBLOCK`/`EINTR`); such conditions are retried on the
    /// next processing tick instead of being surfaced.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) | Self::Sock(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
