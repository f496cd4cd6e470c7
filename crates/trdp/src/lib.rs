//! TRDP (Train Real-time Data Protocol, IEC 61375-2-3) communication
//! stack for IP-connected train devices.
//!
//! Two traffic classes share one session object: cyclic **process data**
//! (publish/subscribe, push or pull) and request/reply **message data**
//! with per-exchange session identifiers. Frames are bit exact to the
//! standard's wire format: big-endian headers protected by CRC-32 frame
//! check sequences, topography counter validation, and per-key sequence
//! counters filtering duplicates.
//!
//! # Event loop integration
//!
//! The stack never spawns threads. The host owns the loop: ask the session
//! which sockets to watch and how long to wait, wait, then hand the ready
//! descriptors back to [`Session::process`]:
//!
//! ```ignore
//! use trdp::{Session, SessionConfig, sock};
//!
//! let mut session = Session::open(SessionConfig::default())?;
//! loop {
//!     let (timeout, fds) = session.next_interval();
//!     let ready = sock::poll_readable(&fds, timeout)?;
//!     session.process(&ready)?;
//! }
//! ```
//!
//! Any `poll`/`epoll`-based loop works the same way; `sock::poll_readable`
//! is just the built-in convenience.
//!
//! # Publish / subscribe
//!
//! ```ignore
//! use std::time::Duration;
//! use trdp::{Flags, Timeout, TopoCount};
//!
//! let pub_handle = session.publish(
//!     12345,
//!     TopoCount::default(),
//!     [0, 0, 0, 0].into(),      // source: stack picks the own address
//!     [10, 0, 0, 2].into(),
//!     Some(Duration::from_millis(100)),
//!     0,
//!     Flags::NONE,
//!     None,
//!     b"hello-world-0000",
//! )?;
//! session.put(pub_handle, b"hello-world-0001")?;
//! ```
//!
//! Subscriptions either poll via [`Session::get`] or set
//! [`Flags::CALLBACK`] and receive data changes and timeouts through the
//! session's PD callback, synchronously from `process`.
//!
//! # Message data
//!
//! [`Session::md_request`] opens a correlated exchange; listeners on the
//! replier side fork sessions that the application answers with
//! [`Session::reply`], [`Session::reply_query`] (confirmed via
//! [`Session::confirm`]) or [`Session::reply_err`]. UDP unicast requests
//! retry on reply timeout; multicast and TCP never do.

pub mod error;
pub mod frame;
pub mod marshall;
pub mod md;
pub mod pd;
pub mod queue;
pub mod seqcnt;
pub mod session;
pub mod sock;
pub mod stats;
pub mod types;

// Re-export the everyday surface at the crate root.
pub use error::{Error, Result};
pub use frame::MsgType;
pub use marshall::{DataType, Dataset, DatasetElement, Registry};
pub use md::ListenerHandle;
pub use pd::{PubHandle, SubHandle, Timeout};
pub use session::{
    GRAIN, MD_PORT, MdConfig, PD_UDP_PORT, PdConfig, ProcessOptions, Session, SessionConfig,
};
pub use stats::{MdStatistics, PdStatistics, Statistics};
pub use types::{
    Flags, MdCallback, MdInfo, PdCallback, PdInfo, ReplyStatus, SendParam, ToBehavior, TopoCount,
};
