//! Common protocol types shared by the PD and MD engines.

use std::net::Ipv4Addr;
use std::ops::BitOr;

use crate::frame::MsgType;

/// Option flags accepted on publish, subscribe and listener calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    /// No options.
    pub const NONE: Flags = Flags(0);
    /// Element belongs to a redundancy group.
    pub const REDUNDANT: Flags = Flags(0x1);
    /// Marshall/unmarshall payloads in the stack via the dataset registry.
    pub const MARSHALL: Flags = Flags(0x2);
    /// Dispatch received data through the callback instead of polling.
    pub const CALLBACK: Flags = Flags(0x4);
    /// Use TCP for message data.
    pub const TCP: Flags = Flags(0x8);

    /// Check whether all bits of `other` are set.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Behaviour of a subscription buffer when its timeout expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToBehavior {
    /// Zero the data buffer on timeout.
    #[default]
    SetToZero,
    /// Keep the last received values.
    KeepLastValue,
}

/// Quality of service and time-to-live for outgoing telegrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendParam {
    /// QoS class, mapped into the IP TOS/DSCP field.
    pub qos: u8,
    /// IP time-to-live; also the multicast TTL.
    pub ttl: u8,
    /// Retransmissions on reply timeout (UDP unicast MD requests only).
    pub retries: u32,
}

/// Reply status carried in MD headers and surfaced to callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyStatus {
    /// Exchange in order.
    #[default]
    Ok,
    /// The replier application did not answer within its deadline.
    ApplTimeout,
    /// Session aborted by the peer.
    SessionAbort,
    /// No replier instance for the addressed comId/URI.
    NoReplierInst,
    /// Replier out of memory.
    NoMemRepl,
    /// Caller out of memory.
    NoMemLocal,
    /// No reply arrived within the reply timeout.
    NoReply,
    /// Fewer replies than expected arrived.
    NotAllReplies,
    /// A requested confirmation never arrived.
    NoConfirm,
    /// Topography counter mismatch at the replier.
    WrongTopoCount,
    /// The transport could not deliver the message.
    SendingFailed,
    /// Unspecified error.
    Unspecified,
}

impl ReplyStatus {
    /// Wire encoding (0 for OK, small negatives otherwise).
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ApplTimeout => -1,
            Self::SessionAbort => -2,
            Self::NoReplierInst => -3,
            Self::NoMemRepl => -4,
            Self::NoMemLocal => -5,
            Self::NoReply => -6,
            Self::NotAllReplies => -7,
            Self::NoConfirm => -8,
            Self::WrongTopoCount => -9,
            Self::SendingFailed => -10,
            Self::Unspecified => -99,
        }
    }

    /// Decode a wire value; unknown codes map to `Unspecified`.
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            -1 => Self::ApplTimeout,
            -2 => Self::SessionAbort,
            -3 => Self::NoReplierInst,
            -4 => Self::NoMemRepl,
            -5 => Self::NoMemLocal,
            -6 => Self::NoReply,
            -7 => Self::NotAllReplies,
            -8 => Self::NoConfirm,
            -9 => Self::WrongTopoCount,
            -10 => Self::SendingFailed,
            _ => Self::Unspecified,
        }
    }
}

/// The addressing tuple keying publishers, subscriptions and MD exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addressing {
    /// Telegram identifier.
    pub com_id: u32,
    /// Source filter; `UNSPECIFIED` matches any source.
    pub src_ip: Ipv4Addr,
    /// Destination address (unicast or multicast).
    pub dst_ip: Ipv4Addr,
    /// Multicast group joined for this element, `UNSPECIFIED` if none.
    pub mc_group: Ipv4Addr,
    /// ETB topography counter the element was created under.
    pub etb_topo: u32,
    /// Operational train topography counter the element was created under.
    pub op_trn_topo: u32,
}

impl Addressing {
    /// Addressing for a unicast or multicast destination; the multicast
    /// group is derived from the destination address.
    pub fn new(com_id: u32, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, etb: u32, op_trn: u32) -> Self {
        Self {
            com_id,
            src_ip,
            dst_ip,
            mc_group: if dst_ip.is_multicast() {
                dst_ip
            } else {
                Ipv4Addr::UNSPECIFIED
            },
            etb_topo: etb,
            op_trn_topo: op_trn,
        }
    }
}

/// Topography counter pair validated against incoming frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TopoCount {
    /// ETB (train backbone) counter.
    pub etb: u32,
    /// Operational train counter.
    pub op_trn: u32,
}

impl TopoCount {
    /// A frame matches when each counter is equal or either side is zero.
    pub fn matches(self, etb: u32, op_trn: u32) -> bool {
        (self.etb == 0 || etb == 0 || self.etb == etb)
            && (self.op_trn == 0 || op_trn == 0 || self.op_trn == op_trn)
    }
}

/// Metadata handed to PD callbacks and `get`.
#[derive(Debug, Clone)]
pub struct PdInfo {
    /// Source address the telegram was received from (or sent with).
    pub src_ip: Ipv4Addr,
    /// Destination address of the telegram.
    pub dst_ip: Ipv4Addr,
    /// Sequence counter from the frame header.
    pub seq_count: u32,
    /// Protocol version from the frame header.
    pub proto_version: u16,
    /// Message type.
    pub msg_type: MsgType,
    /// Telegram identifier.
    pub com_id: u32,
    /// ETB topography counter from the frame header.
    pub etb_topo: u32,
    /// Operational train topography counter from the frame header.
    pub op_trn_topo: u32,
    /// Pull reply comId (pull request only).
    pub reply_com_id: u32,
    /// Pull reply address (pull request only).
    pub reply_ip: Ipv4Addr,
    /// User reference given at subscribe time.
    pub user_ref: usize,
    /// Delivery status: `0` (OK) or a negative [`crate::Error::code`]
    /// value, e.g. timeout.
    pub result_code: i32,
}

/// Metadata handed to MD callbacks.
#[derive(Debug, Clone)]
pub struct MdInfo {
    /// Source address the message was received from.
    pub src_ip: Ipv4Addr,
    /// Destination address of the message.
    pub dst_ip: Ipv4Addr,
    /// Sequence counter from the frame header.
    pub seq_count: u32,
    /// Protocol version from the frame header.
    pub proto_version: u16,
    /// Message type.
    pub msg_type: MsgType,
    /// Telegram identifier.
    pub com_id: u32,
    /// ETB topography counter from the frame header.
    pub etb_topo: u32,
    /// Operational train topography counter from the frame header.
    pub op_trn_topo: u32,
    /// Reply status from the frame header.
    pub reply_status: ReplyStatus,
    /// Session identifier of the exchange.
    pub session_id: [u8; 16],
    /// Reply timeout in microseconds given with the request.
    pub reply_timeout_us: u32,
    /// Destination URI user part from the header.
    pub dest_uri: String,
    /// Source URI user part from the header.
    pub src_uri: String,
    /// Replies seen so far for the originating request.
    pub num_replies: u32,
    /// User reference given with the local call or listener.
    pub user_ref: usize,
    /// Delivery status: `0` (OK) or a negative [`crate::Error::code`]
    /// value.
    pub result_code: i32,
}

/// Callback invoked for PD receptions and subscription timeouts.
///
/// Callbacks run synchronously inside `process` on the calling thread and
/// always see a stable snapshot of the payload.
pub type PdCallback = Box<dyn FnMut(&PdInfo, &[u8])>;

/// Callback invoked for MD indications, replies, confirms and timeouts.
pub type MdCallback = Box<dyn FnMut(&MdInfo, &[u8])>;

/// Decode a fixed, zero padded URI field into a string, stopping at the
/// first NUL.
pub fn uri_to_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
