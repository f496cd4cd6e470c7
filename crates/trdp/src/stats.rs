//! Per-session statistics counters.
//!
//! Every drop path and every successful send/receive feeds these counters;
//! a snapshot is available through `Session::statistics`.

use std::time::Instant;

/// Process data counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "stats-serde", derive(serde::Serialize))]
pub struct PdStatistics {
    /// Subscribed comIds.
    pub num_subs: u32,
    /// Published comIds.
    pub num_pub: u32,
    /// Received PD frames accepted.
    pub num_rcv: u32,
    /// Received PD frames with FCS errors.
    pub num_crc_err: u32,
    /// Received PD frames with protocol errors.
    pub num_prot_err: u32,
    /// Received PD frames with mismatching topography counters.
    pub num_topo_err: u32,
    /// Received push frames without a matching subscription.
    pub num_no_subs: u32,
    /// Received pull requests without a matching publisher.
    pub num_no_pub: u32,
    /// Subscription timeouts.
    pub num_timeout: u32,
    /// Duplicate or replayed frames dropped.
    pub num_dup: u32,
    /// Frames skipped in sequence counter gaps.
    pub num_missed: u32,
    /// PD frames sent.
    pub num_send: u32,
}

/// Message data counters, one instance per transport (UDP / TCP).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "stats-serde", derive(serde::Serialize))]
pub struct MdStatistics {
    /// Armed listeners.
    pub num_list: u32,
    /// Received MD frames accepted.
    pub num_rcv: u32,
    /// Received MD frames with FCS errors.
    pub num_crc_err: u32,
    /// Received MD frames with protocol errors.
    pub num_prot_err: u32,
    /// Received MD frames with mismatching topography counters.
    pub num_topo_err: u32,
    /// Received MD frames no listener or session matched.
    pub num_no_listener: u32,
    /// Reply timeouts.
    pub num_reply_timeout: u32,
    /// Confirm timeouts.
    pub num_confirm_timeout: u32,
    /// MD frames sent.
    pub num_send: u32,
}

/// Snapshot of all counters of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "stats-serde", derive(serde::Serialize))]
pub struct Statistics {
    /// Seconds since the session was opened.
    pub uptime_secs: u64,
    /// Multicast groups currently joined.
    pub num_join: u32,
    /// Redundancy groups observed on publishers.
    pub num_red: u32,
    /// Process data counters.
    pub pd: PdStatistics,
    /// Message data counters over UDP.
    pub udp_md: MdStatistics,
    /// Message data counters over TCP.
    pub tcp_md: MdStatistics,
}

/// Live counter block owned by the session.
#[derive(Debug)]
pub(crate) struct StatsBlock {
    pub(crate) opened: Instant,
    pub(crate) num_join: u32,
    pub(crate) num_red: u32,
    pub(crate) pd: PdStatistics,
    pub(crate) udp_md: MdStatistics,
    pub(crate) tcp_md: MdStatistics,
}

impl StatsBlock {
    pub(crate) fn new() -> Self {
        Self {
            opened: Instant::now(),
            num_join: 0,
            num_red: 0,
            pd: PdStatistics::default(),
            udp_md: MdStatistics::default(),
            tcp_md: MdStatistics::default(),
        }
    }

    pub(crate) fn snapshot(&self) -> Statistics {
        Statistics {
            uptime_secs: self.opened.elapsed().as_secs(),
            num_join: self.num_join,
            num_red: self.num_red,
            pd: self.pd,
            udp_md: self.udp_md,
            tcp_md: self.tcp_md,
        }
    }

    pub(crate) fn reset(&mut self) {
        let opened = self.opened;
        *self = Self::new();
        self.opened = opened;
    }
}
