//! Session façade: configuration, the work function and the event loop
//! integration point.
//!
//! A [`Session`] owns every queue, socket and counter of one protocol
//! endpoint. The host drives it: [`Session::next_interval`] yields the
//! sockets to wait on and the next deadline, the host waits (its own event
//! loop or [`crate::sock::poll_readable`]), then calls [`Session::process`]
//! with the ready descriptors. The core never spawns threads; callbacks
//! run synchronously inside `process`.

use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::marshall::Registry;
use crate::md::{Listener, MdSession};
use crate::pd::PdElement;
use crate::queue::Queue;
use crate::seqcnt::SeqCntTable;
use crate::sock::{SockKind, SocketPool};
use crate::stats::{Statistics, StatsBlock};
use crate::types::{Flags, MdCallback, MdInfo, PdCallback, PdInfo, SendParam, ToBehavior, TopoCount};

/// Scheduler quantum: the minimum cycle time and the jitter bound of the
/// timer wheel.
pub const GRAIN: Duration = Duration::from_millis(10);

/// Default UDP port for process data.
pub const PD_UDP_PORT: u16 = 17224;

/// Default UDP and TCP port for message data.
pub const MD_PORT: u16 = 17225;

/// Default subscription timeout.
pub const PD_DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Default MD reply timeout.
pub const MD_DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default MD confirm timeout.
pub const MD_DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);

/// Default TCP connect timeout.
pub const MD_DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound for draining partial TCP writes.
pub const MD_DEFAULT_SENDING_TIMEOUT: Duration = Duration::from_millis(500);

/// Stack behaviour options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Open sockets blocking; the host then reads exactly one datagram per
    /// readiness notification.
    pub block: bool,
    /// Spread cyclic send offsets so equal cycles do not burst together.
    pub traffic_shaping: bool,
}

/// Default configuration for process data.
pub struct PdConfig {
    /// Callback for receive indications and timeouts (`CALLBACK` flag).
    pub callback: Option<PdCallback>,
    /// Default QoS/TTL for PD sockets.
    pub send_param: SendParam,
    /// Default flags merged into publish/subscribe calls.
    pub flags: Flags,
    /// Default subscription timeout.
    pub timeout: Duration,
    /// Default timeout behaviour.
    pub to_behavior: ToBehavior,
    /// UDP port for process data.
    pub port: u16,
}

impl Default for PdConfig {
    fn default() -> Self {
        Self {
            callback: None,
            send_param: SendParam {
                qos: 5,
                ttl: 64,
                retries: 0,
            },
            flags: Flags::NONE,
            timeout: PD_DEFAULT_TIMEOUT,
            to_behavior: ToBehavior::SetToZero,
            port: PD_UDP_PORT,
        }
    }
}

impl std::fmt::Debug for PdConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdConfig")
            .field("callback", &self.callback.is_some())
            .field("send_param", &self.send_param)
            .field("flags", &self.flags)
            .field("timeout", &self.timeout)
            .field("to_behavior", &self.to_behavior)
            .field("port", &self.port)
            .finish()
    }
}

/// Default configuration for message data.
pub struct MdConfig {
    /// Callback for indications, replies, confirms and timeouts.
    pub callback: Option<MdCallback>,
    /// Default QoS/TTL/retries for MD sockets.
    pub send_param: SendParam,
    /// Default flags merged into MD calls (`TCP` selects the transport).
    pub flags: Flags,
    /// Default reply timeout for requests.
    pub reply_timeout: Duration,
    /// Default confirm timeout for reply-queries.
    pub confirm_timeout: Duration,
    /// TCP connect completion bound.
    pub connect_timeout: Duration,
    /// Bound for draining partial TCP writes.
    pub sending_timeout: Duration,
    /// UDP port for message data.
    pub udp_port: u16,
    /// TCP port for message data.
    pub tcp_port: u16,
}

impl Default for MdConfig {
    fn default() -> Self {
        Self {
            callback: None,
            send_param: SendParam {
                qos: 3,
                ttl: 64,
                retries: 2,
            },
            flags: Flags::NONE,
            reply_timeout: MD_DEFAULT_REPLY_TIMEOUT,
            confirm_timeout: MD_DEFAULT_CONFIRM_TIMEOUT,
            connect_timeout: MD_DEFAULT_CONNECT_TIMEOUT,
            sending_timeout: MD_DEFAULT_SENDING_TIMEOUT,
            udp_port: MD_PORT,
            tcp_port: MD_PORT,
        }
    }
}

impl std::fmt::Debug for MdConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdConfig")
            .field("callback", &self.callback.is_some())
            .field("send_param", &self.send_param)
            .field("flags", &self.flags)
            .field("reply_timeout", &self.reply_timeout)
            .field("confirm_timeout", &self.confirm_timeout)
            .field("udp_port", &self.udp_port)
            .field("tcp_port", &self.tcp_port)
            .finish()
    }
}

/// Everything needed to open a session.
#[derive(Debug)]
pub struct SessionConfig {
    /// Own interface address; `UNSPECIFIED` binds all interfaces.
    pub own_ip: Ipv4Addr,
    /// Virtual (redundancy leader) address, informational.
    pub leader_ip: Ipv4Addr,
    /// Stack behaviour options.
    pub options: ProcessOptions,
    /// Process data defaults.
    pub pd: PdConfig,
    /// Message data defaults.
    pub md: MdConfig,
    /// Dataset registry for in-stack marshalling (may be empty).
    pub registry: Registry,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            own_ip: Ipv4Addr::UNSPECIFIED,
            leader_ip: Ipv4Addr::UNSPECIFIED,
            options: ProcessOptions::default(),
            pd: PdConfig::default(),
            md: MdConfig::default(),
            registry: Registry::default(),
        }
    }
}

/// One protocol endpoint: queues, sockets, counters and timers.
pub struct Session {
    pub(crate) own_ip: Ipv4Addr,
    pub(crate) leader_ip: Ipv4Addr,
    pub(crate) options: ProcessOptions,
    pub(crate) pd_cfg: PdConfig,
    pub(crate) md_cfg: MdConfig,
    pub(crate) registry: Registry,
    pub(crate) topo: TopoCount,
    pub(crate) pool: SocketPool,
    pub(crate) snd_queue: Queue<PdElement>,
    pub(crate) rcv_queue: Queue<PdElement>,
    pub(crate) md_snd: Queue<MdSession>,
    pub(crate) md_rcv: Queue<MdSession>,
    pub(crate) listeners: Queue<Listener>,
    pub(crate) seq_table: SeqCntTable,
    pub(crate) stats: StatsBlock,
    pub(crate) pd_events: Vec<(PdInfo, Vec<u8>)>,
    pub(crate) md_events: Vec<(MdInfo, Vec<u8>)>,
}

impl Session {
    /// Open a session; zeroed config fields fall back to the protocol
    /// defaults.
    pub fn open(mut config: SessionConfig) -> Result<Session> {
        if config.pd.port == 0 {
            config.pd.port = PD_UDP_PORT;
        }
        if config.pd.timeout.is_zero() {
            config.pd.timeout = PD_DEFAULT_TIMEOUT;
        }
        if config.md.udp_port == 0 {
            config.md.udp_port = MD_PORT;
        }
        if config.md.tcp_port == 0 {
            config.md.tcp_port = MD_PORT;
        }
        if config.md.reply_timeout.is_zero() {
            config.md.reply_timeout = MD_DEFAULT_REPLY_TIMEOUT;
        }
        if config.md.confirm_timeout.is_zero() {
            config.md.confirm_timeout = MD_DEFAULT_CONFIRM_TIMEOUT;
        }
        if config.md.connect_timeout.is_zero() {
            config.md.connect_timeout = MD_DEFAULT_CONNECT_TIMEOUT;
        }
        if config.md.sending_timeout.is_zero() {
            config.md.sending_timeout = MD_DEFAULT_SENDING_TIMEOUT;
        }
        if config.pd.send_param.ttl == 0 {
            config.pd.send_param.ttl = 64;
        }
        if config.md.send_param.ttl == 0 {
            config.md.send_param.ttl = 64;
        }

        info!(own_ip = %config.own_ip, "session opened");
        Ok(Session {
            own_ip: config.own_ip,
            leader_ip: config.leader_ip,
            options: config.options,
            pd_cfg: config.pd,
            md_cfg: config.md,
            registry: config.registry,
            topo: TopoCount::default(),
            pool: SocketPool::new(),
            snd_queue: Queue::new(),
            rcv_queue: Queue::new(),
            md_snd: Queue::new(),
            md_rcv: Queue::new(),
            listeners: Queue::new(),
            seq_table: SeqCntTable::new(),
            stats: StatsBlock::new(),
            pd_events: Vec::new(),
            md_events: Vec::new(),
        })
    }

    /// Close the session: abort pending MD exchanges (callbacks fire with
    /// the abort result), release every element and socket.
    pub fn close(&mut self) {
        self.md_abort_all();
        self.dispatch_events();
        self.snd_queue.drain();
        self.rcv_queue.drain();
        self.listeners.drain();
        self.pool.close_all();
        info!("session closed");
    }

    /// Set the topography counters validated against all traffic.
    ///
    /// Zero disables matching for the respective counter.
    pub fn set_topo_count(&mut self, etb: u32, op_trn: u32) {
        debug!(etb, op_trn, "topo count set");
        self.topo = TopoCount { etb, op_trn };
    }

    /// Current topography counters.
    pub fn topo_count(&self) -> TopoCount {
        self.topo
    }

    /// Own interface address of this session.
    pub fn own_ip(&self) -> Ipv4Addr {
        self.own_ip
    }

    /// Redundancy leader address of this session.
    pub fn leader_ip(&self) -> Ipv4Addr {
        self.leader_ip
    }

    /// Stack version triple.
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Counter snapshot.
    pub fn statistics(&self) -> Statistics {
        self.stats.snapshot()
    }

    /// Reset all counters (uptime origin is kept).
    pub fn reset_statistics(&mut self) {
        self.stats.reset();
    }

    /// Re-join all multicast memberships, e.g. after an interface bounce.
    pub fn reinit(&mut self) -> Result<()> {
        let groups: Vec<(usize, Ipv4Addr)> = self
            .rcv_queue
            .iter()
            .filter(|(_, e)| e.addr.mc_group != Ipv4Addr::UNSPECIFIED)
            .map(|(_, e)| (e.socket_idx, e.addr.mc_group))
            .chain(
                self.listeners
                    .iter()
                    .filter(|(_, l)| l.mc_group != Ipv4Addr::UNSPECIFIED)
                    .filter_map(|(_, l)| l.socket_idx.map(|i| (i, l.mc_group))),
            )
            .collect();
        for (idx, group) in groups {
            self.pool.leave_mc(idx, group)?;
            self.pool.join_mc(idx, group, self.own_ip)?;
        }
        Ok(())
    }

    /// The sockets to wait on and the time until the next deadline.
    ///
    /// With nothing scheduled the interval falls back to the 10 ms grain,
    /// matching the original stack's minimum poll time.
    pub fn next_interval(&self) -> (Duration, Vec<RawFd>) {
        let now = Instant::now();
        let deadline = match (self.pd_next_deadline(), self.md_next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let interval = match deadline {
            Some(d) if d > now => (d - now).max(Duration::from_millis(1)),
            Some(_) => Duration::ZERO,
            None => GRAIN,
        };

        let mut fds: Vec<RawFd> = self.pool.iter().map(|(_, s)| s.raw_fd()).collect();
        if let Some(fd) = self.pool.tcp_listener_fd() {
            fds.push(fd);
        }
        (interval, fds)
    }

    /// The work function: emit due telegrams, read ready sockets, sweep
    /// deadlines, dispatch callbacks.
    ///
    /// `ready` holds the descriptors the host's wait reported readable; an
    /// empty slice still drives timers and sends.
    pub fn process(&mut self, ready: &[RawFd]) -> Result<()> {
        let now = Instant::now();
        let mut result = Ok(());

        if let Err(e) = self.pd_send_queued(now) {
            result = Err(e);
        }
        self.pd_handle_timeouts(now);

        if let Err(e) = self.md_send_queued(now) {
            result = Err(e);
        }
        self.tcp_housekeeping(now);

        for &fd in ready {
            if Some(fd) == self.pool.tcp_listener_fd() {
                while let Some(_idx) = self.pool.accept_tcp()? {}
                continue;
            }
            let found = self
                .pool
                .iter()
                .find(|(_, s)| s.raw_fd() == fd)
                .map(|(i, s)| (i, s.kind));
            let Some((idx, kind)) = found else { continue };

            let drain = !self.options.block;
            match kind {
                SockKind::Pd => loop {
                    match self.pd_receive(idx) {
                        Ok(()) if drain => continue,
                        Ok(()) => break,
                        Err(Error::NoData) => break,
                        Err(e) if e.is_transient() => break,
                        Err(e) => {
                            warn!(error = %e, "PD receive failed");
                            result = Err(e);
                            break;
                        }
                    }
                },
                SockKind::MdUdp => loop {
                    match self.md_receive_udp(idx) {
                        Ok(()) if drain => continue,
                        Ok(()) => break,
                        Err(Error::NoData) => break,
                        Err(e) if e.is_transient() => break,
                        Err(e) => {
                            warn!(error = %e, "MD receive failed");
                            result = Err(e);
                            break;
                        }
                    }
                },
                SockKind::MdTcp => {
                    if let Err(e) = self.md_receive_tcp(idx) {
                        if !e.is_transient() {
                            warn!(error = %e, "MD TCP receive failed");
                            result = Err(e);
                        }
                    }
                }
            }
        }

        self.md_check_timeouts(now);
        self.dispatch_events();
        result
    }

    /// Poll TCP connect completions, retry partial writes, reap sockets
    /// scheduled for death.
    fn tcp_housekeeping(&mut self, now: Instant) {
        let failed_connects = self.pool.update_tcp_connects(now);
        for idx in failed_connects {
            self.md_fail_tcp_sessions(idx);
            self.pool.close(idx);
        }
        let failed_sends = self.pool.flush_tcp(now);
        for idx in failed_sends {
            self.md_fail_tcp_sessions(idx);
            self.pool.close(idx);
        }
        // Sockets marked morituri close once their pending bytes drained.
        let drained: Vec<usize> = self
            .pool
            .iter()
            .filter(|(_, s)| {
                s.tcp
                    .as_ref()
                    .is_some_and(|t| t.morituri && t.pending.is_empty())
            })
            .map(|(i, _)| i)
            .collect();
        for idx in drained {
            self.pool.close(idx);
        }
    }

    /// Abort every MD session bound to a dead TCP socket.
    fn md_fail_tcp_sessions(&mut self, socket_idx: usize) {
        use crate::types::ReplyStatus;

        let handles: Vec<_> = self
            .md_snd
            .iter()
            .filter(|(_, s)| s.socket_idx == socket_idx && s.flags.contains(Flags::TCP))
            .map(|(h, _)| h)
            .collect();
        let io_code = Error::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).code();
        for handle in handles {
            if let Some(session) = self.md_snd.remove(handle) {
                warn!(com_id = session.addr.com_id, "TCP session failed");
                self.md_events
                    .push((session.info(io_code, ReplyStatus::SendingFailed), Vec::new()));
                self.stats.tcp_md.num_reply_timeout += 1;
            }
        }
        let stale: Vec<_> = self
            .md_rcv
            .iter()
            .filter(|(_, s)| s.socket_idx == socket_idx && s.flags.contains(Flags::TCP))
            .map(|(h, _)| h)
            .collect();
        for handle in stale {
            self.md_rcv.remove(handle);
        }
    }

    /// Fire collected callbacks, after all queue mutation is done. Each
    /// callback sees a stable payload snapshot.
    fn dispatch_events(&mut self) {
        if self.pd_events.is_empty() && self.md_events.is_empty() {
            return;
        }
        if let Some(mut cb) = self.pd_cfg.callback.take() {
            for (info, data) in self.pd_events.drain(..) {
                cb(&info, &data);
            }
            self.pd_cfg.callback = Some(cb);
        } else {
            self.pd_events.clear();
        }
        if let Some(mut cb) = self.md_cfg.callback.take() {
            for (info, data) in self.md_events.drain(..) {
                cb(&info, &data);
            }
            self.md_cfg.callback = Some(cb);
        } else {
            self.md_events.clear();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Pending MD work is aborted silently; sockets close with the pool.
        self.md_snd.drain();
        self.md_rcv.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_fills_defaults() {
        let config = SessionConfig {
            pd: PdConfig {
                port: 0,
                timeout: Duration::ZERO,
                ..Default::default()
            },
            md: MdConfig {
                udp_port: 0,
                tcp_port: 0,
                reply_timeout: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let session = Session::open(config).unwrap();
        assert_eq!(session.pd_cfg.port, PD_UDP_PORT);
        assert_eq!(session.pd_cfg.timeout, PD_DEFAULT_TIMEOUT);
        assert_eq!(session.md_cfg.udp_port, MD_PORT);
        assert_eq!(session.md_cfg.reply_timeout, MD_DEFAULT_REPLY_TIMEOUT);
    }

    #[test]
    fn test_topo_count_roundtrip() {
        let mut session = Session::open(SessionConfig::default()).unwrap();
        session.set_topo_count(7, 9);
        assert_eq!(session.topo_count(), TopoCount { etb: 7, op_trn: 9 });
    }

    #[test]
    fn test_idle_interval_is_grain() {
        let session = Session::open(SessionConfig::default()).unwrap();
        let (interval, fds) = session.next_interval();
        assert_eq!(interval, GRAIN);
        assert!(fds.is_empty());
    }

    #[test]
    fn test_process_with_no_ready_fds() {
        let mut session = Session::open(SessionConfig::default()).unwrap();
        session.process(&[]).unwrap();
    }

    #[test]
    fn test_version() {
        assert!(!Session::version().is_empty());
    }
}
