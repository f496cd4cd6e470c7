//! Process data engine: cyclic send, reception, supervision and pull.
//!
//! Publishers and subscriptions are PD elements on the session's send and
//! receive queues. The send path stamps sequence counters and check
//! sequences into a preassembled frame buffer; the receive path validates,
//! deduplicates and copies into the matching subscription slot. All timing
//! runs off `time_to_go` deadlines swept by `Session::process`.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::frame::{
    self, FCS_SIZE, MsgType, PD_HEADER_SIZE, PD_MAX_DATA, PD_MAX_PACKET, PROTOCOL_VERSION,
    PdHeader, pd_packet_size,
};
use crate::queue::Handle;
use crate::seqcnt::SeqOutcome;
use crate::session::{GRAIN, Session};
use crate::sock::SockKind;
use crate::types::{Addressing, Flags, PdInfo, SendParam, ToBehavior, TopoCount};

/// Handle of a publication, returned by `publish`.
pub type PubHandle = Handle;

/// Handle of a subscription, returned by `subscribe`.
pub type SubHandle = Handle;

/// Subscription supervision interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Use the session's default PD timeout.
    #[default]
    Default,
    /// No supervision; the subscription never times out.
    Never,
    /// Explicit timeout, clamped up to the scheduler grain.
    After(Duration),
}

// Private element flags.
pub(crate) const MC_JOINED: u8 = 0x01;
pub(crate) const TIMED_OUT: u8 = 0x02;
pub(crate) const INVALID_DATA: u8 = 0x04;
pub(crate) const REQ_2B_SENT: u8 = 0x08;
pub(crate) const PULL_SUB: u8 = 0x10;
pub(crate) const REDUNDANT: u8 = 0x20;

/// One element of the PD send or receive queue.
pub(crate) struct PdElement {
    pub(crate) addr: Addressing,
    /// Second accepted source for redundant source filtering.
    pub(crate) src_ip2: Ipv4Addr,
    /// Source of the most recently accepted telegram.
    pub(crate) last_src_ip: Ipv4Addr,
    /// Where a one-shot pull reply goes.
    pub(crate) pull_dst: Option<SocketAddrV4>,
    /// Redundancy group, zero for none.
    pub(crate) red_id: u32,
    /// Last sent or received push counter.
    pub(crate) seq: u32,
    /// Last sent pull counter, independent of `seq`.
    pub(crate) seq_pull: u32,
    pub(crate) num_rx_tx: u32,
    pub(crate) upd_pkts: u32,
    pub(crate) get_pkts: u32,
    pub(crate) num_missed: u32,
    /// Result code of the last delivery (0 or a negative error code).
    pub(crate) last_err: i32,
    pub(crate) priv_flags: u8,
    pub(crate) flags: Flags,
    /// Send cycle or supervision interval; `None` for pull elements and
    /// unsupervised subscriptions.
    pub(crate) interval: Option<Duration>,
    /// Next send or supervision deadline.
    pub(crate) time_to_go: Option<Instant>,
    pub(crate) to_behavior: ToBehavior,
    /// Net payload size currently held in `frame`.
    pub(crate) data_size: usize,
    /// Assembled wire frame (header, payload, FCS), reused in place.
    pub(crate) frame: BytesMut,
    pub(crate) socket_idx: usize,
    pub(crate) msg_type: MsgType,
    pub(crate) user_ref: usize,
}

impl PdElement {
    /// Initialise the static header fields of the element's frame.
    fn init_frame(
        &mut self,
        topo: TopoCount,
        reply_com_id: u32,
        reply_ip: Ipv4Addr,
    ) {
        let gross = pd_packet_size(self.data_size);
        self.frame.resize(gross, 0);
        let header = PdHeader::mut_from_frame(&mut self.frame).unwrap();
        header.protocol_version.set(PROTOCOL_VERSION);
        header.msg_type.set(self.msg_type as u16);
        header.com_id.set(self.addr.com_id);
        header.etb_topo_cnt.set(topo.etb);
        header.op_trn_topo_cnt.set(topo.op_trn);
        header.dataset_length.set(self.data_size as u32);
        header.reserved.set(0);
        header.reply_com_id.set(reply_com_id);
        header.reply_ip_address.set(u32::from(reply_ip));
        frame::seal_pd(&mut self.frame);
    }

    /// Payload bytes of the held frame.
    pub(crate) fn payload(&self) -> &[u8] {
        &self.frame[PD_HEADER_SIZE..PD_HEADER_SIZE + self.data_size]
    }

    fn header(&self) -> &PdHeader {
        PdHeader::from_frame(&self.frame).unwrap()
    }

    /// Build the callback metadata for the current frame content.
    pub(crate) fn info(&self, result_code: i32) -> PdInfo {
        let header = self.header();
        PdInfo {
            src_ip: self.last_src_ip,
            dst_ip: self.addr.dst_ip,
            seq_count: header.sequence_counter.get(),
            proto_version: header.protocol_version.get(),
            msg_type: MsgType::from_u16(header.msg_type.get()).unwrap_or(self.msg_type),
            com_id: self.addr.com_id,
            etb_topo: header.etb_topo_cnt.get(),
            op_trn_topo: header.op_trn_topo_cnt.get(),
            reply_com_id: header.reply_com_id.get(),
            reply_ip: Ipv4Addr::from(header.reply_ip_address.get()),
            user_ref: self.user_ref,
            result_code,
        }
    }
}

impl Session {
    /// Prepare cyclic sending of a process data telegram.
    ///
    /// `interval == None` creates a pull publisher: the telegram is only
    /// emitted in response to a pull request. An empty `data` slice leaves
    /// the element invalid until the first [`Session::put`].
    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        &mut self,
        com_id: u32,
        topo: TopoCount,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        interval: Option<Duration>,
        red_id: u32,
        flags: Flags,
        send_param: Option<SendParam>,
        data: &[u8],
    ) -> Result<PubHandle> {
        if com_id == 0 {
            return Err(Error::Param("comId must not be zero"));
        }
        if dst_ip == Ipv4Addr::UNSPECIFIED {
            return Err(Error::Param("destination address missing"));
        }
        if data.len() > PD_MAX_DATA {
            return Err(Error::Param("payload exceeds PD maximum"));
        }
        if interval.is_some_and(|i| i < GRAIN) {
            return Err(Error::Param("interval below timer granularity"));
        }

        let src_used = if src_ip == Ipv4Addr::UNSPECIFIED {
            self.own_ip
        } else {
            src_ip
        };
        let addr = Addressing::new(com_id, src_ip, dst_ip, topo.etb, topo.op_trn);

        if self
            .snd_queue
            .find(|e| {
                e.addr.com_id == com_id && e.addr.src_ip == src_ip && e.addr.dst_ip == dst_ip
            })
            .is_some()
        {
            return Err(Error::NoPub);
        }

        let param = send_param.unwrap_or(self.pd_cfg.send_param);
        let socket_idx = self.pool.request_udp(
            src_used,
            self.pd_cfg.port,
            SockKind::Pd,
            param.qos,
            param.ttl,
            false,
            !self.options.block,
        )?;
        if dst_ip.is_multicast() && !src_used.is_loopback() {
            self.pool.set_multicast_if(socket_idx, src_used)?;
        }

        let flags = if flags == Flags::NONE {
            self.pd_cfg.flags
        } else {
            flags
        };
        let mut element = PdElement {
            addr,
            src_ip2: Ipv4Addr::UNSPECIFIED,
            last_src_ip: src_used,
            pull_dst: None,
            red_id,
            // Continue a previous publisher's progression so subscribers
            // never see the counter jump backwards.
            seq: self.seq_table.publisher_seed(com_id, src_used, MsgType::Pd),
            seq_pull: self.seq_table.publisher_seed(com_id, src_used, MsgType::Pr),
            num_rx_tx: 0,
            upd_pkts: 0,
            get_pkts: 0,
            num_missed: 0,
            last_err: 0,
            priv_flags: if data.is_empty() { INVALID_DATA } else { 0 },
            flags,
            interval,
            time_to_go: interval.map(|i| Instant::now() + i),
            to_behavior: self.pd_cfg.to_behavior,
            data_size: if data.is_empty() { 0 } else { data.len() },
            frame: BytesMut::with_capacity(PD_MAX_PACKET),
            socket_idx,
            msg_type: MsgType::Pd,
            user_ref: 0,
        };

        // Joining an already-follower group marks the fresh element too.
        if red_id != 0 && matches!(self.is_redundant_leader(red_id), Ok(false)) {
            element.priv_flags |= REDUNDANT;
        }
        if red_id != 0 {
            self.stats.num_red += 1;
        }

        element.init_frame(topo, 0, Ipv4Addr::UNSPECIFIED);
        let handle = self.snd_queue.insert(element);
        self.stats.pd.num_pub += 1;
        debug!(com_id, %dst_ip, ?interval, "published");

        if !data.is_empty() {
            self.put(handle, data)?;
        }
        if self.options.traffic_shaping {
            self.pd_distribute();
        }
        Ok(handle)
    }

    /// Stop sending a published telegram and release its resources.
    pub fn unpublish(&mut self, handle: PubHandle) -> Result<()> {
        let element = self.snd_queue.remove(handle).ok_or(Error::NoPub)?;
        self.pool.release(element.socket_idx);
        self.stats.pd.num_pub = self.stats.pd.num_pub.saturating_sub(1);
        debug!(com_id = element.addr.com_id, "unpublished");
        Ok(())
    }

    /// Update the payload of a published telegram.
    ///
    /// The size must match the published size; elements published without
    /// data accept any size up to the PD maximum on their first update.
    pub fn put(&mut self, handle: PubHandle, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > PD_MAX_DATA {
            return Err(Error::Param("payload size out of range"));
        }
        let registry = &self.registry;
        let element = self.snd_queue.get_mut(handle).ok_or(Error::NoPub)?;

        let marshalled;
        let payload: &[u8] = if element.flags.contains(Flags::MARSHALL) && !registry.is_empty() {
            let mut wire = vec![0u8; PD_MAX_DATA];
            let n = registry.marshall(element.addr.com_id, data, &mut wire)?;
            wire.truncate(n);
            marshalled = wire;
            &marshalled
        } else {
            data
        };

        if element.priv_flags & INVALID_DATA == 0 && payload.len() != element.data_size {
            return Err(Error::Param("payload size differs from published size"));
        }

        element.data_size = payload.len();
        element.frame.resize(pd_packet_size(payload.len()), 0);
        element.frame[PD_HEADER_SIZE..PD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        let header = PdHeader::mut_from_frame(&mut element.frame).unwrap();
        header.dataset_length.set(payload.len() as u32);
        frame::seal_pd(&mut element.frame);
        element.priv_flags &= !INVALID_DATA;
        element.upd_pkts += 1;
        Ok(())
    }

    /// Prepare receiving a process data telegram.
    ///
    /// `src_ip1`/`src_ip2` filter accepted sources (`UNSPECIFIED` accepts
    /// any); a multicast destination joins the group. `max_size == 0` is
    /// the legacy unsubscribe: the matching subscription is removed and
    /// `NoSub` returned.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &mut self,
        user_ref: usize,
        com_id: u32,
        topo: TopoCount,
        src_ip1: Ipv4Addr,
        src_ip2: Ipv4Addr,
        dst_ip: Ipv4Addr,
        flags: Flags,
        timeout: Timeout,
        to_behavior: Option<ToBehavior>,
        max_size: usize,
    ) -> Result<SubHandle> {
        if com_id == 0 {
            return Err(Error::Param("comId must not be zero"));
        }
        if max_size > PD_MAX_DATA {
            return Err(Error::Param("max size exceeds PD maximum"));
        }

        let existing = self
            .rcv_queue
            .find(|e| {
                e.addr.com_id == com_id && e.addr.src_ip == src_ip1 && e.addr.dst_ip == dst_ip
            })
            .map(|(h, _)| h);

        if max_size == 0 {
            // Legacy: zero max size unsubscribes the matching element.
            let handle = existing.ok_or(Error::NoSub)?;
            self.unsubscribe(handle)?;
            return Err(Error::NoSub);
        }
        if existing.is_some() {
            return Err(Error::NoSub);
        }

        let interval = match timeout {
            Timeout::Default => Some(self.pd_cfg.timeout),
            Timeout::Never => None,
            Timeout::After(d) => Some(d.max(GRAIN)),
        };

        let socket_idx = self.pool.request_udp(
            if dst_ip.is_multicast() {
                Ipv4Addr::UNSPECIFIED
            } else {
                self.own_ip
            },
            self.pd_cfg.port,
            SockKind::Pd,
            self.pd_cfg.send_param.qos,
            self.pd_cfg.send_param.ttl,
            true,
            !self.options.block,
        )?;

        let flags = if flags == Flags::NONE {
            self.pd_cfg.flags
        } else {
            flags
        };
        let mut element = PdElement {
            addr: Addressing::new(com_id, src_ip1, dst_ip, topo.etb, topo.op_trn),
            src_ip2,
            last_src_ip: Ipv4Addr::UNSPECIFIED,
            pull_dst: None,
            red_id: 0,
            seq: 0,
            seq_pull: 0,
            num_rx_tx: 0,
            upd_pkts: 0,
            get_pkts: 0,
            num_missed: 0,
            last_err: 0,
            priv_flags: INVALID_DATA,
            flags,
            interval,
            time_to_go: interval.map(|i| Instant::now() + i),
            to_behavior: to_behavior.unwrap_or(self.pd_cfg.to_behavior),
            data_size: 0,
            frame: BytesMut::zeroed(PD_HEADER_SIZE),
            socket_idx,
            msg_type: MsgType::Pd,
            user_ref,
        };

        if element.addr.mc_group != Ipv4Addr::UNSPECIFIED {
            self.pool
                .join_mc(socket_idx, element.addr.mc_group, self.own_ip)?;
            element.priv_flags |= MC_JOINED;
            self.stats.num_join += 1;
        }

        let handle = self.rcv_queue.insert(element);
        self.stats.pd.num_subs += 1;
        debug!(com_id, %dst_ip, "subscribed");
        Ok(handle)
    }

    /// Stop receiving a subscribed telegram and release its resources.
    pub fn unsubscribe(&mut self, handle: SubHandle) -> Result<()> {
        let element = self.rcv_queue.remove(handle).ok_or(Error::NoSub)?;
        if element.priv_flags & MC_JOINED != 0 {
            self.pool
                .leave_mc(element.socket_idx, element.addr.mc_group)?;
            self.stats.num_join = self.stats.num_join.saturating_sub(1);
        }
        self.pool.release(element.socket_idx);
        self.stats.pd.num_subs = self.stats.pd.num_subs.saturating_sub(1);
        debug!(com_id = element.addr.com_id, "unsubscribed");
        Ok(())
    }

    /// Poll the last valid data of a subscription.
    ///
    /// In non-blocking mode the subscription's socket is drained first, so
    /// hosts can poll without driving callbacks. Returns the info block and
    /// the payload length written into `buf`.
    pub fn get(&mut self, handle: SubHandle, buf: &mut [u8]) -> Result<(PdInfo, usize)> {
        let socket_idx = self
            .rcv_queue
            .get(handle)
            .ok_or(Error::NoSub)?
            .socket_idx;

        if !self.options.block {
            loop {
                match self.pd_receive(socket_idx) {
                    Ok(()) => {}
                    Err(Error::NoData) => break,
                    Err(e) if e.is_transient() => break,
                    Err(e) => return Err(e),
                }
            }
        }

        let registry = &self.registry;
        let element = self.rcv_queue.get_mut(handle).ok_or(Error::NoSub)?;
        let now = Instant::now();

        if element.interval.is_some()
            && element.time_to_go.is_some_and(|t| t <= now)
        {
            if element.to_behavior == ToBehavior::SetToZero {
                buf.fill(0);
            }
            return Err(Error::Timeout);
        }
        if element.priv_flags & INVALID_DATA != 0 {
            return Err(Error::NoData);
        }

        element.get_pkts += 1;
        let info = element.info(0);
        let n = if element.flags.contains(Flags::MARSHALL) && !registry.is_empty() {
            registry.unmarshall(element.addr.com_id, element.payload(), buf)?
        } else {
            let payload = element.payload();
            if buf.len() < payload.len() {
                return Err(Error::Mem("buffer too small for payload"));
            }
            buf[..payload.len()].copy_from_slice(payload);
            payload.len()
        };
        Ok((info, n))
    }

    /// Request a one-shot emission from a pull publisher.
    ///
    /// Composes (or re-arms) a `Pr` element on the send queue and restarts
    /// the subscription's supervision.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        &mut self,
        sub_handle: SubHandle,
        com_id: u32,
        topo: TopoCount,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        flags: Flags,
        send_param: Option<SendParam>,
        data: &[u8],
        reply_com_id: u32,
        reply_ip: Ipv4Addr,
    ) -> Result<()> {
        if com_id == 0 || dst_ip == Ipv4Addr::UNSPECIFIED {
            return Err(Error::Param("comId and destination are required"));
        }
        if data.len() > PD_MAX_DATA {
            return Err(Error::Param("payload exceeds PD maximum"));
        }
        if self.rcv_queue.get(sub_handle).is_none() {
            return Err(Error::NoSub);
        }

        let existing = self
            .snd_queue
            .find(|e| e.msg_type == MsgType::Pr && e.addr.com_id == com_id)
            .map(|(h, _)| h);

        let handle = match existing {
            Some(h) => h,
            None => {
                let param = send_param.unwrap_or(self.pd_cfg.send_param);
                let socket_idx = self.pool.request_udp(
                    if src_ip == Ipv4Addr::UNSPECIFIED {
                        self.own_ip
                    } else {
                        src_ip
                    },
                    self.pd_cfg.port,
                    SockKind::Pd,
                    param.qos,
                    param.ttl,
                    false,
                    !self.options.block,
                )?;
                let mut element = PdElement {
                    addr: Addressing::new(com_id, src_ip, dst_ip, topo.etb, topo.op_trn),
                    src_ip2: Ipv4Addr::UNSPECIFIED,
                    last_src_ip: self.own_ip,
                    pull_dst: None,
                    red_id: 0,
                    seq: self.seq_table.publisher_seed(com_id, self.own_ip, MsgType::Pr),
                    seq_pull: 0,
                    num_rx_tx: 0,
                    upd_pkts: 0,
                    get_pkts: 0,
                    num_missed: 0,
                    last_err: 0,
                    priv_flags: PULL_SUB,
                    flags: if flags == Flags::NONE {
                        self.pd_cfg.flags
                    } else {
                        flags
                    },
                    interval: None,
                    time_to_go: None,
                    to_behavior: self.pd_cfg.to_behavior,
                    data_size: data.len(),
                    frame: BytesMut::with_capacity(PD_MAX_PACKET),
                    socket_idx,
                    msg_type: MsgType::Pr,
                    user_ref: 0,
                };
                element.init_frame(topo, reply_com_id, reply_ip);
                self.snd_queue.insert(element)
            }
        };

        if !data.is_empty() {
            self.put(handle, data)?;
        }

        // One shot: process sends it on the next tick.
        let element = self.snd_queue.get_mut(handle).unwrap();
        element.priv_flags |= REQ_2B_SENT;
        element.time_to_go = Some(Instant::now());

        // Sending a request restarts the subscription's supervision.
        let sub = self.rcv_queue.get_mut(sub_handle).unwrap();
        if let Some(interval) = sub.interval {
            sub.time_to_go = Some(Instant::now() + interval);
        }
        Ok(())
    }

    /// Mark every publisher of a redundancy group leader or follower.
    ///
    /// `red_id == 0` switches all groups at once. Followers keep their
    /// timers and counters running but suppress emission.
    pub fn set_redundant(&mut self, red_id: u32, leader: bool) -> Result<()> {
        let mut found = false;
        for (_, element) in self.snd_queue.iter_mut() {
            if element.red_id != 0 && (element.red_id == red_id || red_id == 0) {
                if leader {
                    element.priv_flags &= !REDUNDANT;
                } else {
                    element.priv_flags |= REDUNDANT;
                }
                found = true;
            }
        }
        if !found {
            warn!(red_id, "redundancy group not found");
            return Err(Error::Param("redundancy group not found"));
        }
        debug!(red_id, leader, "redundancy switched");
        Ok(())
    }

    /// Leadership of the first publisher in a redundancy group.
    pub fn is_redundant_leader(&self, red_id: u32) -> Result<bool> {
        self.snd_queue
            .find(|e| e.red_id == red_id && red_id != 0)
            .map(|(_, e)| e.priv_flags & REDUNDANT == 0)
            .ok_or(Error::Param("redundancy group not found"))
    }

    /// Spread cyclic send deadlines so equal cycles do not burst on the
    /// same tick (traffic shaping option).
    pub(crate) fn pd_distribute(&mut self) {
        let now = Instant::now();
        let mut phase = Duration::ZERO;
        for (_, element) in self.snd_queue.iter_mut() {
            if let Some(interval) = element.interval {
                element.time_to_go = Some(now + phase.min(interval - GRAIN / 2) + GRAIN);
                phase += GRAIN;
            }
        }
        trace!("traffic shaping redistributed send offsets");
    }

    /// Emit every due element of the send queue, ordered by deadline.
    pub(crate) fn pd_send_queued(&mut self, now: Instant) -> Result<()> {
        let mut due: Vec<(Instant, Handle)> = self
            .snd_queue
            .iter()
            .filter_map(|(h, e)| match e.time_to_go {
                Some(t) if t <= now => Some((t, h)),
                _ => None,
            })
            .collect();
        due.sort_by_key(|&(t, _)| t);

        let mut result = Ok(());
        for (_, handle) in due {
            if let Err(e) = self.pd_send_element(handle, now) {
                if !e.is_transient() {
                    warn!(error = %e, "PD send failed");
                    result = Err(e);
                }
            }
        }
        result
    }

    fn pd_send_element(&mut self, handle: Handle, now: Instant) -> Result<()> {
        let pool = &self.pool;
        let stats = &mut self.stats;
        let seq_table = &mut self.seq_table;
        let topo = self.topo;
        let own_ip = self.own_ip;
        let pd_port = self.pd_cfg.port;
        let Some(element) = self.snd_queue.get_mut(handle) else {
            return Ok(());
        };

        let one_shot = element.priv_flags & REQ_2B_SENT != 0;
        let suppressed = element.priv_flags & REDUNDANT != 0;
        let invalid = element.priv_flags & INVALID_DATA != 0;

        // Roll the cycle timer forward without accumulation; a long stall
        // re-anchors at now.
        if let (Some(interval), Some(ttg)) = (element.interval, element.time_to_go) {
            let mut next = ttg + interval;
            if next <= now {
                next = now + interval;
            }
            element.time_to_go = Some(next);
        } else if one_shot {
            element.time_to_go = None;
        } else {
            // Pull publisher without a pending request: nothing to do.
            return Ok(());
        }

        if invalid {
            return Ok(());
        }

        // Pull replies run their own counter so they do not disturb the
        // monotonic push progression.
        let (seq, key_type) = if one_shot && element.msg_type == MsgType::Pd {
            element.seq_pull = element.seq_pull.wrapping_add(1);
            (element.seq_pull, MsgType::Pr)
        } else if element.msg_type == MsgType::Pr {
            element.seq = element.seq.wrapping_add(1);
            (element.seq, MsgType::Pr)
        } else {
            element.seq = element.seq.wrapping_add(1);
            (element.seq, MsgType::Pd)
        };
        seq_table.store(element.addr.com_id, own_ip, key_type, seq);

        if suppressed {
            // Follower: counters advanced, frame suppressed.
            element.priv_flags &= !REQ_2B_SENT;
            return Ok(());
        }

        {
            let header = PdHeader::mut_from_frame(&mut element.frame).unwrap();
            header.sequence_counter.set(seq);
            header.etb_topo_cnt.set(topo.etb);
            header.op_trn_topo_cnt.set(topo.op_trn);
        }
        frame::seal_pd(&mut element.frame);

        let dst = if one_shot && element.msg_type == MsgType::Pd {
            element
                .pull_dst
                .unwrap_or(SocketAddrV4::new(element.addr.dst_ip, pd_port))
        } else {
            SocketAddrV4::new(element.addr.dst_ip, pd_port)
        };
        element.priv_flags &= !REQ_2B_SENT;

        match pool.send_to(element.socket_idx, &element.frame, dst) {
            Ok(_) => {
                element.num_rx_tx += 1;
                stats.pd.num_send += 1;
                trace!(com_id = element.addr.com_id, seq, %dst, "PD sent");
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Sweep the receive queue for expired supervision deadlines.
    pub(crate) fn pd_handle_timeouts(&mut self, now: Instant) {
        let stats = &mut self.stats;
        let events = &mut self.pd_events;
        for (_, element) in self.rcv_queue.iter_mut() {
            if element.interval.is_none()
                || element.priv_flags & TIMED_OUT != 0
                || !element.time_to_go.is_some_and(|t| t <= now)
            {
                continue;
            }

            element.priv_flags |= TIMED_OUT;
            element.last_err = Error::Timeout.code();
            stats.pd.num_timeout += 1;
            debug!(com_id = element.addr.com_id, "subscription timed out");

            if element.to_behavior == ToBehavior::SetToZero {
                let data_size = element.data_size;
                if data_size > 0 {
                    element.frame[PD_HEADER_SIZE..PD_HEADER_SIZE + data_size].fill(0);
                }
            }

            if element.flags.contains(Flags::CALLBACK) {
                events.push((element.info(Error::Timeout.code()), Vec::new()));
            }
        }
    }

    /// Read and process one datagram from a PD socket.
    ///
    /// Returns `NoData` when the socket has nothing to read.
    pub(crate) fn pd_receive(&mut self, socket_idx: usize) -> Result<()> {
        let mut buf = [0u8; PD_MAX_PACKET + FCS_SIZE];
        let (n, from) = match self.pool.recv_from(socket_idx, &mut buf) {
            Ok(x) => x,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                return Err(Error::NoData);
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let frame_buf = &buf[..n];

        let header = match frame::check_pd(frame_buf) {
            Ok(h) => h,
            Err(Error::Crc { .. }) => {
                self.stats.pd.num_crc_err += 1;
                return Ok(());
            }
            Err(_) => {
                self.stats.pd.num_prot_err += 1;
                return Ok(());
            }
        };

        let msg_type = MsgType::from_u16(header.msg_type.get()).unwrap();
        let com_id = header.com_id.get();
        let etb = header.etb_topo_cnt.get();
        let op_trn = header.op_trn_topo_cnt.get();

        if !self.topo.matches(etb, op_trn) {
            self.stats.pd.num_topo_err += 1;
            trace!(com_id, etb, op_trn, "PD topo mismatch, dropped");
            return Ok(());
        }

        if msg_type == MsgType::Pr {
            return self.pd_handle_pull_request(header, *from.ip());
        }

        let seq = header.sequence_counter.get();
        let data_len = header.dataset_length.get() as usize;
        let src = *from.ip();

        // Locate the matching subscription: comId plus source filter.
        let found = self
            .rcv_queue
            .iter()
            .find(|(_, e)| {
                e.addr.com_id == com_id
                    && (e.addr.src_ip == Ipv4Addr::UNSPECIFIED
                        || e.addr.src_ip == src
                        || e.src_ip2 == src)
            })
            .map(|(h, _)| h);
        let Some(handle) = found else {
            self.stats.pd.num_no_subs += 1;
            return Ok(());
        };

        match self
            .seq_table
            .check_and_update(com_id, src, msg_type, seq)
        {
            SeqOutcome::Duplicate => {
                self.stats.pd.num_dup += 1;
                return Ok(());
            }
            SeqOutcome::Fresh { missed } => {
                self.stats.pd.num_missed += missed;
                if let Some(element) = self.rcv_queue.get_mut(handle) {
                    element.num_missed += missed;
                }
            }
        }

        let events = &mut self.pd_events;
        let stats = &mut self.stats;
        let registry = &self.registry;
        let element = self.rcv_queue.get_mut(handle).unwrap();

        let was_invalid = element.priv_flags & (INVALID_DATA | TIMED_OUT) != 0;
        // The comparison covers the whole frame: the fresh sequence counter
        // makes every accepted telegram count as changed, so callbacks fire
        // per reception; only a byte-identical retransmission stays silent.
        let changed = was_invalid || &element.frame[..] != frame_buf;

        element.frame.clear();
        element.frame.extend_from_slice(frame_buf);
        element.data_size = data_len;
        element.last_src_ip = src;
        element.priv_flags &= !(INVALID_DATA | TIMED_OUT);
        element.last_err = 0;
        element.num_rx_tx += 1;
        if let Some(interval) = element.interval {
            element.time_to_go = Some(Instant::now() + interval);
        }
        stats.pd.num_rcv += 1;

        if element.flags.contains(Flags::CALLBACK) && changed {
            // Callbacks always get a stable snapshot of the payload,
            // unmarshalled when the element asks for it.
            let payload = if element.flags.contains(Flags::MARSHALL) && !registry.is_empty() {
                let mut host = vec![0u8; PD_MAX_DATA];
                match registry.unmarshall(element.addr.com_id, element.payload(), &mut host) {
                    Ok(n) => {
                        host.truncate(n);
                        host
                    }
                    Err(e) => {
                        warn!(com_id = element.addr.com_id, error = %e, "unmarshalling failed");
                        element.payload().to_vec()
                    }
                }
            } else {
                element.payload().to_vec()
            };
            events.push((element.info(0), payload));
        }
        Ok(())
    }

    /// Arm the matching pull publisher for a one-shot reply.
    fn pd_handle_pull_request(&mut self, header: &PdHeader, src: Ipv4Addr) -> Result<()> {
        let com_id = header.com_id.get();
        let reply_ip = Ipv4Addr::from(header.reply_ip_address.get());
        let pd_port = self.pd_cfg.port;

        let found = self
            .snd_queue
            .iter()
            .find(|(_, e)| e.addr.com_id == com_id && e.msg_type == MsgType::Pd)
            .map(|(h, _)| h);
        let Some(handle) = found else {
            self.stats.pd.num_no_pub += 1;
            trace!(com_id, "pull request without publisher");
            return Ok(());
        };

        let element = self.snd_queue.get_mut(handle).unwrap();
        let dst = if reply_ip == Ipv4Addr::UNSPECIFIED {
            src
        } else {
            reply_ip
        };
        element.pull_dst = Some(SocketAddrV4::new(dst, pd_port));
        element.priv_flags |= REQ_2B_SENT;
        element.time_to_go = Some(Instant::now());
        trace!(com_id, %dst, "pull request armed");
        Ok(())
    }

    /// Earliest PD deadline (send or supervision), if any.
    pub(crate) fn pd_next_deadline(&self) -> Option<Instant> {
        let snd = self
            .snd_queue
            .iter()
            .filter_map(|(_, e)| e.time_to_go.filter(|_| e.interval.is_some() || e.priv_flags & REQ_2B_SENT != 0));
        let rcv = self
            .rcv_queue
            .iter()
            .filter_map(|(_, e)| e.time_to_go.filter(|_| e.interval.is_some()));
        snd.chain(rcv).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionConfig, Session};

    // Every test binds its own port so parallel test threads do not
    // contend for the same address.
    fn test_session(port: u16) -> Session {
        let mut config = SessionConfig {
            own_ip: Ipv4Addr::LOCALHOST,
            ..Default::default()
        };
        config.pd.port = port;
        Session::open(config).unwrap()
    }

    const DST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    #[test]
    fn test_publish_rejects_bad_params() {
        let mut s = test_session(23101);
        assert!(matches!(
            s.publish(
                0,
                TopoCount::default(),
                Ipv4Addr::UNSPECIFIED,
                DST,
                None,
                0,
                Flags::NONE,
                None,
                b"x"
            ),
            Err(Error::Param(_))
        ));
        assert!(matches!(
            s.publish(
                1,
                TopoCount::default(),
                Ipv4Addr::UNSPECIFIED,
                DST,
                Some(Duration::from_millis(1)),
                0,
                Flags::NONE,
                None,
                b"x"
            ),
            Err(Error::Param(_))
        ));
    }

    #[test]
    fn test_publish_twice_fails() {
        let mut s = test_session(23102);
        s.publish(
            12345,
            TopoCount::default(),
            Ipv4Addr::UNSPECIFIED,
            DST,
            Some(Duration::from_millis(100)),
            0,
            Flags::NONE,
            None,
            b"hello",
        )
        .unwrap();
        assert!(matches!(
            s.publish(
                12345,
                TopoCount::default(),
                Ipv4Addr::UNSPECIFIED,
                DST,
                Some(Duration::from_millis(100)),
                0,
                Flags::NONE,
                None,
                b"hello",
            ),
            Err(Error::NoPub)
        ));
    }

    #[test]
    fn test_unpublish_is_idempotent_per_handle() {
        let mut s = test_session(23103);
        let handle = s
            .publish(
                7,
                TopoCount::default(),
                Ipv4Addr::UNSPECIFIED,
                DST,
                Some(Duration::from_millis(100)),
                0,
                Flags::NONE,
                None,
                b"abc",
            )
            .unwrap();
        s.unpublish(handle).unwrap();
        assert!(matches!(s.unpublish(handle), Err(Error::NoPub)));
    }

    #[test]
    fn test_put_size_must_match() {
        let mut s = test_session(23104);
        let handle = s
            .publish(
                7,
                TopoCount::default(),
                Ipv4Addr::UNSPECIFIED,
                DST,
                Some(Duration::from_millis(100)),
                0,
                Flags::NONE,
                None,
                b"abcd",
            )
            .unwrap();
        assert!(matches!(s.put(handle, b"toolong"), Err(Error::Param(_))));
        s.put(handle, b"efgh").unwrap();
    }

    #[test]
    fn test_empty_publish_is_invalid_until_put() {
        let mut s = test_session(23105);
        let handle = s
            .publish(
                7,
                TopoCount::default(),
                Ipv4Addr::UNSPECIFIED,
                DST,
                Some(Duration::from_millis(100)),
                0,
                Flags::NONE,
                None,
                &[],
            )
            .unwrap();
        {
            let e = s.snd_queue.get(handle).unwrap();
            assert!(e.priv_flags & INVALID_DATA != 0);
        }
        s.put(handle, &[1, 2, 3]).unwrap();
        let e = s.snd_queue.get(handle).unwrap();
        assert!(e.priv_flags & INVALID_DATA == 0);
        assert_eq!(e.data_size, 3);
    }

    #[test]
    fn test_pull_publisher_never_scheduled() {
        let mut s = test_session(23106);
        let handle = s
            .publish(
                30,
                TopoCount::default(),
                Ipv4Addr::UNSPECIFIED,
                DST,
                None,
                0,
                Flags::NONE,
                None,
                b"data",
            )
            .unwrap();
        assert!(s.snd_queue.get(handle).unwrap().time_to_go.is_none());
        assert!(s.pd_next_deadline().is_none());
    }

    #[test]
    fn test_set_redundant_flags_group() {
        let mut s = test_session(23107);
        s.publish(
            1,
            TopoCount::default(),
            Ipv4Addr::UNSPECIFIED,
            DST,
            Some(Duration::from_millis(100)),
            42,
            Flags::NONE,
            None,
            b"a",
        )
        .unwrap();
        assert_eq!(s.is_redundant_leader(42).unwrap(), true);
        s.set_redundant(42, false).unwrap();
        assert_eq!(s.is_redundant_leader(42).unwrap(), false);
        s.set_redundant(42, true).unwrap();
        assert_eq!(s.is_redundant_leader(42).unwrap(), true);
        assert!(matches!(s.set_redundant(99, false), Err(Error::Param(_))));
    }

    #[test]
    fn test_subscribe_legacy_zero_size_unsubscribes() {
        let mut s = test_session(23108);
        s.subscribe(
            0,
            20,
            TopoCount::default(),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            DST,
            Flags::NONE,
            Timeout::Default,
            None,
            256,
        )
        .unwrap();
        assert_eq!(s.rcv_queue.len(), 1);
        let err = s
            .subscribe(
                0,
                20,
                TopoCount::default(),
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                DST,
                Flags::NONE,
                Timeout::Default,
                None,
                0,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NoSub));
        assert_eq!(s.rcv_queue.len(), 0);
    }

    #[test]
    fn test_multicast_membership_follows_last_subscriber() {
        let mut s = test_session(23109);
        let group = Ipv4Addr::new(239, 1, 2, 3);
        let sub1 = s
            .subscribe(
                0,
                20,
                TopoCount::default(),
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                group,
                Flags::NONE,
                Timeout::Never,
                None,
                64,
            )
            .unwrap();
        let sub2 = s
            .subscribe(
                0,
                21,
                TopoCount::default(),
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                group,
                Flags::NONE,
                Timeout::Never,
                None,
                64,
            )
            .unwrap();
        let idx = s.rcv_queue.get(sub1).unwrap().socket_idx;
        assert_eq!(idx, s.rcv_queue.get(sub2).unwrap().socket_idx);
        assert!(s.pool.get(idx).unwrap().has_joined(group));

        // First unsubscribe keeps the membership alive.
        s.unsubscribe(sub1).unwrap();
        assert!(s.pool.get(idx).unwrap().has_joined(group));
        // The last holder releases the group.
        s.unsubscribe(sub2).unwrap();
        assert!(
            s.pool.get(idx).is_none() || !s.pool.get(idx).unwrap().has_joined(group)
        );
    }

    #[test]
    fn test_traffic_shaping_spreads_deadlines() {
        let mut s = test_session(23110);
        s.options.traffic_shaping = true;
        for com_id in 1..=4 {
            s.publish(
                com_id,
                TopoCount::default(),
                Ipv4Addr::UNSPECIFIED,
                DST,
                Some(Duration::from_millis(100)),
                0,
                Flags::NONE,
                None,
                b"x",
            )
            .unwrap();
        }
        let deadlines: Vec<Instant> = s
            .snd_queue
            .iter()
            .filter_map(|(_, e)| e.time_to_go)
            .collect();
        for pair in deadlines.windows(2) {
            let gap = if pair[1] > pair[0] {
                pair[1] - pair[0]
            } else {
                pair[0] - pair[1]
            };
            assert!(gap >= GRAIN / 2, "deadlines must not align: {gap:?}");
        }
    }
}
