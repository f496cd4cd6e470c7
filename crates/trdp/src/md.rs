//! Message data engine: notify/request/reply/confirm session lifecycle.
//!
//! Every exchange is correlated by a 16 byte session identifier. Caller
//! sessions live on the MD send queue (armed for emission, then waiting for
//! replies or confirms); replier sessions live on the MD receive queue
//! (waiting for the application to reply or confirm). Listeners are passive
//! records that fork a replier session when a matching notify or request
//! arrives.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::frame::{
    self, MD_HEADER_SIZE, MD_MAX_DATA, MD_MAX_PACKET, MdHeader, MsgType, PROTOCOL_VERSION,
    md_packet_size, uri_field,
};
use crate::queue::Handle;
use crate::session::Session;
use crate::sock::{SockKind, SocketPool};
use crate::types::{
    Addressing, Flags, MdInfo, ReplyStatus, SendParam, TopoCount, uri_to_string,
};

/// Handle of an armed listener, returned by `add_listener`.
pub type ListenerHandle = Handle;

/// MD session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MdState {
    /// Ready to emit a notify.
    TxNotifyArm,
    /// Ready to emit a request.
    TxRequestArm,
    /// Ready to emit a reply.
    TxReplyArm,
    /// Ready to emit a reply expecting confirmation.
    TxReplyQueryArm,
    /// Ready to emit a confirm.
    TxConfirmArm,
    /// Ready to emit an error reply.
    TxErrorArm,
    /// Request emitted, waiting for replies.
    TxRequestW4Reply,
    /// Reply-query emitted, waiting for the peer's confirm.
    RxReplyQueryW4C,
    /// Request received, waiting for the application to reply.
    RxReqW4ApReply,
    /// Reply-query received, waiting for the application to confirm.
    TxReqW4ApConfirm,
}

/// One MD session element (caller or replier side).
pub(crate) struct MdSession {
    pub(crate) addr: Addressing,
    pub(crate) state: MdState,
    pub(crate) msg_type: MsgType,
    pub(crate) session_id: [u8; 16],
    pub(crate) seq: u32,
    pub(crate) flags: Flags,
    /// Reply or confirm supervision interval; also the retry period.
    pub(crate) interval: Duration,
    pub(crate) deadline: Option<Instant>,
    /// Expected repliers; zero means unknown (ends only by timeout).
    pub(crate) num_exp_replies: u32,
    pub(crate) num_replies: u32,
    pub(crate) num_replies_query: u32,
    pub(crate) num_confirm_sent: u32,
    pub(crate) num_confirm_timeout: u32,
    pub(crate) retries_max: u32,
    pub(crate) retries: u32,
    pub(crate) user_ref: usize,
    pub(crate) src_uri: String,
    pub(crate) dest_uri: String,
    /// Port replies are sent to (the requester's source port).
    pub(crate) dst_port: u16,
    pub(crate) socket_idx: usize,
    /// Assembled wire frame, regenerated per (re)transmission.
    pub(crate) frame: Vec<u8>,
    pub(crate) reply_timeout_us: u32,
}

impl MdSession {
    fn is_tcp(&self) -> bool {
        self.flags.contains(Flags::TCP)
    }

    /// Callback metadata from the session's own bookkeeping (timeout and
    /// abort paths, where no received frame exists).
    pub(crate) fn info(&self, result_code: i32, reply_status: ReplyStatus) -> MdInfo {
        MdInfo {
            src_ip: self.addr.src_ip,
            dst_ip: self.addr.dst_ip,
            seq_count: self.seq,
            proto_version: PROTOCOL_VERSION,
            msg_type: self.msg_type,
            com_id: self.addr.com_id,
            etb_topo: self.addr.etb_topo,
            op_trn_topo: self.addr.op_trn_topo,
            reply_status,
            session_id: self.session_id,
            reply_timeout_us: self.reply_timeout_us,
            dest_uri: self.dest_uri.clone(),
            src_uri: self.src_uri.clone(),
            num_replies: self.num_replies,
            user_ref: self.user_ref,
            result_code,
        }
    }
}

/// A passive listener for incoming notifies and requests.
pub(crate) struct Listener {
    pub(crate) com_id: u32,
    pub(crate) mc_group: Ipv4Addr,
    pub(crate) dest_uri: String,
    pub(crate) user_ref: usize,
    pub(crate) flags: Flags,
    /// UDP listeners own a pinned socket; TCP listeners share the session's
    /// listen socket.
    pub(crate) socket_idx: Option<usize>,
    pub(crate) num_sessions: u32,
}

struct MdSendSpec<'a> {
    msg_type: MsgType,
    user_ref: usize,
    com_id: u32,
    topo: TopoCount,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    flags: Flags,
    reply_status: ReplyStatus,
    num_repliers: u32,
    reply_timeout: Option<Duration>,
    confirm_timeout: Option<Duration>,
    send_param: Option<SendParam>,
    data: &'a [u8],
    source_uri: &'a str,
    dest_uri: &'a str,
    /// Session to continue (reply and confirm paths).
    session_ref: Option<[u8; 16]>,
}

impl Session {
    /// Send a notification (no reply expected).
    #[allow(clippy::too_many_arguments)]
    pub fn notify(
        &mut self,
        user_ref: usize,
        com_id: u32,
        topo: TopoCount,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        flags: Flags,
        send_param: Option<SendParam>,
        data: &[u8],
        source_uri: &str,
        dest_uri: &str,
    ) -> Result<()> {
        self.md_common_send(MdSendSpec {
            msg_type: MsgType::Mn,
            user_ref,
            com_id,
            topo,
            src_ip,
            dst_ip,
            flags,
            reply_status: ReplyStatus::Ok,
            num_repliers: 1,
            reply_timeout: None,
            confirm_timeout: None,
            send_param,
            data,
            source_uri,
            dest_uri,
            session_ref: None,
        })
        .map(|_| ())
    }

    /// Send a request and await replies; returns the session identifier.
    ///
    /// `num_repliers == 0` means the replier count is unknown: the session
    /// then ends only by reply timeout, delivering every reply until then.
    #[allow(clippy::too_many_arguments)]
    pub fn md_request(
        &mut self,
        user_ref: usize,
        com_id: u32,
        topo: TopoCount,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        flags: Flags,
        num_repliers: u32,
        reply_timeout: Option<Duration>,
        send_param: Option<SendParam>,
        data: &[u8],
        source_uri: &str,
        dest_uri: &str,
    ) -> Result<[u8; 16]> {
        self.md_common_send(MdSendSpec {
            msg_type: MsgType::Mr,
            user_ref,
            com_id,
            topo,
            src_ip,
            dst_ip,
            flags,
            reply_status: ReplyStatus::Ok,
            num_repliers,
            reply_timeout,
            confirm_timeout: None,
            send_param,
            data,
            source_uri,
            dest_uri,
            session_ref: None,
        })
    }

    /// Answer a received request without asking for a confirmation.
    pub fn reply(
        &mut self,
        session_id: [u8; 16],
        com_id: u32,
        flags: Flags,
        data: &[u8],
        source_uri: &str,
    ) -> Result<()> {
        self.md_common_send(MdSendSpec {
            msg_type: MsgType::Mp,
            user_ref: 0,
            com_id,
            topo: self.topo,
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            flags,
            reply_status: ReplyStatus::Ok,
            num_repliers: 1,
            reply_timeout: None,
            confirm_timeout: None,
            send_param: None,
            data,
            source_uri,
            dest_uri: "",
            session_ref: Some(session_id),
        })
        .map(|_| ())
    }

    /// Answer a received request and ask the requester to confirm.
    pub fn reply_query(
        &mut self,
        session_id: [u8; 16],
        com_id: u32,
        flags: Flags,
        confirm_timeout: Option<Duration>,
        data: &[u8],
        source_uri: &str,
    ) -> Result<()> {
        self.md_common_send(MdSendSpec {
            msg_type: MsgType::Mq,
            user_ref: 0,
            com_id,
            topo: self.topo,
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            flags,
            reply_status: ReplyStatus::Ok,
            num_repliers: 1,
            reply_timeout: None,
            confirm_timeout,
            send_param: None,
            data,
            source_uri,
            dest_uri: "",
            session_ref: Some(session_id),
        })
        .map(|_| ())
    }

    /// Answer a received request with an error status.
    pub fn reply_err(
        &mut self,
        session_id: [u8; 16],
        com_id: u32,
        reply_status: ReplyStatus,
        source_uri: &str,
    ) -> Result<()> {
        self.md_common_send(MdSendSpec {
            msg_type: MsgType::Me,
            user_ref: 0,
            com_id,
            topo: self.topo,
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            flags: Flags::NONE,
            reply_status,
            num_repliers: 1,
            reply_timeout: None,
            confirm_timeout: None,
            send_param: None,
            data: &[],
            source_uri,
            dest_uri: "",
            session_ref: Some(session_id),
        })
        .map(|_| ())
    }

    /// Confirm a received reply-query.
    pub fn confirm(
        &mut self,
        session_id: [u8; 16],
        com_id: u32,
        reply_status: ReplyStatus,
    ) -> Result<()> {
        self.md_common_send(MdSendSpec {
            msg_type: MsgType::Mc,
            user_ref: 0,
            com_id,
            topo: self.topo,
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            flags: Flags::NONE,
            reply_status,
            num_repliers: 1,
            reply_timeout: None,
            confirm_timeout: None,
            send_param: None,
            data: &[],
            source_uri: "",
            dest_uri: "",
            session_ref: Some(session_id),
        })
        .map(|_| ())
    }

    /// Arm a listener for incoming notifies and requests.
    ///
    /// `dst_ip` may name a multicast group to join; `dest_uri` filters on
    /// the destination URI user part when non-empty.
    pub fn add_listener(
        &mut self,
        user_ref: usize,
        com_id: u32,
        dst_ip: Ipv4Addr,
        flags: Flags,
        dest_uri: &str,
    ) -> Result<ListenerHandle> {
        if com_id == 0 {
            return Err(Error::Param("comId must not be zero"));
        }

        let flags = if flags == Flags::NONE {
            self.md_cfg.flags
        } else {
            flags
        };

        let socket_idx = if flags.contains(Flags::TCP) {
            self.pool
                .ensure_tcp_listener(self.own_ip, self.md_cfg.tcp_port)?;
            None
        } else {
            let idx = self.pool.request_udp(
                if dst_ip.is_multicast() {
                    Ipv4Addr::UNSPECIFIED
                } else {
                    self.own_ip
                },
                self.md_cfg.udp_port,
                SockKind::MdUdp,
                self.md_cfg.send_param.qos,
                self.md_cfg.send_param.ttl,
                true,
                !self.options.block,
            )?;
            if dst_ip.is_multicast() {
                self.pool.join_mc(idx, dst_ip, self.own_ip)?;
                self.stats.num_join += 1;
            }
            if let Some(slot) = self.pool.get_mut(idx) {
                slot.pinned = true;
            }
            Some(idx)
        };

        let listener = Listener {
            com_id,
            mc_group: if dst_ip.is_multicast() {
                dst_ip
            } else {
                Ipv4Addr::UNSPECIFIED
            },
            dest_uri: dest_uri.to_owned(),
            user_ref,
            flags,
            socket_idx,
            num_sessions: 0,
        };
        let handle = self.listeners.insert(listener);
        if flags.contains(Flags::TCP) {
            self.stats.tcp_md.num_list += 1;
        } else {
            self.stats.udp_md.num_list += 1;
        }
        debug!(com_id, %dst_ip, "listener armed");
        Ok(handle)
    }

    /// Remove a listener and release its socket.
    pub fn del_listener(&mut self, handle: ListenerHandle) -> Result<()> {
        let listener = self.listeners.remove(handle).ok_or(Error::NoListener)?;
        if let Some(idx) = listener.socket_idx {
            if listener.mc_group != Ipv4Addr::UNSPECIFIED {
                self.pool.leave_mc(idx, listener.mc_group)?;
                self.stats.num_join = self.stats.num_join.saturating_sub(1);
            }
            if let Some(slot) = self.pool.get_mut(idx) {
                slot.pinned = false;
            }
            self.pool.release(idx);
        }
        if listener.flags.contains(Flags::TCP) {
            self.stats.tcp_md.num_list = self.stats.tcp_md.num_list.saturating_sub(1);
        } else {
            self.stats.udp_md.num_list = self.stats.udp_md.num_list.saturating_sub(1);
        }
        debug!(com_id = listener.com_id, "listener removed");
        Ok(())
    }

    fn md_common_send(&mut self, spec: MdSendSpec<'_>) -> Result<[u8; 16]> {
        if spec.com_id == 0 {
            return Err(Error::Param("comId must not be zero"));
        }
        if spec.data.len() > MD_MAX_DATA {
            return Err(Error::Param("payload exceeds MD maximum"));
        }

        let flags = if spec.flags == Flags::NONE {
            self.md_cfg.flags
        } else {
            spec.flags
        };
        let param = spec.send_param.unwrap_or(self.md_cfg.send_param);
        let is_reply = matches!(spec.msg_type, MsgType::Mp | MsgType::Mq | MsgType::Me);
        let is_confirm = spec.msg_type == MsgType::Mc;

        // Replies and confirms continue a pending receiver session.
        let mut pending: Option<MdSession> = None;
        if is_reply || is_confirm {
            let wanted_state = if is_reply {
                MdState::RxReqW4ApReply
            } else {
                MdState::TxReqW4ApConfirm
            };
            let uuid = spec.session_ref.ok_or(Error::Param("session id required"))?;
            let found = self
                .md_rcv
                .iter()
                .find(|(_, s)| s.session_id == uuid && s.state == wanted_state)
                .map(|(h, _)| h);
            let handle = found.ok_or(Error::NoSession)?;
            pending = self.md_rcv.remove(handle);
        }

        let (dst_ip, dst_port, session_id, seq, uris) = match &pending {
            Some(p) => (
                p.addr.src_ip,
                p.dst_port,
                p.session_id,
                p.seq,
                (p.dest_uri.clone(), p.src_uri.clone()),
            ),
            None => {
                if spec.dst_ip == Ipv4Addr::UNSPECIFIED {
                    return Err(Error::Param("destination address missing"));
                }
                (
                    spec.dst_ip,
                    if flags.contains(Flags::TCP) {
                        self.md_cfg.tcp_port
                    } else {
                        self.md_cfg.udp_port
                    },
                    rand::random::<[u8; 16]>(),
                    0,
                    (spec.source_uri.to_owned(), spec.dest_uri.to_owned()),
                )
            }
        };

        // Replies and confirms travel on the transport the exchange
        // started on.
        let flags = match &pending {
            Some(p) if p.is_tcp() => flags | Flags::TCP,
            _ => flags,
        };

        // Confirm bookkeeping on the originating request session; a fully
        // replied and fully confirmed request is complete.
        if is_confirm {
            let mut finished = None;
            for (handle, sender) in self.md_snd.iter_mut() {
                if sender.session_id == session_id && sender.state == MdState::TxRequestW4Reply {
                    sender.num_confirm_sent += 1;
                    if sender.num_exp_replies != 0
                        && sender.num_replies >= sender.num_exp_replies
                        && sender.num_confirm_sent >= sender.num_replies_query
                    {
                        finished = Some(handle);
                    }
                    break;
                }
            }
            if let Some(handle) = finished {
                if let Some(s) = self.md_snd.remove(handle) {
                    let tcp = s.is_tcp();
                    md_release_socket(&mut self.pool, s.socket_idx, tcp);
                }
            }
        }

        let interval = match spec.msg_type {
            MsgType::Mr => spec.reply_timeout.unwrap_or(self.md_cfg.reply_timeout),
            MsgType::Mq => spec.confirm_timeout.unwrap_or(self.md_cfg.confirm_timeout),
            _ => self.md_cfg.reply_timeout,
        };

        let (num_exp_replies, retries_max) = if flags.contains(Flags::TCP) {
            (1, 0)
        } else if dst_ip.is_multicast() {
            // Only multicast requests may expect several (or an unknown
            // number of) repliers, and they never retry.
            (spec.num_repliers, 0)
        } else {
            (1, param.retries)
        };

        let src_used = if spec.src_ip == Ipv4Addr::UNSPECIFIED {
            self.own_ip
        } else {
            spec.src_ip
        };

        let socket_idx = if flags.contains(Flags::TCP) {
            match &pending {
                Some(p) => {
                    // Reply over the connection the request came in on.
                    if let Some(slot) = self.pool.get_mut(p.socket_idx) {
                        slot.usage += 1;
                    }
                    p.socket_idx
                }
                None => self.pool.request_tcp(
                    src_used,
                    self.md_cfg.tcp_port,
                    param.qos,
                    param.ttl,
                    dst_ip,
                    self.md_cfg.connect_timeout,
                )?,
            }
        } else {
            self.pool.request_udp(
                src_used,
                self.md_cfg.udp_port,
                SockKind::MdUdp,
                param.qos,
                param.ttl,
                false,
                !self.options.block,
            )?
        };

        let state = match spec.msg_type {
            MsgType::Mn => MdState::TxNotifyArm,
            MsgType::Mr => MdState::TxRequestArm,
            MsgType::Mp => MdState::TxReplyArm,
            MsgType::Mq => MdState::TxReplyQueryArm,
            MsgType::Mc => MdState::TxConfirmArm,
            _ => MdState::TxErrorArm,
        };

        let mut session = MdSession {
            addr: Addressing::new(spec.com_id, src_used, dst_ip, spec.topo.etb, spec.topo.op_trn),
            state,
            msg_type: spec.msg_type,
            session_id,
            seq,
            flags,
            interval,
            deadline: None,
            num_exp_replies,
            num_replies: 0,
            num_replies_query: 0,
            num_confirm_sent: 0,
            num_confirm_timeout: 0,
            retries_max,
            retries: 0,
            user_ref: spec.user_ref,
            // A reply swaps the URI roles of the request it answers.
            src_uri: if pending.is_some() {
                uris.0
            } else {
                spec.source_uri.to_owned()
            },
            dest_uri: if pending.is_some() {
                uris.1
            } else {
                spec.dest_uri.to_owned()
            },
            dst_port,
            socket_idx,
            frame: Vec::new(),
            reply_timeout_us: interval.as_micros().min(u32::MAX as u128) as u32,
        };
        let wire = compose_md_frame(&session, spec.reply_status, spec.data);
        session.frame = wire;
        trace!(
            com_id = spec.com_id,
            msg = ?spec.msg_type,
            %dst_ip,
            "MD session armed"
        );

        self.md_snd.insert(session);
        Ok(session_id)
    }

    /// Emit every armed MD element; called from `process`.
    pub(crate) fn md_send_queued(&mut self, now: Instant) -> Result<()> {
        let armed: Vec<Handle> = self
            .md_snd
            .iter()
            .filter(|(_, s)| {
                matches!(
                    s.state,
                    MdState::TxNotifyArm
                        | MdState::TxRequestArm
                        | MdState::TxReplyArm
                        | MdState::TxReplyQueryArm
                        | MdState::TxConfirmArm
                        | MdState::TxErrorArm
                )
            })
            .map(|(h, _)| h)
            .collect();

        let mut done: Vec<Handle> = Vec::new();
        let mut result = Ok(());

        for handle in armed {
            let pool = &mut self.pool;
            let stats = &mut self.stats;
            let sending_timeout = self.md_cfg.sending_timeout;
            let Some(session) = self.md_snd.get_mut(handle) else {
                continue;
            };

            if session.is_tcp() {
                let connected = pool
                    .get(session.socket_idx)
                    .and_then(|s| s.tcp.as_ref())
                    .is_some_and(|t| t.connect_done);
                if !connected {
                    continue; // connect still pending, polled elsewhere
                }
            }

            // Refresh the mutable header fields before each emission.
            {
                let header = MdHeader::mut_from_frame(&mut session.frame).unwrap();
                header.sequence_counter.set(session.seq);
                header.etb_topo_cnt.set(self.topo.etb);
                header.op_trn_topo_cnt.set(self.topo.op_trn);
            }
            frame::seal_md(&mut session.frame);

            let sent = if session.is_tcp() {
                pool.tcp_send(session.socket_idx, &session.frame, sending_timeout)
                    .map(|_| ())
            } else {
                let dst = SocketAddrV4::new(session.addr.dst_ip, session.dst_port);
                pool.send_to(session.socket_idx, &session.frame, dst)
                    .map(|_| ())
                    .map_err(Error::Io)
            };

            match sent {
                Ok(()) => {
                    if session.is_tcp() {
                        stats.tcp_md.num_send += 1;
                    } else {
                        stats.udp_md.num_send += 1;
                    }
                    trace!(com_id = session.addr.com_id, msg = ?session.msg_type, "MD sent");
                    match session.state {
                        MdState::TxRequestArm => {
                            session.state = MdState::TxRequestW4Reply;
                            session.deadline = Some(now + session.interval);
                        }
                        MdState::TxReplyQueryArm => {
                            session.state = MdState::RxReplyQueryW4C;
                            session.deadline = Some(now + session.interval);
                        }
                        _ => done.push(handle),
                    }
                }
                Err(e) if e.is_transient() => {} // retried next tick
                Err(e) => {
                    warn!(error = %e, "MD send failed");
                    result = Err(e);
                    done.push(handle);
                }
            }
        }

        for handle in done {
            if let Some(session) = self.md_snd.remove(handle) {
                md_release_socket(&mut self.pool, session.socket_idx, session.is_tcp());
            }
        }
        result
    }

    /// Read and process one datagram from an MD UDP socket.
    pub(crate) fn md_receive_udp(&mut self, socket_idx: usize) -> Result<()> {
        let mut buf = vec![0u8; MD_MAX_PACKET];
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
        self.md_process_frame(&buf[..n], from, None)
    }

    /// Reassemble and process frames from a TCP connection.
    pub(crate) fn md_receive_tcp(&mut self, socket_idx: usize) -> Result<()> {
        loop {
            let frame = match self.pool.tcp_recv_frame(socket_idx) {
                Ok(Some(f)) => f,
                Ok(None) => return Ok(()),
                Err(Error::NoData) => {
                    // Peer closed; tear the connection down.
                    self.pool.close(socket_idx);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let peer = self
                .pool
                .get(socket_idx)
                .and_then(|s| s.tcp.as_ref())
                .map(|t| t.corner_ip)
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            let from = SocketAddrV4::new(peer, self.md_cfg.tcp_port);
            self.md_process_frame(&frame, from, Some(socket_idx))?;
        }
    }

    /// Validate one MD frame and advance the matching session or listener.
    fn md_process_frame(
        &mut self,
        frame_buf: &[u8],
        from: SocketAddrV4,
        tcp_socket: Option<usize>,
    ) -> Result<()> {
        let is_tcp = tcp_socket.is_some();
        let header = match frame::check_md(frame_buf) {
            Ok(h) => h,
            Err(Error::Crc { .. }) => {
                self.md_stats_mut(is_tcp).num_crc_err += 1;
                return Ok(());
            }
            Err(_) => {
                self.md_stats_mut(is_tcp).num_prot_err += 1;
                return Ok(());
            }
        };

        let etb = header.etb_topo_cnt.get();
        let op_trn = header.op_trn_topo_cnt.get();
        if !self.topo.matches(etb, op_trn) {
            self.md_stats_mut(is_tcp).num_topo_err += 1;
            trace!(com_id = header.com_id.get(), "MD topo mismatch, dropped");
            return Ok(());
        }

        let msg_type = MsgType::from_u16(header.msg_type.get()).unwrap();
        let com_id = header.com_id.get();
        let data_len = header.dataset_length.get() as usize;
        let payload = &frame_buf[MD_HEADER_SIZE..MD_HEADER_SIZE + data_len];
        let session_id = header.session_id;

        let info = MdInfo {
            src_ip: *from.ip(),
            dst_ip: self.own_ip,
            seq_count: header.sequence_counter.get(),
            proto_version: header.protocol_version.get(),
            msg_type,
            com_id,
            etb_topo: etb,
            op_trn_topo: op_trn,
            reply_status: ReplyStatus::from_i32(header.reply_status.get()),
            session_id,
            reply_timeout_us: header.reply_timeout.get(),
            dest_uri: uri_to_string(&header.destination_uri),
            src_uri: uri_to_string(&header.source_uri),
            num_replies: 0,
            user_ref: 0,
            result_code: 0,
        };

        match msg_type {
            MsgType::Mn | MsgType::Mr => {
                self.md_handle_indication(msg_type, info, header, payload, from, tcp_socket)
            }
            MsgType::Mp | MsgType::Mq | MsgType::Me => {
                self.md_handle_reply(msg_type, info, header, payload, from, tcp_socket)
            }
            MsgType::Mc => self.md_handle_confirm(info, payload, is_tcp),
            _ => unreachable!("check_md only passes MD types"),
        }
    }

    /// An incoming notify or request: match a listener, fork a replier
    /// session for requests.
    fn md_handle_indication(
        &mut self,
        msg_type: MsgType,
        mut info: MdInfo,
        header: &MdHeader,
        payload: &[u8],
        from: SocketAddrV4,
        tcp_socket: Option<usize>,
    ) -> Result<()> {
        let is_tcp = tcp_socket.is_some();
        let dest_uri = info.dest_uri.clone();
        let found = self
            .listeners
            .iter()
            .find(|(_, l)| {
                l.com_id == info.com_id
                    && l.flags.contains(Flags::TCP) == is_tcp
                    && (l.dest_uri.is_empty() || l.dest_uri == dest_uri)
            })
            .map(|(h, _)| h);
        let Some(listener_handle) = found else {
            self.md_stats_mut(is_tcp).num_no_listener += 1;
            debug!(com_id = info.com_id, ?msg_type, "no listener, dropped");
            return Ok(());
        };

        self.md_stats_mut(is_tcp).num_rcv += 1;
        let listener = self.listeners.get_mut(listener_handle).unwrap();
        listener.num_sessions += 1;
        info.user_ref = listener.user_ref;
        let listener_flags = listener.flags;
        let listener_socket = listener.socket_idx;

        if msg_type == MsgType::Mr {
            // Fork a replier session; the application answers via `reply`.
            let reply_timeout =
                Duration::from_micros(header.reply_timeout.get().max(1) as u64);
            let socket_idx = match (tcp_socket, listener_socket) {
                (Some(idx), _) => idx,
                (None, Some(idx)) => {
                    if let Some(slot) = self.pool.get_mut(idx) {
                        slot.usage += 1;
                    }
                    idx
                }
                (None, None) => return Ok(()), // TCP listener, UDP frame
            };
            let session = MdSession {
                addr: Addressing::new(
                    info.com_id,
                    *from.ip(),
                    self.own_ip,
                    info.etb_topo,
                    info.op_trn_topo,
                ),
                state: MdState::RxReqW4ApReply,
                msg_type,
                session_id: info.session_id,
                seq: info.seq_count,
                flags: listener_flags,
                interval: reply_timeout,
                deadline: Some(Instant::now() + reply_timeout),
                num_exp_replies: 0,
                num_replies: 0,
                num_replies_query: 0,
                num_confirm_sent: 0,
                num_confirm_timeout: 0,
                retries_max: 0,
                retries: 0,
                user_ref: listener.user_ref,
                // Stored crosswise so the reply answers back to the
                // requester's URI.
                src_uri: info.src_uri.clone(),
                dest_uri: info.dest_uri.clone(),
                dst_port: from.port(),
                socket_idx,
                frame: Vec::new(),
                reply_timeout_us: header.reply_timeout.get(),
            };
            self.md_rcv.insert(session);
        }

        self.md_events.push((info, payload.to_vec()));
        Ok(())
    }

    /// An incoming reply (plain, with confirm request, or error) for one of
    /// our pending requests.
    fn md_handle_reply(
        &mut self,
        msg_type: MsgType,
        mut info: MdInfo,
        header: &MdHeader,
        payload: &[u8],
        from: SocketAddrV4,
        tcp_socket: Option<usize>,
    ) -> Result<()> {
        let is_tcp = tcp_socket.is_some();
        let found = self
            .md_snd
            .iter()
            .find(|(_, s)| {
                s.session_id == info.session_id
                    && s.addr.com_id == info.com_id
                    && s.state == MdState::TxRequestW4Reply
            })
            .map(|(h, _)| h);
        let Some(handle) = found else {
            self.md_stats_mut(is_tcp).num_no_listener += 1;
            debug!(com_id = info.com_id, "reply without pending request");
            return Ok(());
        };

        self.md_stats_mut(is_tcp).num_rcv += 1;
        let (user_ref, num_replies, request_socket, complete) = {
            let session = self.md_snd.get_mut(handle).unwrap();
            session.num_replies += 1;
            if msg_type == MsgType::Mq {
                session.num_replies_query += 1;
            }
            (
                session.user_ref,
                session.num_replies,
                session.socket_idx,
                session.num_exp_replies != 0
                    && session.num_replies >= session.num_exp_replies
                    && session.num_replies_query == 0,
            )
        };
        info.user_ref = user_ref;
        info.num_replies = num_replies;

        if msg_type == MsgType::Mq {
            // The application must confirm; park a receiver-side record the
            // confirm call resolves against.
            let confirm_deadline = Instant::now() + self.md_cfg.confirm_timeout;
            let record = MdSession {
                addr: Addressing::new(
                    info.com_id,
                    *from.ip(),
                    self.own_ip,
                    info.etb_topo,
                    info.op_trn_topo,
                ),
                state: MdState::TxReqW4ApConfirm,
                msg_type,
                session_id: info.session_id,
                seq: header.sequence_counter.get(),
                flags: if is_tcp { Flags::TCP } else { Flags::NONE },
                interval: self.md_cfg.confirm_timeout,
                deadline: Some(confirm_deadline),
                num_exp_replies: 0,
                num_replies: 0,
                num_replies_query: 0,
                num_confirm_sent: 0,
                num_confirm_timeout: 0,
                retries_max: 0,
                retries: 0,
                user_ref,
                src_uri: info.src_uri.clone(),
                dest_uri: info.dest_uri.clone(),
                dst_port: from.port(),
                socket_idx: tcp_socket.unwrap_or(request_socket),
                frame: Vec::new(),
                reply_timeout_us: header.reply_timeout.get(),
            };
            if !is_tcp {
                if let Some(slot) = self.pool.get_mut(record.socket_idx) {
                    slot.usage += 1;
                }
            }
            self.md_rcv.insert(record);
        }

        self.md_events.push((info, payload.to_vec()));

        if complete {
            if let Some(session) = self.md_snd.remove(handle) {
                md_release_socket(&mut self.pool, session.socket_idx, session.is_tcp());
            }
        }
        Ok(())
    }

    /// An incoming confirm for one of our pending reply-queries.
    fn md_handle_confirm(
        &mut self,
        mut info: MdInfo,
        payload: &[u8],
        is_tcp: bool,
    ) -> Result<()> {
        let found = self
            .md_snd
            .iter()
            .find(|(_, s)| {
                s.session_id == info.session_id && s.state == MdState::RxReplyQueryW4C
            })
            .map(|(h, _)| h);
        let Some(handle) = found else {
            self.md_stats_mut(is_tcp).num_no_listener += 1;
            debug!(com_id = info.com_id, "confirm without pending reply-query");
            return Ok(());
        };

        self.md_stats_mut(is_tcp).num_rcv += 1;
        let session = self.md_snd.remove(handle).unwrap();
        info.user_ref = session.user_ref;
        self.md_events.push((info, payload.to_vec()));
        md_release_socket(&mut self.pool, session.socket_idx, session.is_tcp());
        Ok(())
    }

    /// Sweep reply, confirm and application deadlines; drive retries.
    pub(crate) fn md_check_timeouts(&mut self, now: Instant) {
        // Caller side: requests waiting for replies, reply-queries waiting
        // for confirms.
        let expired: Vec<Handle> = self
            .md_snd
            .iter()
            .filter(|(_, s)| s.deadline.is_some_and(|d| d <= now))
            .map(|(h, _)| h)
            .collect();

        for handle in expired {
            let Some(session) = self.md_snd.get_mut(handle) else {
                continue;
            };
            match session.state {
                MdState::TxRequestW4Reply => {
                    let can_retry = session.retries < session.retries_max
                        && !session.is_tcp()
                        && !session.addr.dst_ip.is_multicast();
                    if can_retry {
                        session.retries += 1;
                        session.seq = session.seq.wrapping_add(1);
                        session.state = MdState::TxRequestArm;
                        session.deadline = None;
                        debug!(
                            com_id = session.addr.com_id,
                            retry = session.retries,
                            "request retry"
                        );
                        continue;
                    }
                    let status = if session.num_replies == 0 {
                        ReplyStatus::NoReply
                    } else if session.num_exp_replies != 0
                        && session.num_replies < session.num_exp_replies
                    {
                        ReplyStatus::NotAllReplies
                    } else {
                        ReplyStatus::Ok
                    };
                    let info = session.info(Error::Timeout.code(), status);
                    let is_tcp = session.is_tcp();
                    self.md_events.push((info, Vec::new()));
                    self.md_stats_mut(is_tcp).num_reply_timeout += 1;
                    if let Some(s) = self.md_snd.remove(handle) {
                        md_release_socket(&mut self.pool, s.socket_idx, is_tcp);
                    }
                }
                MdState::RxReplyQueryW4C => {
                    let info = session.info(Error::Timeout.code(), ReplyStatus::NoConfirm);
                    let is_tcp = session.is_tcp();
                    let com_id = session.addr.com_id;
                    self.md_events.push((info, Vec::new()));
                    self.md_stats_mut(is_tcp).num_confirm_timeout += 1;
                    debug!(com_id, "confirm timed out");
                    if let Some(s) = self.md_snd.remove(handle) {
                        md_release_socket(&mut self.pool, s.socket_idx, is_tcp);
                    }
                }
                _ => {}
            }
        }

        // Replier side: the application failed to reply or confirm in time.
        let stale: Vec<Handle> = self
            .md_rcv
            .iter()
            .filter(|(_, s)| s.deadline.is_some_and(|d| d <= now))
            .map(|(h, _)| h)
            .collect();
        for handle in stale {
            let Some(session) = self.md_rcv.remove(handle) else {
                continue;
            };
            let is_tcp = session.is_tcp();
            match session.state {
                MdState::RxReqW4ApReply => {
                    warn!(
                        com_id = session.addr.com_id,
                        "application reply window expired"
                    );
                    self.md_stats_mut(is_tcp).num_reply_timeout += 1;
                }
                MdState::TxReqW4ApConfirm => {
                    warn!(
                        com_id = session.addr.com_id,
                        "application confirm window expired"
                    );
                    self.md_stats_mut(is_tcp).num_confirm_timeout += 1;
                }
                _ => {}
            }
            md_release_socket(&mut self.pool, session.socket_idx, is_tcp);
        }
    }

    /// Abort every MD session (session close): callbacks fire with the
    /// abort result before resources go away.
    pub(crate) fn md_abort_all(&mut self) {
        for session in self.md_snd.drain() {
            if matches!(
                session.state,
                MdState::TxRequestW4Reply | MdState::RxReplyQueryW4C
            ) {
                self.md_events.push((
                    session.info(Error::SessionAbort.code(), ReplyStatus::SessionAbort),
                    Vec::new(),
                ));
            }
        }
        self.md_rcv.drain();
    }

    /// Earliest MD deadline, if any.
    pub(crate) fn md_next_deadline(&self) -> Option<Instant> {
        let snd = self.md_snd.iter().filter_map(|(_, s)| s.deadline);
        let rcv = self.md_rcv.iter().filter_map(|(_, s)| s.deadline);
        snd.chain(rcv).min()
    }

    pub(crate) fn md_stats_mut(&mut self, is_tcp: bool) -> &mut crate::stats::MdStatistics {
        if is_tcp {
            &mut self.stats.tcp_md
        } else {
            &mut self.stats.udp_md
        }
    }
}

/// Compose the wire frame of an MD session.
fn compose_md_frame(session: &MdSession, reply_status: ReplyStatus, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; md_packet_size(data.len())];
    {
        let header = MdHeader::mut_from_frame(&mut frame).unwrap();
        header.sequence_counter.set(session.seq);
        header.protocol_version.set(PROTOCOL_VERSION);
        header.msg_type.set(session.msg_type as u16);
        header.com_id.set(session.addr.com_id);
        header.etb_topo_cnt.set(session.addr.etb_topo);
        header.op_trn_topo_cnt.set(session.addr.op_trn_topo);
        header.dataset_length.set(data.len() as u32);
        header.reply_status.set(reply_status.as_i32());
        header.session_id = session.session_id;
        header.reply_timeout.set(session.reply_timeout_us);
        header.source_uri = uri_field(&session.src_uri);
        header.destination_uri = uri_field(&session.dest_uri);
    }
    frame[MD_HEADER_SIZE..MD_HEADER_SIZE + data.len()].copy_from_slice(data);
    frame::seal_md(&mut frame);
    frame
}

/// Release an MD session's hold on its socket. TCP sockets with pending
/// bytes are marked for death and drained first; everything else follows
/// normal pool release.
fn md_release_socket(pool: &mut SocketPool, socket_idx: usize, is_tcp: bool) {
    if !is_tcp {
        pool.release(socket_idx);
        return;
    }
    let Some(slot) = pool.get_mut(socket_idx) else {
        return;
    };
    slot.pinned = false;
    if let Some(tcp) = slot.tcp.as_mut() {
        if !tcp.pending.is_empty() {
            // Drain before dying; process() closes it once flushed or the
            // send deadline expires.
            tcp.morituri = true;
            return;
        }
    }
    pool.release(socket_idx);
}
