//! Socket pool: UDP/TCP acquisition, reuse and multicast group lifecycle.
//!
//! Sockets are pooled and shared by acquisition key (bind address, port,
//! usage type, QoS, TTL, receive-only). Options are applied with `socket2`
//! before the first bind; UDP sockets are then converted to
//! `std::net::UdpSocket` for I/O, TCP peers stay `socket2::Socket` so
//! non-blocking connects can be polled for completion. Options the standard
//! library does not expose (`IP_TOS`, `IP_MULTICAST_IF`) go through libc.

use std::io::{self, Read, Write};
use std::mem::size_of;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::frame::{MD_HEADER_SIZE, md_packet_size};

/// Upper bound on pooled sockets per session.
pub const MAX_SOCKET_CNT: usize = 64;

/// What a pooled socket is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    /// UDP process data.
    Pd,
    /// UDP message data.
    MdUdp,
    /// TCP message data (per-peer connection).
    MdTcp,
}

/// Per-peer TCP connection state.
#[derive(Debug)]
pub struct TcpState {
    /// The remote end of this connection.
    pub corner_ip: Ipv4Addr,
    /// Whether the non-blocking connect has completed.
    pub connect_done: bool,
    /// Deadline for connect completion.
    pub connect_deadline: Option<Instant>,
    /// Bytes accepted for sending but not yet written to the socket.
    pub pending: BytesMut,
    /// Deadline for draining `pending`; armed while it is non-empty.
    pub send_deadline: Option<Instant>,
    /// Reassembly buffer for partially received frames.
    pub recv_buf: BytesMut,
    /// Scheduled for teardown once its owning session terminates.
    pub morituri: bool,
}

impl TcpState {
    fn new(corner_ip: Ipv4Addr, connect_done: bool) -> Self {
        Self {
            corner_ip,
            connect_done,
            connect_deadline: None,
            pending: BytesMut::new(),
            send_deadline: None,
            recv_buf: BytesMut::new(),
            morituri: false,
        }
    }
}

enum SockIo {
    Udp(UdpSocket),
    Tcp(Socket),
}

impl std::fmt::Debug for SockIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp(s) => write!(f, "Udp(fd {})", s.as_raw_fd()),
            Self::Tcp(s) => write!(f, "Tcp(fd {})", s.as_raw_fd()),
        }
    }
}

/// One pooled socket.
#[derive(Debug)]
pub struct SocketSlot {
    io: SockIo,
    /// Interface address the socket is bound to.
    pub bind_ip: Ipv4Addr,
    /// Bound (or, for TCP peers, remote) port.
    pub port: u16,
    /// Usage type.
    pub kind: SockKind,
    /// QoS class the TOS field was derived from.
    pub qos: u8,
    /// Time-to-live.
    pub ttl: u8,
    /// Opened for reception (subscriptions, listeners).
    pub rcv_only: bool,
    /// Number of queue elements holding this socket.
    pub usage: u32,
    /// Held open by a listener even at zero usage.
    pub pinned: bool,
    /// Joined multicast groups: (group, join interface, holder count).
    mc_groups: Vec<(Ipv4Addr, Ipv4Addr, u32)>,
    /// TCP connection state, `None` for UDP slots.
    pub tcp: Option<TcpState>,
}

impl SocketSlot {
    /// Raw descriptor for readiness integration.
    pub fn raw_fd(&self) -> RawFd {
        match &self.io {
            SockIo::Udp(s) => s.as_raw_fd(),
            SockIo::Tcp(s) => s.as_raw_fd(),
        }
    }

    /// Whether this slot has joined `group`.
    pub fn has_joined(&self, group: Ipv4Addr) -> bool {
        self.mc_groups.iter().any(|&(g, _, _)| g == group)
    }
}

/// Fixed-size socket pool of one session.
#[derive(Debug, Default)]
pub struct SocketPool {
    slots: Vec<Option<SocketSlot>>,
    /// The single TCP listen socket, outside the keyed slots.
    listener: Option<Socket>,
}

impl SocketPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            listener: None,
        }
    }

    fn free_index(&mut self) -> Result<usize> {
        if let Some(i) = self.slots.iter().position(Option::is_none) {
            return Ok(i);
        }
        if self.slots.len() >= MAX_SOCKET_CNT {
            return Err(Error::QueueFull("socket pool exhausted"));
        }
        self.slots.push(None);
        Ok(self.slots.len() - 1)
    }

    /// Borrow a slot.
    pub fn get(&self, index: usize) -> Option<&SocketSlot> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Mutably borrow a slot.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut SocketSlot> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Iterate over live slots.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &SocketSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    /// Acquire a UDP socket, reusing a pooled one when the key matches.
    pub fn request_udp(
        &mut self,
        bind_ip: Ipv4Addr,
        port: u16,
        kind: SockKind,
        qos: u8,
        ttl: u8,
        rcv_only: bool,
        nonblocking: bool,
    ) -> Result<usize> {
        debug_assert!(kind != SockKind::MdTcp);

        // The receive-only flag is not part of the key: a publisher and a
        // subscriber on the same interface and port share one socket, as
        // there can only be one bound socket per (address, port) anyway.
        if let Some(i) = self.slots.iter().position(|s| {
            s.as_ref().is_some_and(|s| {
                s.bind_ip == bind_ip
                    && s.port == port
                    && s.kind == kind
                    && s.qos == qos
                    && s.ttl == ttl
            })
        }) {
            let slot = self.slots[i].as_mut().unwrap();
            slot.usage += 1;
            slot.rcv_only &= rcv_only;
            trace!(index = i, usage = slot.usage, "reusing pooled socket");
            return Ok(i);
        }

        let index = self.free_index()?;
        let sock = open_udp(bind_ip, port, qos, ttl, nonblocking).map_err(Error::Sock)?;
        debug!(index, %bind_ip, port, ?kind, "opened UDP socket");
        self.slots[index] = Some(SocketSlot {
            io: SockIo::Udp(sock),
            bind_ip,
            port,
            kind,
            qos,
            ttl,
            rcv_only,
            usage: 1,
            pinned: false,
            mc_groups: Vec::new(),
            tcp: None,
        });
        Ok(index)
    }

    /// Acquire a TCP connection to `dst`, reusing an established one.
    ///
    /// A fresh socket starts a non-blocking connect bounded by
    /// `connect_timeout`; completion is polled via
    /// [`SocketPool::update_tcp_connects`].
    pub fn request_tcp(
        &mut self,
        bind_ip: Ipv4Addr,
        port: u16,
        qos: u8,
        ttl: u8,
        dst: Ipv4Addr,
        connect_timeout: Duration,
    ) -> Result<usize> {
        if let Some(i) = self.slots.iter().position(|s| {
            s.as_ref().is_some_and(|s| {
                s.kind == SockKind::MdTcp
                    && !s.rcv_only
                    && s.tcp.as_ref().is_some_and(|t| t.corner_ip == dst)
            })
        }) {
            let slot = self.slots[i].as_mut().unwrap();
            slot.usage += 1;
            return Ok(i);
        }

        let index = self.free_index()?;
        let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Sock)?;
        sock.set_nonblocking(true).map_err(Error::Sock)?;
        set_tos(sock.as_raw_fd(), qos).map_err(Error::Sock)?;
        set_ttl(sock.as_raw_fd(), ttl).map_err(Error::Sock)?;
        if bind_ip != Ipv4Addr::UNSPECIFIED {
            sock.bind(&SockAddr::from(SocketAddrV4::new(bind_ip, 0)))
                .map_err(Error::Sock)?;
        }

        let mut state = TcpState::new(dst, false);
        match sock.connect(&SockAddr::from(SocketAddrV4::new(dst, port))) {
            Ok(()) => state.connect_done = true,
            Err(e) if in_progress(&e) => {
                state.connect_deadline = Some(Instant::now() + connect_timeout);
            }
            Err(e) => return Err(Error::Sock(e)),
        }
        debug!(index, %dst, port, done = state.connect_done, "TCP connect started");

        self.slots[index] = Some(SocketSlot {
            io: SockIo::Tcp(sock),
            bind_ip,
            port,
            kind: SockKind::MdTcp,
            qos,
            ttl,
            rcv_only: false,
            usage: 1,
            pinned: false,
            mc_groups: Vec::new(),
            tcp: Some(state),
        });
        Ok(index)
    }

    /// Ensure the session's TCP listen socket exists and return its fd.
    pub fn ensure_tcp_listener(&mut self, bind_ip: Ipv4Addr, port: u16) -> Result<RawFd> {
        if let Some(l) = &self.listener {
            return Ok(l.as_raw_fd());
        }
        let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Sock)?;
        sock.set_reuse_address(true).map_err(Error::Sock)?;
        sock.set_nonblocking(true).map_err(Error::Sock)?;
        sock.bind(&SockAddr::from(SocketAddrV4::new(bind_ip, port)))
            .map_err(Error::Sock)?;
        sock.listen(8).map_err(Error::Sock)?;
        let fd = sock.as_raw_fd();
        debug!(%bind_ip, port, fd, "TCP listen socket opened");
        self.listener = Some(sock);
        Ok(fd)
    }

    /// The listen socket's fd, if one exists.
    pub fn tcp_listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    /// Accept one pending connection; `Ok(None)` when none is queued.
    ///
    /// The accepted socket is pooled receive-only and pinned until its
    /// owning receiver session completes.
    pub fn accept_tcp(&mut self) -> Result<Option<usize>> {
        let Some(listener) = &self.listener else {
            return Ok(None);
        };
        match listener.accept() {
            Ok((sock, addr)) => {
                sock.set_nonblocking(true).map_err(Error::Sock)?;
                let peer = match addr.as_socket() {
                    Some(SocketAddr::V4(v4)) => *v4.ip(),
                    _ => Ipv4Addr::UNSPECIFIED,
                };
                let index = self.free_index()?;
                debug!(index, %peer, "accepted TCP connection");
                self.slots[index] = Some(SocketSlot {
                    io: SockIo::Tcp(sock),
                    bind_ip: Ipv4Addr::UNSPECIFIED,
                    port: 0,
                    kind: SockKind::MdTcp,
                    qos: 0,
                    ttl: 0,
                    rcv_only: true,
                    usage: 1,
                    pinned: true,
                    mc_groups: Vec::new(),
                    tcp: Some(TcpState::new(peer, true)),
                });
                Ok(Some(index))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Release one hold on a slot; the socket closes when the last holder
    /// releases and no listener pins it. Returns `true` when closed.
    pub fn release(&mut self, index: usize) -> bool {
        let Some(slot) = self.slots.get_mut(index).and_then(Option::as_mut) else {
            return false;
        };
        slot.usage = slot.usage.saturating_sub(1);
        if slot.usage == 0 && !slot.pinned {
            debug!(index, "closing pooled socket");
            self.slots[index] = None;
            true
        } else {
            false
        }
    }

    /// Force-close a slot regardless of usage (TCP teardown).
    pub fn close(&mut self, index: usize) {
        if self.slots.get_mut(index).map(Option::take).is_some() {
            debug!(index, "socket torn down");
        }
    }

    /// Join a multicast group on a slot; joins the kernel group only for
    /// the first holder.
    pub fn join_mc(&mut self, index: usize, group: Ipv4Addr, iface: Ipv4Addr) -> Result<()> {
        let slot = self
            .get_mut(index)
            .ok_or(Error::Param("invalid socket index"))?;
        if let Some(entry) = slot.mc_groups.iter_mut().find(|(g, _, _)| *g == group) {
            entry.2 += 1;
            return Ok(());
        }
        match &slot.io {
            SockIo::Udp(s) => s.join_multicast_v4(&group, &iface).map_err(Error::Sock)?,
            SockIo::Tcp(_) => return Err(Error::Param("multicast join on TCP socket")),
        }
        debug!(index, %group, %iface, "joined multicast group");
        slot.mc_groups.push((group, iface, 1));
        Ok(())
    }

    /// Drop one hold on a joined group; leaves the kernel group when the
    /// last holder goes.
    pub fn leave_mc(&mut self, index: usize, group: Ipv4Addr) -> Result<()> {
        let slot = self
            .get_mut(index)
            .ok_or(Error::Param("invalid socket index"))?;
        let Some(pos) = slot.mc_groups.iter().position(|(g, _, _)| *g == group) else {
            return Ok(());
        };
        slot.mc_groups[pos].2 -= 1;
        if slot.mc_groups[pos].2 == 0 {
            let (_, iface, _) = slot.mc_groups.remove(pos);
            if let SockIo::Udp(s) = &slot.io {
                s.leave_multicast_v4(&group, &iface).map_err(Error::Sock)?;
                debug!(index, %group, "left multicast group");
            }
        }
        Ok(())
    }

    /// Select the outgoing multicast interface for a slot.
    pub fn set_multicast_if(&mut self, index: usize, iface: Ipv4Addr) -> Result<()> {
        let slot = self
            .get(index)
            .ok_or(Error::Param("invalid socket index"))?;
        set_multicast_if(slot.raw_fd(), iface).map_err(Error::Sock)
    }

    /// Send one datagram.
    pub fn send_to(&self, index: usize, buf: &[u8], dst: SocketAddrV4) -> io::Result<usize> {
        match self.get(index).map(|s| &s.io) {
            Some(SockIo::Udp(s)) => s.send_to(buf, dst),
            _ => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    /// Receive one datagram; the source must be IPv4.
    pub fn recv_from(&self, index: usize, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        match self.get(index).map(|s| &s.io) {
            Some(SockIo::Udp(s)) => {
                let (n, addr) = s.recv_from(buf)?;
                match addr {
                    SocketAddr::V4(v4) => Ok((n, v4)),
                    SocketAddr::V6(_) => Err(io::Error::from(io::ErrorKind::InvalidData)),
                }
            }
            _ => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    /// Poll in-progress TCP connects; marks completions, reports expired
    /// connect deadlines as a list of slot indices for the MD engine.
    pub fn update_tcp_connects(&mut self, now: Instant) -> Vec<usize> {
        let mut expired = Vec::new();
        for (i, slot) in self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|s| (i, s)))
        {
            let SockIo::Tcp(sock) = &slot.io else { continue };
            let Some(tcp) = slot.tcp.as_mut() else { continue };
            if tcp.connect_done {
                continue;
            }
            if poll_writable(sock.as_raw_fd()) {
                match sock.take_error() {
                    Ok(None) => {
                        debug!(index = i, peer = %tcp.corner_ip, "TCP connect completed");
                        tcp.connect_done = true;
                        tcp.connect_deadline = None;
                        continue;
                    }
                    Ok(Some(e)) => {
                        warn!(index = i, peer = %tcp.corner_ip, error = %e, "TCP connect failed");
                        expired.push(i);
                        continue;
                    }
                    Err(_) => {}
                }
            }
            if tcp.connect_deadline.is_some_and(|d| d <= now) {
                warn!(index = i, peer = %tcp.corner_ip, "TCP connect timed out");
                expired.push(i);
            }
        }
        expired
    }

    /// Queue a frame on a TCP connection, writing as much as the socket
    /// accepts; the rest is kept and drained by [`SocketPool::flush_tcp`].
    pub fn tcp_send(&mut self, index: usize, frame: &[u8], send_timeout: Duration) -> Result<()> {
        let slot = self
            .get_mut(index)
            .ok_or(Error::Param("invalid socket index"))?;
        let SockIo::Tcp(sock) = &slot.io else {
            return Err(Error::Param("not a TCP socket"));
        };
        let tcp = slot.tcp.as_mut().ok_or(Error::Param("not a TCP socket"))?;

        tcp.pending.extend_from_slice(frame);
        if !tcp.connect_done {
            return Ok(());
        }

        let mut sock_ref = sock;
        while !tcp.pending.is_empty() {
            match sock_ref.write(&tcp.pending) {
                Ok(n) => {
                    tcp.pending.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        tcp.send_deadline = if tcp.pending.is_empty() {
            None
        } else {
            trace!(index, left = tcp.pending.len(), "partial TCP send");
            Some(Instant::now() + send_timeout)
        };
        Ok(())
    }

    /// Retry pending TCP writes. Returns slots whose send deadline expired.
    pub fn flush_tcp(&mut self, now: Instant) -> Vec<usize> {
        let mut expired = Vec::new();
        for (i, slot) in self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|s| (i, s)))
        {
            let SockIo::Tcp(sock) = &slot.io else { continue };
            let Some(tcp) = slot.tcp.as_mut() else { continue };
            if !tcp.connect_done || tcp.pending.is_empty() {
                continue;
            }
            let mut sock_ref = sock;
            loop {
                match sock_ref.write(&tcp.pending) {
                    Ok(n) => {
                        tcp.pending.advance(n);
                        if tcp.pending.is_empty() {
                            tcp.send_deadline = None;
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        expired.push(i);
                        break;
                    }
                }
            }
            if tcp.send_deadline.is_some_and(|d| d <= now) {
                expired.push(i);
            }
        }
        expired
    }

    /// Read from a TCP connection and reassemble one MD frame.
    ///
    /// `Ok(None)` while the frame is incomplete; `Err(NoData)` when the
    /// peer closed the connection.
    pub fn tcp_recv_frame(&mut self, index: usize) -> Result<Option<Vec<u8>>> {
        let slot = self
            .get_mut(index)
            .ok_or(Error::Param("invalid socket index"))?;
        let SockIo::Tcp(sock) = &slot.io else {
            return Err(Error::Param("not a TCP socket"));
        };
        let tcp = slot.tcp.as_mut().ok_or(Error::Param("not a TCP socket"))?;

        let mut chunk = [0u8; 4096];
        let mut sock_ref = sock;
        loop {
            match sock_ref.read(&mut chunk) {
                Ok(0) => {
                    if tcp.recv_buf.is_empty() {
                        return Err(Error::NoData);
                    }
                    break;
                }
                Ok(n) => tcp.recv_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        if tcp.recv_buf.len() < MD_HEADER_SIZE {
            return Ok(None);
        }
        let data_len =
            u32::from_be_bytes(tcp.recv_buf[20..24].try_into().unwrap()) as usize;
        let expected = md_packet_size(data_len);
        if tcp.recv_buf.len() < expected {
            return Ok(None);
        }
        let frame = tcp.recv_buf.split_to(expected).to_vec();
        Ok(Some(frame))
    }

    /// Close every socket (session teardown).
    pub fn close_all(&mut self) {
        self.slots.clear();
        self.listener = None;
    }
}

fn open_udp(
    bind_ip: Ipv4Addr,
    port: u16,
    qos: u8,
    ttl: u8,
    nonblocking: bool,
) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.set_nonblocking(nonblocking)?;
    sock.set_broadcast(true)?;
    set_tos(sock.as_raw_fd(), qos)?;
    set_ttl(sock.as_raw_fd(), ttl)?;
    set_multicast_ttl(sock.as_raw_fd(), ttl)?;
    if bind_ip != Ipv4Addr::UNSPECIFIED && !bind_ip.is_loopback() {
        set_multicast_if(sock.as_raw_fd(), bind_ip)?;
    }
    sock.bind(&SockAddr::from(SocketAddrV4::new(bind_ip, port)))?;
    Ok(sock.into())
}

fn in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Map a QoS class into the IP precedence bits of the TOS octet.
fn set_tos(fd: RawFd, qos: u8) -> io::Result<()> {
    set_ipproto_int(fd, libc::IP_TOS, ((qos & 0x07) as libc::c_int) << 5)
}

fn set_ipproto_int(fd: RawFd, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    // SAFETY: fd is a live socket owned by the caller; the option takes a
    // c_int-sized value.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            opt,
            &value as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_ttl(fd: RawFd, ttl: u8) -> io::Result<()> {
    set_ipproto_int(fd, libc::IP_TTL, ttl as libc::c_int)
}

fn set_multicast_ttl(fd: RawFd, ttl: u8) -> io::Result<()> {
    set_ipproto_int(fd, libc::IP_MULTICAST_TTL, ttl as libc::c_int)
}

/// Select the interface multicast datagrams are sent from.
fn set_multicast_if(fd: RawFd, iface: Ipv4Addr) -> io::Result<()> {
    let addr = libc::in_addr {
        s_addr: u32::from(iface).to_be(),
    };
    // SAFETY: fd is a live socket owned by the caller; IP_MULTICAST_IF
    // accepts a struct in_addr.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            &addr as *const _ as *const libc::c_void,
            size_of::<libc::in_addr>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn poll_writable(fd: RawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    // SAFETY: pfd points at one valid pollfd; zero timeout, no blocking.
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    rc == 1 && pfd.revents & libc::POLLOUT != 0
}

/// Wait for readability on `fds`, bounded by `timeout`; returns the ready
/// subset. Convenience for hosts without their own event loop.
pub fn poll_readable(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<RawFd>> {
    if fds.is_empty() {
        std::thread::sleep(timeout);
        return Ok(Vec::new());
    }
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: pfds is a live array of pfds.len() entries for the whole
    // call.
    let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, millis) };
    if rc < 0 {
        let e = io::Error::last_os_error();
        if e.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(e);
    }
    Ok(pfds
        .iter()
        .filter(|p| p.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0)
        .map(|p| p.fd)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuses_matching_key() {
        let mut pool = SocketPool::new();
        let a = pool
            .request_udp(Ipv4Addr::LOCALHOST, 0, SockKind::Pd, 5, 64, false, true)
            .unwrap();
        let b = pool
            .request_udp(Ipv4Addr::LOCALHOST, 0, SockKind::Pd, 5, 64, false, true)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.get(a).unwrap().usage, 2);
    }

    #[test]
    fn test_pool_distinguishes_qos() {
        let mut pool = SocketPool::new();
        let a = pool
            .request_udp(Ipv4Addr::LOCALHOST, 0, SockKind::Pd, 5, 64, false, true)
            .unwrap();
        let b = pool
            .request_udp(Ipv4Addr::LOCALHOST, 0, SockKind::Pd, 3, 64, false, true)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_release_closes_at_zero_usage() {
        let mut pool = SocketPool::new();
        let a = pool
            .request_udp(Ipv4Addr::LOCALHOST, 0, SockKind::Pd, 5, 64, false, true)
            .unwrap();
        pool.request_udp(Ipv4Addr::LOCALHOST, 0, SockKind::Pd, 5, 64, false, true)
            .unwrap();
        assert!(!pool.release(a));
        assert!(pool.release(a));
        assert!(pool.get(a).is_none());
    }

    #[test]
    fn test_mc_refcount() {
        let mut pool = SocketPool::new();
        let idx = pool
            .request_udp(Ipv4Addr::UNSPECIFIED, 0, SockKind::Pd, 5, 64, true, true)
            .unwrap();
        let group = Ipv4Addr::new(239, 1, 2, 3);
        pool.join_mc(idx, group, Ipv4Addr::LOCALHOST).unwrap();
        pool.join_mc(idx, group, Ipv4Addr::LOCALHOST).unwrap();
        assert!(pool.get(idx).unwrap().has_joined(group));
        // First leave keeps the membership, second drops it.
        pool.leave_mc(idx, group).unwrap();
        assert!(pool.get(idx).unwrap().has_joined(group));
        pool.leave_mc(idx, group).unwrap();
        assert!(!pool.get(idx).unwrap().has_joined(group));
    }

    #[test]
    fn test_udp_loopback_roundtrip() {
        let mut pool = SocketPool::new();
        let tx = pool
            .request_udp(Ipv4Addr::LOCALHOST, 0, SockKind::Pd, 5, 64, false, true)
            .unwrap();
        let rx = pool
            .request_udp(Ipv4Addr::LOCALHOST, 17994, SockKind::Pd, 5, 64, true, true)
            .unwrap();
        pool.send_to(tx, b"ping", SocketAddrV4::new(Ipv4Addr::LOCALHOST, 17994))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let mut buf = [0u8; 16];
        let (n, from) = pool.recv_from(rx, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(*from.ip(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_poll_readable_times_out() {
        let mut pool = SocketPool::new();
        let rx = pool
            .request_udp(Ipv4Addr::LOCALHOST, 0, SockKind::Pd, 5, 64, true, true)
            .unwrap();
        let fd = pool.get(rx).unwrap().raw_fd();
        let ready = poll_readable(&[fd], Duration::from_millis(10)).unwrap();
        assert!(ready.is_empty());
    }
}
