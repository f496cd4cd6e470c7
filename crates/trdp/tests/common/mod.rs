#![allow(dead_code)] // each test binary uses its own subset

//! Shared helpers for the loopback integration tests.
//!
//! Each test emulates two devices with two sessions bound to different
//! loopback addresses on a test-unique port, driven by the same
//! `next_interval` / `poll` / `process` loop a real host runs.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use trdp::sock::poll_readable;
use trdp::{MdInfo, PdInfo, Session, SessionConfig};

pub const DEV_A: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
pub const DEV_B: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

pub type PdLog = Rc<RefCell<Vec<(PdInfo, Vec<u8>)>>>;
pub type MdLog = Rc<RefCell<Vec<(MdInfo, Vec<u8>)>>>;

/// Session config for PD tests: own address, PD port, optional recorder.
pub fn pd_session(own_ip: Ipv4Addr, port: u16, log: Option<PdLog>) -> Session {
    let mut config = SessionConfig {
        own_ip,
        ..Default::default()
    };
    config.pd.port = port;
    if let Some(log) = log {
        config.pd.callback = Some(Box::new(move |info: &PdInfo, data: &[u8]| {
            log.borrow_mut().push((info.clone(), data.to_vec()));
        }));
    }
    Session::open(config).unwrap()
}

/// Session config for MD tests: own address, MD UDP port, recorder.
pub fn md_session(own_ip: Ipv4Addr, port: u16, log: Option<MdLog>) -> Session {
    let mut config = SessionConfig {
        own_ip,
        ..Default::default()
    };
    config.md.udp_port = port;
    if let Some(log) = log {
        config.md.callback = Some(Box::new(move |info: &MdInfo, data: &[u8]| {
            log.borrow_mut().push((info.clone(), data.to_vec()));
        }));
    }
    Session::open(config).unwrap()
}

/// Run the host loop over all sessions for `total` wall time.
///
/// Ready descriptors are handed to every session; each one picks out its
/// own sockets.
pub fn drive(sessions: &mut [Session], total: Duration) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        let mut fds = Vec::new();
        let mut wait = Duration::from_millis(10);
        for session in sessions.iter() {
            let (interval, session_fds) = session.next_interval();
            wait = wait.min(interval);
            fds.extend(session_fds);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let ready = poll_readable(&fds, wait.min(remaining).max(Duration::from_millis(1)))
            .expect("poll failed");
        for session in sessions.iter_mut() {
            session.process(&ready).expect("process failed");
        }
    }
}
