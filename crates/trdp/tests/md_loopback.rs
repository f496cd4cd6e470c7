//! End-to-end message data scenarios over loopback.

mod common;

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use common::{DEV_A, DEV_B, drive, md_session};
use trdp::{Error, Flags, MsgType, ReplyStatus, TopoCount};

#[test]
fn notify_reaches_listener() {
    let server_log = Rc::new(RefCell::new(Vec::new()));
    let mut server = md_session(DEV_A, 22010, Some(server_log.clone()));
    let mut client = md_session(DEV_B, 22010, None);

    server
        .add_listener(11, 200, Ipv4Addr::UNSPECIFIED, Flags::NONE, "")
        .unwrap();
    client
        .notify(
            0,
            200,
            TopoCount::default(),
            Ipv4Addr::UNSPECIFIED,
            DEV_A,
            Flags::NONE,
            None,
            b"heads-up",
            "client",
            "server",
        )
        .unwrap();

    let mut sessions = [server, client];
    drive(&mut sessions, Duration::from_millis(150));

    let events = server_log.borrow();
    assert_eq!(events.len(), 1);
    let (info, data) = &events[0];
    assert_eq!(info.msg_type, MsgType::Mn);
    assert_eq!(info.com_id, 200);
    assert_eq!(info.user_ref, 11);
    assert_eq!(info.src_uri, "client");
    assert_eq!(data, b"heads-up");
}

#[test]
fn request_reply_confirm_roundtrip() {
    let server_log = Rc::new(RefCell::new(Vec::new()));
    let client_log = Rc::new(RefCell::new(Vec::new()));
    let mut server = md_session(DEV_A, 22020, Some(server_log.clone()));
    let mut client = md_session(DEV_B, 22020, Some(client_log.clone()));

    server
        .add_listener(1, 100, Ipv4Addr::UNSPECIFIED, Flags::NONE, "server")
        .unwrap();
    let uuid = client
        .md_request(
            2,
            100,
            TopoCount::default(),
            Ipv4Addr::UNSPECIFIED,
            DEV_A,
            Flags::NONE,
            1,
            Some(Duration::from_secs(2)),
            None,
            &[0x42u8; 32],
            "client",
            "server",
        )
        .unwrap();

    let mut sessions = [server, client];
    drive(&mut sessions, Duration::from_millis(150));

    // Server application sees the request and answers with a confirmable
    // reply.
    {
        let events = server_log.borrow();
        assert_eq!(events.len(), 1);
        let (info, data) = &events[0];
        assert_eq!(info.msg_type, MsgType::Mr);
        assert_eq!(info.session_id, uuid);
        assert_eq!(data.len(), 32);
    }
    sessions[0]
        .reply_query(
            uuid,
            100,
            Flags::NONE,
            Some(Duration::from_millis(600)),
            &[0x17u8; 16],
            "server",
        )
        .unwrap();

    drive(&mut sessions, Duration::from_millis(150));

    // Client sees the reply-query and confirms.
    {
        let events = client_log.borrow();
        assert_eq!(events.len(), 1);
        let (info, data) = &events[0];
        assert_eq!(info.msg_type, MsgType::Mq);
        assert_eq!(info.session_id, uuid);
        assert_eq!(data, &[0x17u8; 16]);
        assert_eq!(info.num_replies, 1);
    }
    sessions[1].confirm(uuid, 100, ReplyStatus::Ok).unwrap();

    drive(&mut sessions, Duration::from_millis(150));

    // Server sees the confirm; no timeout anywhere.
    let events = server_log.borrow();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].0.msg_type, MsgType::Mc);
    assert_eq!(events[1].0.result_code, 0);
    assert_eq!(sessions[0].statistics().udp_md.num_confirm_timeout, 0);
}

#[test]
fn missing_confirm_times_out_replier() {
    let server_log = Rc::new(RefCell::new(Vec::new()));
    let client_log = Rc::new(RefCell::new(Vec::new()));
    let mut server = md_session(DEV_A, 22030, Some(server_log.clone()));
    let mut client = md_session(DEV_B, 22030, Some(client_log.clone()));

    server
        .add_listener(1, 101, Ipv4Addr::UNSPECIFIED, Flags::NONE, "")
        .unwrap();
    let uuid = client
        .md_request(
            2,
            101,
            TopoCount::default(),
            Ipv4Addr::UNSPECIFIED,
            DEV_A,
            Flags::NONE,
            1,
            Some(Duration::from_secs(2)),
            None,
            b"please",
            "client",
            "",
        )
        .unwrap();

    let mut sessions = [server, client];
    drive(&mut sessions, Duration::from_millis(150));
    sessions[0]
        .reply_query(
            uuid,
            101,
            Flags::NONE,
            Some(Duration::from_millis(200)),
            b"confirm-me?00000",
            "",
        )
        .unwrap();

    // The client never confirms.
    drive(&mut sessions, Duration::from_millis(500));

    let events = server_log.borrow();
    let timeout = events
        .iter()
        .find(|(info, _)| info.result_code == Error::Timeout.code())
        .expect("replier must see a confirm timeout");
    assert_eq!(timeout.0.reply_status, ReplyStatus::NoConfirm);
    assert_eq!(sessions[0].statistics().udp_md.num_confirm_timeout, 1);
}

#[test]
fn unanswered_request_retries_then_times_out() {
    let client_log: common::MdLog = Rc::new(RefCell::new(Vec::new()));
    let mut config = trdp::SessionConfig {
        own_ip: DEV_B,
        ..Default::default()
    };
    config.md.udp_port = 22040;
    config.md.send_param.retries = 3;
    let log = client_log.clone();
    config.md.callback = Some(Box::new(move |info: &trdp::MdInfo, data: &[u8]| {
        log.borrow_mut().push((info.clone(), data.to_vec()));
    }));
    let mut client = trdp::Session::open(config).unwrap();

    let uuid = client
        .md_request(
            0,
            102,
            TopoCount::default(),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(127, 0, 0, 3), // nobody listens there
            Flags::NONE,
            1,
            Some(Duration::from_millis(120)),
            None,
            b"anyone?",
            "",
            "",
        )
        .unwrap();
    assert_ne!(uuid, [0u8; 16]);

    let mut sessions = [client];
    drive(&mut sessions, Duration::from_millis(900));

    // Initial transmission plus three retries, then a single timeout.
    let stats = sessions[0].statistics();
    assert_eq!(stats.udp_md.num_send, 4);
    assert_eq!(stats.udp_md.num_reply_timeout, 1);

    let events = client_log.borrow();
    assert_eq!(events.len(), 1);
    let (info, _) = &events[0];
    assert_eq!(info.result_code, Error::Timeout.code());
    assert_eq!(info.reply_status, ReplyStatus::NoReply);
    assert_eq!(info.session_id, uuid);
}

#[test]
fn plain_reply_completes_session() {
    let server_log = Rc::new(RefCell::new(Vec::new()));
    let client_log = Rc::new(RefCell::new(Vec::new()));
    let mut server = md_session(DEV_A, 22050, Some(server_log.clone()));
    let mut client = md_session(DEV_B, 22050, Some(client_log.clone()));

    server
        .add_listener(1, 103, Ipv4Addr::UNSPECIFIED, Flags::NONE, "")
        .unwrap();
    let uuid = client
        .md_request(
            2,
            103,
            TopoCount::default(),
            Ipv4Addr::UNSPECIFIED,
            DEV_A,
            Flags::NONE,
            1,
            Some(Duration::from_millis(800)),
            None,
            b"status?",
            "client",
            "",
        )
        .unwrap();

    let mut sessions = [server, client];
    drive(&mut sessions, Duration::from_millis(150));
    sessions[0]
        .reply(uuid, 103, Flags::NONE, b"all-good", "")
        .unwrap();
    drive(&mut sessions, Duration::from_millis(150));

    let events = client_log.borrow();
    assert_eq!(events.len(), 1);
    let (info, data) = &events[0];
    assert_eq!(info.msg_type, MsgType::Mp);
    assert_eq!(data, b"all-good");
    assert_eq!(info.result_code, 0);

    // Session closed on both ends: no stray timeout later.
    drop(events);
    drive(&mut sessions, Duration::from_millis(300));
    assert_eq!(sessions[1].statistics().udp_md.num_reply_timeout, 0);
    assert_eq!(client_log.borrow().len(), 1);
}
