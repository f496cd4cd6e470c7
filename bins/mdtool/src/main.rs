//! trdp-mdtool - Message data request/reply utility
//!
//! Runs either an echo replier (listen) or a one-shot requester, the MD
//! equivalents of the classic manager/replier demo pair.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::process::exit;
use std::rc::Rc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use trdp::sock::poll_readable;
use trdp::{Flags, MsgType, Result, Session, SessionConfig, TopoCount};

#[derive(Parser)]
#[command(name = "trdp-mdtool")]
#[command(about = "Message data request/reply utility", long_about = None)]
#[command(version)]
struct Cli {
    /// Own interface address to bind
    #[arg(short, long, global = true, default_value = "0.0.0.0")]
    own_ip: Ipv4Addr,

    /// MD UDP port
    #[arg(short, long, global = true, default_value_t = trdp::MD_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for requests and echo their payload back
    Listen {
        /// Telegram comId to listen on
        com_id: u32,

        /// Destination URI user part filter (empty accepts everything)
        #[arg(short, long, default_value = "")]
        uri: String,
    },

    /// Send one request and print the replies
    Request {
        /// Telegram comId
        com_id: u32,

        /// Replier address
        dest: Ipv4Addr,

        /// Payload as a UTF-8 string
        #[arg(default_value = "ping")]
        payload: String,

        /// Reply timeout in milliseconds
        #[arg(short, long, default_value_t = 2000)]
        timeout_ms: u64,
    },
}

/// Requests the callback has seen but the application not yet answered.
type PendingReplies = Rc<RefCell<Vec<([u8; 16], u32, Vec<u8>)>>>;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SessionConfig {
        own_ip: cli.own_ip,
        ..Default::default()
    };
    config.md.udp_port = cli.port;

    match cli.command {
        Command::Listen { com_id, uri } => run_replier(config, com_id, &uri),
        Command::Request {
            com_id,
            dest,
            payload,
            timeout_ms,
        } => run_requester(config, com_id, dest, payload.as_bytes(), timeout_ms),
    }
}

fn run_replier(mut config: SessionConfig, com_id: u32, uri: &str) -> Result<()> {
    let pending: PendingReplies = Rc::new(RefCell::new(Vec::new()));
    let seen = pending.clone();
    config.md.callback = Some(Box::new(move |info, data| match info.msg_type {
        MsgType::Mr => {
            info!(com_id = info.com_id, from = %info.src_ip, "request received");
            seen.borrow_mut()
                .push((info.session_id, info.com_id, data.to_vec()));
        }
        MsgType::Mn => {
            info!(com_id = info.com_id, from = %info.src_ip, "notification received");
        }
        _ => {}
    }));

    let mut session = Session::open(config)?;
    session.add_listener(0, com_id, Ipv4Addr::UNSPECIFIED, Flags::NONE, uri)?;
    info!(com_id, uri, "listening, ctrl-c to stop");

    loop {
        let (interval, fds) = session.next_interval();
        let ready = poll_readable(&fds, interval)?;
        session.process(&ready)?;

        // Echo everything the callback collected during process().
        let requests: Vec<_> = pending.borrow_mut().drain(..).collect();
        for (session_id, com_id, data) in requests {
            session.reply(session_id, com_id, Flags::NONE, &data, "")?;
        }
    }
}

fn run_requester(
    mut config: SessionConfig,
    com_id: u32,
    dest: Ipv4Addr,
    payload: &[u8],
    timeout_ms: u64,
) -> Result<()> {
    let done = Rc::new(RefCell::new(false));
    let flag = done.clone();
    config.md.callback = Some(Box::new(move |info, data| {
        if info.result_code == 0 {
            println!(
                "reply {} from {}: {}",
                info.num_replies,
                info.src_ip,
                String::from_utf8_lossy(data)
            );
        } else {
            eprintln!("no reply: {:?}", info.reply_status);
        }
        *flag.borrow_mut() = true;
    }));

    let mut session = Session::open(config)?;
    session.md_request(
        0,
        com_id,
        TopoCount::default(),
        Ipv4Addr::UNSPECIFIED,
        dest,
        Flags::NONE,
        1,
        Some(Duration::from_millis(timeout_ms)),
        None,
        payload,
        "",
        "",
    )?;
    info!(com_id, %dest, "request sent");

    while !*done.borrow() {
        let (interval, fds) = session.next_interval();
        let ready = poll_readable(&fds, interval)?;
        session.process(&ready)?;
    }
    session.close();
    exit(0);
}
