//! trdp-pdtool - Process data publish/subscribe utility
//!
//! Cyclically publishes a telegram or subscribes to one and prints every
//! reception, driving the stack from a plain poll loop.

use std::net::Ipv4Addr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use trdp::sock::poll_readable;
use trdp::{Flags, Result, Session, SessionConfig, Timeout, TopoCount};

#[derive(Parser)]
#[command(name = "trdp-pdtool")]
#[command(about = "Process data publish/subscribe utility", long_about = None)]
#[command(version)]
struct Cli {
    /// Own interface address to bind
    #[arg(short, long, global = true, default_value = "0.0.0.0")]
    own_ip: Ipv4Addr,

    /// PD UDP port
    #[arg(short, long, global = true, default_value_t = trdp::PD_UDP_PORT)]
    port: u16,

    /// ETB topography counter (0 disables matching)
    #[arg(long, global = true, default_value_t = 0)]
    etb_topo: u32,

    /// Print session statistics as JSON every 10 seconds
    #[arg(short, long, global = true)]
    json_stats: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a telegram cyclically
    Publish {
        /// Telegram comId
        com_id: u32,

        /// Destination address (unicast or multicast)
        dest: Ipv4Addr,

        /// Payload as a UTF-8 string
        #[arg(default_value = "Hello, TRDP world!")]
        payload: String,

        /// Cycle time in milliseconds
        #[arg(short, long, default_value_t = 1000)]
        cycle_ms: u64,
    },

    /// Subscribe and print every reception
    Subscribe {
        /// Telegram comId
        com_id: u32,

        /// Destination address the telegrams are sent to (own or group)
        dest: Ipv4Addr,

        /// Source filter (0.0.0.0 accepts any sender)
        #[arg(short, long, default_value = "0.0.0.0")]
        source: Ipv4Addr,

        /// Timeout in milliseconds (0 disables supervision)
        #[arg(short, long, default_value_t = 3000)]
        timeout_ms: u64,
    },
}

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
    config.pd.port = cli.port;

    match cli.command {
        Command::Publish {
            com_id,
            dest,
            payload,
            cycle_ms,
        } => {
            let mut session = Session::open(config)?;
            session.set_topo_count(cli.etb_topo, 0);
            session.publish(
                com_id,
                TopoCount {
                    etb: cli.etb_topo,
                    op_trn: 0,
                },
                Ipv4Addr::UNSPECIFIED,
                dest,
                Some(Duration::from_millis(cycle_ms)),
                0,
                Flags::NONE,
                None,
                payload.as_bytes(),
            )?;
            info!(com_id, %dest, cycle_ms, "publishing, ctrl-c to stop");
            run(session, cli.json_stats)
        }
        Command::Subscribe {
            com_id,
            dest,
            source,
            timeout_ms,
        } => {
            config.pd.callback = Some(Box::new(|info, data| {
                if info.result_code == 0 {
                    println!(
                        "comId {} seq {} from {}: {}",
                        info.com_id,
                        info.seq_count,
                        info.src_ip,
                        String::from_utf8_lossy(data)
                    );
                } else {
                    println!("comId {}: timed out ({})", info.com_id, info.result_code);
                }
            }));
            let mut session = Session::open(config)?;
            session.set_topo_count(cli.etb_topo, 0);
            let timeout = if timeout_ms == 0 {
                Timeout::Never
            } else {
                Timeout::After(Duration::from_millis(timeout_ms))
            };
            session.subscribe(
                0,
                com_id,
                TopoCount {
                    etb: cli.etb_topo,
                    op_trn: 0,
                },
                source,
                Ipv4Addr::UNSPECIFIED,
                dest,
                Flags::CALLBACK,
                timeout,
                None,
                trdp::frame::PD_MAX_DATA,
            )?;
            info!(com_id, %dest, "subscribed, ctrl-c to stop");
            run(session, cli.json_stats)
        }
    }
}

/// The canonical host loop: ask, wait, work.
fn run(mut session: Session, json_stats: bool) -> Result<()> {
    let mut last_dump = std::time::Instant::now();
    loop {
        let (interval, fds) = session.next_interval();
        let ready = poll_readable(&fds, interval)?;
        session.process(&ready)?;

        if json_stats && last_dump.elapsed() >= Duration::from_secs(10) {
            last_dump = std::time::Instant::now();
            match serde_json::to_string(&session.statistics()) {
                Ok(s) => println!("{s}"),
                Err(e) => tracing::warn!(error = %e, "statistics serialisation failed"),
            }
        }
    }
}
