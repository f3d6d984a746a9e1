use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use udp2w::{DeliveryMode, ProcessSet, Reactor};

const TICK: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(about = "Reliable-UDP echo over the reactor")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Echo every message back to whoever connects.
    Server {
        #[arg(default_value = "0.0.0.0")]
        host: String,
        #[arg(default_value_t = 9400)]
        port: u16,
    },
    /// Send numbered messages and print the echoes.
    Client {
        #[arg(default_value = "127.0.0.1")]
        host: String,
        #[arg(default_value_t = 9400)]
        port: u16,
        #[arg(long, default_value_t = 100)]
        count: u32,
    },
}

async fn server(host: &str, port: u16) -> anyhow::Result<()> {
    let mut reactor = Reactor::new();
    let listener = reactor
        .listen_reliable_datagram(host, port, DeliveryMode::Sequential)
        .context("error listening")?;
    info!(addr = ?reactor.local_addr(listener), "listening");

    let mut set = ProcessSet::new();
    set.link(listener);

    loop {
        reactor.run_cycle(&set, TICK).await;
        while let Some(conn) = reactor.claim_new_connection(listener) {
            info!(?conn, peer = ?reactor.peer_addr(conn), "new connection");
            set.link(conn);
        }
        for conn in set.iter().collect::<Vec<_>>() {
            if reactor.is_dead(conn) && conn != listener {
                info!(?conn, "connection gone");
                set.unlink(conn);
                reactor.close(conn);
                continue;
            }
            while let Some(msg) = reactor.drain_input(conn) {
                reactor.enqueue(conn, &msg, true)?;
            }
        }
    }
}

async fn client(host: &str, port: u16, count: u32) -> anyhow::Result<()> {
    let mut reactor = Reactor::new();
    let conn = reactor
        .open_reliable_datagram(host, port, DeliveryMode::Sequential)
        .context("error connecting")?;
    let mut set = ProcessSet::new();
    set.link(conn);

    for i in 0..count {
        reactor.enqueue(conn, format!("message {i}").as_bytes(), true)?;
    }

    let mut echoed = 0;
    while echoed < count {
        anyhow::ensure!(!reactor.is_dead(conn), "connection died");
        reactor.run_cycle(&set, TICK).await;
        while let Some(msg) = reactor.drain_input(conn) {
            info!(echo = %String::from_utf8_lossy(&msg));
            echoed += 1;
        }
    }
    info!(echoed, "all messages echoed");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    match args.command {
        Command::Server { host, port } => server(&host, port).await,
        Command::Client { host, port, count } => client(&host, port, count).await,
    }
}
