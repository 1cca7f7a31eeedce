//! rig-bridge: one-way TCP relay for a single network link.
//!
//! Accepts connections on the listen port and pipes each one to the
//! destination.  The harness cuts the link by killing this process, which
//! drops every connection it carries.

use std::net::{IpAddr, SocketAddr};

use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use clusterrig::config::LoggingConfig;
use clusterrig::signal::shutdown_signal;

#[derive(Parser, Debug)]
#[command(name = "rig-bridge", version, about = "TCP relay for one harness link")]
struct Cli {
    /// Port to accept connections on.
    #[arg(long)]
    listen_port: u16,

    /// Address every accepted connection is piped to.
    #[arg(long)]
    dest: SocketAddr,

    #[arg(long, default_value = "127.0.0.1")]
    listen_host: IpAddr,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    clusterrig::logging::init(&LoggingConfig {
        level: cli.log_level.clone(),
        ..LoggingConfig::default()
    });

    let listen = SocketAddr::new(cli.listen_host, cli.listen_port);
    let listener = TcpListener::bind(listen).await?;
    info!("Relaying {} -> {}", listen, cli.dest);

    tokio::select! {
        result = accept_loop(listener, cli.dest) => result?,
        _ = shutdown_signal() => {}
    }
    info!("Relay {} -> {} stopped", listen, cli.dest);
    Ok(())
}

async fn accept_loop(listener: TcpListener, dest: SocketAddr) -> anyhow::Result<()> {
    loop {
        let (inbound, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = relay(inbound, dest).await {
                debug!("Connection from {} closed: {}", peer, e);
            }
        });
    }
}

/// Pipe one connection.  If the destination refuses, returning drops the
/// inbound side so the client sees the link as broken.
async fn relay(mut inbound: TcpStream, dest: SocketAddr) -> std::io::Result<()> {
    let mut outbound = TcpStream::connect(dest).await?;
    inbound.set_nodelay(true)?;
    outbound.set_nodelay(true)?;
    let (up, down) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    debug!("Relayed {} bytes up, {} bytes down", up, down);
    Ok(())
}
