//! faultgate/src/main.rs
//! Binary entry point: CLI flags, listener setup, admin control plane.

use anyhow::Context;
use clap::Parser;
use faultgate::state::ProxyState;
use faultgate::{admin, connection, logging};
use tokio::net::TcpListener;
use tracing::info;

/// Fault-injecting SOCKS5 TCP proxy.
#[derive(Parser, Debug)]
#[command(name = "faultgate", version, about)]
struct Args {
    /// Address the SOCKS5 listener binds to.
    #[arg(long, default_value = "0.0.0.0:9000")]
    addr: String,

    /// Address the admin control plane binds to.
    #[arg(long, default_value = "0.0.0.0:4000")]
    admin_addr: String,

    /// CSV list of hosts to whitelist; enables whitelist mode.
    #[arg(long, conflicts_with = "blacklist")]
    whitelist: Option<String>,

    /// CSV list of hosts to blacklist; enables blacklist mode.
    #[arg(long)]
    blacklist: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_logging("info");

    let state = ProxyState::new();

    if let Some(hosts) = &args.whitelist {
        state.policy.enable_whitelist(true);
        for host in hosts.split(',').filter(|h| !h.is_empty()) {
            let ip = state
                .policy
                .set_whitelist(host, true)
                .await
                .with_context(|| format!("whitelisting {host}"))?;
            info!(%host, %ip, "whitelisted at startup");
        }
    }

    if let Some(hosts) = &args.blacklist {
        state.policy.enable_blacklist(true);
        for host in hosts.split(',').filter(|h| !h.is_empty()) {
            let ip = state
                .policy
                .set_blacklist(host, true)
                .await
                .with_context(|| format!("blacklisting {host}"))?;
            info!(%host, %ip, "blacklisted at startup");
        }
    }

    let listener = TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("binding SOCKS5 listener on {}", args.addr))?;
    info!(addr = %args.addr, "SOCKS5 listener established");
    tokio::spawn(connection::run_acceptor(listener, state.clone()));

    let admin_listener = TcpListener::bind(&args.admin_addr)
        .await
        .with_context(|| format!("binding admin listener on {}", args.admin_addr))?;
    info!(addr = %args.admin_addr, "admin control plane listening");
    admin::serve(admin_listener, state).await?;
    Ok(())
}
