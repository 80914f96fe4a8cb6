//! Native-messaging host spawned by the browser extension.
//!
//! stdout carries protocol frames, so logs go to stderr.

use std::net::{Ipv4Addr, SocketAddr};

use gripdl::{config, native_host};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let port = match config::Config::load() {
        Ok(config) => config.capture_port,
        Err(e) => {
            tracing::warn!(error = %e, "could not load configuration, using default port");
            config::Config::default().capture_port
        }
    };
    let daemon = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    tracing::debug!(%daemon, "native host started");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(native_host::run(tokio::io::stdin(), tokio::io::stdout(), daemon))?;
    Ok(())
}
