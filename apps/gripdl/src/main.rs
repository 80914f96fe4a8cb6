//! GripDL daemon entry point.

use gripdl::{app, config};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting GripDL");

    let config = config::Config::load()?;
    tracing::info!(
        download_dir = %config.download_dir.display(),
        state = %config.state_file().display(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("GripDL shut down cleanly");
    Ok(())
}
