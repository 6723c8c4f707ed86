use anyhow::{Context, Result};
use innerpath::config::GuideConfig;
use innerpath::runtime::BackendRuntime;
use innerpath::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,innerpath=debug")),
        )
        .init();

    let config = GuideConfig::load();
    let runtime =
        BackendRuntime::bootstrap(config).context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting guide backend (set INNERPATH_BACKEND_TOKEN + optional INNERPATH_BACKEND_BIND; auth mode via INNERPATH_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime))
}
