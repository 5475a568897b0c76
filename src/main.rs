#![forbid(unsafe_code)]

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use std::sync::Arc;
use tollgate::{config, proxy, state};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "OpenAI-compatible gateway with prepaid upstream accounts, metering and an admin API")]
struct Cli {
    /// Path to TOML config
    #[arg(long, default_value = "config.toml")]
    config: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = config::Config::load(&cli.config)?;

    let worker_threads = cfg.worker_threads.unwrap_or_else(num_cpus::get);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(worker_threads)
        .thread_name("tollgate-worker")
        .build()?;

    rt.block_on(async move {
        let listener = std::net::TcpListener::bind(cfg.listen_addr.as_str())?;
        let addr = listener.local_addr()?;
        let state = Arc::new(state::GatewayState::new(cfg)?);
        tracing::info!(%addr, "listening (admin api at /admin/api/v1)");

        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "ctrl-c handler failed");
            }
            tracing::info!("shutdown requested, draining");
        };
        let served = proxy::serve(listener, state.clone(), shutdown).await;
        state.shutdown().await;
        served
    })
}
