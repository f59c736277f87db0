//! VIGIL service binary.
//!
//! Loads the configuration tree, initializes tracing, assembles the
//! components, and runs the accept loops until ctrl-c.

mod engines;
mod server;
mod signal_server;

use anyhow::Context as _;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vigil_core::config::VigilConfig;

#[derive(Debug, Parser)]
#[command(name = "vigil", version, about = "Real-time voice core for an AI call-answering assistant")]
struct Args {
    /// Main protocol listener address.
    #[arg(long, default_value = "127.0.0.1:8750")]
    listen: SocketAddr,

    /// Signaling listener address.
    #[arg(long, default_value = "127.0.0.1:8751")]
    signal_listen: SocketAddr,

    /// JSON configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads; 0 auto-detects from the CPU count.
    #[arg(long, default_value_t = 0)]
    workers: usize,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<VigilConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(VigilConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(args.config.as_ref())?;
    let workers = if args.workers == 0 {
        num_cpus::get()
    } else {
        args.workers
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(async move {
        let app = server::App::new(config);
        app.run(args.listen, args.signal_listen).await
    })
}
