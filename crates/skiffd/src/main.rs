//! skiffd: the Skiff daemon.
//!
//! Single binary that assembles all Skiff subsystems:
//! - Workload repository (redb)
//! - Auth gate and quota engine
//! - Lifecycle orchestrator over the local substrate
//! - Session and snapshot managers
//! - Health aggregator and machine probes
//! - HTTP API
//!
//! # Usage
//!
//! ```text
//! SKIFF_ADMIN_KEY=... skiffd serve --config /etc/skiff/skiff.toml
//! skiffd config --config /etc/skiff/skiff.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use skiff_core::SkiffConfig;

#[derive(Parser)]
#[command(name = "skiffd", about = "Skiff sandbox control plane", version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Serve(Overrides),
    /// Print the effective configuration as TOML and exit.
    Config(Overrides),
}

#[derive(Args)]
struct Overrides {
    /// Path to skiff.toml. Defaults apply when omitted.
    #[arg(long, env = "SKIFF_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding `server.listen`.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Port to listen on, keeping the configured host.
    #[arg(long)]
    port: Option<u16>,

    /// Data directory, overriding `storage.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep all state in memory.
    #[arg(long)]
    in_memory: bool,
}

impl Overrides {
    fn load(self) -> anyhow::Result<SkiffConfig> {
        let mut config = match &self.config {
            Some(path) => SkiffConfig::from_file(path)?,
            None => SkiffConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }
        if let Some(port) = self.port {
            config.server.listen.set_port(port);
        }
        if let Some(data_dir) = self.data_dir {
            config.storage.data_dir = data_dir;
        }
        if self.in_memory {
            config.storage.in_memory = true;
        }
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,skiffd=debug,skiff=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve(overrides) => skiffd::run(overrides.load()?).await,
        Command::Config(overrides) => {
            print!("{}", overrides.load()?.to_toml_string()?);
            Ok(())
        }
    }
}
