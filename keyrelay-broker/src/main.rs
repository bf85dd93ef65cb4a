use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process;

use keyrelay_broker::config::ServiceConfig;
use keyrelay_broker::telemetry;

#[derive(Parser)]
#[command(name = "keyrelay-broker", about = "Secrets broker HTTP service")]
struct BrokerArgs {
    /// Path to the service configuration file
    #[arg(long)]
    config: PathBuf,
    /// Override the configured bind address
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("broker exited with error: {err:#}");
        process::exit(1);
    }
}

async fn real_main() -> anyhow::Result<()> {
    telemetry::init()?;

    let args = BrokerArgs::parse();
    let mut config = ServiceConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen.parse().context("invalid --listen address")?;
    }

    keyrelay_broker::run(config).await
}
