use anyhow::{Context, Result};
use clap::Parser;
use rack_discovery::DiscoveryConfig;
use rack_discovery::engine::DiscoveryEngine;
use rack_discovery::remote::FixtureRemote;
use rack_discovery::remote::fixture::FixtureSpec;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, info, warn};

#[derive(Parser)]
#[command(name = "rack-discovery")]
#[command(about = "Reconciles rack-scale inventory from management services")]
struct Cli {
    /// JSON engine configuration; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON description of the remote services to serve from memory
    #[arg(long)]
    fixture: PathBuf,

    /// Let the engine reconcile for this long before printing the summary
    #[arg(long, default_value_t = 5)]
    run_for_secs: u64,

    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => DiscoveryConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DiscoveryConfig::default(),
    };
    let spec = FixtureSpec::from_file(&cli.fixture)
        .with_context(|| format!("loading fixture {}", cli.fixture.display()))?;

    let remote = FixtureRemote::from_spec(&spec);
    let engine = DiscoveryEngine::with_fixture(config, &remote).await?;
    engine.start().await?;

    for service in &spec.services {
        if let Err(err) = engine.on_service_detected(&service.endpoint()).await {
            warn!(service_id = %service.id, error = %err, "service registration failed");
        }
    }

    info!(seconds = cli.run_for_secs, "reconciling");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.run_for_secs)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    let summary = engine.summary().await;
    engine.stop().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
