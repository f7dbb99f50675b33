use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use paneld::Config;
use paneld::SettingsStore;
use paneld::api::HttpService;
use paneld::daemon;
use paneld::daemon::Context;
use paneld::device::Hardware;
use paneld::device::SysfsHardware;
use paneld::input;
use paneld::input::InputReader;
use paneld::mqtt::RumqttcClient;
use paneld::scheduler::Scheduler;
use tokio::sync::mpsc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Wall display interaction and connectivity daemon
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Daemon configuration file (TOML); missing means defaults
    #[arg(short, long, default_value = "paneld.toml")]
    config: PathBuf,

    /// Settings store path, overriding the config file
    #[arg(short, long)]
    settings: Option<PathBuf>,
}

fn init_logging(config: &Config) {
    let mut targets = Targets::new().with_default(LevelFilter::from(config.logging.level));
    for (target, level) in &config.logging.overrides {
        targets = targets.with_target(target.clone(), LevelFilter::from(*level));
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(targets)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_logging(&config);

    tracing::info!("paneld {} starting", env!("CARGO_PKG_VERSION"));

    let settings_path = args.settings.unwrap_or_else(|| config.settings_path());
    let settings = SettingsStore::open(&settings_path)
        .with_context(|| format!("opening settings {}", settings_path.display()))?;
    tracing::info!("Loaded settings from {}", settings_path.display());

    let hardware: Arc<dyn Hardware> = Arc::new(SysfsHardware::new(config.hardware.clone()));
    let ctx = Context::new(
        &config,
        Arc::new(settings),
        hardware,
        Box::new(RumqttcClient::new()),
    );

    let http = Arc::new(HttpService::new(
        config.http.listen.clone(),
        config.http.port,
        Arc::clone(&ctx),
    ));
    let bus_task = tokio::spawn(daemon::run_bus(
        Arc::clone(&ctx),
        Some(Arc::clone(&http)),
        ctx.bus.subscribe(),
    ));

    ctx.sensors.start();

    let (key_tx, key_rx) = mpsc::unbounded_channel();
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let reader = InputReader::new(&config.input.device_dir);
    let sources = reader.start(key_tx);
    tracing::info!(
        "Reading {} input sources from {}",
        sources,
        config.input.device_dir.display()
    );
    tokio::spawn(input::run_gestures(key_rx, input_tx));
    tokio::spawn(daemon::handle_input(Arc::clone(&ctx), input_rx));

    let scheduler = Scheduler::start(&ctx);

    ctx.session.check_config_and_connect().await;
    ctx.actuation.on_settings_changed().await;
    http.reconcile().await;

    tracing::info!("Press Ctrl+C to exit");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received shutdown signal");
        }
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    reader.stop().await;
    scheduler.cancel();
    ctx.session.disconnect().await;
    ctx.sensors.stop();
    http.stop().await;
    bus_task.abort();

    tracing::info!("paneld shutdown complete");

    Ok(())
}
