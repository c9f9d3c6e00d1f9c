// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Noise Buster - Noise Event Monitor
//!
//! Watches a sound level meter and reports loud events to storage,
//! home automation and notification services.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use std::path::PathBuf;

use noisebuster::{build_info, build_sinks, Config, Engine, Sampler, VERSION};

/// Noise Buster - Noise Event Monitor
#[derive(Parser, Debug)]
#[command(name = "noisebuster")]
#[command(author = "Noise Buster Project")]
#[command(version = VERSION)]
#[command(about = "Sound level event detection with resilient multi-sink delivery")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// Demo mode with a simulated meter
    #[arg(long)]
    demo: bool,

    /// Override the event threshold (dB)
    #[arg(long)]
    threshold: Option<f64>,

    /// MQTT broker address
    #[arg(long)]
    mqtt_broker: Option<String>,

    /// Data output directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_create(&config_path)?;

    let log_level = if args.trace {
        Level::TRACE
    } else if args.debug {
        Level::DEBUG
    } else {
        config.max_log_level()
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let build = build_info();
    info!("Noise Buster v{} ({}/{})", build.version, build.os, build.target);

    if args.demo {
        config.demo_mode = true;
    }
    if let Some(threshold) = args.threshold {
        config.detection.threshold_db = threshold;
    }
    if let Some(data_dir) = args.data_dir {
        config.sinks.sqlite.path = data_dir.join("noisebuster.db");
        config.camera.image_save_path = data_dir.join("images");
        config.data_dir = data_dir;
    }
    if let Some(broker) = args.mqtt_broker {
        config.sinks.mqtt.enabled = true;
        config.sinks.mqtt.broker = broker;
    }

    info!("Configuration loaded from {:?}", config_path);
    info!("Demo mode: {}", config.demo_mode);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let sinks = build_sinks(&config).await?;
    let meter = Sampler::meter_from_config(&config.device, config.demo_mode);

    let mut engine = Engine::new(config).await?;
    info!("Outputs: {}", engine.config.sinks.enabled_names().join(", "));

    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, cleaning up...");
            let _ = shutdown.send(());
        }
    });

    info!("Noise Buster running, press Ctrl+C to stop");
    let result = engine.run(meter, sinks).await;

    let state = engine.state().await;
    info!(
        "{} event(s) from {} sample(s), {} delivery failure(s)",
        state.total_events, state.total_samples, state.delivery_failures
    );

    if let Err(e) = &result {
        error!("Noise Buster stopped: {}", e);
    } else {
        info!("Noise Buster shutdown complete");
    }
    result
}
