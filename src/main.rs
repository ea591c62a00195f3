use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn, LevelFilter};
use mbus2mqtt::bridge::scan::{raw_frame_report, scan, SCAN_ADDRESSES};
use mbus2mqtt::mqtt::Transmission;
use mbus2mqtt::{BridgeContext, Config, MqttManager, PollScheduler, SerialBus};

#[derive(Parser, Debug)]
#[command(name = "mbus2mqtt", version, about = "Publish wired M-Bus meter readings to MQTT")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Scan the bus for devices and exit
    #[arg(short, long)]
    scan: bool,

    /// Print the raw frame of one primary address and exit
    #[arg(short, long, value_name = "ADDRESS")]
    print: Option<u8>,

    /// Configuration file
    #[arg(short, long, env = "CONFFILE", default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = std::env::var("MBUS2MQTT_LOG_LEVEL").unwrap_or("info".to_string());
    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    if cli.debug {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading config {}: {e}", cli.config);
            return ExitCode::FAILURE;
        }
    };
    let bus = Arc::new(SerialBus::new(config.baud_rate));

    if cli.scan {
        scan(&config, bus.as_ref(), SCAN_ADDRESSES).await;
        return ExitCode::SUCCESS;
    }

    if let Some(address) = cli.print {
        return match raw_frame_report(&config, bus.as_ref(), address).await {
            Ok(report) => {
                println!("{report}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Error reading address {address}: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let (mut mqtt, sender) = match MqttManager::connect(&config).await {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to connect to the broker: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut mqtt_thread = tokio::spawn(async move {
        mqtt.start_thread().await;
    });

    let shutdown = sender.clone();
    let context = Arc::new(BridgeContext::new(config, bus, sender));
    let scheduler = PollScheduler::new(context);
    scheduler.publish_autodiscover().await;

    tokio::select! {
        _ = scheduler.run() => {}
        _ = &mut mqtt_thread => {
            error!("MQTT thread exited unexpectedly");
            return ExitCode::FAILURE;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    /* Publish our offline status before the process goes away, a stuck queue must not block the exit */
    let stopped = tokio::time::timeout(Duration::from_secs(2), async move {
        if shutdown.send(Transmission::Shutdown).await.is_ok() {
            let _ = mqtt_thread.await;
        }
    })
    .await;
    if stopped.is_err() {
        warn!("MQTT thread did not stop in time, the broker will publish our last will");
    }
    return ExitCode::SUCCESS;
}
