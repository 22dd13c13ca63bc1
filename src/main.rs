use anyhow::Result;
use clap::Parser;
use pulse_guard::audio::list_input_devices;
use pulse_guard::{activity_log, Config};
use std::path::PathBuf;
use tracing::{error, info};

/// Vital-sign anomaly escalation with a voice check-in
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file (defaults to ~/.pulseguard/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for the measurement feed
    #[arg(long)]
    ingest_port: Option<u16>,

    /// Port for the HTTP status surface
    #[arg(long)]
    http_port: Option<u16>,

    /// List available input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Write the default config to the config path and exit
    #[arg(long)]
    write_default_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    activity_log::init_logging(&Config::log_dir()?, args.verbose)?;

    if args.list_devices {
        return list_devices_and_exit();
    }

    if args.write_default_config {
        let path = match &args.config {
            Some(path) => path.clone(),
            None => Config::config_path()?,
        };
        Config::default().save_to(&path)?;
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }

    let mut config = Config::load_or_default(args.config.as_deref());
    if let Some(port) = args.ingest_port {
        config.network.ingest_port = port;
    }
    if let Some(port) = args.http_port {
        config.network.http_port = port;
    }

    info!(
        "Thresholds: HR {}-{} bpm, BR {}-{} /min, {}s sustained, {}s cooldown",
        config.thresholds.pulse_min,
        config.thresholds.pulse_max,
        config.thresholds.breathing_min,
        config.thresholds.breathing_max,
        config.thresholds.abnormal_duration_secs,
        config.thresholds.alert_cooldown_secs
    );

    pulse_guard::run(config).await
}

fn list_devices_and_exit() -> Result<()> {
    println!("Available input devices:\n");

    match list_input_devices() {
        Ok(devices) => {
            if devices.is_empty() {
                println!("  No input devices found.");
            } else {
                for device in devices {
                    let default_marker = if device.is_default { " (default)" } else { "" };
                    println!("  - {}{}", device.name, default_marker);
                }
            }
        }
        Err(e) => {
            error!("Failed to list devices: {}", e);
            println!("  Error: {}", e);
        }
    }

    Ok(())
}
