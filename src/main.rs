//! deej-bridge - Arduino slider box <-> per-application volume
//!
//! Moves OS volumes when sliders move, and moves sliders when volumes change
//! elsewhere.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deej_bridge::arduino::image::{prepare_image, transmit_image};
use deej_bridge::arduino::{ArduinoDriver, DeviceSink};
use deej_bridge::cli::{self, ConsoleCommand};
use deej_bridge::config::{AppConfig, ImageConfig};
use deej_bridge::foreground::ForegroundTracker;
use deej_bridge::keys::platform_key_injector;
use deej_bridge::paths::AppPaths;
use deej_bridge::protocol::{DeviceLine, HostCommand};
use deej_bridge::resolver::Bindings;
use deej_bridge::sync::{SyncEngine, SyncOptions};
use deej_bridge::volume::platform_directory;

/// deej-bridge - sync an Arduino slider box with OS audio sessions
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: detected app directory)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    verbose: bool,

    /// Serial port override
    #[arg(long)]
    port: Option<String>,

    /// Baud rate override
    #[arg(long)]
    baud: Option<u32>,

    /// List available serial ports
    #[arg(long)]
    list_ports: bool,

    /// Run without the interactive console
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let paths = AppPaths::detect();

    if let Err(e) = paths.ensure_directories() {
        eprintln!("[paths] {:#}", e);
    }

    let level = if args.verbose { "debug" } else { args.log_level.as_str() };
    let _log_guard = init_logging(level, &paths)?;

    info!("Starting deej-bridge v{}...", env!("CARGO_PKG_VERSION"));

    if args.list_ports {
        cli::print_ports(&ArduinoDriver::list_ports()?);
        return Ok(());
    }

    let config_path = paths.config_path(args.config.as_deref());
    info!("Configuration file: {}", config_path.display());

    let mut config = AppConfig::load(&config_path.to_string_lossy()).await?;
    if let Some(port) = args.port {
        config.serial.port = port;
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    config.validate().context("Invalid command-line overrides")?;

    run_app(config, !args.no_console, shutdown_signal()).await?;

    info!("deej-bridge shutdown complete");
    Ok(())
}

async fn run_app(
    config: AppConfig,
    console: bool,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let bindings = Arc::new(Bindings::from_config(&config));
    if bindings.bound_sliders().count() == 0 && bindings.buttons().count() == 0 {
        warn!("No usable slider or button mappings; only the console will do anything");
    }

    let directory = platform_directory()?;
    let keys = platform_key_injector();

    let mut arduino = ArduinoDriver::new(&config);
    let sink = arduino.connect().await?;
    let mut device_rx = arduino
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("Failed to get Arduino event receiver"))?;

    let engine = Arc::new(SyncEngine::new(
        bindings.clone(),
        directory,
        sink.clone(),
        keys,
        SyncOptions::from(&config.sync),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = vec![engine.spawn_reconcile_loop(stop_rx.clone())];

    if !bindings.uses_foreground() {
        debug!("No slider follows the focused app, foreground tracker not started");
    } else {
        let tracker = ForegroundTracker::new(engine.clone(), config.sync.foreground_poll());
        tasks.push(tracker.spawn(stop_rx.clone()));
    }

    let (console_tx, mut console_rx) = mpsc::channel::<ConsoleCommand>(16);
    // Held for the loop's lifetime when no console owns the sender
    let _idle_console_tx = if console {
        cli::print_help(&bindings);
        cli::spawn_console(bindings.clone(), console_tx)?;
        None
    } else {
        Some(console_tx)
    };

    info!("Ready to process slider events!");

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(event) = device_rx.recv() => {
                match event.line {
                    DeviceLine::Frame(msg) => {
                        let report = engine.dispatch(&msg).await;
                        debug!(
                            "Frame applied in {:?}: {} writes ok, {} failed",
                            event.timestamp.elapsed(),
                            report.writes_ok,
                            report.writes_failed
                        );
                    }
                    DeviceLine::Ack(text) => debug!("[Arduino] OK: {}", text),
                    DeviceLine::Error(text) => warn!("[Arduino] ERROR: {}", text),
                    DeviceLine::Ready => info!("[Arduino] Ready!"),
                    DeviceLine::Pong => info!("[Arduino] PONG received"),
                    DeviceLine::ImageRequest => match &config.image {
                        Some(image) => {
                            spawn_image_transfer(sink.clone(), image.path.clone(), image)
                        }
                        None => debug!("Image requested but no image configured"),
                    },
                    DeviceLine::Unrecognized(line) => debug!("[Arduino] {}", line),
                }
            }

            Some(command) = console_rx.recv() => {
                match command {
                    ConsoleCommand::Set { slider, percent } => {
                        if let Err(e) = engine.set_slider(slider, percent).await {
                            warn!("{:#}", e);
                        }
                    }
                    ConsoleCommand::Ping => {
                        if let Err(e) = sink.send(&HostCommand::Ping) {
                            warn!("{:#}", e);
                        }
                    }
                    ConsoleCommand::Image(path) => {
                        let image = config
                            .image
                            .clone()
                            .unwrap_or_else(|| ImageConfig::for_path(&path));
                        spawn_image_transfer(sink.clone(), path, &image);
                    }
                    ConsoleCommand::Quit => {
                        info!("Exit requested from console");
                        break;
                    }
                }
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }

    info!("Shutting down...");
    let _ = stop_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }
    arduino.disconnect();

    Ok(())
}

/// Resize and stream an image on a blocking thread
fn spawn_image_transfer(sink: Arc<dyn DeviceSink>, path: PathBuf, image: &ImageConfig) {
    let (width, height, format) = (image.width, image.height, image.format);
    let row_delay = image.row_delay();
    let caption = image.caption.clone();

    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || {
            let prepared = prepare_image(&path, width, height, format)?;
            transmit_image(sink.as_ref(), &prepared, row_delay, caption.as_deref())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Image transfer failed: {:#}", e),
            Err(e) => error!("Image transfer task failed: {}", e),
        }
    });
}

/// Console plus daily rolling file in the logs directory
fn init_logging(level: &str, paths: &AppPaths) -> Result<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::daily(&paths.logs_dir, "deej-bridge.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(file_writer),
        )
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
}
