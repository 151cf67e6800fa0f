//! netsentry: live network traffic monitor with three detection layers.
//!
//! Every captured packet passes through rule-based protocol-error checks,
//! sliding-window behavioral detection (port scans, host scans, floods),
//! and an unsupervised statistical outlier model trained online from the
//! first packets of a session, and comes out tagged `normal`, `anomaly`,
//! or `danger`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────┐     ┌─────────────┐
//! │   Capture    │────>│    Detection     │────>│   Console   │
//! │   (pcap)     │     │    Pipeline      │ ch  │  consumer   │
//! └──────────────┘     └──────────────────┘     └─────────────┘
//!        one dedicated thread, synchronous          async
//! ```
//!
//! Capture and classification are deliberately serialized on one thread:
//! each packet is fully classified (including a potential model fit) before
//! the next is read. The consumer drains an unbounded ordered channel, so
//! display order always equals capture order.

mod behavior;
mod capture;
mod config;
mod discover;
mod error;
mod features;
mod forest;
mod model;
mod packet;
mod pipeline;
mod stats;

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::capture::PacketCapture;
use crate::config::Config;
use crate::error::CaptureError;
use crate::model::AnomalyDetector;
use crate::pipeline::{ClassifiedPacket, DetectionPipeline};
use crate::stats::SessionStats;

/// netsentry: classify live traffic as normal, anomalous, or dangerous.
#[derive(Parser, Debug)]
#[command(name = "netsentry")]
#[command(version = "0.1.0")]
#[command(about = "Network monitor with rule-based, behavioral, and statistical detection")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture live traffic and classify every packet.
    Capture {
        /// Network interface to capture on (default: auto-detect).
        #[arg(short, long)]
        interface: Option<String>,

        /// BPF filter expression (e.g. "tcp port 443").
        #[arg(short, long)]
        filter: Option<String>,

        /// Path to a TOML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Restrict output to packets involving these IPs (repeatable).
        /// Detection state still observes all traffic.
        #[arg(short, long)]
        target: Vec<IpAddr>,

        /// Ignore a previously saved model and train from scratch.
        #[arg(long)]
        fresh_model: bool,

        /// Output format: text, jsonl.
        #[arg(short, long, default_value = "text")]
        output: String,

        /// Enable verbose logging.
        #[arg(short, long)]
        verbose: bool,
    },

    /// List available network interfaces.
    ListInterfaces,

    /// Discover live hosts in a range via ARP sweep.
    Discover {
        /// CIDR range to sweep, e.g. 192.168.1.0/24.
        #[arg(short, long)]
        range: String,

        /// Interface to sweep on.
        #[arg(short, long)]
        interface: String,

        /// Seconds to wait for replies after the sweep.
        #[arg(short, long, default_value = "3")]
        timeout: u64,
    },

    /// Run the full detection pipeline over a PCAP file (offline mode).
    Analyze {
        /// Path to the PCAP file.
        #[arg(short, long)]
        file: String,

        /// Path to a TOML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Restrict output to packets involving these IPs (repeatable).
        #[arg(short, long)]
        target: Vec<IpAddr>,

        /// Output format: text, jsonl.
        #[arg(short, long, default_value = "text")]
        output: String,

        /// Enable verbose logging.
        #[arg(short, long)]
        verbose: bool,
    },

    /// Delete the persisted model artifacts, forcing retraining.
    ClearModel {
        /// Path to a TOML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Capture {
            interface,
            filter,
            config,
            target,
            fresh_model,
            output,
            verbose,
        } => {
            init_logging(verbose)?;
            let mut cfg = Config::load_or_default(config.as_deref());
            if interface.is_some() {
                cfg.capture.interface = interface;
            }
            if filter.is_some() {
                cfg.capture.filter = filter;
            }
            cfg.validate()?;
            run_capture(cfg, target.into_iter().collect(), fresh_model, &output).await
        }

        Commands::ListInterfaces => {
            let devices = capture::list_devices()?;
            println!("Available network interfaces:\n");
            for device in devices {
                let desc = device
                    .desc
                    .as_ref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default();
                println!("  {}{}", device.name, desc);
                for addr in &device.addresses {
                    println!("    - {}", addr.addr);
                }
            }
            Ok(())
        }

        Commands::Discover {
            range,
            interface,
            timeout,
        } => {
            init_logging(false)?;
            let hosts =
                discover::discover_hosts(&range, &interface, Duration::from_secs(timeout))?;
            if hosts.is_empty() {
                println!("No hosts answered in {}", range);
            } else {
                println!("{:<18} MAC", "IP");
                for host in &hosts {
                    println!("{:<18} {}", host.ip, host.mac);
                }
                println!("\n{} hosts discovered", hosts.len());
            }
            Ok(())
        }

        Commands::Analyze {
            file,
            config,
            target,
            output,
            verbose,
        } => {
            init_logging(verbose)?;
            let cfg = Config::load_or_default(config.as_deref());
            cfg.validate()?;
            run_offline_analysis(&file, cfg, target.into_iter().collect(), &output)
        }

        Commands::ClearModel { config } => {
            let cfg = Config::load_or_default(config.as_deref());
            AnomalyDetector::clear_persisted(
                Path::new(&cfg.model.model_path),
                Path::new(&cfg.model.stats_path),
            );
            println!(
                "Removed model artifacts ({}, {})",
                cfg.model.model_path, cfg.model.stats_path
            );
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    // Logs go to stderr so stdout stays clean for packet lines and JSONL.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Live capture session: spawn the capture/classification thread, drain
/// classified packets until Ctrl+C, then save the model and print totals.
async fn run_capture(
    cfg: Config,
    targets: HashSet<IpAddr>,
    fresh_model: bool,
    output: &str,
) -> Result<()> {
    info!("starting netsentry capture...");

    let stats = SessionStats::new();
    let mut pipeline = DetectionPipeline::new(&cfg, targets, stats.clone());

    let model_path = PathBuf::from(&cfg.model.model_path);
    let stats_path = PathBuf::from(&cfg.model.stats_path);
    if !fresh_model && pipeline.model_mut().load(&model_path, &stats_path) {
        info!("resumed previously trained model; classifying immediately");
    } else {
        let (_, target) = pipeline.model().training_progress();
        info!("model untrained; first {} packets will be used for training", target);
    }

    let capture = PacketCapture::new(cfg.capture.clone());
    let shutdown = capture.shutdown_handle();
    let (mut rx, handle) = match capture.start(pipeline) {
        Ok(started) => started,
        Err(e) => {
            if let Some(CaptureError::PermissionDenied { .. }) = e.downcast_ref::<CaptureError>() {
                error!("{}", e);
            }
            return Err(e);
        }
    };
    info!("packet capture started; press Ctrl+C to stop");

    let jsonl = output.eq_ignore_ascii_case("jsonl") || output.eq_ignore_ascii_case("json");

    loop {
        tokio::select! {
            maybe_packet = rx.recv() => {
                match maybe_packet {
                    Some(classified) => {
                        if stats.take_training_complete() {
                            println!("--- statistical model trained; packets are now classified ---");
                        }
                        print_packet(&classified, jsonl);
                    }
                    // Channel closed: the capture thread is gone.
                    None => break,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping capture...");
                shutdown.store(true, Ordering::Relaxed);
            }
        }
    }

    // Get the pipeline (and its model) back from the capture thread.
    let (pipeline, session_result) = tokio::task::spawn_blocking(move || handle.join())
        .await?
        .map_err(|_| anyhow::anyhow!("capture thread panicked"))?;

    if let Err(e) = pipeline
        .model()
        .save_if_trained(&model_path, &stats_path)
    {
        warn!("could not save model (continuing with in-memory state): {}", e);
    }

    println!("\nSession summary: {}", stats.summary());

    session_result.map_err(Into::into)
}

/// Offline mode: replay a PCAP file through the same pipeline.
fn run_offline_analysis(
    file: &str,
    cfg: Config,
    targets: HashSet<IpAddr>,
    output: &str,
) -> Result<()> {
    use pcap::Capture;

    println!("Analyzing PCAP file: {}", file);

    let stats = SessionStats::new();
    let mut pipeline = DetectionPipeline::new(&cfg, targets, stats.clone());
    pipeline.start_session();

    let mut cap = Capture::from_file(file).context("Failed to open PCAP file")?;
    let jsonl = output.eq_ignore_ascii_case("jsonl") || output.eq_ignore_ascii_case("json");

    while let Ok(packet) = cap.next_packet() {
        let timestamp = capture::timeval_to_datetime(packet.header.ts);
        if let Some(classified) = pipeline.process(packet.data, timestamp) {
            if stats.take_training_complete() {
                println!("--- statistical model trained; packets are now classified ---");
            }
            print_packet(&classified, jsonl);
        }
    }

    println!("\nSession summary: {}", stats.summary());
    Ok(())
}

fn print_packet(classified: &ClassifiedPacket, jsonl: bool) {
    if jsonl {
        match serde_json::to_string(classified) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("failed to serialize packet {}: {}", classified.sequence_id, e),
        }
        return;
    }

    println!(
        "[{:<7}] #{:<6} {} {}",
        classified.severity.label(),
        classified.sequence_id,
        classified.timestamp.format("%H:%M:%S%.3f"),
        classified.summary,
    );
    if let Some(finding) = &classified.rule_finding {
        println!("          rule: {}", finding);
    }
    if let Some(finding) = &classified.behavior_finding {
        println!("          behavior: {}", finding);
    }
}
