//! Caprel - a capture rewrite and replay toolkit
//!
//! This is the main entry point for the caprel command line tool.

mod capture;
mod config;
mod core;
mod history;
mod replay;
mod rules;
mod utils;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};

use crate::config::CaprelConfig;
use crate::core::analyze::{analyze, AnalyzerLimits};
use crate::core::rewrite::RewriteEngine;
use crate::core::stream::{ManipulationResult, PreviewSample, StreamProcessor};
use crate::history::JsonHistory;
use crate::replay::command::ReplayLimits;
use crate::replay::{
    ProgressSubscriber, ProgressUpdate, ReplayManager, ReplayRequest, ReplaySession, ReplayStatus,
    SpeedUnit,
};
use crate::rules::{RuleSet, RuleSpec};
use crate::utils::logger;

/// Command line arguments for caprel
#[derive(Parser, Debug)]
#[clap(
    author = "Caprel Team",
    version,
    about = "Rewrite captured network traffic and replay it onto a live interface"
)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long, default_value = "config/caprel.toml")]
    config: String,

    /// Verbose output
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rewrite a capture file by applying a rule set to every packet
    Rewrite {
        /// Input capture file
        input: PathBuf,

        /// Output capture file
        output: PathBuf,

        /// JSON rule file
        #[clap(short, long)]
        rules: PathBuf,
    },

    /// Preview a rule set against the first packets of a capture
    Preview {
        /// Input capture file
        input: PathBuf,

        /// JSON rule file
        #[clap(short, long)]
        rules: PathBuf,

        /// Number of packets to sample
        #[clap(short, long, default_value_t = 10)]
        samples: usize,
    },

    /// Analyze a capture for endpoints, ports, protocols, and VLAN tags
    Analyze {
        /// Input capture file
        input: PathBuf,

        /// Override the analysis packet ceiling
        #[clap(long)]
        limit: Option<u64>,
    },

    /// Replay a capture onto a live interface
    Replay {
        /// Capture file to replay
        file: PathBuf,

        /// Network interface to send on
        #[clap(short, long)]
        interface: String,

        /// Speed value, interpreted per --speed-unit
        #[clap(short, long)]
        speed: Option<f64>,

        /// Speed unit [multiplier|pps]
        #[clap(long, default_value = "multiplier")]
        speed_unit: String,

        /// Restart the replay on completion until interrupted
        #[clap(long)]
        continuous: bool,
    },

    /// List capture-capable network interfaces
    Interfaces,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    // Load configuration, falling back to defaults when absent.
    let (config, config_note): (CaprelConfig, String) = if Path::new(&args.config).exists() {
        match CaprelConfig::from_file(&args.config) {
            Ok(config) => (config, format!("loaded configuration from {}", args.config)),
            Err(e) => (
                CaprelConfig::default(),
                format!("failed to load configuration ({}), using defaults", e),
            ),
        }
    } else {
        (
            CaprelConfig::default(),
            "configuration file not found, using default configuration".to_string(),
        )
    };

    // Verbosity flags override the configured level.
    let log_level: Level = match args.verbose {
        0 => config.logging.log_level.parse().unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    logger::init_logging(log_level, config.logging.log_file.as_deref());
    info!("{}", config_note);

    match args.command {
        Command::Rewrite {
            input,
            output,
            rules,
        } => run_rewrite(&config, &input, &output, &rules),
        Command::Preview {
            input,
            rules,
            samples,
        } => run_preview(&config, &input, &rules, samples),
        Command::Analyze { input, limit } => run_analyze(&config, &input, limit),
        Command::Replay {
            file,
            interface,
            speed,
            speed_unit,
            continuous,
        } => run_replay(&config, file, interface, speed, &speed_unit, continuous).await,
        Command::Interfaces => run_interfaces(),
    }
}

fn load_rules(path: &Path) -> anyhow::Result<RuleSet> {
    let spec: RuleSpec = RuleSpec::from_json_file(path)
        .with_context(|| format!("loading rule file {}", path.display()))?;
    let rules: RuleSet = spec.validate()?;
    if rules.is_empty() {
        warn!("rule file {} requests no transformations", path.display());
    }
    Ok(rules)
}

fn run_rewrite(
    config: &CaprelConfig,
    input: &Path,
    output: &Path,
    rules_path: &Path,
) -> anyhow::Result<()> {
    let rules: RuleSet = load_rules(rules_path)?;
    let processor = StreamProcessor::new(RewriteEngine::new(), config.rewrite.max_errors);

    let started: Instant = Instant::now();
    let result: ManipulationResult = processor.rewrite_to_file(input, output, &rules)?;

    println!(
        "Processed {} packets ({} modified) in {}",
        result.packets_processed,
        result.packets_modified,
        utils::format_duration(started.elapsed())
    );
    if !result.errors.is_empty() {
        println!("{} packets fell back to their original bytes:", result.errors.len());
        for error in result.errors.iter().take(5) {
            println!("  {}", error);
        }
    }
    println!("Wrote {}", output.display());
    Ok(())
}

fn run_preview(
    config: &CaprelConfig,
    input: &Path,
    rules_path: &Path,
    samples: usize,
) -> anyhow::Result<()> {
    let rules: RuleSet = load_rules(rules_path)?;
    let processor = StreamProcessor::new(RewriteEngine::new(), config.rewrite.max_errors);
    let previews: Vec<PreviewSample> = processor.preview(input, &rules, samples)?;

    if previews.is_empty() {
        println!("No packets in {}", input.display());
        return Ok(());
    }
    for sample in &previews {
        println!("#{:<3} {}", sample.packet_number, sample.original_summary);
        if sample.was_modified {
            println!("  -> {}", sample.modified_summary);
            println!("     before: {}", sample.original_hex);
            println!("     after:  {}", sample.modified_hex);
        } else {
            println!("  -> unchanged");
        }
    }
    let modified: usize = previews.iter().filter(|s| s.was_modified).count();
    println!("{} of {} sampled packets would change", modified, previews.len());
    Ok(())
}

fn run_analyze(config: &CaprelConfig, input: &Path, limit: Option<u64>) -> anyhow::Result<()> {
    let limits = AnalyzerLimits {
        max_packets: limit.unwrap_or(config.analysis.max_packets),
        performance_limit: config.analysis.performance_limit,
    };
    let analysis = analyze(input, &limits)?;

    println!("File:      {}", analysis.file_path.display());
    println!(
        "Format:    {} ({})",
        analysis.file_format,
        utils::format_bytes(analysis.file_size)
    );
    println!("Packets:   {}", analysis.packet_count);
    if let (Some(first), Some(last)) = (analysis.first_timestamp, analysis.last_timestamp) {
        println!(
            "Span:      {:.2}s ({} .. {})",
            analysis.duration_secs,
            first.format("%Y-%m-%d %H:%M:%S"),
            last.format("%Y-%m-%d %H:%M:%S")
        );
        println!(
            "Data rate: {}/s",
            utils::format_bytes(analysis.data_rate as u64)
        );
    }
    println!("Protocols: {}", analysis.protocols.join(", "));
    println!("Addresses: {}", analysis.network_addrs.join(", "));
    println!("MACs:      {}", analysis.link_addrs.join(", "));
    println!(
        "Ports:     {}",
        analysis
            .ports
            .iter()
            .map(|p: &u16| p.to_string())
            .collect::<Vec<String>>()
            .join(", ")
    );
    if !analysis.vlan_ids.is_empty() {
        println!(
            "VLANs:     {}",
            analysis
                .vlan_ids
                .iter()
                .map(|v: &u16| v.to_string())
                .collect::<Vec<String>>()
                .join(", ")
        );
    }
    if let Some(reason) = &analysis.limit_reason {
        println!("Note:      {}", reason);
    }
    Ok(())
}

fn run_interfaces() -> anyhow::Result<()> {
    let interfaces: Vec<String> = capture::list_interfaces()?;
    if interfaces.is_empty() {
        println!("No capture-capable interfaces found");
    }
    for name in interfaces {
        println!("{}", name);
    }
    Ok(())
}

/// Logs throttled progress updates; the transport a deployment would
/// push updates over stays outside the supervisor.
struct ConsoleProgress;

impl ProgressSubscriber for ConsoleProgress {
    fn on_progress(&self, update: &ProgressUpdate) {
        info!(
            "replay progress: {:.0}% ({} packets, {}, loop {})",
            update.progress_percent,
            update.packets_sent,
            utils::format_bytes(update.bytes_sent),
            update.loop_count
        );
    }

    fn on_status(&self, session: &ReplaySession) {
        info!("replay status: {}", session.status);
    }
}

async fn run_replay(
    config: &CaprelConfig,
    file: PathBuf,
    interface: String,
    speed: Option<f64>,
    speed_unit: &str,
    continuous: bool,
) -> anyhow::Result<()> {
    let speed_unit: SpeedUnit = SpeedUnit::try_from(speed_unit)?;
    let request = ReplayRequest {
        file,
        interface,
        speed: speed.unwrap_or(config.replay.default_speed),
        speed_unit,
        continuous,
    };

    // Friendlier feedback when the interface is not visible; tcpreplay
    // still has the final word.
    if let Ok(interfaces) = capture::list_interfaces() {
        if !interfaces.iter().any(|name: &String| name == &request.interface) {
            warn!(
                "interface {} not found among: {}",
                request.interface,
                interfaces.join(", ")
            );
        }
    }

    let manager: ReplayManager = ReplayManager::new(
        config.replay.utility.clone(),
        ReplayLimits {
            max_multiplier: config.replay.max_speed_multiplier,
            max_pps: config.replay.max_pps,
        },
    );
    manager.add_history_sink(Arc::new(JsonHistory::open(&config.replay.history_file)));
    manager.add_subscriber(Arc::new(ConsoleProgress));

    let id = manager.start(request).await?;
    info!("replay session {}", id);

    // Wait for the replay to end, or for Ctrl-C to stop it.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Error setting Ctrl-C handler")?;

    loop {
        tokio::select! {
            _ = rx.recv() => {
                info!("interrupt received, stopping replay");
                manager.stop().await;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }

        if let Some(session) = manager.status() {
            if session.status.is_terminal() {
                println!(
                    "Replay {}: {} packets, {}, {:.2}s, {} loop(s)",
                    session.status,
                    session.packets_sent,
                    utils::format_bytes(session.bytes_sent),
                    session.elapsed_secs,
                    session.loop_count
                );
                if matches!(session.status, ReplayStatus::Failed | ReplayStatus::Error) {
                    anyhow::bail!(
                        "replay did not complete: {}",
                        session.error.unwrap_or_else(|| session.status.to_string())
                    );
                }
                break;
            }
        }
    }

    Ok(())
}
