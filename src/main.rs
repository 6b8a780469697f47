//! CLI entry point for keytar-chords
//!
//! # Usage
//!
//! Play the built-in mock script and print chords as JSON lines:
//! ```bash
//! keytar-chords run
//! ```
//!
//! Read the real keyboard and send notes to a MIDI port:
//! ```bash
//! keytar-chords run --source device --notes
//! ```
//!
//! Inspect a single report:
//! ```bash
//! keytar-chords decode 000000000080000080
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keytar_chords::config::{KeytarConfig, SourceKind, DEFAULT_CONFIG_PATH};
use keytar_chords::notes::{LogNoteSink, NoteMapper, NoteSink, RawMidiSink};
use keytar_chords::transport::{open_source, parse_hex};
use keytar_chords::{logging, publish, PollLoop};
use keytar_core::decode;
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "keytar-chords")]
#[command(about = "Keytar → MIDI notes and stable chord events", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the keyboard until Ctrl+C (or the end of a replay)
    Run {
        /// Where reports come from
        #[arg(long, value_enum)]
        source: Option<SourceArg>,

        /// Capture file for the replay source
        #[arg(long)]
        path: Option<PathBuf>,

        /// Emit per-key MIDI notes
        #[arg(long)]
        notes: bool,

        /// Announce stable chords
        #[arg(long)]
        chords: bool,

        /// How long a chord must be held, in milliseconds
        #[arg(long)]
        hold_time_ms: Option<u64>,
    },

    /// Decode one hex-encoded report
    Decode {
        /// Report bytes as hex, spaces allowed
        hex: String,
    },

    /// Load, validate and print the effective configuration
    CheckConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    Device,
    Replay,
    Mock,
}

impl From<SourceArg> for SourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Device => SourceKind::Device,
            SourceArg::Replay => SourceKind::Replay,
            SourceArg::Mock => SourceKind::Mock,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = KeytarConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }

    match cli.command {
        Commands::Run {
            source,
            path,
            notes,
            chords,
            hold_time_ms,
        } => {
            if let Some(source) = source {
                config.device.source = source.into();
            }
            if path.is_some() {
                config.device.path = path;
            }
            // Either flag selects exactly the outputs named
            if notes || chords {
                config.notes.enabled = notes;
                config.chords.enabled = chords;
            }
            if let Some(ms) = hold_time_ms {
                config.chords.hold_time_ms = ms;
            }
            run(config).await
        }
        Commands::Decode { hex } => decode_report(&config, &hex),
        Commands::CheckConfig => {
            config.validate()?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run(config: KeytarConfig) -> Result<()> {
    config.validate()?;
    logging::init_from_config(&config)?;

    info!(
        name = %config.application.name,
        source = config.device.source.as_str(),
        "Starting"
    );

    let source = open_source(&config).await?;
    let publisher = publish::open_publisher(&config.publish).await?;
    let note_sink: Option<Box<dyn NoteSink>> = match (&config.notes.midi_out, config.notes.enabled) {
        (Some(path), true) => Some(Box::new(RawMidiSink::open(path).await?)),
        (None, true) => Some(Box::new(LogNoteSink)),
        (_, false) => None,
    };

    let poll = PollLoop::from_config(&config, source, publisher, note_sink)?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let signal_task = tokio::spawn(forward_ctrl_c(signal::ctrl_c(), shutdown_tx));

    let result = poll.run(shutdown_rx).await;
    signal_task.abort();

    let stats = result?;
    info!(stats = %serde_json::to_string(&stats)?, "Done");
    Ok(())
}

/// Request shutdown once `ctrl_c` resolves.
///
/// If the handler cannot be installed the sender is held forever, so the
/// loop keeps running until its source closes.
async fn forward_ctrl_c<F>(ctrl_c: F, shutdown: oneshot::Sender<()>)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match ctrl_c.await {
        Ok(()) => {
            info!("Received Ctrl+C");
            let _ = shutdown.send(());
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl+C; stop with the source instead");
            let _held = shutdown;
            std::future::pending::<()>().await;
        }
    }
}

fn decode_report(config: &KeytarConfig, hex: &str) -> Result<()> {
    let digits: String = hex.split_whitespace().collect();
    let bytes = parse_hex(&digits).map_err(|e| anyhow::anyhow!("invalid report: {}", e))?;
    let active = decode(&bytes)?;
    let mapper = NoteMapper::from_config(&config.notes)?;

    let keys = active.to_sorted_vec();
    println!("active: {}", active);
    println!("notes:  {}", mapper.names(&keys).join(" "));
    Ok(())
}
