use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use precall::config::{DiagnosticsConfig, LoggingConfig};
use precall::ice::TraversalMode;
use precall::report::{ReportKey, TestReport};
use precall::selftest::{capture_all, DeviceSnapshot};
use precall::storage::ResultStore;
use precall::transport::{MediaKind, MediaStream, MediaTrack};
use precall::{default_media, Backends, DiagnosticsSuite};

#[derive(Parser)]
#[command(
    name = "precall",
    about = "Pre-call network and media diagnostics",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (falls back to $PRECALL_CONFIG, then ./precall.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    /// Use in-process simulated backends instead of the network
    #[arg(long, global = true)]
    simulate: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Loopback connectivity, one pair per traversal mode
    Connectivity {
        /// Traversal modes to try (all, stun, turn-udp, turn-tcp, turn-tls, relay)
        #[arg(long = "mode")]
        modes: Vec<TraversalMode>,

        /// Run without local media tracks
        #[arg(long)]
        no_media: bool,
    },

    /// Sampled round-trip time and packet loss over a relayed loopback
    Quality {
        /// Send an audio track only
        #[arg(long)]
        audio_only: bool,

        /// Sampling duration in seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Open a signaling socket in every region
    Reachability {
        /// Regions to probe (defaults to the configured list)
        #[arg(long = "region")]
        regions: Vec<String>,
    },

    /// Run connectivity, quality and reachability together
    All {
        /// Quality sampling duration in seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Turn a device snapshot (JSON) into camera, mic and speaker reports
    Devices {
        /// Snapshot file; an empty snapshot is used when omitted
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // The configured level is not known yet; report config loading at the
    // default one.
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&LoggingConfig::default().level))
        .with_writer(std::io::stderr)
        .finish();
    let mut config = tracing::subscriber::with_default(bootstrap, || {
        DiagnosticsConfig::load_or_default(cli.config.as_deref())
    });
    init_tracing(&config, cli.log_json);

    let store = match cli.command {
        Commands::Devices { snapshot } => {
            let snapshot = match snapshot {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read snapshot: {}", path.display()))?;
                    serde_json::from_str::<DeviceSnapshot>(&raw)
                        .with_context(|| format!("failed to parse snapshot: {}", path.display()))?
                }
                None => DeviceSnapshot::default(),
            };
            let store = ResultStore::new();
            capture_all(&store, &snapshot);
            store
        }
        command => {
            if let Commands::Connectivity { modes, .. } = &command {
                if !modes.is_empty() {
                    config.connectivity.modes = modes.clone();
                }
            }
            if let Commands::Reachability { regions } = &command {
                if !regions.is_empty() {
                    config.reachability.regions = regions.clone();
                }
            }
            let backends = if cli.simulate {
                tracing::info!("using simulated backends");
                Backends::simulated()
            } else {
                Backends::live(&config)?
            };
            let suite = DiagnosticsSuite::new(&config, backends);
            start(&suite, command);

            tokio::select! {
                _ = suite.wait_all() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("interrupted, stopping tests");
                    suite.stop_all();
                    suite.wait_all().await;
                }
            }
            suite.store().clone()
        }
    };

    print_reports(&store, cli.json)?;
    Ok(())
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn init_tracing(config: &DiagnosticsConfig, log_json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config.logging.level))
        .with_writer(std::io::stderr);
    if log_json || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn start(suite: &DiagnosticsSuite, command: Commands) {
    let secs = |d: Option<u64>| d.map(Duration::from_secs);
    match command {
        Commands::Connectivity { no_media, .. } => {
            let media = (!no_media).then(default_media);
            suite.connectivity().start(media);
        }
        Commands::Quality {
            audio_only,
            duration,
        } => {
            let media = if audio_only {
                MediaStream::new("precall").with_track(MediaTrack::new("precall-audio", MediaKind::Audio))
            } else {
                default_media()
            };
            suite.quality().start(media, secs(duration));
        }
        Commands::Reachability { .. } => {
            suite.reachability().start();
        }
        Commands::All { duration } => {
            let media = default_media();
            suite.connectivity().start(Some(media.clone()));
            suite.quality().start(media, secs(duration));
            suite.reachability().start();
        }
        Commands::Devices { .. } => {}
    }
}

fn print_reports(store: &ResultStore, json: bool) -> Result<()> {
    let mut reports: Vec<TestReport> = store.snapshot().into_values().collect();
    reports.sort_by_key(TestReport::key);

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    if reports.is_empty() {
        println!("No reports.");
        return Ok(());
    }

    println!("\nPre-call Diagnostics");
    println!("{:<14} | {:<10} | Details", "Test", "Result");
    println!("{:-<14}-|-{:-<10}-|-{:-<40}", "", "", "");
    for report in &reports {
        let key: ReportKey = report.key();
        println!("{:<14} | {:<10} | {}", key.as_str(), report.result_str(), report.summary());
        for error in report.errors() {
            println!("{:<14} | {:<10} |   -> {}", "", "", error.error);
        }
    }
    println!();
    Ok(())
}
