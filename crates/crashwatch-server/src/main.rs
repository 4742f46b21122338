mod dispatcher;
mod metrics;
mod tail;
#[cfg(test)]
mod test_support;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use crashwatch_core::{
    CancelToken, CrashAnalysisConfig, CrashBackendClient, CrashCountRegistry, CrashServices, Device, DumpKind,
    NoEnrichment, StepTimeCorrelator, TestSession, TicketSink,
};
use crashwatch_portal::{SpoolBackend, StepJournal, TicketJournal};
use dispatcher::CrashDispatcher;
use crate::metrics::init_metrics;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tail::TraceWatch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "crashwatch")]
#[command(about = "Crash correlation and ticketing for set-top box test runs")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a device trace and analyse every crash it reports
    Watch {
        /// Device trace file
        #[arg(long)]
        trace: PathBuf,
        /// Crash portal spool directory
        #[arg(long)]
        spool: PathBuf,
        /// Device MAC address
        #[arg(long)]
        mac: String,
        /// Device model
        #[arg(long)]
        model: String,
        /// Firmware (image) version
        #[arg(long)]
        firmware: String,
        /// Test case being executed
        #[arg(long)]
        test_case: String,
        /// Directory for the ticket and step journals
        #[arg(long)]
        journal_dir: Option<PathBuf>,
        /// Serve Prometheus metrics on this address
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
        /// Read the trace from the beginning instead of its end
        #[arg(long)]
        from_start: bool,
        /// Stop at end of trace instead of waiting for more lines
        #[arg(long)]
        once: bool,
        /// Open tickets for discovered crashes
        #[arg(long)]
        ticketing: bool,
    },
    /// Attribute a crash time to a step of an execution log
    Correlate {
        /// Execution log
        #[arg(long)]
        log: PathBuf,
        #[arg(long)]
        test_case: String,
        #[arg(long)]
        mac: String,
        /// Crash time, e.g. "Fri May 17 14:10:44 UTC 2019"
        #[arg(long)]
        crash_time: Option<String>,
    },
    /// Look up a crash file in the spool
    Lookup {
        #[arg(long)]
        spool: PathBuf,
        /// minidump or coredump
        #[arg(long, value_parser = parse_kind)]
        kind: DumpKind,
        #[arg(long)]
        filename: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Watch {
            trace,
            spool,
            mac,
            model,
            firmware,
            test_case,
            journal_dir,
            metrics_addr,
            from_start,
            once,
            ticketing,
        } => {
            if ticketing {
                config.ticketing_enabled = true;
            }
            let device = Device::new(mac, model, firmware);
            let journal_dir = journal_dir.unwrap_or_else(|| config.output_root.join("crash-journal"));
            let options = WatchOptions {
                trace,
                spool,
                journal_dir,
                metrics_addr,
                from_start,
                follow: !once,
            };
            run_watch(config, device, test_case, options).await?;
        }
        Commands::Correlate {
            log,
            test_case,
            mac,
            crash_time,
        } => {
            run_correlate(&config, &log, &test_case, &mac, crash_time.as_deref()).await?;
        }
        Commands::Lookup { spool, kind, filename } => {
            run_lookup(&config, spool, kind, &filename).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CrashAnalysisConfig> {
    let mut config = match path {
        Some(path) => CrashAnalysisConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => CrashAnalysisConfig::default(),
    };
    config
        .apply_process_env()
        .context("Invalid crash analysis environment")?;
    config.validate().context("Invalid crash analysis config")?;
    Ok(config)
}

struct WatchOptions {
    trace: PathBuf,
    spool: PathBuf,
    journal_dir: PathBuf,
    metrics_addr: Option<SocketAddr>,
    from_start: bool,
    follow: bool,
}

async fn run_watch(
    config: CrashAnalysisConfig,
    device: Device,
    test_case: String,
    options: WatchOptions,
) -> anyhow::Result<()> {
    info!("Starting crash watch for {} on {}", test_case, device.mac);

    if let Some(addr) = options.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus metrics exporter")?;
        info!("Metrics on http://{}/metrics", addr);
    }
    init_metrics();

    let backend: Arc<dyn CrashBackendClient> = Arc::new(SpoolBackend::new(options.spool, config.enabled));
    let reporter = StepJournal::open(options.journal_dir.join("steps.ndjson"))?;
    let tickets: Option<Arc<dyn TicketSink>> = if config.ticketing_enabled {
        Some(Arc::new(TicketJournal::open(options.journal_dir.join("tickets.ndjson"))?))
    } else {
        None
    };

    let dispatcher = CrashDispatcher::start(config.max_concurrent_workers, config.queue_capacity);
    let services = CrashServices {
        backend,
        registry: Arc::new(CrashCountRegistry::new()),
        reporter: Arc::new(reporter),
        tickets,
        hooks: Arc::new(NoEnrichment),
        config: Arc::new(config),
    };
    let session = TestSession::new(device, test_case, Utc::now());
    let watch = TraceWatch::new(session, services)?;

    let stop = CancelToken::new();
    let ctrl_c = {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing running sessions");
                stop.cancel();
            }
        })
    };

    let result = watch
        .run(&options.trace, options.from_start, options.follow, &dispatcher, &stop)
        .await;
    ctrl_c.abort();
    dispatcher.shutdown().await;

    let dispatched = result?;
    info!("Crash watch done, {} sessions", dispatched);
    Ok(())
}

async fn run_correlate(
    config: &CrashAnalysisConfig,
    log: &Path,
    test_case: &str,
    mac: &str,
    crash_time: Option<&str>,
) -> anyhow::Result<()> {
    let correlator = StepTimeCorrelator::new(config.log_offset()?);
    let clean_mac = crashwatch_core::clean_mac(mac);
    let entries = correlator.load(log, test_case, &clean_mac).await;
    info!("{} steps logged for {} on {}", entries.len(), test_case, clean_mac);

    let step = correlator.correlate(crash_time, &entries);
    println!("{}", step);
    Ok(())
}

async fn run_lookup(
    config: &CrashAnalysisConfig,
    spool: PathBuf,
    kind: DumpKind,
    filename: &str,
) -> anyhow::Result<()> {
    let backend = SpoolBackend::new(spool, config.enabled);
    match backend.lookup_by_filename(kind, filename).await? {
        Some(record) => {
            let crashed: Option<DateTime<Utc>> = record.crashed_at().and_then(Result::ok);
            info!("Found {} crashed at {:?}", record.id, crashed);
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        None => {
            error!("{} not known to the {} spool", filename, kind);
            anyhow::bail!("crash file {} not found", filename);
        }
    }
    Ok(())
}

fn parse_kind(s: &str) -> Result<DumpKind, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "minidump" => Ok(DumpKind::Minidump),
        "coredump" => Ok(DumpKind::Coredump),
        other => Err(format!("unknown dump kind '{}'", other)),
    }
}
