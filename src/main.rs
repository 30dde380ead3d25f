use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use twinview::config::{self, AppConfig, CaptureSource, LedConfig};
use twinview::events::{EventBus, SystemEvent};
use twinview::state::{RunContext, SharedState};
use twinview::stream::{ReceiveLoop, SendLoop, SendTiming, ViewSelector};
use twinview::tools;
use twinview::transport::{ChannelConfig, DuplexChannel};
use twinview::video::{FrameSource, JpegCodec, TestPatternSource, V4l2Source};
use twinview::web::{self, AppState};
use twinview::worker::{self, ProcessLauncher, SupervisorConfig, WorkerLauncher, WorkerSupervisor};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Verbose => "verbose",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// twinview command line arguments
#[derive(Parser, Debug)]
#[command(name = "twinview")]
#[command(version, about = "Symmetric peer video mirror with liveness failover", long_about = None)]
struct CliArgs {
    /// Config file path (default: twinview.toml, or $TWINVIEW_CONFIG)
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Publish port (overrides config)
    #[arg(long, value_name = "PORT", global = true)]
    local_port: Option<u16>,

    /// Peer host (overrides config)
    #[arg(long, value_name = "HOST", global = true)]
    remote_host: Option<String>,

    /// Peer port (overrides config)
    #[arg(long, value_name = "PORT", global = true)]
    remote_port: Option<u16>,

    /// Do not launch the LED worker
    #[arg(long, global = true)]
    no_worker: bool,

    /// Do not start the preview server
    #[arg(long, global = true)]
    no_preview: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream to and from the peer (default)
    Run,
    /// LED worker process, launched by the supervisor
    #[command(hide = true)]
    Worker {
        /// LED configuration as JSON
        #[arg(long, value_name = "JSON")]
        leds: String,
    },
    /// Check interfaces, peer resolution and peer port reachability
    Diagnose,
    /// Exchange test messages with the peer and report
    Probe {
        /// Probe duration
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let level = effective_level(args.log_level, args.verbose);
    init_logging(level);

    // The worker takes its configuration from the parent, not the file
    if let Some(Command::Worker { leds }) = &args.command {
        let leds: LedConfig = serde_json::from_str(leds)?;
        worker::run_worker(leds).await?;
        return Ok(());
    }

    let config_path = config::resolve_config_path(args.config.clone());
    let mut config = config::load_config(&config_path).await?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    match args.command {
        Some(Command::Diagnose) => {
            let report = tools::run_diagnostics(&config).await;
            print!("{}", report.render(&config));
            std::process::exit(report.exit_code());
        }
        Some(Command::Probe { seconds }) => {
            let ctx = new_context();
            spawn_signal_handler(ctx.clone())?;
            let channel = ChannelConfig::from_app(&config)?;
            match tools::run_probe(&channel, Duration::from_secs(seconds), &ctx).await? {
                Some(report) => {
                    println!(
                        "sent={} received={} errors={}: {}",
                        report.sent,
                        report.received,
                        report.errors,
                        if report.passed() { "PASS" } else { "FAIL" }
                    );
                    if !report.passed() {
                        std::process::exit(1);
                    }
                }
                None => {
                    println!("Interrupted before the peer was reachable");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Some(Command::Run) | None => run(config, level).await,
        Some(Command::Worker { .. }) => Ok(()),
    }
}

async fn run(config: AppConfig, level: LogLevel) -> anyhow::Result<()> {
    tracing::info!("Starting twinview v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Publishing on {}:{}, peer at {}",
        config.local.bind_address,
        config.local.port,
        config.remote.address()
    );

    let ctx = new_context();
    spawn_signal_handler(ctx.clone())?;

    // Failing to bind the publish port is fatal
    let channel = DuplexChannel::open(&ChannelConfig::from_app(&config)?)?;
    let publisher = channel.publisher();
    ctx.events().publish(SystemEvent::PublisherBound {
        port: publisher.local_addr().port(),
    });

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let source = open_source(&config)?;
    let send_loop = SendLoop::new(
        ctx.clone(),
        publisher.clone(),
        source,
        Box::new(JpegCodec::new(config.stream.jpeg_quality)?),
        SendTiming::from(&config.stream),
    );
    tasks.push(tokio::spawn(send_loop.run()));

    let receive_loop = ReceiveLoop::new(
        ctx.clone(),
        channel,
        Box::new(JpegCodec::new(config.stream.jpeg_quality)?),
        ViewSelector::new(config.stream.freshness()),
        config.stream.receive_timeout(),
    );
    tasks.push(tokio::spawn(receive_loop.run()));

    let mut worker_status = None;
    if config.worker.enabled {
        let launcher: Arc<dyn WorkerLauncher> = Arc::new(match &config.worker.program {
            Some(program) => ProcessLauncher::for_worker(program, &config.leds, level.as_str())?,
            None => ProcessLauncher::current_exe(&config.leds, level.as_str())?,
        });
        let supervisor = WorkerSupervisor::new(
            ctx.clone(),
            launcher,
            SupervisorConfig::from(&config.worker),
        );
        worker_status = Some(supervisor.status());
        tasks.push(tokio::spawn(supervisor.run()));
    } else {
        tracing::info!("LED worker disabled");
    }

    if config.preview.enabled {
        let bind: SocketAddr = config
            .preview
            .bind
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid preview bind address: {}", config.preview.bind))?;
        let mut state = AppState::new(ctx.clone(), config.stream.fps, config.remote.address())
            .with_publisher(publisher.clone());
        if let Some(status) = worker_status {
            state = state.with_worker(status);
        }
        tasks.push(tokio::spawn(async move {
            // The stream keeps running without a preview
            if let Err(e) = web::serve(bind, Arc::new(state)).await {
                tracing::error!("Preview server failed: {}", e);
            }
        }));
    }

    ctx.stopped().await;
    tracing::info!("Shutting down");
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Task failed during shutdown: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn new_context() -> RunContext {
    RunContext::new(
        Arc::new(SharedState::with_defaults()),
        Arc::new(EventBus::new()),
    )
}

fn open_source(config: &AppConfig) -> anyhow::Result<Box<dyn FrameSource>> {
    let capture = &config.capture;
    Ok(match capture.source {
        CaptureSource::TestPattern => Box::new(TestPatternSource::new(
            capture.width,
            capture.height,
            capture.detection_threshold,
        )),
        CaptureSource::V4l2 => Box::new(V4l2Source::open(
            &capture.device,
            capture.width,
            capture.height,
            capture.detection_threshold,
        )?),
    })
}

fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(port) = args.local_port {
        config.local.port = port;
    }
    if let Some(host) = &args.remote_host {
        config.remote.host = host.clone();
    }
    if let Some(port) = args.remote_port {
        config.remote.port = port;
    }
    if args.no_worker {
        config.worker.enabled = false;
    }
    if args.no_preview {
        config.preview.enabled = false;
    }
}

/// Stop the run context on Ctrl+C or SIGTERM
fn spawn_signal_handler(ctx: RunContext) -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
            }
            _ = term.recv() => {}
        }
        tracing::info!("Shutdown signal received");
        ctx.stop();
    });
    Ok(())
}

fn effective_level(level: LogLevel, verbose_count: u8) -> LogLevel {
    // Verbose count overrides log level
    match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

fn init_logging(level: LogLevel) {
    let filter = match level {
        LogLevel::Error => "twinview=error,tower_http=error",
        LogLevel::Warn => "twinview=warn,tower_http=warn",
        LogLevel::Info => "twinview=info,tower_http=info",
        LogLevel::Verbose => "twinview=debug,tower_http=info",
        LogLevel::Debug => "twinview=debug,tower_http=debug",
        LogLevel::Trace => "twinview=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
