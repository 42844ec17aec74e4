use anyhow::Result;
use clap::Parser;
use maplecam::{SentinelConfig, SentinelOrchestrator};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "maplecam")]
#[command(about = "In-vehicle monitoring appliance: evidence capture, telemetry and geofencing")]
#[command(version)]
#[command(long_about = "Continuously records camera evidence in rotating segments, tracks GPS \
telemetry with a simulation fallback, evaluates time-windowed enforcement zones, and guards \
against vehicle power loss with a debounced shutdown sentinel. Designed for Raspberry Pi \
hardware and systemd service management.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "maplecam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the system")]
    validate_config: bool,

    /// Print the effective configuration and exit
    #[arg(long, help = "Print the effective configuration in TOML format and exit")]
    print_config: bool,

    /// Dry run mode - set up components but don't start them
    #[arg(long, help = "Perform dry run - set up components but don't start them")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match SentinelConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    // Any invalid value aborts startup; a half-configured appliance on the
    // road is worse than one that refuses to boot.
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    if args.validate_config {
        println!("Configuration is valid");
        return Ok(());
    }

    if args.dry_run {
        dry_run(&config)?;
        println!("Dry run completed successfully");
        return Ok(());
    }

    info!("Starting MapleCam Sentinel v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let orchestrator = SentinelOrchestrator::new(config);
    let exit_code = orchestrator.run(CancellationToken::new()).await.map_err(|e| {
        error!("System error during execution: {}", e);
        e
    })?;

    info!("MapleCam Sentinel exited with code {}", exit_code);

    // Exit with the orchestrator's verdict for systemd
    std::process::exit(exit_code);
}

/// Exercise the fallible setup paths without touching hardware or starting
/// any component.
fn dry_run(config: &SentinelConfig) -> Result<()> {
    let recording_dir = std::path::PathBuf::from(&config.recording.directory);
    maplecam::evidence::ensure_recording_dir(&recording_dir)?;
    maplecam::GeofenceEvaluator::from_config(&config.zones, &config.schedule)?;
    info!("Dry run: configuration, recording directory and zones all check out");
    Ok(())
}

fn init_logging(args: &Args) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("maplecam={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}
