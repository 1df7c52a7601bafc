use lscov_core::config::LscovConfig;
use lscov_core::session::Session;

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Output path for the coverage time series.
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// Seconds between tally snapshots.
    #[clap(long)]
    period_secs: Option<u64>,
    /// Bloom filter size in bytes.
    #[clap(long)]
    filter_size_bytes: Option<usize>,
    /// Number of hash functions per fingerprint.
    #[clap(long)]
    num_hashes: Option<u32>,
    /// Error-bound percentage in the report (0 disables bound columns).
    #[clap(long)]
    error_percent: Option<u8>,
}

/// Set by the signal handler, observed by the session loop. The handler
/// itself does nothing else: the final tally and IPC teardown must not run
/// in handler context.
static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_sig: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<(), anyhow::Error> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = request_stop as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);

        for signal in [libc::SIGINT, libc::SIGHUP, libc::SIGTERM] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                anyhow::bail!(
                    "failed to install handler for signal {signal}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            info!("loading configuration from {config_path:?}");
            LscovConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("lscov.toml");
            if default_config_path.exists() {
                info!("no config file specified, loading default {default_config_path:?}");
                LscovConfig::load_from_file(&default_config_path)?
            } else {
                LscovConfig::default()
            }
        }
    };

    if let Some(output) = cli.output {
        config.output_path = output;
    }
    if let Some(period_secs) = cli.period_secs {
        config.tally_period_secs = period_secs;
    }
    if let Some(filter_size_bytes) = cli.filter_size_bytes {
        config.filter_size_bytes = filter_size_bytes;
    }
    if let Some(num_hashes) = cli.num_hashes {
        config.num_hashes = num_hashes;
    }
    if let Some(error_percent) = cli.error_percent {
        config.error_percent = error_percent;
    }
    config.validate()?;

    info!(
        "lscov daemon v{} (period: {}s, filter: {} bytes, hashes: {})",
        env!("CARGO_PKG_VERSION"),
        config.tally_period_secs,
        config.filter_size_bytes,
        config.num_hashes
    );

    install_signal_handlers()?;

    let mut session = Session::new(&config)?;
    session.run(&STOP)?;

    info!("measurement stopped");
    Ok(())
}
