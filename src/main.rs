use clap::Parser;

mod config;
mod device_lock;
mod engine;
mod error;
mod instance_guard;
mod job;
mod logging;
mod notifier;
mod paths;
mod process;
mod processor;
mod queue;
mod watcher;

use engine::Engine;
use error::EngineError;

/// filejobrouter — local, single-host file-driven job dispatch engine.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Directory to start the config.json discovery walk from. Defaults to
    /// the running executable's own location.
    #[arg(long, value_name = "DIR")]
    start_dir: Option<std::path::PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let start = cli
        .start_dir
        .or_else(|| std::env::current_exe().ok())
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    match try_main(&start) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

fn try_main(start: &std::path::Path) -> Result<(), EngineError> {
    let (cfg, root) = config::Config::discover_and_load(start)?;
    let config_path = root.join("config.json");

    // Logging can only be initialised once the config (and therefore the
    // log directory) is known, so startup failures above this point are
    // reported to stderr only.
    let log_dir = paths::log_dir(&cfg.log_directory, &paths::current_user(), paths::today());
    let _log_guard = logging::init(&log_dir).map_err(EngineError::Io)?;

    let engine = Engine::bootstrap(cfg, config_path)?;

    let cancel = engine.cancellation_handle();
    register_shutdown_signals(cancel);

    engine.run();
    Ok(())
}

/// Flips the cancellation token on SIGINT/SIGTERM rather than calling
/// `std::process::exit` directly, so the orderly-shutdown path (Instance
/// Guard removal, device release, Watcher/Notifier teardown) always runs.
fn register_shutdown_signals(cancel: std::sync::Arc<std::sync::atomic::AtomicBool>) {
    for signal in signal_hook::consts::TERM_SIGNALS {
        if let Err(e) = signal_hook::flag::register(*signal, std::sync::Arc::clone(&cancel)) {
            tracing::warn!("failed to register shutdown signal handler: {e}");
        }
    }
}
