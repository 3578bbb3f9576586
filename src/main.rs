use clap::Parser;
use gmem::cli::{self, Cli, Command};
use gmem::s5_supervisor::{self, SupervisorOptions};
use gmem::{GmemError, s3_daemon, s5_config};
use std::process::ExitCode;
use std::time::Duration;

fn init_logging() {
    let filter = std::env::var("GMEM_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".into());
    env_logger::Builder::new()
        .parse_filters(&filter)
        .format_timestamp_millis()
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime, GmemError> {
    Ok(tokio::runtime::Builder::new_multi_thread().enable_all().build()?)
}

fn run() -> Result<(), GmemError> {
    let cli = Cli::parse();
    let path = cli::config_file(&cli);

    let load = || s5_config::load_config_from(&path);

    match &cli.command {
        Command::Daemon => {
            let config = load()?;
            let rt = runtime()?;
            let result = rt.block_on(s3_daemon::run_daemon(config, Some(path.clone())));
            // Abandoned store calls must not hold the process past its grace period.
            rt.shutdown_timeout(Duration::from_millis(200));
            result
        }
        Command::Supervise => {
            let opts = SupervisorOptions::for_current_exe(path.clone())?;
            runtime()?.block_on(s5_supervisor::run_supervisor(opts, s3_daemon::wait_for_signal()))
        }
        Command::Enable => cli::handle_toggle(&path, true),
        Command::Disable => cli::handle_toggle(&path, false),
        Command::Status => cli::handle_status(&load()?),
        Command::Sync(args) => cli::handle_sync(&load()?, args),
        Command::Failed(args) => cli::handle_failed(&load()?, args),
        Command::Service { action } => cli::handle_service(action),
        Command::Resolve { path } => cli::handle_resolve(&load()?, path),
    }
}

fn main() -> ExitCode {
    init_logging();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gmem: {e}");
            ExitCode::from(1)
        }
    }
}
