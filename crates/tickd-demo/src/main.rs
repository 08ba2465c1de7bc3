mod config;
mod error;
mod stdin;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use clap::Parser;
use tickd::signals::UserSignalHandler;
use tickd::{PollStatus, Runtime, Signal, Timer, TimerAction, TimerProperties};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use crate::config::{DemoConfig, TimerSpec};
use crate::error::DemoError;
use crate::stdin::CommandReader;

/// Set from the SIGUSR1 handler, drained by the main loop.
static STATUS_REQUESTED: AtomicBool = AtomicBool::new(false);

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "tickd-demo", version)]
struct Cli {
    /// YAML config file (built-in heartbeat timer when omitted)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Maximum log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
    /// Do not read commands from stdin
    #[arg(long)]
    no_stdin: bool,
}

/// Initialize tracing with a tee writer (stderr + rolling log file).
///
/// The returned guard must outlive the main loop so buffered lines are
/// flushed on exit.
fn init_tracing_with_file(
    dir: &Path,
    name: &str,
    level: tracing::Level,
) -> Result<tracing_appender::non_blocking::WorkerGuard, DemoError> {
    std::fs::create_dir_all(dir)?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(name)
        .filename_suffix("log")
        .max_log_files(7)
        .build(dir)
        .map_err(|e| DemoError::Logging(format!("{}: {e}", dir.display())))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let writer = std::io::stderr.and(non_blocking);

    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_max_level(level)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}

fn init_tracing_stderr(level: tracing::Level) {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn request_status(_: Signal) {
    STATUS_REQUESTED.store(true, Ordering::SeqCst);
}

fn spawn_timer<E>(runtime: &mut Runtime<E>, spec: &TimerSpec) -> Result<Timer, DemoError> {
    let name = spec.name.clone();
    let max_fires = spec.max_fires;
    let mut fires = 0u32;
    let on_expire = move || {
        fires = fires.saturating_add(1);
        tracing::info!(timer = %name, fires, "timer fired");
        if max_fires.is_some_and(|max| fires >= max) {
            TimerAction::Release
        } else {
            TimerAction::Continue
        }
    };

    let properties = if spec.repeat {
        TimerProperties::repeating(spec.interval(), on_expire)
    } else {
        TimerProperties::once(spec.interval(), on_expire)
    };
    let released = spec.name.clone();
    let timer = runtime.timer(
        properties.on_released(move || tracing::debug!(timer = %released, "timer released")),
    )?;
    tracing::debug!(
        timer = %spec.name,
        interval_ms = spec.interval_ms,
        repeat = spec.repeat,
        "timer started"
    );
    Ok(timer)
}

fn run(cli: &Cli, config: DemoConfig) -> Result<(), DemoError> {
    tracing::info!(version = %tickd::version(), name = %config.name, "starting");

    let mut runtime = Runtime::init(config.runtime_config(), config.name.clone())?;
    let handler: UserSignalHandler = request_status;
    runtime.set_signal_handler(Signal::SIGUSR1, Some(handler))?;
    // SIGUSR1 interrupts the wait; keep looping.
    runtime.set_loop_error_handler(Some(Box::new(|| true)));

    let mut timers = Vec::with_capacity(config.timers.len());
    for spec in &config.timers {
        timers.push(spawn_timer(&mut runtime, spec)?);
    }

    let commands = if cli.no_stdin {
        None
    } else {
        let source =
            CommandReader::stdin()?.into_source(std::sync::Arc::clone(runtime.lifecycle()));
        match runtime.register(&source) {
            Ok(()) => Some(source),
            Err(e) => {
                // Regular files and /dev/null cannot be watched by epoll.
                tracing::warn!("stdin commands unavailable: {e}");
                None
            }
        }
    };

    while !runtime.is_terminating() {
        if let PollStatus::Ready(dispatch) = runtime.tick()? {
            for failure in &dispatch.failures {
                tracing::warn!(fd = failure.fd, "source removed: {}", failure.error);
            }
        }
        if STATUS_REQUESTED.swap(false, Ordering::SeqCst) {
            tracing::info!(
                app_time = runtime.app_time(),
                sources = runtime.reactor().len(),
                "status"
            );
        }
    }

    tracing::info!(app_time = runtime.app_time(), "shutting down");
    for timer in timers {
        runtime.release_timer(timer);
    }
    if let Some(source) = commands {
        runtime.unregister(&source);
    }
    let name = runtime.release();
    tracing::info!(%name, "stopped");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match DemoConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => DemoConfig::default(),
    };

    let _guard = match &cli.log_dir {
        Some(dir) => match init_tracing_with_file(dir, &config.name, cli.log_level) {
            Ok(guard) => Some(guard),
            Err(e) => {
                init_tracing_stderr(cli.log_level);
                tracing::warn!("file logging unavailable, using stderr only: {e}");
                None
            }
        },
        None => {
            init_tracing_stderr(cli.log_level);
            None
        }
    };

    match run(&cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
