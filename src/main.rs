use bthome_gateway::app::{self, Options};
use clap::Parser;
use std::io;
use std::panic::{self, PanicHookInfo};
use std::path::Path;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Set up logging to stderr or to `--log-file`.
///
/// The returned guard flushes the log file when dropped.
fn init_logging(options: &Options) -> io::Result<Option<WorkerGuard>> {
    let (writer, guard) = match &options.log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid log file name \"{}\"", path.display()),
                    )
                })?;
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(file_name)
                .build(directory)
                .map_err(io::Error::other)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(io::stderr), None),
    };

    let filter = EnvFilter::builder()
        .with_default_directive(options.log_level.to_level_filter().into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(options.log_file.is_none())
        .with_writer(writer);

    if options.timestamp {
        let format = if options.date {
            "%Y-%m-%dT%H:%M:%S%.3f"
        } else {
            "%H:%M:%S%.3f"
        };
        builder
            .with_timer(ChronoLocal::new(format.to_string()))
            .init();
    } else {
        builder.without_time().init();
    }
    Ok(guard)
}

/// Resolve once a terminating signal is received.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut signals = Vec::new();
        for (kind, name) in [
            (SignalKind::interrupt(), "SIGINT"),
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::hangup(), "SIGHUP"),
            (SignalKind::quit(), "SIGQUIT"),
        ] {
            match signal(kind) {
                Ok(stream) => signals.push((stream, name)),
                Err(e) => warn!("Cannot listen for {name}: {e}."),
            }
        }

        if !signals.is_empty() {
            let received = signals.iter_mut().map(|(stream, name)| {
                Box::pin(async move {
                    stream.recv().await;
                    *name
                })
            });
            let (name, _, _) = futures::future::select_all(received).await;
            warn!("Caught signal {name}, terminating.");
            return;
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("Caught Ctrl-C, terminating."),
        Err(e) => {
            error!("Cannot listen for Ctrl-C: {e}.");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();

    let guard = match init_logging(&options) {
        Ok(guard) => guard,
        Err(why) => {
            eprintln!("error: cannot set up logging: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    };
    info!("{} {} started.", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Log level = {:?}", options.log_level);

    let code = match app::run(options, shutdown_signal()).await {
        Ok(()) => EXIT_SUCCESS,
        Err(why) => {
            error!("{why}. Exiting.");
            EXIT_ERROR
        }
    };
    info!("Exiting.");

    // process::exit skips destructors; flush the log file first.
    drop(guard);
    std::process::exit(code);
}
