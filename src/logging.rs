use crate::core::config::LoggingConfig;
use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the writer of the log file alive for the lifetime of the process.
struct Installed {
    _guard: Option<WorkerGuard>,
}

static INSTALLED: Mutex<Option<Installed>> = parking_lot::const_mutex(None);

/// Installs the global tracing subscriber and routes `log` records into it.
///
/// `RUST_LOG` takes precedence over the configured filter. With a file configured, output goes
/// to a daily rolling file through a non-blocking writer instead of stdout.
/// Calling it again once a subscriber is installed does nothing.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let mut installed = INSTALLED.lock();
    if installed.is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .with_context(|| format!("invalid log filter '{}'", config.filter))?;

    let guard = match &config.file {
        Some((directory, prefix)) => {
            let appender = tracing_appender::rolling::daily(directory, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_ansi(false));
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| anyhow!("failed to install subscriber: {}", e))?;
            Some(guard)
        }
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true));
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| anyhow!("failed to install subscriber: {}", e))?;
            None
        }
    };
    tracing_log::LogTracer::init().map_err(|e| anyhow!("failed to bridge log records: {}", e))?;

    *installed = Some(Installed { _guard: guard });
    tracing::debug!("logging initialized with filter '{}'", config.filter);
    Ok(())
}
