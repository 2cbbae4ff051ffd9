use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Full filter override, e.g. `JANUS_LOG_FILTER=janus_client::transport=trace`.
pub const FILTER_ENV: &str = "JANUS_LOG_FILTER";
/// Lets websocket/http client traces through at `trace` level.
pub const TRACE_DEPS_ENV: &str = "JANUS_TRACE_DEPS";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (filter, throttled) = match std::env::var(FILTER_ENV) {
        Ok(filter) => (filter, false),
        Err(_) => default_filter(config.level.to_filter(), trace_deps_allowed()),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    if throttled {
        eprintln!(
            "[janus-probe] dependency traces capped at info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to override"
        );
    }
    Ok(())
}

fn trace_deps_allowed() -> bool {
    std::env::var(TRACE_DEPS_ENV)
        .map(|value| !value.is_empty() && value != "0")
        .unwrap_or(false)
}

const NOISY_TARGETS: &[&str] = &[
    "tungstenite",
    "tokio_tungstenite",
    "reqwest",
    "hyper",
    "rustls",
    "h2",
    "mio",
    "webrtc_ice",
    "webrtc_sctp",
];

/// Filter for a level: our crates follow the level, everything else stays at
/// info or above. Returns whether dependency traces were capped.
fn default_filter(level: LevelFilter, allow_dep_traces: bool) -> (String, bool) {
    let mut filter = match level {
        LevelFilter::TRACE => "info,janus=trace,janus_client=trace,janus_probe=trace".to_owned(),
        LevelFilter::DEBUG => "info,janus=debug,janus_client=debug,janus_probe=debug".to_owned(),
        other => other.to_string().to_lowercase(),
    };
    if level != LevelFilter::TRACE || allow_dep_traces {
        return (filter, false);
    }
    for target in NOISY_TARGETS {
        filter.push_str(&format!(",{target}=info"));
    }
    (filter, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_levels_apply_globally() {
        assert_eq!(default_filter(LevelFilter::WARN, false), ("warn".to_owned(), false));
        assert_eq!(default_filter(LevelFilter::INFO, false), ("info".to_owned(), false));
    }

    #[test]
    fn debug_only_raises_our_crates() {
        let (filter, throttled) = default_filter(LevelFilter::DEBUG, false);
        assert_eq!(filter, "info,janus=debug,janus_client=debug,janus_probe=debug");
        assert!(!throttled);
    }

    #[test]
    fn trace_caps_dependencies_unless_allowed() {
        let (filter, throttled) = default_filter(LevelFilter::TRACE, false);
        assert!(throttled);
        assert!(filter.starts_with("info,janus=trace,janus_client=trace"));
        assert!(filter.contains(",tungstenite=info"));

        let (filter, throttled) = default_filter(LevelFilter::TRACE, true);
        assert!(!throttled);
        assert!(!filter.contains("tungstenite"));
    }

    #[test]
    fn levels_order_by_verbosity() {
        assert!(LogLevel::Trace > LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert_eq!(LogLevel::default(), LogLevel::Warn);
    }
}
