//! Unit-visible log.
//!
//! Every entry goes to `tracing`, to a line-capped NDJSON file, to stdout as
//! an NDJSON line when console output is on and, unless it is marked
//! file-only, to a mirror channel that the client drains onto the
//! `log/pepeunit` topic. The mirror is a channel rather than a direct publish
//! so a failing publish can never log back into this logger.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::files;
use crate::settings::SettingsStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    #[default]
    #[serde(alias = "DEBUG", alias = "debug")]
    Debug,
    #[serde(alias = "INFO", alias = "info")]
    Info,
    #[serde(alias = "WARNING", alias = "warning", alias = "Warn")]
    Warning,
    #[serde(alias = "ERROR", alias = "error")]
    Error,
    #[serde(alias = "CRITICAL", alias = "critical")]
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "Debug",
            LogLevel::Info => "Info",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
            LogLevel::Critical => "Critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub text: String,
    pub create_datetime: String,
}

pub struct UnitLogger {
    path: Option<PathBuf>,
    settings: Arc<SettingsStore>,
    console: bool,
    file_lock: Mutex<()>,
    mirror: Mutex<Option<mpsc::UnboundedSender<LogEntry>>>,
}

impl UnitLogger {
    pub fn new(path: Option<PathBuf>, settings: Arc<SettingsStore>, console: bool) -> Self {
        Self {
            path,
            settings,
            console,
            file_lock: Mutex::new(()),
            mirror: Mutex::new(None),
        }
    }

    /// Routes non-file-only entries to `tx`; replaces any previous mirror.
    pub fn set_mirror(&self, tx: mpsc::UnboundedSender<LogEntry>) {
        let mut guard = self.mirror.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(tx);
    }

    pub fn debug(&self, text: impl Into<String>) {
        self.log(LogLevel::Debug, text.into(), false);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.log(LogLevel::Info, text.into(), false);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.log(LogLevel::Warning, text.into(), false);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.log(LogLevel::Error, text.into(), false);
    }

    pub fn critical(&self, text: impl Into<String>) {
        self.log(LogLevel::Critical, text.into(), false);
    }

    /// Logs without mirroring onto the log topic.
    pub fn file_only(&self, level: LogLevel, text: impl Into<String>) {
        self.log(level, text.into(), true);
    }

    fn log(&self, level: LogLevel, text: String, file_only: bool) {
        let settings = self.settings.snapshot();
        if level < settings.min_log_level {
            return;
        }

        match level {
            LogLevel::Debug => debug!(target: "pepeunit::unit", "{}", text),
            LogLevel::Info => info!(target: "pepeunit::unit", "{}", text),
            LogLevel::Warning => warn!(target: "pepeunit::unit", "{}", text),
            LogLevel::Error => error!(target: "pepeunit::unit", "{}", text),
            LogLevel::Critical => error!(target: "pepeunit::unit", critical = true, "{}", text),
        }

        let entry = LogEntry {
            level,
            text,
            create_datetime: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };

        if self.console {
            if let Ok(line) = serde_json::to_string(&entry) {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{}", line);
            }
        }

        if let Some(path) = &self.path {
            let _guard = self.file_lock.lock().unwrap_or_else(|p| p.into_inner());
            let max_lines = usize::try_from(settings.max_log_length).unwrap_or(usize::MAX);
            match serde_json::to_value(&entry) {
                Ok(value) => {
                    if let Err(e) = files::append_ndjson(path, &value, max_lines) {
                        warn!("Failed to append to unit log {:?}: {}", path, e);
                    }
                }
                Err(e) => warn!("Failed to encode log entry: {}", e),
            }
        }

        if !file_only {
            let guard = self.mirror.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(entry);
            }
        }
    }

    /// All entries currently in the log file, oldest first.
    pub fn full_log(&self) -> Vec<Value> {
        match &self.path {
            Some(path) => {
                let _guard = self.file_lock.lock().unwrap_or_else(|p| p.into_inner());
                files::read_ndjson(path)
            }
            None => Vec::new(),
        }
    }

    pub fn reset_log(&self) {
        if let Some(path) = &self.path {
            let _guard = self.file_lock.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = files::write_atomic(path, b"") {
                warn!("Failed to reset unit log {:?}: {}", path, e);
            }
        }
    }
}

/// Console filter for the binary: the given `RUST_LOG` directives, or `info`
/// when they are missing or invalid.
pub fn console_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    struct CountUnitEvents(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for CountUnitEvents {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if event.metadata().target() == "pepeunit::unit" {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn logger_with(min: LogLevel, max_lines: u64) -> (tempfile::TempDir, UnitLogger) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            min_log_level: min,
            max_log_length: max_lines,
            ..Settings::default()
        };
        let store = Arc::new(SettingsStore::from_settings(dir.path().join("env.json"), settings));
        let logger = UnitLogger::new(Some(dir.path().join("log.json")), store, false);
        (dir, logger)
    }

    #[test]
    fn entries_below_minimum_are_dropped() {
        let (_dir, logger) = logger_with(LogLevel::Warning, 64);
        logger.info("quiet");
        logger.error("loud");

        let entries = logger.full_log();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["text"], "loud");
        assert_eq!(entries[0]["level"], "Error");
    }

    #[test]
    fn file_is_capped() {
        let (_dir, logger) = logger_with(LogLevel::Debug, 2);
        logger.info("one");
        logger.info("two");
        logger.info("three");

        let texts: Vec<_> = logger.full_log().iter().map(|e| e["text"].clone()).collect();
        assert_eq!(texts, vec!["two", "three"]);
    }

    #[test]
    fn file_only_entries_are_not_mirrored() {
        let (_dir, logger) = logger_with(LogLevel::Debug, 64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        logger.set_mirror(tx);

        logger.file_only(LogLevel::Info, "local");
        logger.warning("shared");

        let mirrored = rx.try_recv().unwrap();
        assert_eq!(mirrored.text, "shared");
        assert!(rx.try_recv().is_err());
        assert_eq!(logger.full_log().len(), 2);
    }

    #[test]
    fn reset_clears_file() {
        let (_dir, logger) = logger_with(LogLevel::Debug, 64);
        logger.info("something");
        logger.reset_log();
        assert!(logger.full_log().is_empty());
    }

    #[test]
    fn entries_reach_tracing_without_console_output() {
        let (_dir, logger) = logger_with(LogLevel::Debug, 64);
        let seen = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(CountUnitEvents(seen.clone()));

        tracing::subscriber::with_default(subscriber, || {
            logger.debug("one");
            logger.critical("two");
        });
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn console_filter_follows_directives() {
        assert_eq!(console_filter(None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(
            console_filter(Some("debug")).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
        assert_eq!(
            console_filter(Some("pepeunit=notalevel")).max_level_hint(),
            Some(LevelFilter::INFO)
        );
    }
}
