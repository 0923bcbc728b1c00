//! Peer-scoped log verbosity.
//!
//! A [`Peer`](crate::Peer) built with a level other than
//! [`LogLevel::Disabled`] installs a global `tracing` subscriber on
//! construction, unless the application already installed its own.
//! `PEERLINK_LOG_FILTER` replaces the computed directives verbatim.

use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Verbosity of the peerlink crates, numbered 0 to 3 in config files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawLevel", into = "u8")]
pub enum LogLevel {
    #[default]
    Disabled,
    Errors,
    Warnings,
    All,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLevel {
    Number(u8),
    Name(String),
}

impl TryFrom<RawLevel> for LogLevel {
    type Error = InitError;

    fn try_from(raw: RawLevel) -> Result<Self, Self::Error> {
        match raw {
            RawLevel::Number(n) => LogLevel::try_from(n),
            RawLevel::Name(name) => name.parse(),
        }
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = InitError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LogLevel::Disabled),
            1 => Ok(LogLevel::Errors),
            2 => Ok(LogLevel::Warnings),
            3 => Ok(LogLevel::All),
            other => Err(InitError::Level(other.to_string())),
        }
    }
}

impl From<LogLevel> for u8 {
    fn from(level: LogLevel) -> Self {
        level as u8
    }
}

impl FromStr for LogLevel {
    type Err = InitError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Ok(n) = value.parse::<u8>() {
            return LogLevel::try_from(n);
        }
        match value.to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(LogLevel::Disabled),
            "errors" | "error" => Ok(LogLevel::Errors),
            "warnings" | "warning" | "warn" => Ok(LogLevel::Warnings),
            "all" | "trace" => Ok(LogLevel::All),
            _ => Err(InitError::Level(value.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Disabled => "disabled",
            LogLevel::Errors => "errors",
            LogLevel::Warnings => "warnings",
            LogLevel::All => "all",
        };
        f.write_str(name)
    }
}

impl LogLevel {
    /// `tracing` directive for our own targets.
    fn own_directive(self) -> &'static str {
        match self {
            LogLevel::Disabled => "off",
            LogLevel::Errors => "error",
            LogLevel::Warnings => "warn",
            LogLevel::All => "trace",
        }
    }

    /// Filter directives: peerlink crates at this level, transport crates
    /// only surface warnings and only when everything is on.
    pub fn directives(self) -> String {
        if self == LogLevel::Disabled {
            return "off".to_string();
        }
        let own = self.own_directive();
        let mut filter = format!("off,peerlink={own},peerlink_webrtc={own}");
        if self == LogLevel::All {
            for target in TRANSPORT_TARGETS {
                filter.push(',');
                filter.push_str(target);
                filter.push_str("=warn");
            }
        }
        filter
    }
}

const TRANSPORT_TARGETS: &[&str] = &[
    "tokio_tungstenite",
    "tungstenite",
    "reqwest",
    "webrtc",
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self { level, file: None }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("unknown log level {0}; expected 0-3 or disabled/errors/warnings/all")]
    Level(String),
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("a global subscriber is already installed: {0}")]
    AlreadySet(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber for `config`. Returns `false` when logging
/// is disabled or a peerlink subscriber is already in place.
pub fn init(config: &LogConfig) -> Result<bool, InitError> {
    if config.level == LogLevel::Disabled || GUARD.get().is_some() {
        return Ok(false);
    }
    let filter = std::env::var("PEERLINK_LOG_FILTER")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new(config.level.directives()));

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
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(config.level == LogLevel::All)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::AlreadySet(err.to_string()))?;
    let _ = GUARD.set(guard);
    Ok(true)
}
