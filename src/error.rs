//! Crate error types.
//!
//! Collectors never propagate errors past the engine boundary; a failed
//! `measure()` only self-terminates its own worker. Fatal decisions belong
//! to the writer (cancellation latch) and to startup code in `main`.

use thiserror::Error;

/// Errors raised inside a collector's measurement loop.
#[derive(Debug, Error)]
pub enum CollectError {
    /// The data source is missing on this node (hardware absent, tool not
    /// installed, sysfs path gone). The collector self-terminates and the
    /// watchdog leaves it alone.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    /// An external tool failed or exceeded its hard timeout.
    #[error("tool `{cmd}` failed: {reason}")]
    Tool { cmd: String, reason: String },
}

/// Errors raised while inserting measurements into the database.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The destination table does not exist. Warn-and-skip, never fatal.
    #[error("table `{0}` does not exist")]
    UnknownTable(String),

    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Any other server-side failure. Fatal for the engine.
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },
}

/// Errors from the control-plane REST client.
#[derive(Debug, Error)]
pub enum RestError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("login failed: no access token in response")]
    Login,

    #[error("unexpected response from {endpoint}: {message}")]
    Response { endpoint: String, message: String },
}

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("missing key `{section}.{key}`")]
    MissingKey { section: String, key: String },

    #[error("invalid value for `{section}.{key}`: {value}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}
