//! Error types for tamer-core

use std::path::PathBuf;

use thiserror::Error;

use crate::host::{PrimitiveKind, SignalKind};

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tamer-core
///
/// None of these ever reach page code through an intercepted primitive: the
/// engine recovers from each one locally and falls back to delivering
/// callbacks with their requested delay.
#[derive(Error, Debug)]
pub enum Error {
    /// The host does not expose a scheduling primitive of this kind
    #[error("scheduling primitive unavailable: {0}")]
    PrimitiveUnavailable(PrimitiveKind),

    /// The host cannot deliver this kind of environmental signal
    #[error("signal source unavailable: {0}")]
    SignalSourceUnavailable(SignalKind),

    /// A listener or bus handler panicked; caught at the dispatch boundary
    #[error("handler panicked in {context}: {message}")]
    HandlerPanicked { context: String, message: String },

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// One-line hint describing how the engine recovers (or how to fix the
    /// underlying problem).
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::PrimitiveUnavailable(kind) => Some(format!(
                "{kind} registrations are left untouched; the other primitives are still throttled."
            )),
            Self::SignalSourceUnavailable(kind) => Some(format!(
                "{kind} notifications are missing; the page is treated as visible and idle \
                 (no throttling)."
            )),
            Self::HandlerPanicked { .. } => {
                Some("The panicking handler was skipped; other handlers still ran.".to_string())
            }
            Self::Config(err) => Some(err.hint()),
        }
    }

    /// Wrap a panic caught at a dispatch boundary.
    pub(crate) fn handler_panicked(
        context: impl Into<String>,
        payload: &(dyn std::any::Any + Send),
    ) -> Self {
        Self::HandlerPanicked {
            context: context.into(),
            message: panic_message(payload),
        }
    }

    /// True when the engine carries on unaffected after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PrimitiveUnavailable(_)
                | Self::SignalSourceUnavailable(_)
                | Self::HandlerPanicked { .. }
        )
    }
}

/// Configuration store errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("config version {found} is newer than supported ({supported})")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("no config directory available on this platform")]
    NoConfigDir,
}

impl ConfigError {
    #[must_use]
    pub fn hint(&self) -> String {
        match self {
            Self::ReadFailed { path, .. } => {
                format!("Check permissions on {}; defaults are used meanwhile.", path.display())
            }
            Self::WriteFailed { path, .. } => {
                format!("Check that {} is writable.", path.display())
            }
            Self::ParseError(_) => {
                "Fix or delete the config file; defaults are used meanwhile.".to_string()
            }
            Self::SerializeError(_) => {
                "The configuration could not be encoded as TOML.".to_string()
            }
            Self::VersionTooNew { .. } => {
                "The config was written by a newer release; defaults are used.".to_string()
            }
            Self::NoConfigDir => "Pass an explicit config path.".to_string(),
        }
    }
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
