//! tamer-core: adaptive callback throttling engine
//!
//! Intercepts a host's three scheduling primitives (periodic timers,
//! one-shot timers, and frame-aligned callbacks) and stretches the delays
//! of non-critical callbacks while the page is in the background. The page
//! never loses a callback: it is only delivered later.
//!
//! # Architecture
//!
//! ```text
//! SignalSource ─→ EnvironmentTracker ─→ ThrottleLevel
//!                                           ↓
//! page code ─→ wrapper (intercept) ─→ ThrottlePolicy floor ─→ original primitive
//!                   ↑
//!          CriticalCallbacks
//!
//! ConfigStore ─save→ EventBus ─→ ThrottleEngine (install / uninstall)
//! ```
//!
//! # Modules
//!
//! - `engine`: lifecycle controller and public entry point
//! - `tracker`: visibility and media signals to throttle level
//! - `level`: throttle levels and the state they derive from
//! - `allowlist`: callbacks exempt from throttling
//! - `intercept`: primitive capture, wrapping, and restore
//! - `policy`: delay floors per primitive kind and level
//! - `host`: host capability traits (`GlobalScope`, `SignalSource`)
//! - `sim`: deterministic virtual-clock host
//! - `tokio_host`: host backed by `tokio::time`
//! - `config`: versioned TOML configuration store
//! - `events`: event bus for config changes and page unload
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod allowlist;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod host;
pub mod intercept;
pub mod level;
pub mod logging;
pub mod policy;
pub mod sim;
pub mod tokio_host;
pub mod tracker;

pub use config::{ConfigStore, EnhancerConfig};
pub use engine::{LifecycleOutcome, ThrottleEngine, TransitionReport};
pub use error::{ConfigError, Error, Result};
pub use events::{Event, EventBus};
pub use host::{Callback, GlobalScope, PrimitiveKind, SignalKind, SignalSource, TimerId};
pub use level::ThrottleLevel;
pub use policy::ThrottlePolicy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
