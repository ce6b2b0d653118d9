//! Configuration management for tamer
//!
//! Loads and saves `tamer.toml`. Loading never fails from the caller's point
//! of view: missing, unreadable, or invalid documents fall back to defaults
//! (with a warning), older documents are migrated, missing fields are filled
//! from defaults, and out-of-range values are clamped. Saving publishes
//! [`Event::ConfigChanged`] on the attached [`EventBus`].
//!
//! ```toml
//! version = 2
//!
//! [features]
//! adaptive_throttling = true
//!
//! [throttle]
//! frame_mode = "defer"
//!
//! [throttle.periodic]
//! background_playing_ms = 1000
//! background_idle_ms = 10000
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::events::{Event, EventBus};
use crate::policy::ThrottlePolicy;

/// Schema version written by this release.
pub const CURRENT_CONFIG_VERSION: u32 = 2;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancerConfig {
    /// Schema version of the document
    pub version: u32,

    /// Feature toggles
    pub features: FeatureFlags,

    /// Delay floors used while throttling
    pub throttle: ThrottlePolicy,
}

impl Default for EnhancerConfig {
    fn default() -> Self {
        Self {
            version: CURRENT_CONFIG_VERSION,
            features: FeatureFlags::default(),
            throttle: ThrottlePolicy::default(),
        }
    }
}

/// Feature toggles. Only `adaptive_throttling` is consumed by the engine;
/// the rest belong to the surrounding page glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub adaptive_throttling: bool,
    pub layout_enhancement: bool,
    pub shorts_removal: bool,
    pub fullscreen_clock: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            adaptive_throttling: true,
            layout_enhancement: true,
            shorts_removal: true,
            fullscreen_clock: true,
        }
    }
}

impl EnhancerConfig {
    /// Parse a TOML document, migrating and sanitizing it.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut table: toml::Table = toml::from_str(contents)?;
        migrate(&mut table)?;
        let config: Self = toml::Value::Table(table).try_into()?;
        Ok(config.sanitized())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Copy with the current version stamped and values clamped to range.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        self.version = CURRENT_CONFIG_VERSION;
        self.throttle = self.throttle.sanitized();
        self
    }
}

/// Bring an older document up to [`CURRENT_CONFIG_VERSION`] in place.
///
/// Documents without a version are version 1. Version 1 named the throttling
/// toggle `features.cpu_tamer`.
fn migrate(table: &mut toml::Table) -> Result<(), ConfigError> {
    let version = table
        .get("version")
        .and_then(toml::Value::as_integer)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(1);

    if version > CURRENT_CONFIG_VERSION {
        return Err(ConfigError::VersionTooNew {
            found: version,
            supported: CURRENT_CONFIG_VERSION,
        });
    }

    if version < 2 {
        if let Some(features) = table.get_mut("features").and_then(toml::Value::as_table_mut) {
            if let Some(legacy) = features.remove("cpu_tamer") {
                features
                    .entry("adaptive_throttling")
                    .or_insert(legacy);
            }
        }
        tracing::info!(from = version, to = 2, "migrated config");
    }

    table.insert(
        "version".to_string(),
        toml::Value::Integer(i64::from(CURRENT_CONFIG_VERSION)),
    );
    Ok(())
}

// =============================================================================
// Backends
// =============================================================================

/// Raw key-value storage for the serialized document.
pub trait ConfigBackend: Send + Sync {
    /// Stored document, `None` when nothing was saved yet.
    fn read(&self) -> Result<Option<String>, ConfigError>;

    fn write(&self, contents: &str) -> Result<(), ConfigError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    contents: Mutex<Option<String>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self {
            contents: Mutex::new(Some(contents.into())),
        }
    }

    #[must_use]
    pub fn contents(&self) -> Option<String> {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConfigBackend for MemoryBackend {
    fn read(&self) -> Result<Option<String>, ConfigError> {
        Ok(self.contents())
    }

    fn write(&self, contents: &str) -> Result<(), ConfigError> {
        *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = Some(contents.to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// TOML file backend. Writes go through a temp file and a rename so a crash
/// never leaves a truncated document behind.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/tamer/tamer.toml`.
    pub fn default_location() -> Result<Self, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(Self::new(dir.join("tamer").join("tamer.toml")))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigBackend for FileBackend {
    fn read(&self) -> Result<Option<String>, ConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ConfigError::ReadFailed {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write(&self, contents: &str) -> Result<(), ConfigError> {
        let write_failed = |source| ConfigError::WriteFailed {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(write_failed)?;
            }
        }
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, contents).map_err(write_failed)?;
        std::fs::rename(&tmp, &self.path).map_err(write_failed)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

// =============================================================================
// Store
// =============================================================================

/// Versioned configuration store.
pub struct ConfigStore {
    backend: Box<dyn ConfigBackend>,
    bus: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("backend", &self.backend.describe())
            .field("bus", &self.bus.is_some())
            .finish()
    }
}

impl ConfigStore {
    #[must_use]
    pub fn new(backend: impl ConfigBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            bus: None,
        }
    }

    /// In-memory store with nothing saved yet.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// Publish [`Event::ConfigChanged`] on `bus` after every save.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Load the configuration, falling back to defaults on any error.
    #[must_use]
    pub fn load(&self) -> EnhancerConfig {
        match self.try_load() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    location = %self.backend.describe(),
                    error = %err,
                    hint = %err.hint(),
                    "failed to load config; using defaults"
                );
                EnhancerConfig::default()
            }
        }
    }

    /// Load the configuration, reporting errors.
    pub fn try_load(&self) -> Result<EnhancerConfig, ConfigError> {
        match self.backend.read()? {
            Some(contents) => EnhancerConfig::from_toml_str(&contents),
            None => {
                tracing::debug!(
                    location = %self.backend.describe(),
                    "no saved config; using defaults"
                );
                Ok(EnhancerConfig::default())
            }
        }
    }

    /// Persist `config` and notify subscribers. Returns what was saved.
    pub fn save(&self, config: &EnhancerConfig) -> Result<EnhancerConfig, ConfigError> {
        let saved = config.clone().sanitized();
        self.backend.write(&saved.to_toml_string()?)?;
        tracing::debug!(location = %self.backend.describe(), "config saved");
        if let Some(bus) = &self.bus {
            bus.publish(&Event::ConfigChanged {
                config: saved.clone(),
            });
        }
        Ok(saved)
    }
}
