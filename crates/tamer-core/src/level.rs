//! Throttle levels and the environmental state they are derived from.
//!
//! | hidden | media_playing | level               |
//! |--------|---------------|---------------------|
//! | false  | any           | `Active`            |
//! | true   | true          | `BackgroundPlaying` |
//! | true   | false         | `BackgroundIdle`    |
//!
//! The level is never stored; it is recomputed from the state on every read.

use serde::{Deserialize, Serialize};

/// Throttling intensity, ordered from least to most aggressive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleLevel {
    /// Page visible: no throttling.
    Active,
    /// Page hidden but media is playing: gentle floors keep buffering alive.
    BackgroundPlaying,
    /// Page hidden and nothing playing: aggressive floors.
    BackgroundIdle,
}

impl ThrottleLevel {
    /// Ordinal value (0-2).
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::BackgroundPlaying => 1,
            Self::BackgroundIdle => 2,
        }
    }

    /// Derive the level from the two environmental booleans.
    #[must_use]
    pub const fn derive(hidden: bool, media_playing: bool) -> Self {
        match (hidden, media_playing) {
            (false, _) => Self::Active,
            (true, true) => Self::BackgroundPlaying,
            (true, false) => Self::BackgroundIdle,
        }
    }

    #[must_use]
    pub const fn is_background(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::BackgroundPlaying => write!(f, "BACKGROUND_PLAYING"),
            Self::BackgroundIdle => write!(f, "BACKGROUND_IDLE"),
        }
    }
}

/// Snapshot of the two signals the tracker observes.
///
/// The default (`visible`, nothing playing) is also the fallback when the
/// host lacks visibility or media APIs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentalState {
    pub hidden: bool,
    pub media_playing: bool,
}

impl EnvironmentalState {
    #[must_use]
    pub const fn new(hidden: bool, media_playing: bool) -> Self {
        Self {
            hidden,
            media_playing,
        }
    }

    #[must_use]
    pub const fn level(self) -> ThrottleLevel {
        ThrottleLevel::derive(self.hidden, self.media_playing)
    }
}
