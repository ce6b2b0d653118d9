//! Delay floors per primitive kind and throttle level.
//!
//! # Default floors
//!
//! | kind          | Active    | BackgroundPlaying | BackgroundIdle |
//! |---------------|-----------|-------------------|----------------|
//! | periodic      | requested | ≥ 1000 ms         | ≥ 10000 ms     |
//! | one-shot      | requested | ≥ 250 ms          | ≥ 10000 ms     |
//! | frame-aligned | native    | ≥ 1000 ms (~1 fps)| ≥ 1000 ms      |
//!
//! Timers keep a gentler floor while media plays in the background because
//! buffering and audio bookkeeping still run on them. Frame callbacks only
//! drive visual work, so they drop to about one frame per second as soon as
//! the page is hidden.
//!
//! All values are configuration (see [`ThrottlePolicy`]); none is a protocol
//! constant.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::host::PrimitiveKind;
use crate::level::ThrottleLevel;

/// Upper bound accepted for any configured floor (10 minutes).
pub const MAX_FLOOR_MS: u64 = 600_000;

/// Background floors for one primitive kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloorTable {
    /// Minimum delay while hidden with media playing.
    pub background_playing_ms: u64,
    /// Minimum delay while hidden with nothing playing.
    pub background_idle_ms: u64,
}

impl FloorTable {
    #[must_use]
    pub const fn new(background_playing_ms: u64, background_idle_ms: u64) -> Self {
        Self {
            background_playing_ms,
            background_idle_ms,
        }
    }

    /// Floor for `level`, `None` when the level imposes none.
    #[must_use]
    pub const fn floor(&self, level: ThrottleLevel) -> Option<Duration> {
        match level {
            ThrottleLevel::Active => None,
            ThrottleLevel::BackgroundPlaying => {
                Some(Duration::from_millis(self.background_playing_ms))
            }
            ThrottleLevel::BackgroundIdle => Some(Duration::from_millis(self.background_idle_ms)),
        }
    }

    fn clamped(self) -> Self {
        Self {
            background_playing_ms: self.background_playing_ms.min(MAX_FLOOR_MS),
            background_idle_ms: self.background_idle_ms.min(MAX_FLOOR_MS),
        }
    }
}

/// How frame-aligned callbacks are delivered while the page is hidden.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameMode {
    /// Deliver at the first frame after the cadence floor.
    #[default]
    Defer,
    /// Keep the cadence but do not run the callback body.
    Skip,
}

/// Tunable throttling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlePolicy {
    pub periodic: FloorTable,
    pub one_shot: FloorTable,
    pub frame_aligned: FloorTable,
    pub frame_mode: FrameMode,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            periodic: FloorTable::new(1_000, 10_000),
            one_shot: FloorTable::new(250, 10_000),
            frame_aligned: FloorTable::new(1_000, 1_000),
            frame_mode: FrameMode::Defer,
        }
    }
}

impl ThrottlePolicy {
    #[must_use]
    pub const fn table(&self, kind: PrimitiveKind) -> &FloorTable {
        match kind {
            PrimitiveKind::Periodic => &self.periodic,
            PrimitiveKind::OneShot => &self.one_shot,
            PrimitiveKind::FrameAligned => &self.frame_aligned,
        }
    }

    #[must_use]
    pub const fn floor(&self, kind: PrimitiveKind, level: ThrottleLevel) -> Option<Duration> {
        self.table(kind).floor(level)
    }

    /// `max(requested, floor(kind, level))`.
    #[must_use]
    pub fn effective_delay(
        &self,
        kind: PrimitiveKind,
        level: ThrottleLevel,
        requested: Duration,
    ) -> Duration {
        self.floor(kind, level)
            .map_or(requested, |floor| requested.max(floor))
    }

    /// Full decision for a non-critical registration.
    #[must_use]
    pub fn adjust(
        &self,
        kind: PrimitiveKind,
        level: ThrottleLevel,
        requested: Duration,
    ) -> Adjustment {
        let effective = self.effective_delay(kind, level, requested);
        let skip_body = kind == PrimitiveKind::FrameAligned
            && level.is_background()
            && self.frame_mode == FrameMode::Skip;
        Adjustment {
            requested,
            effective,
            skip_body,
        }
    }

    /// Copy with every floor capped at [`MAX_FLOOR_MS`].
    #[must_use]
    pub fn sanitized(self) -> Self {
        Self {
            periodic: self.periodic.clamped(),
            one_shot: self.one_shot.clamped(),
            frame_aligned: self.frame_aligned.clamped(),
            frame_mode: self.frame_mode,
        }
    }
}

/// Outcome of applying the policy to one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    pub requested: Duration,
    pub effective: Duration,
    /// Register on cadence but do not run the callback body.
    pub skip_body: bool,
}

impl Adjustment {
    /// Delivery with the requested delay and the real callback.
    #[must_use]
    pub const fn unchanged(requested: Duration) -> Self {
        Self {
            requested,
            effective: requested,
            skip_body: false,
        }
    }

    #[must_use]
    pub fn is_floored(&self) -> bool {
        self.effective > self.requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn default_floor_table() {
        use PrimitiveKind::{FrameAligned, OneShot, Periodic};
        use ThrottleLevel::{Active, BackgroundIdle, BackgroundPlaying};
        let p = ThrottlePolicy::default();

        assert_eq!(p.effective_delay(Periodic, Active, ms(200)), ms(200));
        assert_eq!(p.effective_delay(Periodic, BackgroundPlaying, ms(200)), ms(1_000));
        assert_eq!(p.effective_delay(Periodic, BackgroundIdle, ms(200)), ms(10_000));

        assert_eq!(p.effective_delay(OneShot, Active, ms(10)), ms(10));
        assert_eq!(p.effective_delay(OneShot, BackgroundPlaying, ms(10)), ms(250));
        assert_eq!(p.effective_delay(OneShot, BackgroundIdle, ms(500)), ms(10_000));

        assert_eq!(p.effective_delay(FrameAligned, Active, Duration::ZERO), Duration::ZERO);
        assert_eq!(p.effective_delay(FrameAligned, BackgroundPlaying, Duration::ZERO), ms(1_000));
        assert_eq!(p.effective_delay(FrameAligned, BackgroundIdle, Duration::ZERO), ms(1_000));
    }

    #[test]
    fn longer_requests_are_untouched() {
        let p = ThrottlePolicy::default();
        assert_eq!(
            p.effective_delay(PrimitiveKind::Periodic, ThrottleLevel::BackgroundIdle, ms(60_000)),
            ms(60_000)
        );
    }

    #[test]
    fn skip_mode_only_applies_to_background_frames() {
        let p = ThrottlePolicy {
            frame_mode: FrameMode::Skip,
            ..ThrottlePolicy::default()
        };
        let frame = PrimitiveKind::FrameAligned;
        let idle = ThrottleLevel::BackgroundIdle;
        assert!(p.adjust(frame, idle, Duration::ZERO).skip_body);
        assert!(!p.adjust(frame, ThrottleLevel::Active, Duration::ZERO).skip_body);
        assert!(!p.adjust(PrimitiveKind::Periodic, idle, ms(5)).skip_body);
        assert!(!ThrottlePolicy::default().adjust(frame, idle, Duration::ZERO).skip_body);
    }

    #[test]
    fn adjustment_reports_flooring() {
        let p = ThrottlePolicy::default();
        let idle = ThrottleLevel::BackgroundIdle;
        assert!(p.adjust(PrimitiveKind::OneShot, idle, ms(1)).is_floored());
        assert!(!p.adjust(PrimitiveKind::OneShot, ThrottleLevel::Active, ms(1)).is_floored());
        assert!(!Adjustment::unchanged(ms(3)).is_floored());
    }

    #[test]
    fn sanitized_caps_floors() {
        let p = ThrottlePolicy {
            periodic: FloorTable::new(u64::MAX, 5),
            ..ThrottlePolicy::default()
        }
        .sanitized();
        assert_eq!(p.periodic.background_playing_ms, MAX_FLOOR_MS);
        assert_eq!(p.periodic.background_idle_ms, 5);
    }

    #[test]
    fn policy_toml_roundtrip_with_partial_input() {
        let parsed: ThrottlePolicy = toml::from_str(concat!(
            "frame_mode = \"skip\"\n",
            "[one_shot]\n",
            "background_playing_ms = 400\n",
            "background_idle_ms = 8000\n",
        ))
        .unwrap();
        assert_eq!(parsed.frame_mode, FrameMode::Skip);
        assert_eq!(parsed.one_shot, FloorTable::new(400, 8_000));
        assert_eq!(parsed.periodic, ThrottlePolicy::default().periodic);
    }
}
