//! Property-based tests for throttle levels, policy floors, and interception.
//!
//! Covers `ThrottleLevel::derive` purity, `ThrottlePolicy::effective_delay`
//! (`max(requested, floor)`), critical pass-through, serde roundtrips of the
//! policy, and the delays actually handed to the host by installed wrappers.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tamer_core::engine::ThrottleEngine;
use tamer_core::host::{Callback, PrimitiveKind};
use tamer_core::level::{EnvironmentalState, ThrottleLevel};
use tamer_core::policy::{FloorTable, FrameMode, MAX_FLOOR_MS, ThrottlePolicy};
use tamer_core::sim::VirtualHost;

// =========================================================================
// Strategies
// =========================================================================

fn arb_kind() -> impl Strategy<Value = PrimitiveKind> {
    prop_oneof![
        Just(PrimitiveKind::Periodic),
        Just(PrimitiveKind::OneShot),
        Just(PrimitiveKind::FrameAligned),
    ]
}

fn arb_level() -> impl Strategy<Value = ThrottleLevel> {
    prop_oneof![
        Just(ThrottleLevel::Active),
        Just(ThrottleLevel::BackgroundPlaying),
        Just(ThrottleLevel::BackgroundIdle),
    ]
}

fn arb_floor_table() -> impl Strategy<Value = FloorTable> {
    (0_u64..=MAX_FLOOR_MS, 0_u64..=MAX_FLOOR_MS)
        .prop_map(|(playing, idle)| FloorTable::new(playing, idle))
}

fn arb_policy() -> impl Strategy<Value = ThrottlePolicy> {
    (
        arb_floor_table(),
        arb_floor_table(),
        arb_floor_table(),
        prop_oneof![Just(FrameMode::Defer), Just(FrameMode::Skip)],
    )
        .prop_map(|(periodic, one_shot, frame_aligned, frame_mode)| ThrottlePolicy {
            periodic,
            one_shot,
            frame_aligned,
            frame_mode,
        })
}

// =========================================================================
// ThrottleLevel: pure function of (hidden, media_playing)
// =========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Level depends only on the two flags, never on how they were reached.
    #[test]
    fn prop_level_is_pure(hidden in any::<bool>(), media in any::<bool>()) {
        let level = ThrottleLevel::derive(hidden, media);
        prop_assert_eq!(level, EnvironmentalState::new(hidden, media).level());
        prop_assert_eq!(level.is_background(), hidden);
        if !hidden {
            prop_assert_eq!(level, ThrottleLevel::Active);
        }
    }

    /// Any signal sequence ending in a given state yields that state's level.
    #[test]
    fn prop_tracker_level_matches_final_state(
        steps in prop::collection::vec((any::<bool>(), 0_u8..3), 0..20),
    ) {
        use tamer_core::host::SignalKind;

        let host = VirtualHost::new();
        let engine = ThrottleEngine::for_host(&host);
        engine.install();

        let mut hidden = false;
        let mut playing = false;
        for (hide, media) in steps {
            host.set_hidden(hide);
            hidden = hide;
            let signal = match media {
                0 => SignalKind::MediaPlay,
                1 => SignalKind::MediaPause,
                _ => SignalKind::MediaEnded,
            };
            host.media(signal);
            playing = signal == SignalKind::MediaPlay;
        }
        prop_assert_eq!(engine.current_level(), ThrottleLevel::derive(hidden, playing));
    }
}

// =========================================================================
// ThrottlePolicy: effective delay
// =========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// effective = max(requested, floor) for every kind and level.
    #[test]
    fn prop_effective_is_max_of_requested_and_floor(
        policy in arb_policy(),
        kind in arb_kind(),
        level in arb_level(),
        requested in 0_u64..1_000_000,
    ) {
        let requested = Duration::from_millis(requested);
        let effective = policy.effective_delay(kind, level, requested);
        let expected = policy.floor(kind, level).map_or(requested, |floor| requested.max(floor));
        prop_assert_eq!(effective, expected);
        prop_assert!(effective >= requested);
    }

    /// Active never changes the delay.
    #[test]
    fn prop_active_is_identity(
        policy in arb_policy(),
        kind in arb_kind(),
        requested in 0_u64..1_000_000,
    ) {
        let requested = Duration::from_millis(requested);
        prop_assert_eq!(policy.effective_delay(kind, ThrottleLevel::Active, requested), requested);
    }

    /// Only background frame registrations ever skip the body.
    #[test]
    fn prop_skip_body_scope(policy in arb_policy(), kind in arb_kind(), level in arb_level()) {
        let adjustment = policy.adjust(kind, level, Duration::ZERO);
        if adjustment.skip_body {
            prop_assert_eq!(kind, PrimitiveKind::FrameAligned);
            prop_assert!(level.is_background());
            prop_assert_eq!(policy.frame_mode, FrameMode::Skip);
        }
    }

    /// TOML roundtrip preserves every field.
    #[test]
    fn prop_policy_toml_roundtrip(policy in arb_policy()) {
        let text = toml::to_string(&policy).unwrap();
        let back: ThrottlePolicy = toml::from_str(&text).unwrap();
        prop_assert_eq!(back, policy);
    }

    /// Sanitizing never raises a floor and always caps it.
    #[test]
    fn prop_sanitized_caps(playing in any::<u64>(), idle in any::<u64>()) {
        let policy = ThrottlePolicy {
            one_shot: FloorTable::new(playing, idle),
            ..ThrottlePolicy::default()
        }
        .sanitized();
        prop_assert_eq!(policy.one_shot.background_playing_ms, playing.min(MAX_FLOOR_MS));
        prop_assert_eq!(policy.one_shot.background_idle_ms, idle.min(MAX_FLOOR_MS));
    }
}

// =========================================================================
// Installed wrappers: delays seen by the host
// =========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(80))]

    /// A one-shot registration is due at max(requested, floor) on the host.
    #[test]
    fn prop_wrapped_one_shot_due_time(
        hidden in any::<bool>(),
        playing in any::<bool>(),
        requested in 0_u64..30_000,
    ) {
        use tamer_core::host::SignalKind;

        let host = VirtualHost::new();
        let engine = ThrottleEngine::for_host(&host);
        engine.install();
        if playing {
            host.media(SignalKind::MediaPlay);
        }
        host.set_hidden(hidden);

        let level = engine.current_level();
        let expected = ThrottlePolicy::default()
            .effective_delay(PrimitiveKind::OneShot, level, Duration::from_millis(requested));
        let id = host.set_timeout(Arc::new(|| {}), Duration::from_millis(requested)).unwrap();
        prop_assert_eq!(host.due_at(id), Some(expected.as_millis() as u64));
    }

    /// Critical callbacks are delivered with the requested delay at any level.
    #[test]
    fn prop_critical_is_unchanged(
        hidden in any::<bool>(),
        playing in any::<bool>(),
        requested in 0_u64..30_000,
    ) {
        use tamer_core::host::SignalKind;

        let host = VirtualHost::new();
        let engine = ThrottleEngine::for_host(&host);
        engine.install();
        if playing {
            host.media(SignalKind::MediaPlay);
        }
        host.set_hidden(hidden);

        let cb: Callback = Arc::new(|| {});
        engine.mark_critical(&cb);
        let id = host.set_timeout(cb, Duration::from_millis(requested)).unwrap();
        prop_assert_eq!(host.due_at(id), Some(requested));
    }
}
