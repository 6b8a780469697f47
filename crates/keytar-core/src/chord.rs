//! Chord stability detector.
//!
//! Fires once when a non-empty combination of switches has stayed unchanged
//! for at least the hold time, and not again until the combination changes
//! and stabilizes anew.
//!
//! ```text
//!            set changes (to non-empty)
//!   ┌──────┐ ─────────────────────────────▶ ┌──────────┐
//!   │ Idle │                                │ Watching │
//!   └──────┘ ◀───────────────────────────── └──────────┘
//!      ▲        set changes (to empty)         │     ▲
//!      │                        unchanged and  │     │ set changes
//!      │                     elapsed ≥ hold ▼  │     │ (to non-empty)
//!      │   set changes (to empty)     ┌───────────┐  │
//!      └───────────────────────────── │ Announced │ ─┘
//!                                     └───────────┘
//! ```
//!
//! The detector reads no clock: every update carries its own timestamp.

use crate::error::{CoreError, CoreResult};
use crate::types::{ActiveSet, ChordEvent, Timestamp};
use std::time::Duration;

/// Observable phase of a [`ChordDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChordPhase {
    /// No switch held.
    Idle,
    /// A combination is held but has not been announced yet.
    Watching,
    /// The held combination has been announced.
    Announced,
}

/// Debounced, single-fire chord detector.
///
/// # Example
///
/// ```
/// use keytar_core::{ActiveSet, ChordDetector, SwitchIndex, Timestamp};
/// use std::time::Duration;
///
/// let mut detector = ChordDetector::new(Duration::from_millis(200)).unwrap();
/// let chord: ActiveSet = [1, 2].iter().map(|i| SwitchIndex::new(*i).unwrap()).collect();
///
/// assert!(detector.update(chord, Timestamp::from_millis(0)).is_none());
/// let event = detector.update(chord, Timestamp::from_millis(250)).unwrap();
/// assert_eq!(event.switches.len(), 2);
/// assert!(detector.update(chord, Timestamp::from_millis(400)).is_none());
/// ```
#[derive(Debug, Clone)]
pub struct ChordDetector {
    hold_time: Duration,
    current: ActiveSet,
    stable_since: Timestamp,
    announced: bool,
}

impl ChordDetector {
    /// Create a detector in the Idle phase.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidHoldTime`] if `hold_time` is zero. A zero
    /// hold time would announce every change and defeat the debounce.
    pub fn new(hold_time: Duration) -> CoreResult<Self> {
        if hold_time.is_zero() {
            return Err(CoreError::InvalidHoldTime);
        }
        Ok(Self {
            hold_time,
            current: ActiveSet::empty(),
            stable_since: Timestamp::ZERO,
            announced: false,
        })
    }

    /// Feed the snapshot observed at `now`.
    ///
    /// Returns a [`ChordEvent`] only on the update that first sees the
    /// current non-empty combination held for at least the hold time.
    pub fn update(&mut self, set: ActiveSet, now: Timestamp) -> Option<ChordEvent> {
        if set != self.current {
            self.current = set;
            self.stable_since = now;
            self.announced = false;
            return None;
        }

        if self.current.is_empty() || self.announced {
            return None;
        }

        if now.elapsed_since(self.stable_since) < self.hold_time {
            return None;
        }

        self.announced = true;
        Some(ChordEvent {
            switches: self.current.to_sorted_vec(),
            timestamp: now,
        })
    }

    /// Configured hold time.
    pub fn hold_time(&self) -> Duration {
        self.hold_time
    }

    /// The combination currently being watched.
    pub fn current(&self) -> ActiveSet {
        self.current
    }

    /// When the current combination was first observed.
    pub fn stable_since(&self) -> Timestamp {
        self.stable_since
    }

    /// Whether the current combination has already fired.
    pub fn is_announced(&self) -> bool {
        self.announced
    }

    /// Current phase of the state machine.
    pub fn phase(&self) -> ChordPhase {
        match (self.current.is_empty(), self.announced) {
            (true, _) => ChordPhase::Idle,
            (false, false) => ChordPhase::Watching,
            (false, true) => ChordPhase::Announced,
        }
    }

    /// Return to Idle, keeping the hold time.
    pub fn reset(&mut self) {
        self.current = ActiveSet::empty();
        self.stable_since = Timestamp::ZERO;
        self.announced = false;
    }
}
