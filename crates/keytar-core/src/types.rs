//! Shared value types: switch indices, active-switch sets, timestamps and the
//! events produced by the trackers.

use crate::error::{CoreError, CoreResult};
use std::fmt;
use std::ops::Add;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of switches on the device.
pub const SWITCH_COUNT: u8 = 25;

const ALL_SWITCHES_MASK: u32 = (1u32 << SWITCH_COUNT) - 1;

// =============================================================================
// SwitchIndex
// =============================================================================

/// Identifies one physical switch, always in `0..=24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
pub struct SwitchIndex(u8);

impl SwitchIndex {
    /// Lowest switch index.
    pub const MIN: SwitchIndex = SwitchIndex(0);
    /// Highest switch index.
    pub const MAX: SwitchIndex = SwitchIndex(SWITCH_COUNT - 1);

    /// Create an index, returning `None` when out of range.
    pub const fn new(index: u8) -> Option<Self> {
        if index < SWITCH_COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    /// The raw index value.
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Iterate over every switch in ascending order.
    pub fn all() -> impl Iterator<Item = SwitchIndex> {
        (0..SWITCH_COUNT).map(SwitchIndex)
    }

    const fn bit(self) -> u32 {
        1u32 << self.0
    }
}

impl TryFrom<u8> for SwitchIndex {
    type Error = CoreError;

    fn try_from(value: u8) -> CoreResult<Self> {
        Self::new(value).ok_or(CoreError::InvalidSwitchIndex(value))
    }
}

impl From<SwitchIndex> for u8 {
    fn from(index: SwitchIndex) -> Self {
        index.0
    }
}

impl fmt::Display for SwitchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// ActiveSet
// =============================================================================

/// The exact set of switches pressed at one snapshot instant.
///
/// Stored as a bit mask, so two sets compare equal iff they hold the same
/// indices and iteration is always ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ActiveSet(u32);

impl ActiveSet {
    /// The set with no switches pressed.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build a set from a raw mask. Bits above index 24 are dropped.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & ALL_SWITCHES_MASK)
    }

    /// Raw mask, bit `i` set iff switch `i` is active.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Add a switch. Returns `true` if it was not already present.
    pub fn insert(&mut self, index: SwitchIndex) -> bool {
        let added = !self.contains(index);
        self.0 |= index.bit();
        added
    }

    /// Remove a switch. Returns `true` if it was present.
    pub fn remove(&mut self, index: SwitchIndex) -> bool {
        let present = self.contains(index);
        self.0 &= !index.bit();
        present
    }

    /// Whether the switch is in the set.
    pub const fn contains(self, index: SwitchIndex) -> bool {
        self.0 & index.bit() != 0
    }

    /// Number of active switches.
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether no switch is active.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Switches in `self` but not in `other`.
    pub const fn difference(self, other: ActiveSet) -> ActiveSet {
        ActiveSet(self.0 & !other.0)
    }

    /// Switches in both sets.
    pub const fn intersection(self, other: ActiveSet) -> ActiveSet {
        ActiveSet(self.0 & other.0)
    }

    /// Switches in either set.
    pub const fn union(self, other: ActiveSet) -> ActiveSet {
        ActiveSet(self.0 | other.0)
    }

    /// Whether every switch in `self` is also in `other`.
    pub const fn is_subset(self, other: ActiveSet) -> bool {
        self.0 & !other.0 == 0
    }

    /// Iterate the members in ascending order.
    pub fn iter(self) -> impl Iterator<Item = SwitchIndex> {
        SwitchIndex::all().filter(move |index| self.contains(*index))
    }

    /// Members as an ascending vector.
    pub fn to_sorted_vec(self) -> Vec<SwitchIndex> {
        self.iter().collect()
    }
}

impl FromIterator<SwitchIndex> for ActiveSet {
    fn from_iter<I: IntoIterator<Item = SwitchIndex>>(iter: I) -> Self {
        let mut set = ActiveSet::empty();
        for index in iter {
            set.insert(index);
        }
        set
    }
}

impl Extend<SwitchIndex> for ActiveSet {
    fn extend<I: IntoIterator<Item = SwitchIndex>>(&mut self, iter: I) {
        for index in iter {
            self.insert(index);
        }
    }
}

impl fmt::Display for ActiveSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (n, index) in self.iter().enumerate() {
            if n > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", index)?;
        }
        f.write_str("}")
    }
}

// =============================================================================
// Timestamp
// =============================================================================

/// A monotonic instant, expressed as an offset from a caller-chosen origin.
///
/// The core never reads a clock. Callers pass timestamps in, so a recorded
/// sequence of `(set, timestamp)` pairs always replays identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Timestamp(Duration);

impl Timestamp {
    /// The origin.
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    /// Timestamp at `offset` from the origin.
    pub const fn from_duration(offset: Duration) -> Self {
        Self(offset)
    }

    /// Timestamp at `millis` milliseconds from the origin.
    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Timestamp at `secs` seconds from the origin.
    ///
    /// # Panics
    ///
    /// Panics if `secs` is negative or not finite, like
    /// [`Duration::from_secs_f64`].
    pub fn from_secs_f64(secs: f64) -> Self {
        Self(Duration::from_secs_f64(secs))
    }

    /// Offset from the origin.
    pub const fn as_duration(self) -> Duration {
        self.0
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is later than `self`.
    pub fn elapsed_since(self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

// =============================================================================
// Events
// =============================================================================

/// A single switch transition relative to the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "edge", content = "key", rename_all = "snake_case"))]
pub enum EdgeEvent {
    /// The switch closed.
    Pressed(SwitchIndex),
    /// The switch opened.
    Released(SwitchIndex),
}

impl EdgeEvent {
    /// The switch this event refers to.
    pub const fn index(self) -> SwitchIndex {
        match self {
            EdgeEvent::Pressed(index) | EdgeEvent::Released(index) => index,
        }
    }
}

/// A combination that stayed unchanged for at least the hold time.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChordEvent {
    /// Strictly ascending, non-empty.
    pub switches: Vec<SwitchIndex>,
    /// When the chord was recognized.
    pub timestamp: Timestamp,
}

impl ChordEvent {
    /// The chord as a set.
    pub fn as_set(&self) -> ActiveSet {
        self.switches.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(i: u8) -> SwitchIndex {
        SwitchIndex::new(i).unwrap()
    }

    #[test]
    fn test_switch_index_range() {
        assert_eq!(SwitchIndex::new(0), Some(SwitchIndex::MIN));
        assert_eq!(SwitchIndex::new(24), Some(SwitchIndex::MAX));
        assert_eq!(SwitchIndex::new(25), None);
        assert_eq!(
            SwitchIndex::try_from(200),
            Err(CoreError::InvalidSwitchIndex(200))
        );
        assert_eq!(SwitchIndex::all().count(), 25);
    }

    #[test]
    fn test_active_set_equality_ignores_insertion_order() {
        let a: ActiveSet = [idx(3), idx(1), idx(24)].into_iter().collect();
        let b: ActiveSet = [idx(24), idx(3), idx(1), idx(1)].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_active_set_iterates_ascending() {
        let set: ActiveSet = [idx(20), idx(0), idx(7)].into_iter().collect();
        assert_eq!(set.to_sorted_vec(), vec![idx(0), idx(7), idx(20)]);
        assert_eq!(set.to_string(), "{0, 7, 20}");
    }

    #[test]
    fn test_active_set_operations() {
        let a: ActiveSet = [idx(1), idx(2), idx(3)].into_iter().collect();
        let b: ActiveSet = [idx(3), idx(4)].into_iter().collect();

        assert_eq!(a.difference(b).to_sorted_vec(), vec![idx(1), idx(2)]);
        assert_eq!(a.intersection(b).to_sorted_vec(), vec![idx(3)]);
        assert_eq!(a.union(b).len(), 4);
        assert!(a.intersection(b).is_subset(a));
        assert!(!b.is_subset(a));

        let mut c = a;
        assert!(c.remove(idx(2)));
        assert!(!c.remove(idx(2)));
        assert!(!c.insert(idx(1)));
        assert!(!c.contains(idx(2)));
    }

    #[test]
    fn test_from_bits_masks_out_of_range() {
        let set = ActiveSet::from_bits(u32::MAX);
        assert_eq!(set.len(), 25);
        assert_eq!(set.iter().last(), Some(SwitchIndex::MAX));
    }

    #[test]
    fn test_timestamp_elapsed_saturates() {
        let early = Timestamp::from_millis(100);
        let late = Timestamp::from_millis(350);
        assert_eq!(late.elapsed_since(early), Duration::from_millis(250));
        assert_eq!(early.elapsed_since(late), Duration::ZERO);
        assert_eq!(early + Duration::from_millis(250), late);
    }

    #[test]
    fn test_chord_event_as_set() {
        let event = ChordEvent {
            switches: vec![idx(1), idx(2)],
            timestamp: Timestamp::ZERO,
        };
        assert_eq!(event.as_set().to_sorted_vec(), event.switches);
    }
}
