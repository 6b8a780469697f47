//! Edge tracker: diffs consecutive active-switch sets into press/release edges.

use crate::types::{ActiveSet, EdgeEvent};

/// Result of one [`EdgeTracker::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgeUpdate {
    /// Switches active now but not in the previous snapshot.
    pub pressed: ActiveSet,
    /// Switches active in the previous snapshot but not now.
    pub released: ActiveSet,
}

impl EdgeUpdate {
    /// Whether nothing changed.
    pub const fn is_empty(&self) -> bool {
        self.pressed.is_empty() && self.released.is_empty()
    }

    /// The edges as events: all releases first, then all presses, each in
    /// ascending switch order.
    ///
    /// Releasing before pressing lets a note-protocol consumer free a voice
    /// before it is reused within the same snapshot.
    pub fn events(&self) -> impl Iterator<Item = EdgeEvent> {
        let released = self.released.iter().map(EdgeEvent::Released);
        let pressed = self.pressed.iter().map(EdgeEvent::Pressed);
        released.chain(pressed)
    }
}

/// Remembers the previous snapshot and reports what changed.
#[derive(Debug, Clone, Default)]
pub struct EdgeTracker {
    previous: ActiveSet,
}

impl EdgeTracker {
    /// A tracker whose previous snapshot is the empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff `current` against the previous snapshot, then adopt it.
    pub fn update(&mut self, current: ActiveSet) -> EdgeUpdate {
        let update = EdgeUpdate {
            pressed: current.difference(self.previous),
            released: self.previous.difference(current),
        };
        self.previous = current;
        update
    }

    /// The most recently adopted snapshot.
    pub fn current(&self) -> ActiveSet {
        self.previous
    }

    /// Forget the previous snapshot, returning it.
    ///
    /// Callers use the returned set to release anything still held.
    pub fn reset(&mut self) -> ActiveSet {
        std::mem::take(&mut self.previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SwitchIndex;

    fn set(indices: &[u8]) -> ActiveSet {
        indices
            .iter()
            .map(|i| SwitchIndex::new(*i).unwrap())
            .collect()
    }

    #[test]
    fn test_first_update_presses_everything() {
        let mut tracker = EdgeTracker::new();
        let update = tracker.update(set(&[2, 5]));
        assert_eq!(update.pressed, set(&[2, 5]));
        assert!(update.released.is_empty());
        assert_eq!(tracker.current(), set(&[2, 5]));
    }

    #[test]
    fn test_same_set_twice_is_noop() {
        let mut tracker = EdgeTracker::new();
        tracker.update(set(&[1, 2]));
        let update = tracker.update(set(&[1, 2]));
        assert!(update.is_empty());
    }

    #[test]
    fn test_swap_reports_both_edges() {
        let mut tracker = EdgeTracker::new();
        tracker.update(set(&[1, 2]));
        let update = tracker.update(set(&[2, 3]));
        assert_eq!(update.pressed, set(&[3]));
        assert_eq!(update.released, set(&[1]));
    }

    #[test]
    fn test_events_release_before_press() {
        let mut tracker = EdgeTracker::new();
        tracker.update(set(&[4, 9]));
        let events: Vec<_> = tracker.update(set(&[1, 9, 12])).events().collect();
        let idx = |i| SwitchIndex::new(i).unwrap();
        assert_eq!(
            events,
            vec![
                EdgeEvent::Released(idx(4)),
                EdgeEvent::Pressed(idx(1)),
                EdgeEvent::Pressed(idx(12)),
            ]
        );
    }

    #[test]
    fn test_release_all() {
        let mut tracker = EdgeTracker::new();
        tracker.update(set(&[0, 24]));
        let update = tracker.update(ActiveSet::empty());
        assert_eq!(update.released, set(&[0, 24]));
        assert!(update.pressed.is_empty());
    }

    #[test]
    fn test_reset_returns_held() {
        let mut tracker = EdgeTracker::new();
        tracker.update(set(&[7]));
        assert_eq!(tracker.reset(), set(&[7]));
        assert!(tracker.current().is_empty());
    }
}
