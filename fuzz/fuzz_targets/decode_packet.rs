//! Fuzz target for report decoding and the state machines behind it.
//!
//! Checks:
//! - decode never panics and only reports switches 0-24
//! - short reports are always rejected
//! - edge updates partition changes correctly
//! - the chord detector never announces the same hold twice

#![no_main]

use arbitrary::Arbitrary;
use keytar_core::{decode, ActiveSet, ChordDetector, EdgeTracker, Timestamp, MIN_PACKET_LEN};
use libfuzzer_sys::fuzz_target;
use std::time::Duration;

#[derive(Debug, Arbitrary)]
struct Frame {
    bytes: Vec<u8>,
    /// Milliseconds since the previous frame
    gap_ms: u8,
}

#[derive(Debug, Arbitrary)]
struct Input {
    hold_ms: u16,
    frames: Vec<Frame>,
}

fuzz_target!(|input: Input| {
    let hold = Duration::from_millis(u64::from(input.hold_ms.max(1)));
    let mut detector = ChordDetector::new(hold).unwrap();
    let mut tracker = EdgeTracker::new();
    let mut now = Timestamp::ZERO;
    let mut last_announced: Option<(ActiveSet, Timestamp)> = None;

    for frame in input.frames.iter().take(512) {
        now = now + Duration::from_millis(u64::from(frame.gap_ms));

        let set = match decode(&frame.bytes) {
            Ok(set) => set,
            Err(_) => {
                assert!(frame.bytes.len() < MIN_PACKET_LEN);
                continue;
            }
        };
        assert!(frame.bytes.len() >= MIN_PACKET_LEN);
        assert!(set.iter().all(|k| k.get() < 25));

        let previous = tracker.current();
        let update = tracker.update(set);
        assert_eq!(update.pressed, set.difference(previous));
        assert_eq!(update.released, previous.difference(set));
        assert!(update.pressed.intersection(update.released).is_empty());

        let since = detector.stable_since();
        if let Some(event) = detector.update(set, now) {
            assert!(!set.is_empty());
            assert_eq!(event.as_set(), set);
            assert!(now.elapsed_since(since) >= hold);
            if let Some((announced, at)) = last_announced {
                // A repeat of the same set needs a change in between
                assert!(announced != set || detector.stable_since() != at);
            }
            last_announced = Some((set, detector.stable_since()));
        }
    }
});
