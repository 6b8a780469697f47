//! # keytar-core
//!
//! Core logic for turning a 25-key keyboard controller's status reports into
//! musical events. Nothing here performs I/O or reads a clock; callers feed
//! bytes and timestamps in and dispatch the results.
//!
//! ## Data flow
//!
//! ```text
//! raw report ──decode──▶ ActiveSet ─┬──▶ EdgeTracker   ──▶ EdgeEvent*
//!                                   └──▶ ChordDetector ──▶ Option<ChordEvent>
//! ```
//!
//! The edge tracker and the chord detector consume the same decoded set
//! independently and never interact.
//!
//! ## Modules
//!
//! - **`decoder`**: [`decode`] a report into an [`ActiveSet`], and [`encode`]
//!   the inverse for simulated devices.
//! - **`edge`**: [`EdgeTracker`] producing press/release edges.
//! - **`chord`**: [`ChordDetector`], the debounced single-fire chord detector.
//! - **`types`**: [`SwitchIndex`], [`ActiveSet`], [`Timestamp`] and the event types.
//! - **`error`**: [`CoreError`].
//!
//! All types are single-owner and `Send`; share them across threads only
//! behind external synchronization.

pub mod chord;
pub mod decoder;
pub mod edge;
pub mod error;
pub mod types;

pub use chord::{ChordDetector, ChordPhase};
pub use decoder::{decode, encode, MIN_PACKET_LEN, REPORT_LEN};
pub use edge::{EdgeTracker, EdgeUpdate};
pub use error::{CoreError, CoreResult};
pub use types::{ActiveSet, ChordEvent, EdgeEvent, SwitchIndex, Timestamp, SWITCH_COUNT};
