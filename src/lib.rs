//! # keytar_chords
//!
//! Reads status reports from a 25-key USB keyboard controller, turns them
//! into MIDI note on/off messages and announces chords once they have been
//! held steady.
//!
//! The pure state machines (report decoding, edge tracking, chord stability)
//! live in the `keytar-core` crate. This crate wires them to the outside:
//!
//! - **`transport`**: packet sources (USB keyboard, capture replay, mock keyboard)
//! - **`notes`**: key → MIDI note mapping and note sinks
//! - **`publish`**: JSON payloads and the publishers that carry them
//! - **`poll_loop`**: the read/decode/dispatch loop with graceful shutdown
//! - **`config`**: figment-based configuration (TOML file + `KEYTAR_` env)
//! - **`logging`**: `tracing-subscriber` setup
//! - **`clock`**: monotonic and manual time sources
//! - **`error`**: the application error type

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod notes;
pub mod poll_loop;
pub mod publish;
pub mod transport;

pub use config::KeytarConfig;
pub use error::{AppError, AppResult};
pub use poll_loop::{PollLoop, PollSettings, PollStats};

pub use keytar_core;
