//! Note protocol: key edges → MIDI note on/off.
//!
//! [`NoteMapper`] decides which note a key plays and what it is called;
//! [`NoteSink`] implementations deliver the resulting [`NoteMessage`]s.
//! Key 0 is C; with the defaults it plays MIDI note 48 and is named `C1`,
//! so key 24 plays note 72 and is named `C3`.

use crate::config::NotesConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use bytes::Bytes;
use keytar_core::{EdgeEvent, SwitchIndex, SWITCH_COUNT};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

const PITCH_CLASSES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

const NOTE_ON: u8 = 0x90;
const NOTE_OFF: u8 = 0x80;

// =============================================================================
// NoteMapper
// =============================================================================

/// Maps switch indices to MIDI note numbers and note names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteMapper {
    base_note: u8,
    name_octave: i8,
}

impl NoteMapper {
    /// Key 0 plays `base_note` and is named C in octave `name_octave`.
    pub fn new(base_note: u8, name_octave: i8) -> AppResult<Self> {
        if base_note as u16 + (SWITCH_COUNT as u16 - 1) > 127 {
            return Err(AppError::Configuration(format!(
                "base note {} leaves the top key outside the MIDI range",
                base_note
            )));
        }
        Ok(Self {
            base_note,
            name_octave,
        })
    }

    /// Mapper from the `[notes]` configuration section.
    pub fn from_config(config: &NotesConfig) -> AppResult<Self> {
        Self::new(config.base_note, config.name_octave)
    }

    /// MIDI note number played by `key`.
    pub fn midi_note(&self, key: SwitchIndex) -> u8 {
        self.base_note + key.get()
    }

    /// Note name of `key`, such as `C#1`.
    pub fn note_name(&self, key: SwitchIndex) -> String {
        let i = key.get() as usize;
        let octave = self.name_octave as i16 + (i / 12) as i16;
        format!("{}{}", PITCH_CLASSES[i % 12], octave)
    }

    /// Names of several keys, in the given order.
    pub fn names(&self, keys: &[SwitchIndex]) -> Vec<String> {
        keys.iter().map(|k| self.note_name(*k)).collect()
    }
}

impl Default for NoteMapper {
    fn default() -> Self {
        Self {
            base_note: 48,
            name_octave: 1,
        }
    }
}

// =============================================================================
// NoteMessage
// =============================================================================

/// Note on or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    /// Key pressed
    NoteOn,
    /// Key released
    NoteOff,
}

impl NoteKind {
    /// `note_on` or `note_off`.
    pub fn as_str(self) -> &'static str {
        match self {
            NoteKind::NoteOn => "note_on",
            NoteKind::NoteOff => "note_off",
        }
    }
}

/// One MIDI channel voice message for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteMessage {
    /// On or off
    pub kind: NoteKind,
    /// Key that produced it
    pub key: SwitchIndex,
    /// MIDI channel, 0-15
    pub channel: u8,
    /// MIDI note number
    pub note: u8,
    /// Velocity, 0-127
    pub velocity: u8,
}

impl NoteMessage {
    /// Message for an edge event.
    ///
    /// Note-off carries the same velocity as note-on, as the keyboard has no
    /// release velocity.
    pub fn from_edge(event: EdgeEvent, mapper: &NoteMapper, channel: u8, velocity: u8) -> Self {
        let kind = match event {
            EdgeEvent::Pressed(_) => NoteKind::NoteOn,
            EdgeEvent::Released(_) => NoteKind::NoteOff,
        };
        Self {
            kind,
            key: event.index(),
            channel,
            note: mapper.midi_note(event.index()),
            velocity,
        }
    }

    /// The 3-byte MIDI 1.0 encoding.
    pub fn to_midi_bytes(&self) -> Bytes {
        let status = match self.kind {
            NoteKind::NoteOn => NOTE_ON,
            NoteKind::NoteOff => NOTE_OFF,
        };
        Bytes::copy_from_slice(&[
            status | (self.channel & 0x0F),
            self.note & 0x7F,
            self.velocity & 0x7F,
        ])
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Destination for note messages.
#[async_trait]
pub trait NoteSink: Send {
    /// Deliver one message.
    async fn send(&mut self, message: &NoteMessage) -> AppResult<()>;

    /// Flush and release resources.
    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Writes raw MIDI bytes to a device node such as `/dev/snd/midiC1D0`, or to
/// a plain file.
pub struct RawMidiSink {
    path: PathBuf,
    file: File,
}

impl RawMidiSink {
    /// Open `path` for writing, creating it if it is a plain file.
    pub async fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!(path = %path.display(), "Opened MIDI output");
        Ok(Self { path, file })
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NoteSink for RawMidiSink {
    async fn send(&mut self, message: &NoteMessage) -> AppResult<()> {
        self.file.write_all(&message.to_midi_bytes()).await?;
        self.file.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.file.flush().await?;
        Ok(())
    }
}

/// Logs note messages without sending them anywhere.
#[derive(Debug, Default)]
pub struct LogNoteSink;

#[async_trait]
impl NoteSink for LogNoteSink {
    async fn send(&mut self, message: &NoteMessage) -> AppResult<()> {
        debug!(
            kind = message.kind.as_str(),
            key = message.key.get(),
            note = message.note,
            velocity = message.velocity,
            "Note"
        );
        Ok(())
    }
}

/// Forwards note messages to an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelNoteSink {
    tx: mpsc::UnboundedSender<NoteMessage>,
}

impl ChannelNoteSink {
    /// A sink and the receiver it feeds.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NoteMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NoteSink for ChannelNoteSink {
    async fn send(&mut self, message: &NoteMessage) -> AppResult<()> {
        self.tx
            .send(*message)
            .map_err(|_| AppError::Transport("note receiver dropped".to_string()))
    }
}
