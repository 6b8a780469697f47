//! Capture file replay.
//!
//! A capture file holds one report per line as hex digits. Whitespace between
//! bytes is allowed, `#` starts a comment, blank lines are skipped:
//!
//! ```text
//! # C major triad held
//! 00 00 00 00 00 89 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00
//! 000000000089000000000000000000000000000000000000000000
//! ```

use super::{PacketSource, ReadOutcome};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Replays reports from a capture file.
pub struct ReplaySource {
    name: String,
    reports: Vec<Bytes>,
    cursor: usize,
    looping: bool,
}

impl ReplaySource {
    /// Load and parse a capture file.
    pub async fn from_file(path: impl AsRef<Path>, looping: bool) -> AppResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let reports = parse_capture(&text)?;
        info!(
            path = %path.display(),
            reports = reports.len(),
            looping,
            "Loaded capture file"
        );
        Ok(Self::new(format!("replay:{}", path.display()), reports, looping))
    }

    /// Replay reports already in memory.
    pub fn new(name: impl Into<String>, reports: Vec<Bytes>, looping: bool) -> Self {
        Self {
            name: name.into(),
            reports,
            cursor: 0,
            looping,
        }
    }

    /// Reports not yet replayed in the current pass.
    pub fn remaining(&self) -> usize {
        self.reports.len() - self.cursor
    }
}

#[async_trait]
impl PacketSource for ReplaySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&mut self, _timeout: Duration) -> AppResult<ReadOutcome> {
        if self.cursor == self.reports.len() {
            if !self.looping || self.reports.is_empty() {
                return Ok(ReadOutcome::Closed);
            }
            debug!(source = %self.name, "Capture exhausted, starting over");
            self.cursor = 0;
        }
        let report = self.reports[self.cursor].clone();
        self.cursor += 1;
        Ok(ReadOutcome::Report(report))
    }
}

/// Parse capture text into reports.
///
/// Reports are not length-checked here; short ones reach the decoder and are
/// rejected there like any other malformed frame.
pub fn parse_capture(text: &str) -> AppResult<Vec<Bytes>> {
    let mut reports = Vec::new();
    for (n, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default();
        let digits: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if digits.is_empty() {
            continue;
        }
        reports.push(Bytes::from(parse_hex(&digits).map_err(|message| {
            AppError::ReplayParse {
                line: n + 1,
                message,
            }
        })?));
    }
    Ok(reports)
}

/// Decode a string of hex digit pairs.
pub fn parse_hex(digits: &str) -> Result<Vec<u8>, String> {
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits ({})", digits.len()));
    }
    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(format!("invalid hex digit '{}'", bad));
    }
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
            u8::from_str_radix(pair, 16).map_err(|e| e.to_string())
        })
        .collect()
}
