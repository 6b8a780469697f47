//! Simulated keyboard.
//!
//! Plays a script of held key combinations as encoded reports, optionally
//! paced and with malformed frames injected, for running without hardware.
//!
//! # Example
//!
//! ```rust,ignore
//! use keytar_chords::transport::{MockKeytar, MockStep};
//!
//! let keyboard = MockKeytar::new(vec![
//!     MockStep::new(&[0, 4, 7], 30)?,   // C major for 30 reports
//!     MockStep::new(&[], 10)?,          // release
//! ])
//! .with_malformed_every(25);
//! ```

use super::{PacketSource, ReadOutcome};
use crate::config::MockConfig;
use crate::error::AppResult;
use async_trait::async_trait;
use bytes::Bytes;
use keytar_core::{encode, ActiveSet, SwitchIndex};
use std::time::Duration;

/// Keys held for a number of consecutive reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockStep {
    /// Keys held
    pub keys: ActiveSet,
    /// Reports emitted for this step
    pub repeat: u32,
}

impl MockStep {
    /// A step holding `keys` for `repeat` reports.
    pub fn new(keys: &[u8], repeat: u32) -> AppResult<Self> {
        let keys = keys
            .iter()
            .map(|k| SwitchIndex::try_from(*k))
            .collect::<Result<ActiveSet, _>>()?;
        Ok(Self { keys, repeat })
    }
}

/// Scripted keyboard.
pub struct MockKeytar {
    steps: Vec<MockStep>,
    step: usize,
    emitted_in_step: u32,
    repeat_script: bool,
    report_interval: Duration,
    malformed_every: Option<usize>,
    good_since_malformed: usize,
    reports_sent: usize,
}

impl MockKeytar {
    /// A keyboard playing `steps` once.
    pub fn new(steps: Vec<MockStep>) -> Self {
        Self {
            steps,
            step: 0,
            emitted_in_step: 0,
            repeat_script: false,
            report_interval: Duration::ZERO,
            malformed_every: None,
            good_since_malformed: 0,
            reports_sent: 0,
        }
    }

    /// Build from configuration.
    pub fn from_config(config: &MockConfig) -> AppResult<Self> {
        let steps = config
            .steps
            .iter()
            .map(|s| MockStep::new(&s.keys, s.repeat))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self::new(steps).repeat_script(config.repeat_script))
    }

    /// Start the script over when it ends.
    pub fn repeat_script(mut self, enabled: bool) -> Self {
        self.repeat_script = enabled;
        self
    }

    /// Wait this long before each report, like a device's report rate.
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Insert a truncated report after every `n` scripted reports. `0`
    /// disables injection. Truncated reports are extra: the script still
    /// plays every step in full and still ends.
    pub fn with_malformed_every(mut self, n: usize) -> Self {
        self.malformed_every = (n > 0).then_some(n);
        self
    }

    /// Reports emitted so far, including truncated ones.
    pub fn reports_sent(&self) -> usize {
        self.reports_sent
    }

    fn next_keys(&mut self) -> Option<ActiveSet> {
        loop {
            if self.step == self.steps.len() {
                if !self.repeat_script || self.steps.iter().all(|s| s.repeat == 0) {
                    return None;
                }
                self.step = 0;
            }
            let step = self.steps[self.step];
            if self.emitted_in_step < step.repeat {
                self.emitted_in_step += 1;
                return Some(step.keys);
            }
            self.step += 1;
            self.emitted_in_step = 0;
        }
    }
}

#[async_trait]
impl PacketSource for MockKeytar {
    fn name(&self) -> &str {
        "mock"
    }

    async fn read_packet(&mut self, timeout: Duration) -> AppResult<ReadOutcome> {
        if !self.report_interval.is_zero() {
            if self.report_interval > timeout {
                tokio::time::sleep(timeout).await;
                return Ok(ReadOutcome::TimedOut);
            }
            tokio::time::sleep(self.report_interval).await;
        }

        if let Some(n) = self.malformed_every {
            if self.good_since_malformed >= n {
                self.good_since_malformed = 0;
                self.reports_sent += 1;
                return Ok(ReadOutcome::Report(Bytes::from_static(&[0u8; 5])));
            }
        }

        match self.next_keys() {
            Some(keys) => {
                self.good_since_malformed += 1;
                self.reports_sent += 1;
                Ok(ReadOutcome::Report(Bytes::copy_from_slice(&encode(keys))))
            }
            None => Ok(ReadOutcome::Closed),
        }
    }
}
