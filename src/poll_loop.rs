//! The poll loop: source → decoder → edge tracker / chord detector → outputs.
//!
//! One cycle reads a report, decodes it, feeds the decoded set to whichever
//! stages are enabled and dispatches what they produce, then waits for the
//! loop delay. A cycle finishes completely before the next read starts.
//!
//! Malformed reports are dropped before they reach either stage, so a short
//! frame can neither fake a release nor restart the chord window.
//!
//! Note output keeps its own set of sounding notes next to the edge tracker.
//! A note stays sounding until the sink has accepted its note-off, so a
//! failed note-off is sent again on the next snapshot and at shutdown.

use crate::clock::{Clock, MonotonicClock};
use crate::config::KeytarConfig;
use crate::error::{AppError, AppResult};
use crate::notes::{NoteMapper, NoteMessage, NoteSink};
use crate::publish::{ChordPayload, NoteEventPayload, Publisher};
use crate::transport::{PacketSource, ReadOutcome};
use chrono::Utc;
use keytar_core::{decode, ActiveSet, ChordDetector, ChordEvent, EdgeEvent, EdgeTracker};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

/// Timing and error tolerance of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// How long one read may wait for a report
    pub read_timeout: Duration,
    /// Pause between cycles
    pub loop_delay: Duration,
    /// Consecutive transient failures tolerated before the loop gives up
    pub max_consecutive_errors: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(500),
            loop_delay: Duration::from_millis(10),
            max_consecutive_errors: 10,
        }
    }
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollStats {
    /// Reports read, malformed ones included
    pub reports: u64,
    /// Reads that timed out
    pub timeouts: u64,
    /// Reports discarded as malformed
    pub malformed: u64,
    /// Transient failures from the source or the outputs
    pub errors: u64,
    /// Note on/off messages dispatched
    pub notes: u64,
    /// Chords announced
    pub chords: u64,
}

/// Per-key note output.
pub struct NoteOutput {
    tracker: EdgeTracker,
    sounding: ActiveSet,
    sink: Option<Box<dyn NoteSink>>,
    channel: u8,
    velocity: u8,
    topic: String,
}

impl NoteOutput {
    /// Note output on `channel` with fixed `velocity`, published on `topic`.
    pub fn new(channel: u8, velocity: u8, topic: impl Into<String>) -> Self {
        Self {
            tracker: EdgeTracker::new(),
            sounding: ActiveSet::empty(),
            sink: None,
            channel,
            velocity,
            topic: topic.into(),
        }
    }

    /// Also deliver messages to `sink`.
    pub fn with_sink(mut self, sink: Box<dyn NoteSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Keys whose note-on was delivered and whose note-off was not.
    pub fn sounding(&self) -> ActiveSet {
        self.sounding
    }
}

/// Stable chord output.
pub struct ChordOutput {
    detector: ChordDetector,
    topic: String,
}

impl ChordOutput {
    /// Chord output with the given hold time, published on `topic`.
    ///
    /// # Errors
    ///
    /// Fails if `hold_time` is zero.
    pub fn new(hold_time: Duration, topic: impl Into<String>) -> AppResult<Self> {
        Ok(Self {
            detector: ChordDetector::new(hold_time)?,
            topic: topic.into(),
        })
    }
}

/// Owns one packet source and drives it until shutdown.
pub struct PollLoop {
    source: Box<dyn PacketSource>,
    publisher: Box<dyn Publisher>,
    clock: Arc<dyn Clock>,
    mapper: NoteMapper,
    notes: Option<NoteOutput>,
    chords: Option<ChordOutput>,
    settings: PollSettings,
    stats: PollStats,
    consecutive_errors: u32,
}

impl PollLoop {
    /// A loop with no outputs enabled, the default mapper and a monotonic clock.
    pub fn new(source: Box<dyn PacketSource>, publisher: Box<dyn Publisher>) -> Self {
        Self {
            source,
            publisher,
            clock: Arc::new(MonotonicClock::new()),
            mapper: NoteMapper::default(),
            notes: None,
            chords: None,
            settings: PollSettings::default(),
            stats: PollStats::default(),
            consecutive_errors: 0,
        }
    }

    /// A loop configured from `config`.
    pub fn from_config(
        config: &KeytarConfig,
        source: Box<dyn PacketSource>,
        publisher: Box<dyn Publisher>,
        note_sink: Option<Box<dyn NoteSink>>,
    ) -> AppResult<Self> {
        let mut poll = Self::new(source, publisher)
            .with_mapper(NoteMapper::from_config(&config.notes)?)
            .with_settings(PollSettings {
                read_timeout: config.device.read_timeout(),
                loop_delay: config.device.loop_delay(),
                max_consecutive_errors: config.device.max_consecutive_errors,
            });

        if config.notes.enabled {
            let mut output = NoteOutput::new(
                config.notes.channel,
                config.notes.velocity,
                config.notes.topic.clone(),
            );
            if let Some(sink) = note_sink {
                output = output.with_sink(sink);
            }
            poll = poll.with_notes(output);
        }

        if config.chords.enabled {
            poll = poll.with_chords(ChordOutput::new(
                config.chords.hold_time(),
                config.chords.topic.clone(),
            )?);
        }

        Ok(poll)
    }

    /// Use `clock` for chord timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `mapper` for note numbers and names.
    pub fn with_mapper(mut self, mapper: NoteMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Emit per-key notes.
    pub fn with_notes(mut self, notes: NoteOutput) -> Self {
        self.notes = Some(notes);
        self
    }

    /// Announce stable chords.
    pub fn with_chords(mut self, chords: ChordOutput) -> Self {
        self.chords = Some(chords);
        self
    }

    /// Override timing and error tolerance.
    pub fn with_settings(mut self, settings: PollSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Counters so far.
    pub fn stats(&self) -> PollStats {
        self.stats
    }

    /// Run until `shutdown` fires or the source closes.
    ///
    /// Keys still held when the loop ends get a note-off. The source, sink
    /// and publisher are closed before returning.
    ///
    /// # Errors
    ///
    /// Returns the first permanent error, or the last transient one once
    /// more than `max_consecutive_errors` occur in a row.
    #[instrument(skip_all, fields(source = %self.source.name()))]
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> AppResult<PollStats> {
        info!(
            notes = self.notes.is_some(),
            chords = self.chords.is_some(),
            read_timeout_ms = self.settings.read_timeout.as_millis() as u64,
            loop_delay_ms = self.settings.loop_delay.as_millis() as u64,
            "Poll loop started"
        );

        let result = loop {
            let read = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                outcome = self.source.read_packet(self.settings.read_timeout) => Some(outcome),
            };
            let Some(outcome) = read else {
                info!("Shutdown requested");
                break Ok(());
            };

            match self.step(outcome).await {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) if e.is_transient() => {
                    self.stats.errors += 1;
                    self.consecutive_errors += 1;
                    warn!(error = %e, consecutive = self.consecutive_errors, "Poll cycle failed");
                    if self.consecutive_errors > self.settings.max_consecutive_errors {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                _ = tokio::time::sleep(self.settings.loop_delay) => {}
            }
        };

        self.finish().await;

        info!(
            reports = self.stats.reports,
            malformed = self.stats.malformed,
            notes = self.stats.notes,
            chords = self.stats.chords,
            errors = self.stats.errors,
            "Poll loop stopped"
        );
        result.map(|()| self.stats)
    }

    /// Handle one read. Returns `false` once the source has closed.
    async fn step(&mut self, outcome: AppResult<ReadOutcome>) -> AppResult<bool> {
        match outcome? {
            ReadOutcome::TimedOut => {
                self.stats.timeouts += 1;
                self.consecutive_errors = 0;
                Ok(true)
            }
            ReadOutcome::Closed => {
                info!("Source closed");
                Ok(false)
            }
            ReadOutcome::Report(report) => {
                self.stats.reports += 1;
                match decode(&report) {
                    Ok(active) => {
                        self.process(active).await?;
                        self.consecutive_errors = 0;
                    }
                    Err(e) => {
                        self.stats.malformed += 1;
                        warn!(len = report.len(), error = %e, "Discarding malformed report");
                    }
                }
                Ok(true)
            }
        }
    }

    /// Feed one decoded snapshot to the enabled stages.
    ///
    /// Both stages see the snapshot before anything is sent, and every
    /// message is attempted even when an earlier one fails. The first
    /// failure is returned afterwards.
    async fn process(&mut self, active: ActiveSet) -> AppResult<()> {
        let now = self.clock.now();
        let chord = self
            .chords
            .as_mut()
            .and_then(|chords| chords.detector.update(active, now));

        let edges: Vec<EdgeEvent> = match self.notes.as_mut() {
            Some(notes) => {
                let update = notes.tracker.update(active);
                let releases = notes.sounding.difference(active);
                let presses = update.pressed.difference(notes.sounding);
                releases
                    .iter()
                    .map(EdgeEvent::Released)
                    .chain(presses.iter().map(EdgeEvent::Pressed))
                    .collect()
            }
            None => Vec::new(),
        };

        let mut first_error = None;
        for edge in edges {
            if let Err(e) = self.dispatch_note(edge).await {
                warn!(error = %e, key = edge.index().get(), "Note dispatch failed");
                first_error.get_or_insert(e);
            }
        }

        if let Some(event) = chord {
            if let Err(e) = self.publish_chord(&event).await {
                warn!(error = %e, "Chord publish failed");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn publish_chord(&mut self, event: &ChordEvent) -> AppResult<()> {
        let Some(chords) = self.chords.as_ref() else {
            return Ok(());
        };
        let payload = ChordPayload::new(event, &self.mapper, Utc::now());
        info!(chord = ?payload.chord, keys = ?payload.keys, "Chord");
        self.publisher
            .publish(&chords.topic, &serde_json::to_value(&payload)?)
            .await?;
        self.stats.chords += 1;
        Ok(())
    }

    /// Send one note message to the sink, then publish it.
    ///
    /// The publish is attempted even if the sink fails. The sounding set
    /// follows the sink; without a sink it follows the attempt.
    async fn dispatch_note(&mut self, edge: EdgeEvent) -> AppResult<()> {
        let Some(notes) = self.notes.as_mut() else {
            return Ok(());
        };
        let message = NoteMessage::from_edge(edge, &self.mapper, notes.channel, notes.velocity);
        debug!(
            kind = message.kind.as_str(),
            key = message.key.get(),
            note = message.note,
            "Key edge"
        );

        let delivered = match notes.sink.as_mut() {
            Some(sink) => sink.send(&message).await,
            None => Ok(()),
        };
        if delivered.is_ok() {
            match edge {
                EdgeEvent::Pressed(key) => notes.sounding.insert(key),
                EdgeEvent::Released(key) => notes.sounding.remove(key),
            };
        }

        let payload = NoteEventPayload::new(&message, Utc::now());
        let published = match serde_json::to_value(&payload) {
            Ok(value) => self.publisher.publish(&notes.topic, &value).await,
            Err(e) => Err(e.into()),
        };

        delivered.and(published)?;
        self.stats.notes += 1;
        Ok(())
    }

    /// Release sounding notes and close everything. Failures are logged only.
    async fn finish(&mut self) {
        let sounding = match self.notes.as_mut() {
            Some(notes) => {
                notes.tracker.reset();
                notes.sounding
            }
            None => ActiveSet::empty(),
        };
        for key in sounding.iter() {
            if let Err(e) = self.dispatch_note(EdgeEvent::Released(key)).await {
                warn!(error = %e, key = key.get(), "Failed to release held key");
            }
        }

        if let Some(sink) = self.notes.as_mut().and_then(|n| n.sink.as_mut()) {
            log_close_error("note sink", sink.close().await);
        }
        log_close_error("publisher", self.publisher.close().await);
        log_close_error("source", self.source.close().await);
    }
}

fn log_close_error(what: &str, result: AppResult<()>) {
    if let Err(e) = result {
        warn!(error = %e, "Failed to close {}", what);
    }
}

impl std::fmt::Debug for PollLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollLoop")
            .field("source", &self.source.name())
            .field("notes", &self.notes.is_some())
            .field("chords", &self.chords.is_some())
            .field("settings", &self.settings)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notes::ChannelNoteSink;
    use crate::publish::ChannelPublisher;
    use crate::transport::{MockKeytar, MockStep};

    fn settings() -> PollSettings {
        PollSettings {
            read_timeout: Duration::from_millis(50),
            loop_delay: Duration::ZERO,
            max_consecutive_errors: 3,
        }
    }

    #[tokio::test]
    async fn test_notes_for_scripted_presses() {
        let keyboard = MockKeytar::new(vec![
            MockStep::new(&[0], 2).unwrap(),
            MockStep::new(&[0, 4], 1).unwrap(),
            MockStep::new(&[], 1).unwrap(),
        ]);
        let (sink, mut rx) = ChannelNoteSink::new();
        let bus = ChannelPublisher::new(64);
        let mut messages = bus.subscribe();

        let poll = PollLoop::new(Box::new(keyboard), Box::new(bus))
            .with_settings(settings())
            .with_notes(NoteOutput::new(0, 100, "keytar/notes").with_sink(Box::new(sink)));

        let (_tx, shutdown) = oneshot::channel();
        let stats = poll.run(shutdown).await.unwrap();

        assert_eq!(stats.reports, 4);
        assert_eq!(stats.notes, 4);
        assert_eq!(stats.chords, 0);

        let mut notes = Vec::new();
        while let Ok(message) = rx.try_recv() {
            notes.push((message.kind.as_str(), message.note));
        }
        assert_eq!(
            notes,
            vec![
                ("note_on", 48),
                ("note_on", 52),
                ("note_off", 48),
                ("note_off", 52)
            ]
        );

        let first = messages.recv().await.unwrap();
        assert_eq!(first.topic, "keytar/notes");
        assert_eq!(first.payload["event"], "note_on");
        assert_eq!(first.payload["key_index"], 0);
    }

    #[tokio::test]
    async fn test_malformed_reports_do_not_touch_state() {
        let keyboard = MockKeytar::new(vec![MockStep::new(&[3], 5).unwrap()])
            .with_malformed_every(2);
        let (sink, mut rx) = ChannelNoteSink::new();

        let poll = PollLoop::new(Box::new(keyboard), Box::new(ChannelPublisher::new(16)))
            .with_settings(settings())
            .with_notes(NoteOutput::new(0, 100, "n").with_sink(Box::new(sink)));

        let (_tx, shutdown) = oneshot::channel();
        let stats = poll.run(shutdown).await.unwrap();

        assert_eq!(stats.malformed, 2);
        // One press and the release at shutdown; the short frames never
        // looked like an all-released snapshot
        assert_eq!(stats.notes, 2);
        let mut kinds = Vec::new();
        while let Ok(message) = rx.try_recv() {
            kinds.push(message.kind.as_str());
        }
        assert_eq!(kinds, vec!["note_on", "note_off"]);
    }

    /// Forwards to a channel but rejects the `fail_on`th message (1-based).
    struct FlakySink {
        inner: ChannelNoteSink,
        calls: usize,
        fail_on: usize,
    }

    #[async_trait::async_trait]
    impl NoteSink for FlakySink {
        async fn send(&mut self, message: &NoteMessage) -> AppResult<()> {
            self.calls += 1;
            if self.calls == self.fail_on {
                return Err(AppError::Transport("MIDI port busy".into()));
            }
            self.inner.send(message).await
        }
    }

    async fn run_with_flaky_sink(
        steps: Vec<MockStep>,
        fail_on: usize,
    ) -> (PollStats, Vec<(&'static str, u8)>) {
        let (inner, mut rx) = ChannelNoteSink::new();
        let sink = FlakySink {
            inner,
            calls: 0,
            fail_on,
        };
        let poll = PollLoop::new(
            Box::new(MockKeytar::new(steps)),
            Box::new(ChannelPublisher::new(16)),
        )
        .with_settings(settings())
        .with_notes(NoteOutput::new(0, 100, "n").with_sink(Box::new(sink)));

        let (_tx, shutdown) = oneshot::channel();
        let stats = poll.run(shutdown).await.unwrap();

        let mut sent = Vec::new();
        while let Ok(message) = rx.try_recv() {
            sent.push((message.kind.as_str(), message.note));
        }
        (stats, sent)
    }

    #[tokio::test]
    async fn test_failed_note_off_is_sent_again() {
        let (stats, sent) = run_with_flaky_sink(
            vec![
                MockStep::new(&[0, 4], 1).unwrap(),
                MockStep::new(&[], 3).unwrap(),
            ],
            3,
        )
        .await;

        // The first note-off fails; the second one in the same snapshot still
        // goes out and the first is retried on the next snapshot
        assert_eq!(
            sent,
            vec![
                ("note_on", 48),
                ("note_on", 52),
                ("note_off", 52),
                ("note_off", 48)
            ]
        );
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.notes, 4);
    }

    #[tokio::test]
    async fn test_failed_note_off_released_at_shutdown() {
        let (stats, sent) = run_with_flaky_sink(
            vec![
                MockStep::new(&[2], 1).unwrap(),
                MockStep::new(&[], 1).unwrap(),
            ],
            2,
        )
        .await;

        assert_eq!(sent, vec![("note_on", 50), ("note_off", 50)]);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_chord_still_announced_when_note_fails() {
        let clock = ManualClock::new();
        let (inner, _rx) = ChannelNoteSink::new();
        let sink = FlakySink {
            inner,
            calls: 0,
            fail_on: 1,
        };
        let bus = ChannelPublisher::new(32);
        let mut messages = bus.subscribe();

        let mut poll = PollLoop::new(
            Box::new(MockKeytar::new(Vec::new())),
            Box::new(bus),
        )
        .with_clock(Arc::new(clock.clone()))
        .with_notes(NoteOutput::new(0, 100, "n").with_sink(Box::new(sink)))
        .with_chords(ChordOutput::new(Duration::from_millis(100), "c").unwrap());

        let chord: ActiveSet = [0u8, 4, 7]
            .iter()
            .map(|k| keytar_core::SwitchIndex::new(*k).unwrap())
            .collect();
        assert!(poll.process(chord).await.is_err());
        clock.advance(Duration::from_millis(100));
        poll.process(chord).await.unwrap();

        let mut topics = Vec::new();
        while let Ok(message) = messages.try_recv() {
            topics.push(message.topic);
        }
        assert_eq!(topics.iter().filter(|t| *t == "c").count(), 1);
        assert_eq!(poll.stats().chords, 1);
        // Key 0's note-on failed, so it is not sounding and gets no note-off
        let sounding = poll.notes.as_ref().unwrap().sounding();
        assert_eq!(sounding.len(), 2);
    }

    #[tokio::test]
    async fn test_chord_announced_once_with_manual_clock() {
        let clock = ManualClock::new();
        // Each report advances the clock by 100ms via the source below
        struct Ticking {
            inner: MockKeytar,
            clock: ManualClock,
        }
        #[async_trait::async_trait]
        impl PacketSource for Ticking {
            fn name(&self) -> &str {
                "ticking"
            }
            async fn read_packet(&mut self, timeout: Duration) -> AppResult<ReadOutcome> {
                self.clock.advance(Duration::from_millis(100));
                self.inner.read_packet(timeout).await
            }
        }

        let source = Ticking {
            inner: MockKeytar::new(vec![
                MockStep::new(&[7, 0, 4], 6).unwrap(),
                MockStep::new(&[], 3).unwrap(),
            ]),
            clock: clock.clone(),
        };
        let bus = ChannelPublisher::new(16);
        let mut messages = bus.subscribe();

        let poll = PollLoop::new(Box::new(source), Box::new(bus))
            .with_clock(Arc::new(clock))
            .with_settings(settings())
            .with_chords(ChordOutput::new(Duration::from_millis(200), "keytar/chords").unwrap());

        let (_tx, shutdown) = oneshot::channel();
        let stats = poll.run(shutdown).await.unwrap();
        assert_eq!(stats.chords, 1);

        let chord = messages.recv().await.unwrap();
        assert_eq!(chord.topic, "keytar/chords");
        assert_eq!(chord.payload["chord"], serde_json::json!(["C1", "E1", "G1"]));
        assert_eq!(chord.payload["keys"], serde_json::json!([0, 4, 7]));
        assert!(messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_endless_source() {
        let keyboard = MockKeytar::new(vec![MockStep::new(&[1], 1).unwrap()]).repeat_script(true);
        let poll = PollLoop::new(Box::new(keyboard), Box::new(ChannelPublisher::new(4)))
            .with_settings(PollSettings {
                loop_delay: Duration::from_millis(1),
                ..settings()
            })
            .with_chords(ChordOutput::new(Duration::from_millis(20), "c").unwrap());

        let (tx, shutdown) = oneshot::channel();
        let handle = tokio::spawn(poll.run(shutdown));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(stats.reports > 0);
    }

    #[tokio::test]
    async fn test_persistent_transport_errors_abort() {
        struct Broken;
        #[async_trait::async_trait]
        impl PacketSource for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            async fn read_packet(&mut self, _timeout: Duration) -> AppResult<ReadOutcome> {
                Err(AppError::Transport("unplugged".into()))
            }
        }

        let poll = PollLoop::new(Box::new(Broken), Box::new(ChannelPublisher::new(4)))
            .with_settings(settings())
            .with_chords(ChordOutput::new(Duration::from_millis(200), "c").unwrap());

        let (_tx, shutdown) = oneshot::channel();
        let err = poll.run(shutdown).await.unwrap_err();
        assert!(matches!(err, AppError::Transport(_)));
    }

    #[test]
    fn test_zero_hold_time_fails_fast() {
        let err = ChordOutput::new(Duration::ZERO, "c").err().unwrap();
        assert!(matches!(
            err,
            AppError::Core(keytar_core::CoreError::InvalidHoldTime)
        ));
        assert!(ChordOutput::new(Duration::from_millis(1), "c").is_ok());
    }

    #[test]
    fn test_from_config_enables_stages() {
        let mut config = KeytarConfig::default();
        config.notes.enabled = true;
        let source = MockKeytar::from_config(&config.mock).unwrap();
        let poll = PollLoop::from_config(
            &config,
            Box::new(source),
            Box::new(ChannelPublisher::new(4)),
            None,
        )
        .unwrap();
        assert!(poll.notes.is_some());
        assert!(poll.chords.is_some());
        assert_eq!(poll.settings.read_timeout, Duration::from_millis(500));
        assert_eq!(poll.stats(), PollStats::default());
    }
}
