//! Publishing note and chord events as JSON messages on topics.
//!
//! Each message is a topic plus a JSON payload, the shape a message bus such
//! as MQTT expects:
//!
//! ```text
//! keytar/notes   {"event":"note_on","key_index":4,"midi_note":52,"timestamp":1718000000.125}
//! keytar/chords  {"chord":["C1","E1","G1"],"keys":[0,4,7],"timestamp":1718000000.331}
//! ```
//!
//! [`MqttPublisher`] sends them to an MQTT broker. [`JsonLinesPublisher`]
//! writes one `{"topic":..,"payload":..}` object per line instead, and
//! [`ChannelPublisher`] fans messages out in-process.

use crate::config::{MqttConfig, PublishConfig};
use crate::error::{AppError, AppResult};
use crate::notes::{NoteKind, NoteMapper, NoteMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keytar_core::ChordEvent;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Requests buffered for the MQTT connection before publishes start failing.
const MQTT_QUEUE_CAPACITY: usize = 64;
const MQTT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MQTT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Payloads
// =============================================================================

/// Payload for a single key going down or up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteEventPayload {
    /// `note_on` or `note_off`
    pub event: NoteKind,
    /// Key index, 0-24
    pub key_index: u8,
    /// MIDI note number
    pub midi_note: u8,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl NoteEventPayload {
    /// Payload for `message`, stamped with `at`.
    pub fn new(message: &NoteMessage, at: DateTime<Utc>) -> Self {
        Self {
            event: message.kind,
            key_index: message.key.get(),
            midi_note: message.note,
            timestamp: epoch_seconds(at),
        }
    }
}

/// Payload for a stable chord.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChordPayload {
    /// Note names, lowest first
    pub chord: Vec<String>,
    /// Key indices, ascending
    pub keys: Vec<u8>,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl ChordPayload {
    /// Payload for `event`, named with `mapper` and stamped with `at`.
    pub fn new(event: &ChordEvent, mapper: &NoteMapper, at: DateTime<Utc>) -> Self {
        Self {
            chord: mapper.names(&event.switches),
            keys: event.switches.iter().map(|k| k.get()).collect(),
            timestamp: epoch_seconds(at),
        }
    }
}

fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// A message as emitted by a publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedMessage {
    /// Topic name
    pub topic: String,
    /// JSON payload
    pub payload: Value,
}

// =============================================================================
// Publishers
// =============================================================================

/// Destination for published messages.
#[async_trait]
pub trait Publisher: Send {
    /// Publish `payload` on `topic`.
    async fn publish(&mut self, topic: &str, payload: &Value) -> AppResult<()>;

    /// Flush and release resources.
    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    topic: &'a str,
    payload: &'a Value,
}

/// Writes one JSON object per line.
pub struct JsonLinesPublisher<W> {
    writer: W,
}

impl<W> JsonLinesPublisher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Publisher writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesPublisher<tokio::io::Stdout> {
    /// Publisher writing to standard output.
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl JsonLinesPublisher<tokio::fs::File> {
    /// Publisher appending to `path`, creating it if needed.
    pub async fn append_to(path: impl AsRef<Path>) -> AppResult<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        info!(path = %path.as_ref().display(), "Publishing to file");
        Ok(Self::new(file))
    }
}

#[async_trait]
impl<W> Publisher for JsonLinesPublisher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn publish(&mut self, topic: &str, payload: &Value) -> AppResult<()> {
        let mut line = serde_json::to_vec(&Envelope { topic, payload })?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.writer.flush().await?;
        Ok(())
    }
}

/// In-process bus. Messages published with no subscriber are dropped.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: broadcast::Sender<PublishedMessage>,
}

impl ChannelPublisher {
    /// Bus buffering up to `capacity` messages per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&mut self, topic: &str, payload: &Value) -> AppResult<()> {
        let _ = self.tx.send(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

/// Publishes to an MQTT broker.
///
/// The connection is driven by a background task that reconnects after
/// errors. Publishing never waits for the broker: when the request queue is
/// full the message is dropped and an error returned.
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
    broker: String,
    connection: Option<JoinHandle<()>>,
}

impl MqttPublisher {
    /// Start connecting to the broker in `config`. Must be called inside a
    /// Tokio runtime.
    pub fn connect(config: &MqttConfig) -> AppResult<Self> {
        let qos = qos_level(config.qos)?;
        let broker = format!("{}:{}", config.host, config.port);

        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive());
        if let Some(username) = &config.username {
            let password = config.password.clone().unwrap_or_default();
            options.set_credentials(username.clone(), password);
        }

        let (client, eventloop) = AsyncClient::new(options, MQTT_QUEUE_CAPACITY);
        let connection = tokio::spawn(drive_connection(eventloop, broker.clone()));
        info!(broker = %broker, client_id = %config.client_id, "Publishing to MQTT broker");

        Ok(Self {
            client,
            qos,
            broker,
            connection: Some(connection),
        })
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
    }
}

fn qos_level(level: u8) -> AppResult<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(AppError::Configuration(format!(
            "Invalid MQTT QoS {}. Must be 0, 1 or 2",
            other
        ))),
    }
}

/// Poll the connection until a disconnect has been sent.
async fn drive_connection(mut eventloop: EventLoop, broker: String) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(broker = %broker, code = ?ack.code, "Connected to MQTT broker");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(broker = %broker, "Disconnected from MQTT broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(broker = %broker, error = %e, "MQTT connection failed, retrying");
                tokio::time::sleep(MQTT_RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&mut self, topic: &str, payload: &Value) -> AppResult<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.client
            .try_publish(topic, self.qos, false, bytes)
            .map_err(|e| {
                AppError::Transport(format!("MQTT publish to {} failed: {}", self.broker, e))
            })
    }

    async fn close(&mut self) -> AppResult<()> {
        let Some(mut connection) = self.connection.take() else {
            return Ok(());
        };
        if let Err(e) = self.client.try_disconnect() {
            warn!(broker = %self.broker, error = %e, "MQTT disconnect request failed");
        }
        if tokio::time::timeout(MQTT_CLOSE_TIMEOUT, &mut connection)
            .await
            .is_err()
        {
            warn!(broker = %self.broker, "MQTT connection did not close in time");
            connection.abort();
        }
        Ok(())
    }
}

/// Open the publisher selected by the configuration.
///
/// An `[publish.mqtt]` section selects the broker. Otherwise no output,
/// `"stdout"` or `"-"` means standard output, and anything else is a file to
/// append to.
pub async fn open_publisher(config: &PublishConfig) -> AppResult<Box<dyn Publisher>> {
    if let Some(mqtt) = &config.mqtt {
        return Ok(Box::new(MqttPublisher::connect(mqtt)?));
    }
    match config.output.as_deref() {
        Some(path) if path != Path::new("stdout") && path != Path::new("-") => {
            Ok(Box::new(JsonLinesPublisher::append_to(path).await?))
        }
        _ => Ok(Box::new(JsonLinesPublisher::stdout())),
    }
}
