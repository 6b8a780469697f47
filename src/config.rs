//! Configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults ([`KeytarConfig::default`])
//! 2. A TOML file (`config/keytar.toml` unless another path is given)
//! 3. Environment variables prefixed with `KEYTAR_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use keytar_chords::config::KeytarConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // KEYTAR_CHORDS__HOLD_TIME_MS=150 overrides the file value
//! let config = KeytarConfig::load()?;
//! config.validate()?;
//! println!("Hold time: {:?}", config.chords.hold_time());
//! # Ok(())
//! # }
//! ```

use crate::error::{AppError, AppResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/keytar.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeytarConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Where reports come from
    pub device: DeviceConfig,
    /// Stable chord detection
    pub chords: ChordsConfig,
    /// Per-key note events
    pub notes: NotesConfig,
    /// Event publishing
    pub publish: PublishConfig,
    /// Simulated keyboard script
    pub mock: MockConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    Pretty,
    /// Single line, no colors
    Compact,
    /// One JSON object per line
    Json,
}

/// Which packet source to open
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// The keyboard over USB, found by vendor and product ID
    Device,
    /// A capture file of hex-encoded reports
    Replay,
    /// The built-in simulated keyboard
    Mock,
}

/// Packet source configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Source type
    pub source: SourceKind,
    /// Capture file for the replay source
    pub path: Option<PathBuf>,
    /// Bytes per interrupt transfer read from the keyboard
    pub packet_size: usize,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Delay between poll cycles in milliseconds
    pub loop_delay_ms: u64,
    /// Start a capture file over when it ends
    pub loop_replay: bool,
    /// Consecutive transport failures tolerated before the loop gives up
    pub max_consecutive_errors: u32,
}

/// Chord detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChordsConfig {
    /// Whether to run the chord detector
    pub enabled: bool,
    /// How long a combination must stay unchanged, in milliseconds
    pub hold_time_ms: u64,
    /// Topic chord events are published on
    pub topic: String,
}

/// Note output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotesConfig {
    /// Whether to track key edges and emit note on/off
    pub enabled: bool,
    /// MIDI note number of key 0
    pub base_note: u8,
    /// Octave number used when naming key 0
    pub name_octave: i8,
    /// MIDI channel (0-15)
    pub channel: u8,
    /// Note velocity (0-127)
    pub velocity: u8,
    /// Topic note events are published on
    pub topic: String,
    /// Raw MIDI device node to write note messages to (e.g. `/dev/snd/midiC1D0`)
    pub midi_out: Option<PathBuf>,
}

/// Publisher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishConfig {
    /// File to append JSON lines to; standard output when unset
    pub output: Option<PathBuf>,
    /// MQTT broker; takes precedence over `output` when set
    pub mqtt: Option<MqttConfig>,
}

/// MQTT broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name or address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Optional user name
    pub username: Option<String>,
    /// Password, only sent together with `username`
    pub password: Option<String>,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,
    /// Quality of service for every message (0, 1 or 2)
    pub qos: u8,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "keytar-chords".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            qos: 0,
        }
    }
}

impl MqttConfig {
    /// Keep-alive interval as a duration.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// One step of the simulated keyboard script
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MockStepConfig {
    /// Keys held during this step
    pub keys: Vec<u8>,
    /// Number of reports to emit for this step
    pub repeat: u32,
}

/// Simulated keyboard configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MockConfig {
    /// Script played by the simulated keyboard
    pub steps: Vec<MockStepConfig>,
    /// Play the script again when it ends
    pub repeat_script: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "keytar-chords".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Mock,
            path: None,
            packet_size: keytar_core::REPORT_LEN,
            read_timeout_ms: 500,
            loop_delay_ms: 10,
            loop_replay: false,
            max_consecutive_errors: 10,
        }
    }
}

impl Default for ChordsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hold_time_ms: 200,
            topic: "keytar/chords".to_string(),
        }
    }
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_note: 48,
            name_octave: 1,
            channel: 0,
            velocity: 100,
            topic: "keytar/notes".to_string(),
            midi_out: None,
        }
    }
}

impl Default for MockConfig {
    fn default() -> Self {
        // C major, F major, G major triads over the lowest octave, with rests
        let triad = |keys: &[u8]| MockStepConfig {
            keys: keys.to_vec(),
            repeat: 40,
        };
        let rest = MockStepConfig {
            keys: vec![],
            repeat: 10,
        };
        Self {
            steps: vec![
                triad(&[0, 4, 7]),
                rest.clone(),
                triad(&[5, 9, 12]),
                rest.clone(),
                triad(&[7, 11, 14]),
                rest,
            ],
            repeat_script: false,
        }
    }
}

impl ChordsConfig {
    /// Hold time as a duration.
    pub fn hold_time(&self) -> Duration {
        Duration::from_millis(self.hold_time_ms)
    }
}

impl DeviceConfig {
    /// Read timeout as a duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Poll loop delay as a duration.
    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms)
    }
}

impl KeytarConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// A missing file is not an error; defaults and environment still apply.
    /// Example override: `KEYTAR_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The provider stack used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(KeytarConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("KEYTAR_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !self.chords.enabled && !self.notes.enabled {
            return Err(invalid(
                "Nothing to do: enable at least one of [chords] or [notes]",
            ));
        }

        if self.chords.hold_time_ms == 0 {
            return Err(invalid("chords.hold_time_ms must be greater than 0"));
        }

        if self.device.packet_size < keytar_core::MIN_PACKET_LEN {
            return Err(invalid(format!(
                "device.packet_size {} is below the minimum of {}",
                self.device.packet_size,
                keytar_core::MIN_PACKET_LEN
            )));
        }

        if self.device.read_timeout_ms == 0 {
            return Err(invalid("device.read_timeout_ms must be greater than 0"));
        }

        if self.device.source == SourceKind::Replay && self.device.path.is_none() {
            return Err(invalid("device.path is required for source 'replay'"));
        }

        if self.notes.channel > 15 {
            return Err(invalid(format!(
                "Invalid notes.channel {}. Must be 0-15",
                self.notes.channel
            )));
        }

        if self.notes.velocity > 127 {
            return Err(invalid(format!(
                "Invalid notes.velocity {}. Must be 0-127",
                self.notes.velocity
            )));
        }

        let top_note = self.notes.base_note as u16 + (keytar_core::SWITCH_COUNT as u16 - 1);
        if top_note > 127 {
            return Err(invalid(format!(
                "notes.base_note {} puts the top key at {}, above MIDI note 127",
                self.notes.base_note, top_note
            )));
        }

        if let Some(mqtt) = &self.publish.mqtt {
            if mqtt.host.trim().is_empty() {
                return Err(invalid("publish.mqtt.host must not be empty"));
            }
            if mqtt.port == 0 {
                return Err(invalid("publish.mqtt.port must be greater than 0"));
            }
            if mqtt.qos > 2 {
                return Err(invalid(format!(
                    "Invalid publish.mqtt.qos {}. Must be 0, 1 or 2",
                    mqtt.qos
                )));
            }
            if mqtt.password.is_some() && mqtt.username.is_none() {
                return Err(invalid("publish.mqtt.password requires publish.mqtt.username"));
            }
            // The MQTT client requires at least 5 s; the wire field is 16 bits
            if mqtt.keep_alive_secs < 5 || mqtt.keep_alive_secs > u64::from(u16::MAX) {
                return Err(invalid(format!(
                    "publish.mqtt.keep_alive_secs {} must be between 5 and {}",
                    mqtt.keep_alive_secs,
                    u16::MAX
                )));
            }
        }

        for (n, step) in self.mock.steps.iter().enumerate() {
            if let Some(bad) = step.keys.iter().find(|k| **k >= keytar_core::SWITCH_COUNT) {
                return Err(invalid(format!(
                    "mock.steps[{}] names key {}, keys are 0-24",
                    n, bad
                )));
            }
        }

        Ok(())
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| AppError::Configuration(e.to_string()))
    }
}

impl SourceKind {
    /// Lowercase name as used in configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Device => "device",
            SourceKind::Replay => "replay",
            SourceKind::Mock => "mock",
        }
    }
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::Configuration(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = KeytarConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chords.hold_time(), Duration::from_millis(200));
        assert_eq!(config.device.read_timeout(), Duration::from_millis(500));
        assert_eq!(config.device.loop_delay(), Duration::from_millis(10));
        assert_eq!(config.device.packet_size, 27);
        assert_eq!(config.notes.base_note, 48);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = KeytarConfig::load_from("does-not-exist.toml")
                .map_err(|e| e.to_string())?;
            assert_eq!(config, KeytarConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "keytar.toml",
                r#"
                [device]
                source = "replay"
                path = "capture.hex"

                [chords]
                hold_time_ms = 300

                [notes]
                enabled = true
                base_note = 36
                "#,
            )?;
            jail.set_env("KEYTAR_CHORDS__HOLD_TIME_MS", "150");
            jail.set_env("KEYTAR_APPLICATION__LOG_LEVEL", "debug");

            let config = KeytarConfig::load_from("keytar.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.device.source, SourceKind::Replay);
            assert_eq!(config.device.path, Some(PathBuf::from("capture.hex")));
            assert_eq!(config.chords.hold_time_ms, 150);
            assert!(config.notes.enabled);
            assert_eq!(config.notes.base_note, 36);
            assert_eq!(config.notes.velocity, 100);
            assert_eq!(config.application.log_level, "debug");
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_zero_hold_time_rejected() {
        let mut config = KeytarConfig::default();
        config.chords.hold_time_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(AppError::Configuration(msg)) if msg.contains("hold_time_ms")
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = KeytarConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mqtt_section_from_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "keytar.toml",
                r#"
                [publish.mqtt]
                host = "homeassistant.local"
                username = "keytar"
                "#,
            )?;
            jail.set_env("KEYTAR_PUBLISH__MQTT__PASSWORD", "RB3keytar");

            let config = KeytarConfig::load_from("keytar.toml").map_err(|e| e.to_string())?;
            let mqtt = config.publish.mqtt.clone().ok_or("mqtt section missing")?;
            assert_eq!(mqtt.host, "homeassistant.local");
            assert_eq!(mqtt.port, 1883);
            assert_eq!(mqtt.username.as_deref(), Some("keytar"));
            assert_eq!(mqtt.password.as_deref(), Some("RB3keytar"));
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_mqtt_validation() {
        let mut config = KeytarConfig::default();
        config.publish.mqtt = Some(MqttConfig {
            qos: 3,
            ..MqttConfig::default()
        });
        assert!(config.validate().is_err());

        config.publish.mqtt = Some(MqttConfig {
            password: Some("secret".into()),
            ..MqttConfig::default()
        });
        assert!(config.validate().is_err());

        config.publish.mqtt = Some(MqttConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nothing_enabled_rejected() {
        let mut config = KeytarConfig::default();
        config.chords.enabled = false;
        config.notes.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_only_replay_source_needs_path() {
        let mut config = KeytarConfig::default();
        config.device.source = SourceKind::Device;
        assert!(config.validate().is_ok());
        config.device.source = SourceKind::Replay;
        assert!(config.validate().is_err());
        config.device.path = Some(PathBuf::from("capture.hex"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_note_range_checks() {
        let mut config = KeytarConfig::default();
        config.notes.base_note = 110;
        assert!(config.validate().is_err());

        let mut config = KeytarConfig::default();
        config.notes.channel = 16;
        assert!(config.validate().is_err());

        let mut config = KeytarConfig::default();
        config.notes.velocity = 128;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_packet_size_rejected() {
        let mut config = KeytarConfig::default();
        config.device.packet_size = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mock_keys_in_range() {
        let mut config = KeytarConfig::default();
        config.mock.steps.push(MockStepConfig {
            keys: vec![3, 25],
            repeat: 1,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = KeytarConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed: KeytarConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
