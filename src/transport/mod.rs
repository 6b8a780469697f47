//! Packet sources: where raw status reports come from.
//!
//! The poll loop only sees the [`PacketSource`] trait. Three sources exist:
//!
//! - [`UsbSource`]: the keyboard itself, claimed over USB
//! - [`ReplaySource`]: a capture file of hex-encoded reports
//! - [`MockKeytar`]: a scripted, simulated keyboard

mod mock;
mod replay;
mod usb;

pub use mock::{MockKeytar, MockStep};
pub use replay::{parse_capture, parse_hex, ReplaySource};
pub use usb::{ControlTransfer, RusbLink, UsbLink, UsbSource, RB3_HANDSHAKE};

use crate::config::{KeytarConfig, SourceKind};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Result of one read attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A report, not yet validated.
    Report(Bytes),
    /// No report arrived within the timeout.
    TimedOut,
    /// The source has no more reports.
    Closed,
}

/// Something that yields raw status reports.
///
/// A source is owned by exactly one poll loop and read sequentially.
#[async_trait]
pub trait PacketSource: Send {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Wait up to `timeout` for the next report.
    async fn read_packet(&mut self, timeout: Duration) -> AppResult<ReadOutcome>;

    /// Release the underlying device or file.
    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// USB identity of a supported keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Product name
    pub name: &'static str,
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Interrupt IN endpoint carrying status reports
    pub endpoint: u8,
    /// Bytes per status report
    pub report_len: usize,
    /// Interface claimed from the kernel driver
    pub interface: u8,
    /// Sent once after claiming, before any report is read
    pub handshake: ControlTransfer,
}

impl DeviceDescriptor {
    /// Rock Band 3 keytar for PlayStation 3.
    pub const RB3_KEYTAR: DeviceDescriptor = DeviceDescriptor {
        name: "RB3 PS3 Keytar",
        vendor_id: 0x12ba,
        product_id: 0x2330,
        endpoint: 0x81,
        report_len: keytar_core::REPORT_LEN,
        interface: 0,
        handshake: ControlTransfer::RB3_HANDSHAKE,
    };
}

/// Open the source selected by the configuration.
pub async fn open_source(config: &KeytarConfig) -> AppResult<Box<dyn PacketSource>> {
    let device = &config.device;
    match device.source {
        SourceKind::Device => {
            let source =
                UsbSource::connect(DeviceDescriptor::RB3_KEYTAR, device.packet_size).await?;
            Ok(Box::new(source))
        }
        SourceKind::Replay => {
            let path = required_path(config)?;
            let source = ReplaySource::from_file(path, device.loop_replay).await?;
            Ok(Box::new(source))
        }
        SourceKind::Mock => Ok(Box::new(MockKeytar::from_config(&config.mock)?)),
    }
}

fn required_path(config: &KeytarConfig) -> AppResult<&std::path::Path> {
    config.device.path.as_deref().ok_or_else(|| {
        AppError::Configuration(format!(
            "device.path is required for source '{}'",
            config.device.source.as_str()
        ))
    })
}
