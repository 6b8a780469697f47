//! USB source for the keytar.
//!
//! Opening follows the PS3 keytar's start-up sequence: detach the kernel HID
//! driver, claim the interface, then send the 40-byte enable message as a
//! HID SET_REPORT (feature) control transfer. Without it the keyboard stays
//! silent. Reports are then read from the interrupt IN endpoint. Closing
//! releases the interface and hands it back to the kernel driver.
//!
//! libusb calls block, so every transfer runs on Tokio's blocking pool. The
//! [`UsbLink`] trait separates that plumbing from the device itself.

use super::{DeviceDescriptor, PacketSource, ReadOutcome};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use bytes::Bytes;
use rusb::{DeviceHandle, GlobalContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Enable message for the RB3 PS3 keytar.
pub const RB3_HANDSHAKE: [u8; 40] = [
    0xE9, 0x00, 0x89, 0x1B, 0x00, 0x00, 0x00, 0x02, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, //
    0x00, 0x00, 0x89, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0xE9, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// A host-to-device control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTransfer {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// Data stage
    pub data: &'static [u8],
}

impl ControlTransfer {
    /// HID SET_REPORT for feature report 0 on interface 0, carrying
    /// [`RB3_HANDSHAKE`].
    pub const RB3_HANDSHAKE: ControlTransfer = ControlTransfer {
        request_type: 0x21,
        request: 0x09,
        value: 0x0300,
        index: 0,
        data: &RB3_HANDSHAKE,
    };
}

/// Blocking access to one claimed USB interface.
pub trait UsbLink: Send + 'static {
    /// Perform an OUT control transfer. Returns the bytes sent.
    fn write_control(&mut self, transfer: &ControlTransfer, timeout: Duration)
        -> AppResult<usize>;

    /// Read one interrupt transfer into `buf`. `Ok(None)` if nothing arrived
    /// within `timeout`.
    fn read_interrupt(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> AppResult<Option<usize>>;

    /// Give the interface back.
    fn release(&mut self) -> AppResult<()>;
}

/// [`UsbLink`] backed by libusb.
pub struct RusbLink {
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
    reattach: bool,
}

impl RusbLink {
    /// Find the device, detach the kernel driver if needed and claim the
    /// interface.
    pub fn open(descriptor: &DeviceDescriptor) -> AppResult<Self> {
        let mut handle =
            rusb::open_device_with_vid_pid(descriptor.vendor_id, descriptor.product_id)
                .ok_or_else(|| {
                    AppError::Transport(format!(
                        "{} ({:04x}:{:04x}) not found",
                        descriptor.name, descriptor.vendor_id, descriptor.product_id
                    ))
                })?;
        let interface = descriptor.interface;

        let reattach = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                handle.detach_kernel_driver(interface).map_err(usb_error)?;
                true
            }
            Ok(false) | Err(rusb::Error::NotSupported) => false,
            Err(e) => return Err(usb_error(e)),
        };

        match handle.set_active_configuration(1) {
            Ok(()) | Err(rusb::Error::Busy) => {}
            Err(e) => return Err(usb_error(e)),
        }
        handle.claim_interface(interface).map_err(usb_error)?;

        Ok(Self {
            handle,
            interface,
            reattach,
        })
    }
}

impl UsbLink for RusbLink {
    fn write_control(
        &mut self,
        transfer: &ControlTransfer,
        timeout: Duration,
    ) -> AppResult<usize> {
        self.handle
            .write_control(
                transfer.request_type,
                transfer.request,
                transfer.value,
                transfer.index,
                transfer.data,
                timeout,
            )
            .map_err(usb_error)
    }

    fn read_interrupt(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> AppResult<Option<usize>> {
        match self.handle.read_interrupt(endpoint, buf, timeout) {
            Ok(n) => Ok(Some(n)),
            Err(rusb::Error::Timeout) => Ok(None),
            Err(e) => Err(usb_error(e)),
        }
    }

    fn release(&mut self) -> AppResult<()> {
        self.handle
            .release_interface(self.interface)
            .map_err(usb_error)?;
        if self.reattach {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
                warn!(error = %e, "Could not reattach kernel driver");
            }
        }
        Ok(())
    }
}

fn usb_error(e: rusb::Error) -> AppError {
    AppError::Transport(format!("USB: {}", e))
}

fn join_error(e: tokio::task::JoinError) -> AppError {
    AppError::Transport(format!("USB worker failed: {}", e))
}

/// Reads reports from the keyboard over USB.
pub struct UsbSource {
    name: String,
    endpoint: u8,
    packet_size: usize,
    link: Arc<Mutex<Option<Box<dyn UsbLink>>>>,
}

impl UsbSource {
    /// Open the keyboard described by `descriptor` and send its handshake.
    pub async fn connect(descriptor: DeviceDescriptor, packet_size: usize) -> AppResult<Self> {
        let link = tokio::task::spawn_blocking(move || RusbLink::open(&descriptor))
            .await
            .map_err(join_error)??;
        Self::with_link(Box::new(link), descriptor, packet_size).await
    }

    /// Send the handshake over an already claimed `link`.
    ///
    /// The link is released again if the handshake fails.
    pub async fn with_link(
        link: Box<dyn UsbLink>,
        descriptor: DeviceDescriptor,
        packet_size: usize,
    ) -> AppResult<Self> {
        let transfer = descriptor.handshake;
        let (link, sent) = tokio::task::spawn_blocking(move || {
            let mut link = link;
            let sent = link
                .write_control(&transfer, HANDSHAKE_TIMEOUT)
                .and_then(|n| {
                    if n == transfer.data.len() {
                        Ok(n)
                    } else {
                        Err(AppError::Transport(format!(
                            "handshake sent {} of {} bytes",
                            n,
                            transfer.data.len()
                        )))
                    }
                });
            if sent.is_err() {
                if let Err(e) = link.release() {
                    warn!(error = %e, "Failed to release interface after handshake");
                }
            }
            (link, sent)
        })
        .await
        .map_err(join_error)?;
        let sent = sent?;

        if packet_size < descriptor.report_len {
            warn!(
                packet_size,
                report_len = descriptor.report_len,
                "Read size is shorter than a full report"
            );
        }

        info!(
            device = descriptor.name,
            vendor_id = %format!("{:#06x}", descriptor.vendor_id),
            product_id = %format!("{:#06x}", descriptor.product_id),
            endpoint = %format!("{:#04x}", descriptor.endpoint),
            handshake_bytes = sent,
            "Opened keyboard"
        );

        Ok(Self {
            name: format!("usb:{:04x}:{:04x}", descriptor.vendor_id, descriptor.product_id),
            endpoint: descriptor.endpoint,
            packet_size,
            link: Arc::new(Mutex::new(Some(link))),
        })
    }
}

#[async_trait]
impl PacketSource for UsbSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&mut self, timeout: Duration) -> AppResult<ReadOutcome> {
        let link = Arc::clone(&self.link);
        let endpoint = self.endpoint;
        let size = self.packet_size;
        // libusb treats a zero timeout as "wait forever"
        let timeout = timeout.max(Duration::from_millis(1));

        tokio::task::spawn_blocking(move || -> AppResult<ReadOutcome> {
            let mut guard = link.blocking_lock();
            let Some(link) = guard.as_mut() else {
                return Ok(ReadOutcome::Closed);
            };
            let mut buf = vec![0u8; size];
            match link.read_interrupt(endpoint, &mut buf, timeout)? {
                Some(n) => {
                    buf.truncate(n);
                    Ok(ReadOutcome::Report(Bytes::from(buf)))
                }
                None => Ok(ReadOutcome::TimedOut),
            }
        })
        .await
        .map_err(join_error)?
    }

    async fn close(&mut self) -> AppResult<()> {
        let Some(mut link) = self.link.lock().await.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || link.release())
            .await
            .map_err(join_error)??;
        info!(source = %self.name, "Released keyboard");
        Ok(())
    }
}
