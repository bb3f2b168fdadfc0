//! AT command transport over USB bulk endpoints.
//!
//! The SIM7600 family exposes its AT port as a vendor-specific bulk
//! interface pair; which pair depends on the product id. The transport
//! trait keeps the controller and its state machine testable against
//! scripted transcripts.

use crate::error::{AgentError, Result};
use rusb::UsbContext;
use std::time::Duration;
use tracing::{debug, info, warn};

/// SIMCOM vendor id.
pub const VENDOR_ID: u16 = 0x1e0e;

/// Known product ids:
/// 0x9001 standard mode, 0x9011 RNDIS + audio, 0x9025 ECM.
pub const PRODUCT_IDS: [u16; 3] = [0x9001, 0x9011, 0x9025];

/// Byte-level transport carrying AT commands and responses.
///
/// `read` returns `Ok(0)` on a timeout with no data; a hard device loss
/// (unplugged cable, USB reset) surfaces as `AgentError::Modem` containing
/// "no such device", which triggers the controller's reconnect path.
pub trait AtTransport: Send {
    /// Write raw bytes to the command endpoint.
    ///
    /// # Errors
    ///
    /// Fails when the device rejects the write or has disappeared.
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Read up to `buf.len()` bytes from the response endpoint.
    ///
    /// # Errors
    ///
    /// Fails when the device has disappeared; timeouts return `Ok(0)`.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

/// Factory producing fresh transports; the reconnect path re-invokes it
/// after disposing a dead handle.
pub type TransportFactory = Box<dyn Fn() -> Result<Box<dyn AtTransport>> + Send + Sync>;

/// Endpoint layout for a given product id.
#[derive(Debug, Clone, Copy)]
struct EndpointMap {
    interface: u8,
    ep_in: u8,
    ep_out: u8,
}

const fn endpoints_for(product_id: u16) -> EndpointMap {
    match product_id {
        0x9011 => EndpointMap {
            interface: 4,
            ep_in: 0x86,
            ep_out: 0x04,
        },
        _ => EndpointMap {
            interface: 2,
            ep_in: 0x84,
            ep_out: 0x03,
        },
    }
}

/// libusb-backed transport to the modem's AT interface.
pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::Context>,
    endpoints: EndpointMap,
}

impl UsbTransport {
    /// Find and claim the modem's AT command interface.
    ///
    /// # Errors
    ///
    /// Returns an error if no known modem is attached or the interface
    /// cannot be claimed.
    pub fn open() -> Result<Box<dyn AtTransport>> {
        let context = rusb::Context::new()
            .map_err(|e| AgentError::Modem(format!("libusb init failed: {e}")))?;

        let devices = context
            .devices()
            .map_err(|e| AgentError::Modem(format!("cannot list USB devices: {e}")))?;

        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != VENDOR_ID
                || !PRODUCT_IDS.contains(&descriptor.product_id())
            {
                continue;
            }

            let product_id = descriptor.product_id();
            info!("found modem (PID 0x{product_id:04x})");
            return Self::claim(&device, product_id);
        }

        Err(AgentError::Modem(
            "modem not found; check that it is connected and powered".into(),
        ))
    }

    fn claim(
        device: &rusb::Device<rusb::Context>,
        product_id: u16,
    ) -> Result<Box<dyn AtTransport>> {
        let endpoints = endpoints_for(product_id);
        if product_id == 0x9011 {
            info!("using RNDIS+audio mode endpoints (interface 4)");
        }

        let mut handle = device
            .open()
            .map_err(|e| AgentError::Modem(format!("cannot open modem: {e}")))?;

        // Clear stale state from a previous crashed session.
        if let Err(e) = handle.reset() {
            debug!("USB reset skipped: {e}");
        }

        for interface in 0..8u8 {
            match handle.kernel_driver_active(interface) {
                Ok(true) => {
                    if handle.detach_kernel_driver(interface).is_ok() {
                        debug!("detached kernel driver from interface {interface}");
                    }
                }
                _ => {}
            }
        }

        if let Err(e) = handle.set_active_configuration(1) {
            debug!("set_configuration skipped: {e}");
        }

        handle
            .claim_interface(endpoints.interface)
            .map_err(|e| AgentError::Modem(format!("cannot claim AT interface: {e}")))?;

        info!("claimed modem AT interface {}", endpoints.interface);
        Ok(Box::new(Self { handle, endpoints }))
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.endpoints.interface) {
            warn!("release_interface failed: {e}");
        }
    }
}

fn map_usb_error(err: rusb::Error) -> AgentError {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => {
            AgentError::Modem(format!("no such device: {err}"))
        }
        other => AgentError::Modem(format!("USB error: {other}")),
    }
}

impl AtTransport for UsbTransport {
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        self.handle
            .write_bulk(self.endpoints.ep_out, data, timeout)
            .map(|_| ())
            .map_err(map_usb_error)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        match self.handle.read_bulk(self.endpoints.ep_in, buf, timeout) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(map_usb_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_map_follows_product_id() {
        let audio = endpoints_for(0x9011);
        assert_eq!(
            (audio.interface, audio.ep_in, audio.ep_out),
            (4, 0x86, 0x04)
        );

        for pid in [0x9001, 0x9025] {
            let standard = endpoints_for(pid);
            assert_eq!(
                (standard.interface, standard.ep_in, standard.ep_out),
                (2, 0x84, 0x03)
            );
        }
    }
}
