//! nusb-based transport for Qualcomm EDL devices.
//!
//! An EDL device enumerates as VID 0x05C6 / PID 0x9008 with one bulk IN and
//! one bulk OUT endpoint on interface 0; the Firehose XML dialogue and the
//! raw payload both travel over those two endpoints.

use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use nusb::transfer::{Bulk, In, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{Transport, TransportError};

/// Qualcomm Vendor ID.
pub const QUALCOMM_VENDOR_ID: u16 = 0x05C6;

/// Emergency Download mode Product ID (QDLoader 9008).
pub const EDL_PRODUCT_ID: u16 = 0x9008;

/// Diagnostics-mode PID some devices expose before rebooting into EDL.
pub const DIAG_PRODUCT_ID: u16 = 0x900E;

/// All PIDs accepted during device discovery.
pub const SUPPORTED_PIDS: &[u16] = &[EDL_PRODUCT_ID, DIAG_PRODUCT_ID];

/// nusb-based EDL transport.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
    read_timeout: Mutex<Duration>,
}

impl NusbTransport {
    /// Open any matching EDL device (tries all supported PIDs).
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for device_info in devices {
            if device_info.vendor_id() == QUALCOMM_VENDOR_ID
                && SUPPORTED_PIDS.contains(&device_info.product_id())
            {
                return Self::open_device_info(device_info);
            }
        }

        Err(TransportError::DeviceNotFound {
            vid: QUALCOMM_VENDOR_ID,
            pid: 0,
        })
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        // Find BULK endpoints
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() == 0 {
                    for alt in iface.alt_settings() {
                        for ep in alt.endpoints() {
                            if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                                if ep.direction() == nusb::transfer::Direction::In {
                                    in_endpoint = ep.address();
                                } else {
                                    out_endpoint = ep.address();
                                }
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            });
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Device opened successfully"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            vid,
            pid,
            read_timeout: Mutex::new(Duration::from_millis(5000)),
        })
    }
}

impl Transport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(4096);
        writer
            .write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len))]
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(4096);
        let mut buf = vec![0u8; max_len];

        let n = reader
            .read(&mut buf)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn set_read_timeout(&self, timeout: Duration) {
        *self.read_timeout.lock().unwrap() = timeout;
    }

    fn read_timeout(&self) -> Duration {
        *self.read_timeout.lock().unwrap()
    }

    fn discard_buffers(&self) {
        // Bulk endpoints keep no host-side buffer beyond the reader; drain
        // whatever the loader already queued with short non-blocking reads.
        // Errors here are deliberately swallowed.
        if let Ok(ep) = self.interface.endpoint::<Bulk, In>(self.in_endpoint) {
            let mut reader = ep.reader(4096);
            let mut trash = [0u8; 4096];
            for _ in 0..4 {
                match reader.read(&mut trash) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        // nusb doesn't provide a direct "is connected" check.
        true
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
