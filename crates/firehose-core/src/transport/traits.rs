//! Transport layer abstraction.
//!
//! Defines the `Transport` trait for the byte channel a Firehose loader sits
//! behind, allowing different implementations (nusb, mock, etc.).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Timeouts are an expected part of the polling loops; everything else is
    /// fatal to the in-flight exchange.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Abstract duplex byte-channel interface.
///
/// This trait enables:
/// - Production implementation using nusb (EDL bulk endpoints)
/// - Mock implementation for unit testing
/// - Future alternative backends (serial tty, network bridge)
pub trait Transport: Send + Sync {
    /// Write raw bytes to the device.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` raw bytes, blocking at most the current read
    /// timeout. An elapsed timeout returns `TransportError::Timeout`.
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Set the per-read timeout. Callers that shorten it for a scoped
    /// operation are responsible for restoring the prior value.
    fn set_read_timeout(&self, timeout: Duration);

    /// Current per-read timeout.
    fn read_timeout(&self) -> Duration;

    /// Discard any buffered input and output. Secondary errors are swallowed;
    /// a failed discard must never mask the error being recovered from.
    fn discard_buffers(&self);

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}

/// Run `f` with a temporary read timeout, restoring the prior value on every
/// path, including errors.
pub fn with_read_timeout<T, R>(transport: &T, timeout: Duration, f: impl FnOnce(&T) -> R) -> R
where
    T: Transport + ?Sized,
{
    let old = transport.read_timeout();
    transport.set_read_timeout(timeout);
    let result = f(transport);
    transport.set_read_timeout(old);
    result
}
