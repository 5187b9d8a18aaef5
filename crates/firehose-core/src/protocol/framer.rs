//! Packet framing for the half-duplex Firehose byte stream.
//!
//! The loader answers with XML frames terminated by `</data>`, but the
//! transport delivers arbitrary fragments: a frame may arrive split across
//! many reads, several frames may arrive in one read, and during bulk reads
//! the binary payload can arrive coalesced with the control frame that
//! announced it. `PacketFramer` reassembles the control plane;
//! `RawModeScanner` locates the control/payload boundary.

use thiserror::Error;

/// Cap on accumulation while no frame boundary has been found. Guards against
/// a device that never emits the marker we are waiting for.
pub const MAX_HEADER_SCAN: usize = 64 * 1024;

const END_TAG: &[u8] = b"</data>";

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("No Firehose header within {buffered} buffered bytes")]
    HeaderOverflow { buffered: usize },
}

/// Reassembles complete XML packets from a fragmented byte stream.
#[derive(Debug, Default)]
pub struct PacketFramer {
    buf: Vec<u8>,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly-read bytes to the accumulator. Fails once the buffer
    /// exceeds [`MAX_HEADER_SCAN`] without a single frame boundary in sight.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_HEADER_SCAN && find_ci(&self.buf, END_TAG, 0).is_none() {
            return Err(FramingError::HeaderOverflow {
                buffered: self.buf.len(),
            });
        }
        Ok(())
    }

    /// Drop all accumulated state (purge path).
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the first complete packet delimited by `</data>`, consuming it
    /// from the accumulator. Chunks that close a `</data>` without ever
    /// opening a `<data` tag are device noise (stray logs, zero-length-packet
    /// artifacts) and are silently discarded.
    pub fn try_extract_packet(&mut self) -> Option<String> {
        loop {
            let end = find_ci(&self.buf, END_TAG, 0)?;
            let packet_len = end + END_TAG.len();
            let raw: Vec<u8> = self.buf.drain(..packet_len).collect();

            if find_ci(&raw, b"<data", 0).is_some() {
                return Some(String::from_utf8_lossy(&raw).into_owned());
            }
            // No opening tag: noise, keep scanning the remainder.
        }
    }
}

/// Outcome of one `RawModeScanner::feed` call.
#[derive(Debug, PartialEq, Eq)]
pub enum RawScan {
    /// Marker not seen yet; keep reading.
    Pending,
    /// Device rejected the command before entering rawmode.
    Rejected(String),
    /// Rawmode confirmed. Carries any payload bytes that arrived coalesced
    /// with the control frame (possibly empty).
    Payload(Vec<u8>),
}

/// Resynchronizes on the `rawmode="true"` marker that precedes a bulk binary
/// payload. Device log packets may precede the marker and are skipped.
#[derive(Debug, Default)]
pub struct RawModeScanner {
    buf: Vec<u8>,
}

impl RawModeScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one read's worth of bytes and look for the payload start.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<RawScan, FramingError> {
        self.buf.extend_from_slice(chunk);

        let marker = find_ci(&self.buf, b"rawmode=\"true\"", 0)
            .or_else(|| find_ci(&self.buf, b"rawmode='true'", 0));

        if let Some(at) = marker {
            if let Some(end) = find_ci(&self.buf, END_TAG, at) {
                let payload_start = end + END_TAG.len();
                let payload = self.buf.split_off(payload_start.min(self.buf.len()));
                self.buf.clear();
                return Ok(RawScan::Payload(payload));
            }
            // Marker seen but the frame is still open; wait for its end.
            return Ok(RawScan::Pending);
        }

        if find_ci(&self.buf, b"value=\"NAK\"", 0).is_some()
            || find_ci(&self.buf, b"Failed to run the last command", 0).is_some()
        {
            return Ok(RawScan::Rejected(
                String::from_utf8_lossy(&self.buf).into_owned(),
            ));
        }

        if self.buf.len() > MAX_HEADER_SCAN {
            return Err(FramingError::HeaderOverflow {
                buffered: self.buf.len(),
            });
        }

        Ok(RawScan::Pending)
    }
}

/// ASCII case-insensitive substring search over raw bytes.
pub(crate) fn find_ci(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    let last = haystack.len() - needle.len();
    (from..=last).find(|&i| {
        haystack[i..i + needle.len()]
            .iter()
            .zip(needle)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}
