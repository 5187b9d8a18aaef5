//! Firehose command/response engine.
//!
//! Drives the half-duplex exchange: write one XML command, poll the framer
//! for the loader's answer, classify it. The engine owns its receive buffer;
//! one engine per connection, never shared.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

use super::framer::{FramingError, PacketFramer};
use super::response::{CommandStatus, ProtocolResponse, parse_packet};
use crate::transport::{Transport, TransportError, with_read_timeout};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("Device returned NAK: {response}")]
    Nak { response: String },

    #[error("No response after {attempts} attempts")]
    NoResponse { attempts: u32 },
}

/// Retry budget for one exchange.
///
/// Implemented as a mutable remaining-attempts counter local to the exchange,
/// so the worst case stays bounded even with extensions.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Polls per exchange before giving up.
    pub max_attempts: u32,
    /// Blocking window of a single poll read.
    pub poll_timeout: Duration,
    /// Idle between polls when nothing arrived.
    pub idle: Duration,
    /// Idle after an ACK during an attribute exchange; the device is alive
    /// and computing, so back off harder.
    pub ack_idle: Duration,
    /// Attempts granted when an ACK arrives near budget exhaustion.
    pub extension: u32,
    /// Remaining-attempt threshold that triggers an extension.
    pub low_water: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            poll_timeout: Duration::from_millis(50),
            idle: Duration::from_millis(50),
            ack_idle: Duration::from_millis(200),
            extension: 5,
            low_water: 10,
        }
    }
}

/// Protocol engine for one Firehose connection.
pub struct FirehoseEngine<T: Transport> {
    transport: T,
    framer: PacketFramer,
    retry: RetryPolicy,
    device_logs: Vec<String>,
}

impl<T: Transport> FirehoseEngine<T> {
    pub fn new(transport: T) -> Self {
        Self::with_retry_policy(transport, RetryPolicy::default())
    }

    pub fn with_retry_policy(transport: T, retry: RetryPolicy) -> Self {
        Self {
            transport,
            framer: PacketFramer::new(),
            retry,
            device_logs: Vec::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Device `<log>` lines collected since the last take.
    pub fn take_device_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.device_logs)
    }

    /// Discard transport buffers, accumulated framer state, and any bytes the
    /// loader already queued. Used before starting a new command sequence to
    /// recover from stale echoed data.
    pub fn purge(&mut self) {
        // The transport discard is responsible for draining anything the
        // device already pushed.
        self.transport.discard_buffers();
        self.framer.clear();
    }

    /// Write raw payload bytes straight through, bypassing framing.
    pub fn write_raw(&self, data: &[u8]) -> Result<usize, ProtocolError> {
        Ok(self.transport.write(data)?)
    }

    /// Read raw payload bytes straight through, bypassing framing.
    pub fn read_raw(&self, max_len: usize) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.transport.read(max_len)?)
    }

    /// One poll: try the framer first, otherwise read once from the
    /// transport. A timed-out read yields `Ok(None)`.
    fn poll_response(&mut self) -> Result<Option<ProtocolResponse>, ProtocolError> {
        loop {
            if let Some(packet) = self.framer.try_extract_packet() {
                trace!(packet = %packet, "Extracted packet");
                let parsed = parse_packet(&packet);
                for log in &parsed.logs {
                    debug!(device = %log, "Device log");
                }
                self.device_logs.extend(parsed.logs);
                match parsed.response {
                    Some(resp) => return Ok(Some(resp)),
                    None => continue, // log-only packet, keep draining
                }
            }

            let read = with_read_timeout(&self.transport, self.retry.poll_timeout, |t| {
                t.read(4096)
            });
            match read {
                Ok(data) if !data.is_empty() => self.framer.feed(&data)?,
                Ok(_) => return Ok(None),
                Err(e) if e.is_timeout() => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Poll until the loader answers with ACK, data, or NAK.
    ///
    /// `ACK`/`true` succeed; a NAK carrying `rawmode="true"` also succeeds
    /// (the loader accepted the bulk data and only rejected the trailing
    /// control packet); any other non-empty value is returned as data; a
    /// plain NAK is an error.
    pub fn wait_for_response(&mut self) -> Result<ProtocolResponse, ProtocolError> {
        let mut remaining = self.retry.max_attempts;
        while remaining > 0 {
            remaining -= 1;
            match self.poll_response()? {
                Some(resp) => match resp.status() {
                    CommandStatus::Acked | CommandStatus::Data(_) => return Ok(resp),
                    CommandStatus::Nacked => {
                        return Err(ProtocolError::Nak {
                            response: format!("{:?}", resp),
                        });
                    }
                    CommandStatus::Pending => continue,
                },
                None => thread::sleep(self.retry.idle),
            }
        }
        Err(ProtocolError::NoResponse {
            attempts: self.retry.max_attempts,
        })
    }

    /// Wait specifically for a success acknowledgement.
    pub fn wait_for_ack(&mut self) -> Result<ProtocolResponse, ProtocolError> {
        let resp = self.wait_for_response()?;
        debug!(value = ?resp.value, "Response");
        Ok(resp)
    }

    /// Send one XML command and wait for its acknowledgement.
    pub fn send_command(&mut self, xml: &str) -> Result<ProtocolResponse, ProtocolError> {
        debug!(command = %xml, "Sending command");
        self.transport.write(xml.as_bytes())?;
        self.wait_for_ack()
    }

    /// Fire-and-forget: send, then drain one response if the loader offers
    /// one, logging rather than failing on rejection. Used for diagnostic
    /// commands (`nop`, best-effort `poke`) and the VIP sequence, where some
    /// loaders answer with log lines instead of structured responses.
    pub fn send_command_best_effort(&mut self, xml: &str) -> Result<(), ProtocolError> {
        debug!(command = %xml, "Sending command (best effort)");
        self.transport.write(xml.as_bytes())?;
        if let Ok(Some(resp)) = self.poll_response() {
            if resp.status() == CommandStatus::Nacked {
                warn!(response = ?resp, "Ignored rejection");
            }
        }
        Ok(())
    }

    /// Attribute-scoped exchange: send a command and wait for a response
    /// carrying `attribute` with a real value (used e.g. to fetch a
    /// challenge blob).
    ///
    /// An `ACK`/`true` in the target attribute is a keep-alive, not data: the
    /// device is alive and still computing, so the remaining budget is
    /// extended rather than exhausted. A NAK or budget exhaustion yields
    /// `Ok(None)`.
    pub fn send_command_with_attribute(
        &mut self,
        xml: &str,
        attribute: &str,
    ) -> Result<Option<String>, ProtocolError> {
        self.purge();
        debug!(command = %xml, attribute, "Sending attribute exchange");
        self.transport.write(xml.as_bytes())?;

        let mut budget = self.retry.max_attempts;
        let mut tries = 0u32;
        let mut has_acked = false;

        while tries < budget {
            tries += 1;
            match self.poll_response()? {
                Some(resp) => {
                    if let Some(val) = resp.attr(attribute) {
                        if val.eq_ignore_ascii_case("ACK") || val.eq_ignore_ascii_case("true") {
                            has_acked = true;
                            if budget - tries < self.retry.low_water {
                                budget += self.retry.extension;
                                trace!(budget, "Extended retry budget after ACK");
                            }
                            continue;
                        }
                        // A rejection can land in the target attribute itself
                        // when the attribute is `value`; never hand it back as
                        // data.
                        if val.to_ascii_uppercase().contains("NAK") {
                            return Ok(None);
                        }
                        return Ok(Some(val.to_string()));
                    }
                    if resp
                        .value
                        .as_deref()
                        .is_some_and(|v| v.to_ascii_uppercase().contains("NAK"))
                    {
                        return Ok(None);
                    }
                }
                None => thread::sleep(if has_acked {
                    self.retry.ack_idle
                } else {
                    self.retry.idle
                }),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            poll_timeout: Duration::from_millis(1),
            idle: Duration::from_millis(1),
            ack_idle: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    fn engine(max_attempts: u32) -> FirehoseEngine<MockTransport> {
        FirehoseEngine::with_retry_policy(MockTransport::new(), fast_policy(max_attempts))
    }

    #[test]
    fn test_send_command_ack() {
        let mut engine = engine(5);
        engine.transport().queue_value("ACK");
        let resp = engine.send_command("<?xml version=\"1.0\" ?><data><nop /></data>");
        assert!(resp.unwrap().is_success());
    }

    #[test]
    fn test_send_command_nak() {
        let mut engine = engine(5);
        engine.transport().queue_value("NAK");
        let err = engine
            .send_command("<?xml version=\"1.0\" ?><data><nop /></data>")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Nak { .. }));
    }

    #[test]
    fn test_nak_with_rawmode_succeeds() {
        let mut engine = engine(5);
        engine
            .transport()
            .queue_response("<response value=\"NAK\" rawmode=\"true\" />");
        let resp = engine.wait_for_ack().unwrap();
        assert!(resp.is_success());
        assert!(resp.rawmode());
    }

    #[test]
    fn test_no_response_exhausts_budget() {
        let mut engine = engine(3);
        let err = engine.wait_for_ack().unwrap_err();
        assert!(matches!(err, ProtocolError::NoResponse { attempts: 3 }));
    }

    #[test]
    fn test_fragmented_response_reassembled() {
        let mut engine = engine(10);
        engine.transport().queue_read(b"<?xml version=\"1.0\" ?><data><resp");
        engine.transport().queue_read(b"onse value=\"ACK\" /></data>");
        assert!(engine.wait_for_ack().unwrap().is_success());
    }

    #[test]
    fn test_log_packets_skipped_and_captured() {
        let mut engine = engine(10);
        engine
            .transport()
            .queue_response("<log value=\"INFO: storage init\" />");
        engine.transport().queue_value("ACK");
        assert!(engine.wait_for_ack().unwrap().is_success());
        assert_eq!(engine.take_device_logs(), vec!["INFO: storage init"]);
    }

    #[test]
    fn test_attribute_exchange_returns_data() {
        let mut engine = engine(10);
        engine
            .transport()
            .queue_response("<response value=\"BLOB1234\" />");
        let blob = engine
            .send_command_with_attribute(
                "<?xml version=\"1.0\" ?><data><sig TargetName=\"req\" /></data>",
                "value",
            )
            .unwrap();
        assert_eq!(blob.as_deref(), Some("BLOB1234"));
    }

    #[test]
    fn test_attribute_exchange_extends_budget_on_ack() {
        // Two keep-alive ACKs arrive, then the data. With a budget of 2 this
        // only succeeds if each ACK extends the remaining attempts.
        let mut engine = engine(2);
        engine.transport().queue_value("ACK");
        engine.transport().queue_value("ACK");
        engine
            .transport()
            .queue_response("<response value=\"CHALLENGE\" />");
        let blob = engine
            .send_command_with_attribute(
                "<?xml version=\"1.0\" ?><data><sig TargetName=\"req\" /></data>",
                "value",
            )
            .unwrap();
        assert_eq!(blob.as_deref(), Some("CHALLENGE"));
    }

    #[test]
    fn test_attribute_exchange_nak_yields_none() {
        let mut engine = engine(10);
        engine.transport().queue_value("NAK");
        let blob = engine
            .send_command_with_attribute(
                "<?xml version=\"1.0\" ?><data><sig TargetName=\"req\" /></data>",
                "value",
            )
            .unwrap();
        assert!(blob.is_none());
    }

    #[test]
    fn test_purge_clears_framer_and_transport() {
        let mut engine = engine(5);
        engine.transport().queue_read(b"<data><response ");
        // Pull the partial frame into the framer.
        let _ = engine.poll_response();
        engine.purge();
        engine.transport().queue_value("ACK");
        assert!(engine.wait_for_ack().unwrap().is_success());
    }
}
