//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{Transport, TransportError};

/// Mock transport for unit testing protocol logic.
///
/// Reads pop scripted chunks in order; an empty queue reads as a timeout,
/// which is exactly what a silent device looks like to the polling loops.
pub struct MockTransport {
    /// Queued read chunks, returned one per `read` call.
    read_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Current read timeout (stored, never actually waited on).
    read_timeout: Arc<Mutex<Duration>>,
    /// Number of `discard_buffers` calls.
    purge_count: Arc<Mutex<usize>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            read_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            read_timeout: Arc::new(Mutex::new(Duration::from_millis(50))),
            purge_count: Arc::new(Mutex::new(0)),
            vid: 0x05C6,
            pid: 0x9008,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue raw bytes to be returned on a future read.
    pub fn queue_read(&self, data: &[u8]) {
        self.read_queue.lock().unwrap().push_back(data.to_vec());
    }

    /// Queue a complete Firehose response packet.
    pub fn queue_response(&self, inner: &str) {
        self.queue_read(format!("<?xml version=\"1.0\" encoding=\"UTF-8\" ?><data>{inner}</data>").as_bytes());
    }

    /// Queue a plain `<response value="..."/>` packet.
    pub fn queue_value(&self, value: &str) {
        self.queue_response(&format!("<response value=\"{value}\" />"));
    }

    /// Get all captured writes.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Captured writes decoded as lossy UTF-8, for command assertions.
    pub fn write_strings(&self) -> Vec<String> {
        self.writes()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Total payload bytes written after the write matching `after`.
    pub fn bytes_written_after(&self, after: &str) -> usize {
        let writes = self.writes();
        let idx = writes
            .iter()
            .position(|w| String::from_utf8_lossy(w).contains(after));
        match idx {
            Some(i) => writes[i + 1..].iter().map(|w| w.len()).sum(),
            None => 0,
        }
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Number of buffer purges performed so far.
    pub fn purge_count(&self) -> usize {
        *self.purge_count.lock().unwrap()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        let mut queue = self.read_queue.lock().unwrap();
        match queue.pop_front() {
            Some(mut chunk) => {
                if chunk.len() > max_len {
                    // Requeue the tail so partial reads behave like a real port.
                    let rest = chunk.split_off(max_len);
                    queue.push_front(rest);
                }
                Ok(chunk)
            }
            None => Err(TransportError::Timeout {
                timeout_ms: self.read_timeout().as_millis() as u64,
            }),
        }
    }

    fn set_read_timeout(&self, timeout: Duration) {
        *self.read_timeout.lock().unwrap() = timeout;
    }

    fn read_timeout(&self) -> Duration {
        *self.read_timeout.lock().unwrap()
    }

    fn discard_buffers(&self) {
        // Queued chunks model responses the device has not sent yet, so a
        // purge counts the call but leaves the script intact.
        *self.purge_count.lock().unwrap() += 1;
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
