//! Flashing session orchestration.
//!
//! A `FirehoseSession` owns one protocol engine and drives the full loader
//! lifecycle: authentication, storage configuration, then transfers. All
//! transfer paths stream through a bounded buffer; nothing materializes a
//! whole partition in memory.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, AuthStrategy, authenticate};
use crate::events::{NullObserver, SessionEvent, SessionObserver, SessionPhase};
use crate::gpt::parse_gpt;
use crate::partition::PartitionInfo;
use crate::protocol::{
    CommandBuilder, FirehoseEngine, FramingError, ProtocolError, RawModeScanner, RawScan,
};
use crate::rawprogram::{PatchEntry, ProgramEntry, parse_patch_xml};
use crate::sparse::{SparseError, SparseReader, is_sparse};
use crate::transport::Transport;

/// Sectors per `<program>` exchange in chunked writes, 64 MiB at 4K sectors.
pub const WRITE_CHUNK_SECTORS: u64 = 16384;
/// Sectors per `<read>` exchange in chunked reads, 32 MiB at 4K sectors.
/// Some loaders stall on larger single reads.
pub const READ_CHUNK_SECTORS: u64 = 8192;

/// Progress deltas below these are coalesced away.
const BULK_PROGRESS_STEP: u64 = 5 * 1024 * 1024;
const FINE_PROGRESS_STEP: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Sparse(#[from] SparseError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("Device rejected {operation}: {detail}")]
    Rejected { operation: String, detail: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Cooperative cancellation flag, checked between chunks so an in-flight
/// chunk always completes and the wire stays in a known state.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Persistent session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// `ufs` or `emmc`; decides the default sector size until the loader
    /// negotiates its own.
    pub storage_type: String,
    /// Requested MaxPayloadSizeToTargetInBytes.
    pub max_payload_size: u32,
    pub write_chunk_sectors: u64,
    pub read_chunk_sectors: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            storage_type: "ufs".to_string(),
            max_payload_size: 1024 * 1024,
            write_chunk_sectors: WRITE_CHUNK_SECTORS,
            read_chunk_sectors: READ_CHUNK_SECTORS,
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| SessionError::Config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        let text =
            toml::to_string_pretty(self).map_err(|e| SessionError::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    fn default_sector_size(&self) -> u32 {
        if self.storage_type.eq_ignore_ascii_case("emmc") {
            512
        } else {
            4096
        }
    }
}

/// One flashing session against a live loader.
pub struct FirehoseSession<T: Transport> {
    engine: FirehoseEngine<T>,
    config: SessionConfig,
    sector_size: u32,
    max_payload: u32,
    phase: SessionPhase,
    observer: Arc<dyn SessionObserver>,
}

impl<T: Transport> FirehoseSession<T> {
    pub fn new(engine: FirehoseEngine<T>) -> Self {
        Self::with_config(engine, SessionConfig::default())
    }

    pub fn with_config(engine: FirehoseEngine<T>, config: SessionConfig) -> Self {
        let sector_size = config.default_sector_size();
        let max_payload = config.max_payload_size;
        Self {
            engine,
            config,
            sector_size,
            max_payload,
            phase: SessionPhase::WaitingForDevice,
            observer: Arc::new(NullObserver),
        }
    }

    pub fn set_observer(&mut self, observer: Arc<dyn SessionObserver>) {
        self.observer = observer;
    }

    pub fn engine(&self) -> &FirehoseEngine<T> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut FirehoseEngine<T> {
        &mut self.engine
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Override the sector size without a configure exchange, e.g. when
    /// resuming against an already configured loader.
    pub fn set_sector_size(&mut self, size: u32) {
        self.sector_size = size;
    }

    fn emit(&self, event: SessionEvent) {
        self.observer.on_event(&event);
    }

    fn set_phase(&mut self, to: SessionPhase) {
        if self.phase != to {
            self.emit(SessionEvent::PhaseChanged {
                from: self.phase,
                to,
            });
            self.phase = to;
        }
    }

    fn drain_device_logs(&mut self) {
        for message in self.engine.take_device_logs() {
            self.emit(SessionEvent::DeviceLog { message });
        }
    }

    fn settle(&self) {
        thread::sleep(self.engine.retry_policy().idle);
    }

    // --- lifecycle ---

    /// Run the loader handshake for the given strategy.
    pub fn authenticate(&mut self, strategy: &AuthStrategy) -> Result<(), SessionError> {
        self.set_phase(SessionPhase::Authenticating);
        authenticate(&mut self.engine, strategy)?;
        self.drain_device_logs();
        Ok(())
    }

    /// Negotiate storage configuration with the loader.
    ///
    /// The request carries our defaults; whatever sector size and payload
    /// window the response reports wins, since the loader knows the attached
    /// storage better than any host-side guess.
    pub fn configure(&mut self) -> Result<(), SessionError> {
        self.set_phase(SessionPhase::Configuring);
        self.sector_size = self.config.default_sector_size();

        let xml = CommandBuilder::new("configure")
            .attr("MemoryName", &self.config.storage_type)
            .attr("Verbose", 0)
            .attr("AlwaysValidate", 0)
            .attr("MaxPayloadSizeToTargetInBytes", self.max_payload)
            .attr("ZlpAwareHost", 0)
            .attr("SkipStorageInit", 0)
            .attr("CheckDevinfo", 0)
            .attr("EnableFlash", 1)
            .build();

        let resp = self.engine.send_command(&xml)?;
        if let Some(size) = resp.attr("SectorSizeInBytes").and_then(|v| v.parse().ok()) {
            self.sector_size = size;
        }
        if let Some(payload) = resp
            .attr("MaxPayloadSizeToTargetInBytes")
            .and_then(|v| v.parse().ok())
        {
            self.max_payload = payload;
        }
        info!(
            sector_size = self.sector_size,
            max_payload = self.max_payload,
            "Storage configured"
        );
        self.engine.purge();
        self.settle();
        self.drain_device_logs();
        self.set_phase(SessionPhase::Idle);
        Ok(())
    }

    /// Renegotiate the transfer window. Loaders that do not support
    /// reconfiguration simply keep the old window.
    pub fn set_transfer_window(&mut self, size: u32) -> Result<(), SessionError> {
        let xml = CommandBuilder::new("configure")
            .attr("MemoryName", &self.config.storage_type)
            .attr("MaxPayloadSizeToTargetInBytes", size)
            .build();
        self.engine.send_command_best_effort(&xml)?;
        self.max_payload = size;
        debug!(size, "Transfer window updated");
        Ok(())
    }

    pub fn ping(&mut self) -> Result<(), SessionError> {
        self.engine.send_command(&CommandBuilder::new("nop").build())?;
        Ok(())
    }

    /// Reboot or power off. Modes: `reset`, `off`, `reset_to_edl`.
    /// Fire-and-forget; most loaders reset before acknowledging.
    pub fn power(&mut self, mode: &str) -> Result<(), SessionError> {
        self.set_phase(SessionPhase::Resetting);
        info!(mode, "Power command");
        self.engine
            .send_command_best_effort(&CommandBuilder::new("power").attr("value", mode).build())?;
        Ok(())
    }

    pub fn set_bootable_lun(&mut self, lun: u32) -> Result<(), SessionError> {
        info!(lun, "Setting bootable storage drive");
        self.engine.send_command(
            &CommandBuilder::new("setbootablestoragedrive")
                .attr("value", lun)
                .build(),
        )?;
        Ok(())
    }

    pub fn set_active_slot(&mut self, slot: u32) -> Result<(), SessionError> {
        self.engine.send_command(
            &CommandBuilder::new("setactivepartition")
                .attr("value", slot)
                .build(),
        )?;
        Ok(())
    }

    // --- information ---

    /// Loader and storage identification, merged from response attributes
    /// and the `key: value` log lines most loaders print.
    pub fn get_device_info(&mut self) -> Result<Vec<(String, String)>, SessionError> {
        self.engine.purge();
        let resp = self
            .engine
            .send_command(&CommandBuilder::new("getdevinfo").build())?;

        let mut info: Vec<(String, String)> = resp
            .attrs
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("value"))
            .cloned()
            .collect();
        for log in self.engine.take_device_logs() {
            if let Some((key, value)) = log.split_once(':') {
                info.push((key.trim().to_string(), value.trim().to_string()));
            }
            self.emit(SessionEvent::DeviceLog { message: log });
        }
        Ok(info)
    }

    /// Raw storage report for one LUN, log lines and response attributes
    /// joined into display form.
    pub fn get_storage_info(&mut self, lun: u32) -> Result<String, SessionError> {
        self.engine.purge();
        let resp = self.engine.send_command(
            &CommandBuilder::new("getstorageinfo")
                .attr("physical_partition_number", lun)
                .build(),
        )?;

        let mut out = String::new();
        for log in self.engine.take_device_logs() {
            out.push_str(&log);
            out.push('\n');
        }
        for (name, value) in &resp.attrs {
            if !name.eq_ignore_ascii_case("value") {
                out.push_str(&format!("{name}: {value}\n"));
            }
        }
        Ok(out)
    }

    /// On-device SHA256 of a sector range. `Ok(None)` when the loader does
    /// not implement the command.
    pub fn get_sha256(
        &mut self,
        lun: u32,
        start_sector: &str,
        num_sectors: u64,
    ) -> Result<Option<String>, SessionError> {
        let xml = CommandBuilder::new("getsha256digest")
            .attr("SECTOR_SIZE_IN_BYTES", self.sector_size)
            .attr("num_partition_sectors", num_sectors)
            .attr("physical_partition_number", lun)
            .attr("start_sector", start_sector)
            .build();
        Ok(self.engine.send_command_with_attribute(&xml, "Digest")?)
    }

    // --- erase / patch ---

    pub fn erase(
        &mut self,
        start_sector: &str,
        num_sectors: u64,
        lun: &str,
    ) -> Result<(), SessionError> {
        self.set_phase(SessionPhase::Erasing);
        info!(lun, start_sector, num_sectors, "Erasing");
        let xml = CommandBuilder::new("erase")
            .attr("SECTOR_SIZE_IN_BYTES", self.sector_size)
            .attr("num_partition_sectors", num_sectors)
            .attr("physical_partition_number", lun)
            .attr("start_sector", start_sector)
            .build();
        self.engine.send_command(&xml)?;
        self.set_phase(SessionPhase::Idle);
        Ok(())
    }

    /// Send one `<patch>` command. Sector and value stay verbatim so
    /// loader-side formulas survive the trip.
    pub fn apply_patch(&mut self, patch: &PatchEntry) -> Result<(), SessionError> {
        let xml = CommandBuilder::new("patch")
            .attr("SECTOR_SIZE_IN_BYTES", self.sector_size)
            .attr("byte_offset", patch.byte_offset)
            .attr("physical_partition_number", &patch.lun)
            .attr("size_in_bytes", patch.size_in_bytes)
            .attr("start_sector", &patch.start_sector)
            .attr("value", &patch.value)
            .attr("filename", "DISK")
            .build();
        debug!(
            lun = %patch.lun,
            sector = %patch.start_sector,
            offset = patch.byte_offset,
            "Applying patch"
        );
        self.engine.send_command(&xml)?;
        Ok(())
    }

    /// Apply every patch in a patch XML document.
    pub fn apply_patch_xml(&mut self, content: &str) -> Result<usize, SessionError> {
        self.set_phase(SessionPhase::Patching);
        let patches = parse_patch_xml(content);
        for patch in &patches {
            self.apply_patch(patch).map_err(|e| SessionError::Rejected {
                operation: "patch".to_string(),
                detail: format!("sector {}: {e}", patch.start_sector),
            })?;
        }
        self.set_phase(SessionPhase::Idle);
        Ok(patches.len())
    }

    // --- writing ---

    fn program_command(
        &self,
        start_sector: &str,
        num_sectors: u64,
        lun: &str,
        label: &str,
        filename: &str,
    ) -> String {
        CommandBuilder::new("program")
            .attr("SECTOR_SIZE_IN_BYTES", self.sector_size)
            .attr("filename", filename)
            .attr("label", label)
            .attr("num_partition_sectors", num_sectors)
            .attr("physical_partition_number", lun)
            .attr("sparse", "false")
            .attr("start_sector", start_sector)
            .build()
    }

    /// Flash one image with a single `<program>` exchange.
    ///
    /// Sparse images are expanded on the fly; everything else streams as-is.
    /// The final buffer is zero-padded up to a sector multiple, matching the
    /// sector count announced in the command. Returns bytes sent, padding
    /// included.
    pub fn flash_partition(
        &mut self,
        image: &Path,
        start_sector: &str,
        lun: &str,
        label: &str,
        file_offset_bytes: u64,
        cancel: &CancelToken,
    ) -> Result<u64, SessionError> {
        self.set_phase(SessionPhase::Flashing);
        let mut file = std::fs::File::open(image)?;
        let file_len = file.metadata()?.len();

        let mut magic = [0u8; 4];
        let peeked = file.read(&mut magic)?;
        file.seek(SeekFrom::Start(0))?;
        let sparse = file_offset_bytes == 0 && peeked == 4 && is_sparse(&magic);

        let payload_len = if sparse {
            SparseReader::new(&mut file)?.expanded_size()
        } else {
            file_len.saturating_sub(file_offset_bytes)
        };
        let sector = u64::from(self.sector_size);
        let num_sectors = payload_len.div_ceil(sector);
        let total_bytes = num_sectors * sector;

        let filename = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| label.to_string());
        info!(label, start_sector, lun, num_sectors, sparse, "Flashing partition");

        self.engine.purge();
        self.settle();
        self.engine
            .send_command(&self.program_command(start_sector, num_sectors, lun, label, &filename))?;

        file.seek(SeekFrom::Start(file_offset_bytes))?;
        let sent = if sparse {
            let mut reader = SparseReader::new(&mut file)?;
            self.stream_to_device(&mut reader, total_bytes, label, cancel, BULK_PROGRESS_STEP)?
        } else {
            let mut limited = (&mut file).take(payload_len);
            self.stream_to_device(&mut limited, total_bytes, label, cancel, FINE_PROGRESS_STEP)?
        };

        self.engine.wait_for_ack()?;
        self.drain_device_logs();
        self.emit(SessionEvent::PartitionComplete {
            label: label.to_string(),
            bytes: sent,
        });
        self.set_phase(SessionPhase::Idle);
        Ok(sent)
    }

    /// Flash a large raw image as a series of bounded `<program>` exchanges.
    /// A chunk failure aborts the whole transfer; resuming into a
    /// half-written partition is worse than restarting it.
    pub fn flash_partition_chunked(
        &mut self,
        image: &Path,
        start_sector: u64,
        lun: &str,
        label: &str,
        cancel: &CancelToken,
    ) -> Result<u64, SessionError> {
        self.set_phase(SessionPhase::Flashing);
        let mut file = std::fs::File::open(image)?;
        let total_len = file.metadata()?.len();
        let sector = u64::from(self.sector_size);
        let chunk_bytes = self.config.write_chunk_sectors * sector;
        let filename = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| label.to_string());

        let mut offset = 0u64;
        let mut target_sector = start_sector;
        let mut sent_total = 0u64;
        while offset < total_len {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            let bytes = (total_len - offset).min(chunk_bytes);
            let sectors = bytes.div_ceil(sector);

            self.engine.purge();
            self.engine.send_command(&self.program_command(
                &target_sector.to_string(),
                sectors,
                lun,
                label,
                &filename,
            ))?;

            file.seek(SeekFrom::Start(offset))?;
            let mut limited = (&mut file).take(bytes);
            sent_total +=
                self.stream_to_device(&mut limited, sectors * sector, label, cancel, BULK_PROGRESS_STEP)?;
            self.engine.wait_for_ack()?;

            // Let the loader settle between chunks; back-to-back program
            // commands make some loaders drop the next XML.
            thread::sleep(self.engine.retry_policy().ack_idle);

            offset += bytes;
            target_sector += sectors;
        }
        self.drain_device_logs();
        self.set_phase(SessionPhase::Idle);
        Ok(sent_total)
    }

    /// Pump `total_bytes` from `reader` to the device in payload-window
    /// buffers, zero-filling whatever the reader cannot supply.
    fn stream_to_device(
        &mut self,
        reader: &mut dyn Read,
        total_bytes: u64,
        operation: &str,
        cancel: &CancelToken,
        report_step: u64,
    ) -> Result<u64, SessionError> {
        let mut buf = vec![0u8; self.max_payload as usize];
        let mut sent = 0u64;
        let mut last_reported = 0u64;

        while sent < total_bytes {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            let want = buf.len().min((total_bytes - sent) as usize);
            let mut filled = 0;
            while filled < want {
                let n = reader.read(&mut buf[filled..want])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            // Source exhausted: pad the remainder of this buffer with zeros
            // so the announced sector count is honored.
            buf[filled..want].fill(0);

            self.engine
                .write_raw(&buf[..want])
                .map_err(SessionError::Protocol)?;
            sent += want as u64;

            if sent - last_reported >= report_step || sent >= total_bytes {
                self.emit(SessionEvent::Progress {
                    phase: self.phase,
                    operation: operation.to_string(),
                    current: sent,
                    total: total_bytes,
                });
                last_reported = sent;
            }
        }
        Ok(sent)
    }

    // --- reading ---

    /// Read a sector range into `sink` with a single `<read>` exchange.
    ///
    /// The loader answers with a `rawmode="true"` response and then switches
    /// the wire to raw bytes; leading log packets and noise before that
    /// marker are discarded, since payload bytes can legally contain
    /// XML-looking text.
    pub fn read_partition(
        &mut self,
        sink: &mut dyn Write,
        start_sector: &str,
        num_sectors: u64,
        lun: &str,
        label: &str,
        filename: &str,
        cancel: &CancelToken,
    ) -> Result<u64, SessionError> {
        self.set_phase(SessionPhase::Reading);
        let total_bytes = num_sectors * u64::from(self.sector_size);
        info!(label, start_sector, lun, num_sectors, "Reading partition");

        let xml = CommandBuilder::new("read")
            .attr("SECTOR_SIZE_IN_BYTES", self.sector_size)
            .attr("filename", filename)
            .attr("label", label)
            .attr("num_partition_sectors", num_sectors)
            .attr("physical_partition_number", lun)
            .attr("sparse", "false")
            .attr("start_sector", start_sector)
            .build();

        self.engine.purge();
        self.engine.write_raw(xml.as_bytes())?;
        let received = self.receive_raw(sink, total_bytes, label, cancel)?;
        self.engine.wait_for_ack()?;
        self.drain_device_logs();
        self.set_phase(SessionPhase::Idle);
        Ok(received)
    }

    /// Chunked read for loaders that cap a single `<read>`.
    pub fn read_partition_chunked(
        &mut self,
        sink: &mut dyn Write,
        start_sector: u64,
        num_sectors: u64,
        lun: &str,
        label: &str,
        filename: &str,
        cancel: &CancelToken,
    ) -> Result<u64, SessionError> {
        self.set_phase(SessionPhase::Reading);
        let mut remaining = num_sectors;
        let mut current = start_sector;
        let mut received = 0u64;
        while remaining > 0 {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            let chunk = remaining.min(self.config.read_chunk_sectors);
            received += self.read_partition(
                sink,
                &current.to_string(),
                chunk,
                lun,
                label,
                filename,
                cancel,
            )?;
            remaining -= chunk;
            current += chunk;
        }
        self.set_phase(SessionPhase::Idle);
        Ok(received)
    }

    fn receive_raw(
        &mut self,
        sink: &mut dyn Write,
        total_bytes: u64,
        operation: &str,
        cancel: &CancelToken,
    ) -> Result<u64, SessionError> {
        let mut scanner = RawModeScanner::new();
        let mut received = 0u64;
        let mut last_reported = 0u64;
        let mut in_raw = false;
        let mut attempts = self.engine.retry_policy().max_attempts;

        while received < total_bytes {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            // Small reads while hunting the header, full windows after.
            let want = if in_raw {
                (self.max_payload as u64).min(total_bytes - received) as usize
            } else {
                4096
            };
            let data = match self.engine.read_raw(want) {
                Ok(data) => data,
                Err(ProtocolError::Transport(e)) if e.is_timeout() => {
                    attempts = attempts.saturating_sub(1);
                    if attempts == 0 {
                        return Err(SessionError::Rejected {
                            operation: operation.to_string(),
                            detail: "device went silent mid-transfer".to_string(),
                        });
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let payload: &[u8] = if in_raw {
                &data
            } else {
                match scanner.feed(&data)? {
                    RawScan::Pending => continue,
                    RawScan::Rejected(detail) => {
                        return Err(SessionError::Rejected {
                            operation: operation.to_string(),
                            detail,
                        });
                    }
                    RawScan::Payload(first) => {
                        in_raw = true;
                        let take = (first.len() as u64).min(total_bytes) as usize;
                        sink.write_all(&first[..take])?;
                        received += take as u64;
                        continue;
                    }
                }
            };

            let take = (payload.len() as u64).min(total_bytes - received) as usize;
            sink.write_all(&payload[..take])?;
            received += take as u64;

            if received - last_reported >= BULK_PROGRESS_STEP || received >= total_bytes {
                self.emit(SessionEvent::Progress {
                    phase: self.phase,
                    operation: operation.to_string(),
                    current: received,
                    total: total_bytes,
                });
                last_reported = received;
            }
        }
        Ok(received)
    }

    // --- GPT ---

    /// Sectors covering LBA 0 through the primary entry array.
    fn gpt_sectors(&self) -> u64 {
        if self.sector_size == 4096 { 6 } else { 34 }
    }

    /// Dump the primary GPT region of one LUN.
    pub fn read_gpt(&mut self, lun: u32) -> Result<Vec<u8>, SessionError> {
        let sectors = self.gpt_sectors();
        let mut buf = Vec::with_capacity((sectors * u64::from(self.sector_size)) as usize);
        self.read_partition(
            &mut buf,
            "0",
            sectors,
            &lun.to_string(),
            "PrimaryGPT",
            &format!("gpt_backup{lun}.bin"),
            &CancelToken::new(),
        )?;
        Ok(buf)
    }

    /// Dump the backup GPT at the end of the LUN, addressed with the
    /// loader-side `NUM_DISK_SECTORS-N.` formula since the host does not
    /// know the disk size.
    pub fn read_backup_gpt(&mut self, lun: u32) -> Result<Vec<u8>, SessionError> {
        let sectors = self.gpt_sectors();
        let start = format!("NUM_DISK_SECTORS-{sectors}.");
        let mut buf = Vec::with_capacity((sectors * u64::from(self.sector_size)) as usize);
        self.read_partition(
            &mut buf,
            &start,
            sectors,
            &lun.to_string(),
            "ssd",
            "ssd",
            &CancelToken::new(),
        )?;
        Ok(buf)
    }

    /// Read and parse the partition table of one LUN.
    pub fn load_partition_table(&mut self, lun: u32) -> Result<Vec<PartitionInfo>, SessionError> {
        let raw = self.read_gpt(lun)?;
        Ok(parse_gpt(&raw, lun))
    }

    pub fn backup_gpt(&mut self, path: &Path, lun: u32) -> Result<(), SessionError> {
        let raw = self.read_gpt(lun)?;
        std::fs::write(path, raw)?;
        info!(lun, path = %path.display(), "GPT backed up");
        Ok(())
    }

    /// Write a GPT image back to sector 0.
    pub fn restore_gpt(&mut self, path: &Path, lun: u32) -> Result<(), SessionError> {
        warn!(lun, "Restoring partition table");
        self.flash_partition(
            path,
            "0",
            &lun.to_string(),
            "PrimaryGPT",
            0,
            &CancelToken::new(),
        )?;
        Ok(())
    }

    // --- memory access ---

    /// Read loader memory. The response is raw bytes, not rawmode-framed.
    pub fn peek(&mut self, address: u64, size: usize) -> Result<Vec<u8>, SessionError> {
        let xml = CommandBuilder::new("peek")
            .attr("address64", address)
            .attr("size_in_bytes", size)
            .build();
        self.engine.purge();
        self.engine.write_raw(xml.as_bytes())?;

        let mut out = Vec::with_capacity(size);
        let mut attempts = self.engine.retry_policy().max_attempts;
        while out.len() < size {
            match self.engine.read_raw(size - out.len()) {
                Ok(data) if !data.is_empty() => out.extend_from_slice(&data),
                Ok(_) | Err(ProtocolError::Transport(_)) => {
                    attempts = attempts.saturating_sub(1);
                    if attempts == 0 {
                        return Err(SessionError::Rejected {
                            operation: "peek".to_string(),
                            detail: format!("got {}/{} bytes", out.len(), size),
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.engine.wait_for_ack()?;
        Ok(out)
    }

    /// Write loader memory, value hex-encoded in the command itself.
    pub fn poke(&mut self, address: u64, data: &[u8]) -> Result<(), SessionError> {
        let xml = CommandBuilder::new("poke")
            .attr("address64", address)
            .attr("size_in_bytes", data.len())
            .attr("value", hex::encode_upper(data))
            .build();
        self.engine.send_command_best_effort(&xml)?;
        Ok(())
    }

    /// Dump a memory range to `sink` in 1 MiB peeks.
    pub fn dump_memory(
        &mut self,
        sink: &mut dyn Write,
        start_address: u64,
        size: u64,
        cancel: &CancelToken,
    ) -> Result<(), SessionError> {
        const CHUNK: u64 = 1024 * 1024;
        let mut addr = start_address;
        let mut remaining = size;
        while remaining > 0 {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            let chunk = remaining.min(CHUNK);
            let data = self.peek(addr, chunk as usize)?;
            sink.write_all(&data)?;
            addr += chunk;
            remaining -= chunk;
            self.emit(SessionEvent::Progress {
                phase: self.phase,
                operation: "memdump".to_string(),
                current: size - remaining,
                total: size,
            });
        }
        Ok(())
    }

    // --- rawprogram jobs ---

    /// Flash every entry of a rawprogram document. Entries without a file
    /// name describe layout only and are skipped.
    pub fn run_program_entries(
        &mut self,
        image_dir: &Path,
        entries: &[ProgramEntry],
        cancel: &CancelToken,
    ) -> Result<(), SessionError> {
        for entry in entries {
            if entry.file_name.is_empty() {
                continue;
            }
            let image = image_dir.join(&entry.file_name);
            let offset = entry.file_sector_offset * u64::from(entry.sector_size);
            self.flash_partition(
                &image,
                &entry.start_sector,
                &entry.lun,
                &entry.label,
                offset,
                cancel,
            )?;
        }
        self.emit(SessionEvent::Complete);
        self.set_phase(SessionPhase::Complete);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RetryPolicy;
    use crate::transport::MockTransport;
    use std::time::Duration;

    fn session() -> FirehoseSession<MockTransport> {
        let engine = FirehoseEngine::with_retry_policy(
            MockTransport::new(),
            RetryPolicy {
                max_attempts: 5,
                poll_timeout: Duration::from_millis(1),
                idle: Duration::from_millis(1),
                ack_idle: Duration::from_millis(1),
                ..RetryPolicy::default()
            },
        );
        FirehoseSession::new(engine)
    }

    fn emmc_session() -> FirehoseSession<MockTransport> {
        let mut s = session();
        s.config.storage_type = "emmc".to_string();
        s.sector_size = 512;
        s
    }

    #[test]
    fn test_configure_negotiates_device_values() {
        let mut s = session();
        assert_eq!(s.sector_size(), 4096);
        s.engine().transport().queue_response(
            "<response value=\"ACK\" SectorSizeInBytes=\"512\" MaxPayloadSizeToTargetInBytes=\"262144\" />",
        );
        s.configure().unwrap();
        assert_eq!(s.sector_size(), 512);
        assert_eq!(s.max_payload, 262144);
        let writes = s.engine().transport().write_strings();
        assert!(writes[0].contains("<configure"));
        assert!(writes[0].contains("MemoryName=\"ufs\""));
        assert!(writes[0].contains("EnableFlash=\"1\""));
    }

    #[test]
    fn test_configure_keeps_defaults_on_bare_ack() {
        let mut s = emmc_session();
        s.engine().transport().queue_value("ACK");
        s.configure().unwrap();
        assert_eq!(s.sector_size(), 512);
    }

    #[test]
    fn test_flash_pads_to_sector_multiple() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("misc.img");
        std::fs::write(&image, vec![0xA5u8; 4097]).unwrap();

        let mut s = session();
        s.engine().transport().queue_value("ACK"); // program handshake
        s.engine().transport().queue_value("ACK"); // post-data ack

        let sent = s
            .flash_partition(&image, "100", "0", "misc", 0, &CancelToken::new())
            .unwrap();
        assert_eq!(sent, 8192); // 4097 bytes at 4K sectors

        let t = s.engine().transport();
        assert_eq!(t.bytes_written_after("<program"), 8192);
        let writes = t.write_strings();
        assert!(writes.iter().any(|w| w.contains("num_partition_sectors=\"2\"")));
        assert!(writes.iter().any(|w| w.contains("start_sector=\"100\"")));
    }

    #[test]
    fn test_flash_program_nak_aborts_before_data() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("boot.img");
        std::fs::write(&image, vec![1u8; 512]).unwrap();

        let mut s = session();
        s.engine().transport().queue_value("NAK");
        let err = s
            .flash_partition(&image, "0", "0", "boot", 0, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol(ProtocolError::Nak { .. })));
        assert_eq!(s.engine().transport().bytes_written_after("<program"), 0);
    }

    #[test]
    fn test_flash_cancelled_between_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("super.img");
        std::fs::write(&image, vec![0u8; 4096]).unwrap();

        let mut s = session();
        s.engine().transport().queue_value("ACK");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = s
            .flash_partition(&image, "0", "0", "super", 0, &cancel)
            .unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
    }

    #[test]
    fn test_read_resyncs_past_noise_to_rawmode_payload() {
        let mut s = emmc_session();
        let t = s.engine().transport();
        // Log chatter before the rawmode marker must be discarded.
        t.queue_read(b"<?xml version=\"1.0\" ?><data><log value=\"INFO: opening\" /></data>");
        let payload = vec![0x5Au8; 512];
        let mut first = Vec::new();
        first.extend_from_slice(
            b"<?xml version=\"1.0\" ?><data><response value=\"ACK\" rawmode=\"true\" /></data>",
        );
        first.extend_from_slice(&payload[..100]);
        t.queue_read(&first);
        t.queue_read(&payload[100..]);
        t.queue_value("ACK"); // post-transfer ack

        let mut sink = Vec::new();
        let got = s
            .read_partition(&mut sink, "40", 1, "0", "persist", "persist.img", &CancelToken::new())
            .unwrap();
        assert_eq!(got, 512);
        assert_eq!(sink, payload);
    }

    #[test]
    fn test_read_rejected_with_nak() {
        let mut s = emmc_session();
        s.engine().transport().queue_value("NAK");
        let mut sink = Vec::new();
        let err = s
            .read_partition(&mut sink, "0", 1, "0", "dump", "x", &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, SessionError::Rejected { .. }));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_backup_gpt_uses_symbolic_sector() {
        let mut s = session();
        let t = s.engine().transport();
        let mut resp = Vec::new();
        resp.extend_from_slice(
            b"<?xml version=\"1.0\" ?><data><response value=\"ACK\" rawmode=\"true\" /></data>",
        );
        resp.extend_from_slice(&vec![0u8; 6 * 4096]);
        t.queue_read(&resp);
        t.queue_value("ACK");

        let raw = s.read_backup_gpt(0).unwrap();
        assert_eq!(raw.len(), 6 * 4096);
        assert!(
            s.engine()
                .transport()
                .write_strings()
                .iter()
                .any(|w| w.contains("start_sector=\"NUM_DISK_SECTORS-6.\""))
        );
    }

    #[test]
    fn test_get_sha256_returns_digest_attribute() {
        let mut s = session();
        s.engine()
            .transport()
            .queue_response("<response value=\"ACK\" Digest=\"AB12\" />");
        let digest = s.get_sha256(0, "0", 8).unwrap();
        assert_eq!(digest.as_deref(), Some("AB12"));
    }

    #[test]
    fn test_apply_patch_xml_sends_verbatim_values() {
        let mut s = emmc_session();
        s.engine().transport().queue_value("ACK");
        let count = s
            .apply_patch_xml(
                r#"<patch byte_offset="88" size_in_bytes="4"
                    start_sector="NUM_DISK_SECTORS-1." value="CRC32(2,8192)"
                    physical_partition_number="0" />"#,
            )
            .unwrap();
        assert_eq!(count, 1);
        let writes = s.engine().transport().write_strings();
        assert!(writes.iter().any(|w| {
            w.contains("<patch")
                && w.contains("start_sector=\"NUM_DISK_SECTORS-1.\"")
                && w.contains("value=\"CRC32(2,8192)\"")
        }));
    }

    #[test]
    fn test_get_device_info_merges_logs_and_attrs() {
        let mut s = session();
        let t = s.engine().transport();
        t.queue_response("<log value=\"Serial Number: 0x1234ABCD\" />");
        t.queue_response("<response value=\"ACK\" ChipSerialNum=\"305441741\" />");
        let info = s.get_device_info().unwrap();
        assert!(info.iter().any(|(k, v)| k == "ChipSerialNum" && v == "305441741"));
        assert!(info.iter().any(|(k, v)| k == "Serial Number" && v == "0x1234ABCD"));
    }

    #[test]
    fn test_erase_command_shape() {
        let mut s = emmc_session();
        s.engine().transport().queue_value("ACK");
        s.erase("2048", 1024, "0").unwrap();
        let writes = s.engine().transport().write_strings();
        assert!(writes.iter().any(|w| {
            w.contains("<erase")
                && w.contains("num_partition_sectors=\"1024\"")
                && w.contains("start_sector=\"2048\"")
        }));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firehose.toml");
        let mut config = SessionConfig::default();
        config.storage_type = "emmc".to_string();
        config.max_payload_size = 262144;
        config.save(&path).unwrap();

        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded.storage_type, "emmc");
        assert_eq!(loaded.max_payload_size, 262144);
        assert_eq!(loaded.write_chunk_sectors, WRITE_CHUNK_SECTORS);
    }

    #[test]
    fn test_poke_hex_encodes_value() {
        let mut s = session();
        s.poke(0x1400_0000, &[0xDE, 0xAD]).unwrap();
        let writes = s.engine().transport().write_strings();
        assert!(writes.iter().any(|w| {
            w.contains("<poke") && w.contains("value=\"DEAD\"") && w.contains("size_in_bytes=\"2\"")
        }));
    }

    #[test]
    fn test_phase_transitions_reported() {
        struct Recorder(std::sync::Mutex<Vec<String>>);
        impl SessionObserver for Recorder {
            fn on_event(&self, event: &SessionEvent) {
                if let SessionEvent::PhaseChanged { to, .. } = event {
                    self.0.lock().unwrap().push(to.to_string());
                }
            }
        }
        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        let mut s = session();
        s.set_observer(recorder.clone());
        s.engine().transport().queue_value("ACK");
        s.configure().unwrap();
        let phases = recorder.0.lock().unwrap().clone();
        assert_eq!(phases, vec!["Configuring".to_string(), "Idle".to_string()]);
    }
}
