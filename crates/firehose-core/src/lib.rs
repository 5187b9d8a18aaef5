//! Firehose-Core: Qualcomm Firehose (EDL) flashing protocol in Rust.
//!
//! This crate provides a host-side implementation of the Firehose protocol
//! spoken by Qualcomm Emergency Download loaders, covering partition
//! flashing, dumping, erasing, GPT handling, and loader authentication.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Protocol**: XML framing, response classification, command engine
//! - **Sparse**: Android sparse image expansion
//! - **GPT**: Partition table decoding
//! - **Rawprogram**: Factory rawprogram/patch XML handling
//! - **Auth**: Loader authentication strategies
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use firehose_core::protocol::FirehoseEngine;
//! use firehose_core::session::{CancelToken, FirehoseSession};
//! use firehose_core::transport::NusbTransport;
//!
//! let transport = NusbTransport::open().expect("no EDL device");
//! let mut session = FirehoseSession::new(FirehoseEngine::new(transport));
//! session.configure().expect("configure failed");
//! session
//!     .flash_partition(
//!         "boot.img".as_ref(),
//!         "2048",
//!         "0",
//!         "boot",
//!         0,
//!         &CancelToken::new(),
//!     )
//!     .expect("flash failed");
//! ```

pub mod auth;
pub mod events;
pub mod gpt;
pub mod partition;
pub mod protocol;
pub mod rawprogram;
pub mod session;
pub mod sparse;
pub mod transport;

// Re-exports for convenience
pub use auth::{AuthError, AuthStrategy, XiaomiAuth};
pub use events::{NullObserver, SessionEvent, SessionObserver, SessionPhase, TracingObserver};
pub use gpt::{Crc32, GptEntry, GptHeader, parse_gpt};
pub use partition::PartitionInfo;
pub use protocol::{CommandBuilder, FirehoseEngine, ProtocolError, RetryPolicy};
pub use rawprogram::{PatchEntry, ProgramEntry, parse_patch_xml, parse_program_xml};
pub use session::{CancelToken, FirehoseSession, SessionConfig, SessionError};
pub use sparse::{SparseHeader, SparseReader, is_sparse};
pub use transport::{MockTransport, NusbTransport, Transport, TransportError};
