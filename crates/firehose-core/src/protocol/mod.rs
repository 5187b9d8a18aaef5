//! Firehose wire protocol: XML command building, packet framing, response
//! classification, and the command/response engine.

pub mod engine;
pub mod framer;
pub mod response;
pub mod xml;

pub use engine::{FirehoseEngine, ProtocolError, RetryPolicy};
pub use framer::{FramingError, PacketFramer, RawModeScanner, RawScan};
pub use response::{CommandStatus, ParsedPacket, ProtocolResponse, parse_packet};
pub use xml::{CommandBuilder, Element, scan_elements};
