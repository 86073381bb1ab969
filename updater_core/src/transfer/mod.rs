//! TCP folder transfer.
//!
//! This module provides:
//! - Recursive folder enumeration with wire-safe relative paths
//! - The versioned record codec and length-prefixed framing
//! - The sending session that streams a folder to a device
//! - The device-side receiver that unpacks a stream

pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod walk;

// Re-export public API
pub use protocol::{FileRecord, RecordError, decode_record, encode_record, read_record};
pub use receiver::TransferReceiver;
pub use sender::{SessionOutcome, send_folder};
pub use walk::enumerate_folder;
