//! Durable event log.
//!
//! Every published event is appended to a single log file before it is
//! delivered to anyone. On startup the log is replayed front to back to
//! rebuild the category buffers and the last-event cache.
//!
//! Log order, id order and delivery order are the same thing: the writer
//! assigns ids under its own exclusive access and the reader rejects any
//! record whose id does not exceed the one before it.

mod log;
mod reader;

pub use log::EventLog;
pub use reader::LogReader;

/// Magic bytes for the event log.
pub(crate) const LOG_MAGIC: &[u8; 4] = b"LPB\0";

/// Current log format version.
pub(crate) const LOG_VERSION: u8 = 1;

/// Header size: magic + version.
pub(crate) const HEADER_LEN: u64 = 5;

/// Length prefix plus trailing checksum around each encoded record.
pub(crate) const FRAME_OVERHEAD: u64 = 8;
