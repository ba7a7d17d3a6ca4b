//! Sequential reader for the event log.

use super::{FRAME_OVERHEAD, HEADER_LEN, LOG_MAGIC, LOG_VERSION};
use crate::error::{BusError, Result};
use crate::types::{Event, EventId};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};

/// Reads events from a log file in the order they were written.
///
/// Damage confined to the final record (a short write, a bad checksum, an
/// undecodable body) ends iteration cleanly and is reported through
/// [`LogReader::trailing_damage`]. Damage with more data after it yields a
/// [`BusError::Corruption`] and ends iteration. A length prefix running
/// past the end of the file only counts as a torn tail when no intact
/// record can be found behind it.
pub struct LogReader {
    reader: BufReader<File>,
    /// Offset just past the last good record.
    offset: u64,
    file_len: u64,
    last_id: EventId,
    trailing: Option<String>,
    done: bool,
}

impl LogReader {
    /// Start reading a log file. Verifies the header.
    pub fn new(mut file: File) -> Result<Self> {
        let file_len = file.metadata()?.len();
        if file_len < HEADER_LEN {
            return Err(BusError::InvalidFormat("Log shorter than header".into()));
        }

        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(BusError::InvalidFormat("Invalid log magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(BusError::InvalidFormat(format!(
                "Unsupported log version: {}",
                version[0]
            )));
        }

        Ok(Self {
            reader,
            offset: HEADER_LEN,
            file_len,
            last_id: EventId::ZERO,
            trailing: None,
            done: false,
        })
    }

    /// Offset just past the last intact record.
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    /// Highest id read so far.
    pub fn last_id(&self) -> EventId {
        self.last_id
    }

    /// Why the tail of the log was ignored, if it was.
    pub fn trailing_damage(&self) -> Option<&str> {
        self.trailing.as_deref()
    }

    fn stop_trailing(&mut self, reason: impl Into<String>) {
        self.trailing = Some(reason.into());
        self.done = true;
    }

    fn read_next(&mut self) -> Result<Option<Event>> {
        let remaining = self.file_len - self.offset;
        if remaining == 0 {
            self.done = true;
            return Ok(None);
        }
        if remaining < 4 {
            self.stop_trailing("partial length prefix");
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as u64;

        let frame_len = len + FRAME_OVERHEAD;
        if frame_len > remaining {
            let reason = format!("record of {} bytes extends past end of log", frame_len);
            // A torn final write leaves nothing intact behind it. A damaged
            // length prefix in the middle of the log does.
            let mut rest = Vec::new();
            self.reader.read_to_end(&mut rest)?;
            if let Some(at) = find_intact_frame(&rest) {
                self.done = true;
                return Err(BusError::Corruption {
                    offset: self.offset,
                    reason: format!(
                        "{}, but an intact record follows at offset {}",
                        reason,
                        self.offset + 4 + at as u64
                    ),
                });
            }
            self.stop_trailing(reason);
            return Ok(None);
        }
        let is_last = frame_len == remaining;

        let mut encoded = vec![0u8; len as usize];
        self.reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        self.reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&encoded);

        if stored_checksum != computed_checksum {
            let err = BusError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            };
            return self.damaged(is_last, err.to_string(), &encoded, &checksum_bytes);
        }

        let event: Event = match rmp_serde::from_slice(&encoded) {
            Ok(event) => event,
            Err(e) => return self.damaged(is_last, e.to_string(), &encoded, &checksum_bytes),
        };

        if event.id <= self.last_id {
            self.done = true;
            return Err(BusError::OutOfOrder {
                offset: self.offset,
                previous: self.last_id,
                got: event.id,
            });
        }

        self.offset += frame_len;
        self.last_id = event.id;
        Ok(Some(event))
    }

    fn damaged(
        &mut self,
        is_last: bool,
        reason: String,
        body: &[u8],
        checksum: &[u8],
    ) -> Result<Option<Event>> {
        // A damaged length can make a frame end exactly at EOF while
        // swallowing intact records.
        let swallowed = is_last && {
            let mut rest = body.to_vec();
            rest.extend_from_slice(checksum);
            find_intact_frame(&rest).is_some()
        };

        if is_last && !swallowed {
            self.stop_trailing(reason);
            Ok(None)
        } else {
            self.done = true;
            Err(BusError::Corruption {
                offset: self.offset,
                reason,
            })
        }
    }
}

/// Position of the first well-formed frame in `bytes`, if any: a length
/// that fits, a matching checksum and a decodable event.
fn find_intact_frame(bytes: &[u8]) -> Option<usize> {
    let overhead = FRAME_OVERHEAD as usize;
    (0..bytes.len().saturating_sub(overhead - 1)).find(|&start| {
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[start..start + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;

        let body_start = start + 4;
        let Some(body_end) = body_start.checked_add(len) else {
            return false;
        };
        if body_end + 4 > bytes.len() {
            return false;
        }

        let body = &bytes[body_start..body_end];
        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(&bytes[body_end..body_end + 4]);
        u32::from_le_bytes(checksum_bytes) == crc32fast::hash(body)
            && rmp_serde::from_slice::<Event>(body).is_ok()
    })
}

impl Iterator for LogReader {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
