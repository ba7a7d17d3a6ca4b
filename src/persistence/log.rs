//! Append-only event log.

use super::reader::LogReader;
use super::{HEADER_LEN, LOG_MAGIC, LOG_VERSION};
use crate::error::{BusError, Result};
use crate::types::{Event, EventId, Timestamp};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Append-only event log.
///
/// The log owns id assignment: the next id is always one past the highest
/// id on disk, and it only advances once a record has been written.
pub struct EventLog {
    /// Path to the log file.
    path: PathBuf,

    /// Log file handle.
    file: File,

    /// Held for the lifetime of the log.
    _lock_file: File,

    /// Next event id to assign.
    next_id: EventId,

    /// Length of the intact portion of the file.
    size: u64,

    /// Number of writes since last sync.
    writes_since_sync: u64,

    /// Sync every N writes.
    sync_interval: u64,
}

impl EventLog {
    /// Open or create a log, syncing after every append.
    pub fn open(path: impl AsRef<Path>, on_event: impl FnMut(Event)) -> Result<Self> {
        Self::open_with_sync_interval(path, 1, on_event)
    }

    /// Open or create a log, handing every stored event to `on_event` in
    /// write order before returning.
    ///
    /// - sync_interval = 0 or 1: sync every write
    /// - sync_interval = N: sync every N writes
    pub fn open_with_sync_interval(
        path: impl AsRef<Path>,
        sync_interval: u64,
        mut on_event: impl FnMut(Event),
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = Self::acquire_lock(&path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_len = file.metadata()?.len();

        let (size, last_id, replayed) = if file_len < HEADER_LEN {
            if file_len > 0 {
                warn!(path = %path.display(), file_len, "Reinitialising log with partial header");
            }
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;
            (HEADER_LEN, EventId::ZERO, 0u64)
        } else {
            let mut reader = LogReader::new(file.try_clone()?)?;
            let mut replayed = 0u64;
            for event in reader.by_ref() {
                on_event(event?);
                replayed += 1;
            }

            let valid_len = reader.valid_len();
            if let Some(reason) = reader.trailing_damage() {
                warn!(
                    path = %path.display(),
                    offset = valid_len,
                    dropped_bytes = file_len - valid_len,
                    reason,
                    "Discarding damaged tail of event log"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            (valid_len, reader.last_id(), replayed)
        };

        file.seek(SeekFrom::Start(size))?;

        info!(
            path = %path.display(),
            events = replayed,
            last_id = %last_id,
            "Opened event log"
        );

        Ok(Self {
            path,
            file,
            _lock_file: lock_file,
            next_id: last_id.next(),
            size,
            writes_since_sync: 0,
            sync_interval: sync_interval.max(1),
        })
    }

    /// Read every intact event from a log without taking ownership of it.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<Event>> {
        let file = File::open(path.as_ref())?;
        LogReader::new(file)?.collect()
    }

    /// Assign the next id to a new event and write it durably.
    ///
    /// On failure the file is cut back to its previous length and the id
    /// is not consumed.
    pub fn append(&mut self, category: &str, payload: serde_json::Value) -> Result<Event> {
        let event = Event {
            id: self.next_id,
            category: category.to_owned(),
            timestamp: Timestamp::now(),
            payload,
        };

        let encoded = rmp_serde::to_vec(&event)?;
        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());

        if let Err(e) = self.write_frame(&frame) {
            error!(path = %self.path.display(), id = %event.id, error = %e, "Event log append failed");
            self.rollback();
            return Err(BusError::Persistence(e.to_string()));
        }

        self.size += frame.len() as u64;
        self.next_id = event.id.next();
        Ok(event)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Highest id written so far.
    pub fn last_id(&self) -> EventId {
        EventId(self.next_id.0 - 1)
    }

    /// Current file size.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(self.size))?;
        self.file.write_all(frame)?;

        self.writes_since_sync += 1;
        if self.writes_since_sync >= self.sync_interval {
            self.file.sync_data()?;
            self.writes_since_sync = 0;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.size) {
            error!(path = %self.path.display(), error = %e, "Failed to roll back partial append");
        }
        let _ = self.file.seek(SeekFrom::Start(self.size));
    }

    /// Swap the underlying handle, returning the old one.
    #[cfg(test)]
    pub(crate) fn replace_file(&mut self, file: File) -> File {
        std::mem::replace(&mut self.file, file)
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let mut lock_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        lock_name.push(".lock");
        let lock_file = File::create(path.with_file_name(lock_name))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| BusError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        let _ = self.file.sync_data();
    }
}
