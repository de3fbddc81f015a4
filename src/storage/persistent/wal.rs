//! Write-ahead log for the durable contact store.
//!
//! Every committed unit of work is appended as a single framed record before
//! it is applied in memory, so a merge (demotions, relinks and the new record)
//! is either entirely in the log or not at all.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [RECORD 1: codec-framed WalEntry]
//! [RECORD 2: codec-framed WalEntry]
//! ...
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::contact::Contact;
use crate::storage::table::CommitBatch;

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The logged change.
    pub kind: WalEntryKind,
}

/// The type of WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// One committed unit of work.
    Commit(CommitBatch),
    /// Full table image written by compaction. Replaces all prior state.
    Snapshot {
        contacts: Vec<Contact>,
    },
}

struct WalState {
    writer: BufWriter<File>,
    sequence: u64,
    /// File length after the last intact record.
    len: u64,
    /// Set when a failed append could not be rolled back.
    broken: bool,
}

impl WalState {
    /// Cuts the file back to the last intact record and drops any bytes
    /// still buffered from the failed append.
    fn roll_back(&mut self, path: &Path) -> IoResult<()> {
        let fresh = OpenOptions::new().append(true).open(path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(fresh));
        // `into_parts` hands back the buffer without flushing it.
        drop(stale.into_parts());
        self.writer.get_ref().set_len(self.len)?;
        self.writer.get_ref().sync_all()
    }
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal")
}

fn write_record(writer: &mut BufWriter<File>, bytes: &[u8], sync: bool) -> IoResult<()> {
    writer.write_all(bytes)?;
    writer.flush()?;
    if sync {
        writer.get_ref().sync_all()?;
    }
    Ok(())
}

/// Append-only log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<WalState>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Open or create a WAL file.
    ///
    /// An existing file is scanned for its last intact sequence number; a new
    /// file gets a header.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let has_header = path.exists() && fs::metadata(path)?.len() >= 5;

        let sequence = if has_header {
            let scan = Self::scan(path)?;
            let len = fs::metadata(path)?.len();
            if !scan.corrupted && scan.end < len {
                warn!(
                    sequence = scan.last_sequence,
                    dropped_bytes = len - scan.end,
                    "torn wal tail truncated"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(scan.end)?;
                if sync_on_write {
                    file.sync_all()?;
                }
            }
            scan.last_sequence
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };

        let file = OpenOptions::new().append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                writer: BufWriter::new(file),
                sequence,
                len,
                broken: false,
            }),
            sync_on_write,
        })
    }

    /// Append an entry, returning its sequence number.
    ///
    /// The entry is flushed (and fsynced if configured) before returning.
    /// On failure the file is cut back to its previous length, so a later
    /// append never lands behind a partial record. If that cleanup fails
    /// too, every further append is refused.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.broken {
            return Err(IoError::new(
                ErrorKind::Other,
                "wal is unusable after a failed append; reopen the store",
            ));
        }
        let sequence = state.sequence + 1;
        let encoded = codec::encode(&WalEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        })?;

        if let Err(e) = write_record(&mut state.writer, &encoded, self.sync_on_write) {
            if let Err(cleanup) = state.roll_back(&self.path) {
                error!(error = %cleanup, len = state.len, "failed to roll back wal append");
                state.broken = true;
            }
            return Err(e);
        }

        state.len += u64::try_from(encoded.len()).unwrap_or(u64::MAX);
        state.sequence = sequence;
        Ok(sequence)
    }

    /// Iterate over all intact entries.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last appended entry.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.state.lock().map_err(|_| poisoned())?.sequence)
    }

    /// Size of the WAL file in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Atomically replaces the log with a single snapshot entry.
    ///
    /// The snapshot is written to a sibling file and renamed over the log, so
    /// a crash leaves either the old log or the new one.
    pub fn rewrite_as_snapshot(&self, contacts: Vec<Contact>) -> IoResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if !state.broken {
            state.writer.flush()?;
        }

        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            codec::write_header(&mut tmp)?;
            tmp.write_all(&codec::encode(&WalEntry {
                sequence: 1,
                timestamp: Utc::now(),
                kind: WalEntryKind::Snapshot { contacts },
            })?)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        state.len = file.metadata()?.len();
        state.writer = BufWriter::new(file);
        state.sequence = 1;
        state.broken = false;
        Ok(())
    }

    fn scan(path: &Path) -> IoResult<TailScan> {
        let mut iter = WalIterator::new(path)?;
        let mut scan = TailScan {
            last_sequence: 0,
            end: iter.position()?,
            corrupted: false,
        };
        loop {
            let Some(entry) = iter.next() else { break };
            match entry {
                Ok(entry) => {
                    scan.last_sequence = entry.sequence;
                    scan.end = iter.position()?;
                }
                Err(e) => {
                    warn!(sequence = scan.last_sequence + 1, error = %e, "wal corruption detected; later entries ignored");
                    scan.corrupted = true;
                    break;
                }
            }
        }
        Ok(scan)
    }
}

/// Where the intact prefix of a log ends.
struct TailScan {
    last_sequence: u64,
    end: u64,
    corrupted: bool,
}

/// Iterator over WAL entries.
///
/// Stops silently at a torn final record (unexpected end of file).
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.stream_position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}
