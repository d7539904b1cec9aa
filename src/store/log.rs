//! Append-only on-disk message log.

use crate::error::{BrokerError, Result};
use crate::types::{StoredMessage, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::MessageStore;

/// Magic bytes starting every record.
const LOG_MAGIC: &[u8; 4] = b"MSG\0";

/// Current record format version.
const LOG_VERSION: u8 = 1;

/// Upper bound on a single payload, to reject garbage lengths.
const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

const LOG_FILE: &str = "messages.log";
const COMPACT_FILE: &str = "messages.log.compact";
const LOCK_FILE: &str = "LOCK";

/// Durable message log in a directory of its own.
///
/// Record layout (little endian):
/// magic(4) version(1) flags(1) timestamp(8) topic_len(2) topic
/// payload_len(4) payload crc32(4), the checksum covering topic and payload.
pub struct LogStore {
    /// Directory holding the log.
    dir: PathBuf,

    /// Log file handle, positioned anywhere; writers seek to the end.
    file: Mutex<File>,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Number of writes since last sync.
    writes_since_sync: Mutex<u64>,

    /// Sync every N writes.
    sync_interval: u64,
}

impl LogStore {
    /// Default sync interval.
    const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a log in `dir` with the default sync interval.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(dir, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a log, syncing to disk every `sync_interval` writes
    /// (0 and 1 both mean every write).
    pub fn open_with_sync_interval(dir: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock_file = File::create(dir.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| BrokerError::Locked)?;

        // A leftover from an interrupted compaction is incomplete
        let compact = dir.join(COMPACT_FILE);
        if compact.exists() {
            fs::remove_file(&compact)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(LOG_FILE))?;
        Self::truncate_torn_tail(&mut file)?;

        debug!(path = %dir.display(), "message log opened");

        Ok(Self {
            dir,
            file: Mutex::new(file),
            _lock_file: lock_file,
            writes_since_sync: Mutex::new(0),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Directory holding the log.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Current log size in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Cut a partial record left at the end by a crash, so new records
    /// follow the last intact one.
    fn truncate_torn_tail(file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&*file);
        let mut intact = 0u64;

        loop {
            match read_record(&mut reader) {
                Ok(Some(_)) => intact = reader.stream_position()?,
                Ok(None) => return Ok(()),
                Err(BrokerError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                // Corruption before the end is reported by reads, not repaired
                Err(_) => return Ok(()),
            }
        }
        drop(reader);

        let len = file.metadata()?.len();
        warn!(kept = intact, dropped = len - intact, "truncating torn record at end of message log");
        file.set_len(intact)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read every intact record from the start of the log.
    fn read_all(file: &mut File) -> Result<Vec<StoredMessage>> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&*file);
        let mut messages = Vec::new();

        loop {
            match read_record(&mut reader) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break,
                Err(BrokerError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    warn!("message log ends in a torn record, ignoring the tail");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(messages)
    }
}

impl MessageStore for LogStore {
    fn insert(&self, message: &StoredMessage) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;

        let mut writer = BufWriter::new(&*file);
        write_record(&mut writer, message)?;
        writer.flush()?;
        drop(writer);

        let mut writes = self.writes_since_sync.lock();
        *writes += 1;
        if *writes >= self.sync_interval {
            file.sync_all()?;
            *writes = 0;
        }

        Ok(())
    }

    fn query_since(&self, topic: &str, since: Timestamp) -> Result<Vec<StoredMessage>> {
        let mut file = self.file.lock();
        let mut messages = Self::read_all(&mut file)?;
        messages.retain(|m| m.topic == topic && m.timestamp > since);
        Ok(messages)
    }

    /// Rewrites the survivors to a side file and renames it over the log.
    fn delete_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = Timestamp::now().before(age);
        let mut file = self.file.lock();

        let messages = Self::read_all(&mut file)?;
        let total = messages.len();
        let keep: Vec<_> = messages.into_iter().filter(|m| m.timestamp >= cutoff).collect();
        let removed = total - keep.len();
        if removed == 0 {
            return Ok(0);
        }

        let compact_path = self.dir.join(COMPACT_FILE);
        {
            let compact = File::create(&compact_path)?;
            let mut writer = BufWriter::new(&compact);
            for message in &keep {
                write_record(&mut writer, message)?;
            }
            writer.flush()?;
            drop(writer);
            compact.sync_all()?;
        }
        fs::rename(&compact_path, self.dir.join(LOG_FILE))?;

        *file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.dir.join(LOG_FILE))?;
        *self.writes_since_sync.lock() = 0;

        debug!(removed, kept = keep.len(), "message log compacted");
        Ok(removed)
    }
}

fn checksum(topic: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(topic);
    hasher.update(payload);
    hasher.finalize()
}

fn write_record(w: &mut impl Write, message: &StoredMessage) -> Result<()> {
    let topic = message.topic.as_bytes();
    if topic.len() > u16::MAX as usize {
        return Err(BrokerError::InvalidFormat(format!(
            "Topic too long: {} bytes",
            topic.len()
        )));
    }
    if message.payload.len() > MAX_PAYLOAD_LEN {
        return Err(BrokerError::InvalidFormat(format!(
            "Payload too large: {} bytes",
            message.payload.len()
        )));
    }

    w.write_all(LOG_MAGIC)?;
    w.write_all(&[LOG_VERSION])?;
    // Flags (reserved)
    w.write_all(&[0u8])?;
    w.write_all(&message.timestamp.0.to_le_bytes())?;

    w.write_all(&(topic.len() as u16).to_le_bytes())?;
    w.write_all(topic)?;

    w.write_all(&(message.payload.len() as u32).to_le_bytes())?;
    w.write_all(&message.payload)?;

    w.write_all(&checksum(topic, &message.payload).to_le_bytes())?;
    Ok(())
}

/// Read one record. `Ok(None)` at a clean end of log.
fn read_record(r: &mut impl Read) -> Result<Option<StoredMessage>> {
    let mut magic = [0u8; 4];
    match r.read(&mut magic[..1])? {
        0 => return Ok(None),
        _ => r.read_exact(&mut magic[1..])?,
    }
    if &magic != LOG_MAGIC {
        return Err(BrokerError::InvalidFormat("Invalid record magic".into()));
    }

    let mut header = [0u8; 2];
    r.read_exact(&mut header)?;
    if header[0] != LOG_VERSION {
        return Err(BrokerError::InvalidFormat(format!(
            "Unsupported log version: {}",
            header[0]
        )));
    }

    let mut ts_bytes = [0u8; 8];
    r.read_exact(&mut ts_bytes)?;
    let timestamp = Timestamp(i64::from_le_bytes(ts_bytes));

    let mut topic_len_bytes = [0u8; 2];
    r.read_exact(&mut topic_len_bytes)?;
    let mut topic = vec![0u8; u16::from_le_bytes(topic_len_bytes) as usize];
    r.read_exact(&mut topic)?;

    let mut payload_len_bytes = [0u8; 4];
    r.read_exact(&mut payload_len_bytes)?;
    let payload_len = u32::from_le_bytes(payload_len_bytes) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(BrokerError::InvalidFormat(format!(
            "Payload length out of range: {}",
            payload_len
        )));
    }
    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    r.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = checksum(&topic, &payload);
    if stored != computed {
        return Err(BrokerError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let topic = String::from_utf8(topic)
        .map_err(|e| BrokerError::InvalidFormat(format!("Topic is not UTF-8: {}", e)))?;

    Ok(Some(StoredMessage {
        topic,
        payload,
        timestamp,
    }))
}
