//! Durable metadata: write-ahead log plus checkpoints
//!
//! Every mutation of the sector index or a folder bitmap is described by a
//! [`Batch`] of [`Change`]s. A batch is appended to the log and synced before
//! the operation that produced it is acknowledged, so after a crash the log
//! replays exactly the acknowledged operations.
//!
//! ```text
//! data_dir/
//! ├── metadata.snapshot   # last checkpoint (atomically replaced)
//! └── metadata.wal        # batches committed since that checkpoint
//! ```
//!
//! ## Record Format
//!
//! ```text
//! +-----------+-----------+----------------------+
//! | len (u32) | crc (u32) | bincode(Batch)       |
//! +-----------+-----------+----------------------+
//! ```
//!
//! Replay stops at the first record that is short or fails its CRC: that is
//! a write torn by a crash, never an acknowledged batch, and it is truncated
//! away before new records are appended.
//!
//! ## Checkpoints
//!
//! A checkpoint writes the full state to a temporary file, syncs it, renames
//! it over the old snapshot and then truncates the log. Each batch carries a
//! sequence number, so batches already covered by the snapshot are skipped if
//! a crash lands between the rename and the truncate.

use crate::core::sector::{SectorId, SectorLocation, SALT_LEN};
use crate::error::{ContractManagerError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const WAL_FILE: &str = "metadata.wal";
pub const SNAPSHOT_FILE: &str = "metadata.snapshot";
const SNAPSHOT_TMP_FILE: &str = "metadata.snapshot.tmp";

const SNAPSHOT_MAGIC: [u8; 8] = *b"CMSNAP\x00\x01";
pub const SNAPSHOT_VERSION: u32 = 1;

/// Record header: length + CRC32
const RECORD_HEADER_SIZE: usize = 8;

/// Records larger than this are treated as a torn length field
const MAX_RECORD_SIZE: usize = 1 << 30;

/// Persisted description of a storage folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub id: u16,
    pub path: PathBuf,
    pub capacity: u32,
    /// Bitmap words; empty when the folder is freshly added
    pub words: Vec<u64>,
}

/// One atomic metadata change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    SectorUpsert {
        id: SectorId,
        location: SectorLocation,
    },
    SectorRemove {
        id: SectorId,
    },
    SlotSet {
        folder: u16,
        slot: u32,
    },
    SlotClear {
        folder: u16,
        slot: u32,
    },
    FolderAdd {
        folder: FolderRecord,
    },
    FolderRemove {
        id: u16,
    },
    FolderResize {
        id: u16,
        capacity: u32,
    },
}

/// Changes committed together, all or nothing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub seq: u64,
    pub changes: Vec<Change>,
}

impl Batch {
    pub fn new(changes: Vec<Change>) -> Self {
        Batch { seq: 0, changes }
    }
}

/// Full metadata state written at a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Sequence number of the last batch the snapshot covers
    pub last_seq: u64,
    pub salt: [u8; SALT_LEN],
    pub sector_size: u64,
    pub folders: Vec<FolderRecord>,
    pub sectors: Vec<(SectorId, SectorLocation)>,
}

/// State recovered at startup
#[derive(Debug, Default)]
pub struct Recovered {
    pub snapshot: Option<Snapshot>,
    /// Batches committed after the snapshot, in commit order
    pub batches: Vec<Batch>,
}

/// Durable, all-or-nothing metadata persistence
pub trait MetadataStore: Send + Sync {
    /// Read back the last checkpoint and every batch committed after it
    fn load(&self) -> Result<Recovered>;

    /// Durably commit a batch; once this returns `Ok` the batch survives a crash
    fn commit(&self, batch: Batch) -> Result<()>;

    /// Replace all persisted state with `snapshot` and discard the log
    fn checkpoint(&self, snapshot: Snapshot) -> Result<()>;

    /// Bytes of log written since the last checkpoint
    fn log_size(&self) -> u64;
}

struct WalInner {
    file: File,
    size: u64,
    next_seq: u64,
    /// Set when a failed append could not be undone
    poisoned: bool,
}

/// File-backed [`MetadataStore`]
pub struct WalStore {
    dir: PathBuf,
    inner: Mutex<WalInner>,
}

fn persistence(context: &str, err: impl std::fmt::Display) -> ContractManagerError {
    ContractManagerError::PersistenceFailure(format!("{}: {}", context, err))
}

impl WalStore {
    /// Open (or create) the log in `dir`
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(WAL_FILE))?;
        let size = file.metadata()?.len();

        Ok(WalStore {
            dir,
            inner: Mutex::new(WalInner {
                file,
                size,
                next_seq: 1,
                poisoned: false,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_snapshot(&self) -> Result<Option<Snapshot>> {
        let path = self.dir.join(SNAPSHOT_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() < 20 || bytes[..8] != SNAPSHOT_MAGIC {
            return Err(ContractManagerError::Corruption(
                "metadata snapshot has an invalid header".to_string(),
            ));
        }

        let len = u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default()) as usize;
        let crc = u32::from_le_bytes(bytes[16..20].try_into().unwrap_or_default());
        let body = &bytes[20..];
        if body.len() != len || crc32fast::hash(body) != crc {
            return Err(ContractManagerError::Corruption(
                "metadata snapshot checksum mismatch".to_string(),
            ));
        }

        let snapshot: Snapshot = bincode::deserialize(body)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ContractManagerError::Corruption(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    /// Parse records from the start of the log, stopping at the first bad one
    fn scan(bytes: &[u8]) -> (Vec<Batch>, usize) {
        let mut batches = Vec::new();
        let mut offset = 0usize;

        while bytes.len() - offset >= RECORD_HEADER_SIZE {
            let header = &bytes[offset..offset + RECORD_HEADER_SIZE];
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            let start = offset + RECORD_HEADER_SIZE;
            if len > MAX_RECORD_SIZE || bytes.len() - start < len {
                break;
            }

            let payload = &bytes[start..start + len];
            if crc32fast::hash(payload) != crc {
                break;
            }

            match bincode::deserialize::<Batch>(payload) {
                Ok(batch) => batches.push(batch),
                Err(_) => break,
            }
            offset = start + len;
        }

        (batches, offset)
    }

    fn sync_dir(&self) -> Result<()> {
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

impl MetadataStore for WalStore {
    fn load(&self) -> Result<Recovered> {
        let snapshot = self.read_snapshot()?;
        let covered = snapshot.as_ref().map(|s| s.last_seq).unwrap_or(0);

        let mut inner = self.inner.lock();
        let mut bytes = Vec::new();
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.read_to_end(&mut bytes)?;

        let (batches, valid_len) = Self::scan(&bytes);
        if valid_len < bytes.len() {
            warn!(
                "Discarding {} bytes of torn metadata log after {} batches",
                bytes.len() - valid_len,
                batches.len()
            );
            inner.file.set_len(valid_len as u64)?;
            inner.file.sync_all()?;
        }
        inner.size = valid_len as u64;

        let last_seq = batches.last().map(|b| b.seq).unwrap_or(0).max(covered);
        inner.next_seq = last_seq + 1;

        let batches: Vec<Batch> = batches.into_iter().filter(|b| b.seq > covered).collect();
        debug!(
            "Loaded metadata: snapshot={}, {} batches to replay",
            snapshot.is_some(),
            batches.len()
        );

        Ok(Recovered { snapshot, batches })
    }

    fn commit(&self, mut batch: Batch) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(ContractManagerError::PersistenceFailure(
                "metadata log is poisoned by an earlier failed write".to_string(),
            ));
        }

        batch.seq = inner.next_seq;
        let payload = bincode::serialize(&batch)?;
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        record.extend_from_slice(&payload);

        let start = inner.size;
        let written = inner
            .file
            .seek(SeekFrom::Start(start))
            .and_then(|_| inner.file.write_all(&record))
            .and_then(|_| inner.file.sync_data());

        if let Err(e) = written {
            // Drop whatever part of the record reached the file
            if inner.file.set_len(start).and_then(|_| inner.file.sync_all()).is_err() {
                inner.poisoned = true;
            }
            return Err(persistence("metadata log append failed", e));
        }

        inner.size = start + record.len() as u64;
        inner.next_seq += 1;
        Ok(())
    }

    fn checkpoint(&self, mut snapshot: Snapshot) -> Result<()> {
        let mut inner = self.inner.lock();
        snapshot.version = SNAPSHOT_VERSION;
        snapshot.last_seq = inner.next_seq - 1;

        let body = bincode::serialize(&snapshot)?;
        let mut bytes = Vec::with_capacity(20 + body.len());
        bytes.extend_from_slice(&SNAPSHOT_MAGIC);
        bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        bytes.extend_from_slice(&body);

        let tmp = self.dir.join(SNAPSHOT_TMP_FILE);
        let write_snapshot = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            std::fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))
        };
        write_snapshot().map_err(|e| persistence("checkpoint write failed", e))?;
        self.sync_dir()
            .map_err(|e| persistence("checkpoint directory sync failed", e))?;

        inner
            .file
            .set_len(0)
            .and_then(|_| inner.file.sync_all())
            .map_err(|e| persistence("metadata log truncate failed", e))?;
        inner.size = 0;
        inner.poisoned = false;

        info!(
            "Checkpoint written: {} folders, {} sectors, seq {}",
            snapshot.folders.len(),
            snapshot.sectors.len(),
            snapshot.last_seq
        );
        Ok(())
    }

    fn log_size(&self) -> u64 {
        self.inner.lock().size
    }
}

/// In-memory [`MetadataStore`] for tests and benchmarks
///
/// Survives a manager being dropped and reopened, not the process exiting.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    snapshot: Option<Snapshot>,
    batches: Vec<Batch>,
    last_seq: u64,
    size: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn load(&self) -> Result<Recovered> {
        let inner = self.inner.lock();
        Ok(Recovered {
            snapshot: inner.snapshot.clone(),
            batches: inner.batches.clone(),
        })
    }

    fn commit(&self, mut batch: Batch) -> Result<()> {
        let mut inner = self.inner.lock();
        batch.seq = inner.last_seq + 1;
        let size = bincode::serialized_size(&batch)?;
        inner.last_seq = batch.seq;
        inner.size += RECORD_HEADER_SIZE as u64 + size;
        inner.batches.push(batch);
        Ok(())
    }

    fn checkpoint(&self, mut snapshot: Snapshot) -> Result<()> {
        let mut inner = self.inner.lock();
        snapshot.version = SNAPSHOT_VERSION;
        snapshot.last_seq = inner.last_seq;
        inner.snapshot = Some(snapshot);
        inner.batches.clear();
        inner.size = 0;
        Ok(())
    }

    fn log_size(&self) -> u64 {
        self.inner.lock().size
    }
}
