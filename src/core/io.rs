//! Physical sector I/O
//!
//! The contract manager never touches sector bytes directly; it goes through a
//! [`SectorIo`] keyed by `(folder, slot)`. [`FileSectorIo`] keeps one data file
//! per storage folder and addresses slot `n` at byte offset `n * sector_size`.
//! [`MemorySectorIo`] keeps everything in memory for tests and tooling.

use crate::error::{ContractManagerError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the sector data file inside each storage folder directory
pub const FOLDER_DATA_FILE: &str = "sectors.dat";

/// Read/write-at-slot primitives for storage folders
pub trait SectorIo: Send + Sync {
    /// Prepare backing storage for a new folder of `capacity` slots
    fn create_folder(&self, folder: u16, path: &Path, capacity: u32) -> Result<()>;

    /// Attach backing storage for a folder recovered from metadata
    fn open_folder(&self, folder: u16, path: &Path) -> Result<()>;

    /// Grow or shrink a folder's backing storage
    fn resize_folder(&self, folder: u16, capacity: u32) -> Result<()>;

    /// Detach and delete a folder's backing storage
    fn remove_folder(&self, folder: u16) -> Result<()>;

    fn write_sector(&self, folder: u16, slot: u32, data: &[u8]) -> Result<()>;

    fn read_sector(&self, folder: u16, slot: u32) -> Result<Vec<u8>>;
}

/// Disk-backed data file for one storage folder
///
/// Reads and writes are positioned, so they never move a shared cursor and
/// any number of them can run on the same file at once.
pub struct FolderFile {
    file: File,
    path: PathBuf,
}

impl FolderFile {
    /// Create (or reuse) the data file and size it to `len` bytes
    pub fn create<P: AsRef<Path>>(path: P, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(len)?;
        file.sync_all()?;

        Ok(FolderFile {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open an existing data file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        Ok(FolderFile {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    #[cfg(unix)]
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;

        let mut buffer = vec![0u8; len];
        self.file.read_exact_at(&mut buffer, offset)?;
        Ok(buffer)
    }

    #[cfg(windows)]
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::os::windows::fs::FileExt;

        let mut buffer = vec![0u8; len];
        let mut done = 0;
        while done < len {
            let n = self.file.seek_read(&mut buffer[done..], offset + done as u64)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            done += n;
        }
        Ok(buffer)
    }

    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;

        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    #[cfg(windows)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        use std::os::windows::fs::FileExt;

        let mut done = 0;
        while done < data.len() {
            let n = self.file.seek_write(&data[done..], offset + done as u64)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            done += n;
        }
        Ok(())
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Sync written data to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One data file per folder, positioned reads and writes
pub struct FileSectorIo {
    sector_size: u64,
    sync_writes: bool,
    files: RwLock<HashMap<u16, Arc<FolderFile>>>,
}

impl FileSectorIo {
    pub fn new(sector_size: u64, sync_writes: bool) -> Self {
        FileSectorIo {
            sector_size,
            sync_writes,
            files: RwLock::new(HashMap::new()),
        }
    }

    fn file(&self, folder: u16) -> Result<Arc<FolderFile>> {
        self.files
            .read()
            .get(&folder)
            .cloned()
            .ok_or(ContractManagerError::FolderNotFound(folder))
    }

    fn offset(&self, slot: u32) -> u64 {
        slot as u64 * self.sector_size
    }
}

impl SectorIo for FileSectorIo {
    fn create_folder(&self, folder: u16, path: &Path, capacity: u32) -> Result<()> {
        std::fs::create_dir_all(path)?;
        let file = FolderFile::create(
            path.join(FOLDER_DATA_FILE),
            capacity as u64 * self.sector_size,
        )?;
        self.files.write().insert(folder, Arc::new(file));
        Ok(())
    }

    fn open_folder(&self, folder: u16, path: &Path) -> Result<()> {
        let file = FolderFile::open(path.join(FOLDER_DATA_FILE))?;
        self.files.write().insert(folder, Arc::new(file));
        Ok(())
    }

    fn resize_folder(&self, folder: u16, capacity: u32) -> Result<()> {
        self.file(folder)?.set_len(capacity as u64 * self.sector_size)
    }

    fn remove_folder(&self, folder: u16) -> Result<()> {
        let file = self
            .files
            .write()
            .remove(&folder)
            .ok_or(ContractManagerError::FolderNotFound(folder))?;
        let path = file.path().to_path_buf();
        drop(file);

        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_sector(&self, folder: u16, slot: u32, data: &[u8]) -> Result<()> {
        let file = self.file(folder)?;
        file.write_at(self.offset(slot), data)?;
        if self.sync_writes {
            file.sync()?;
        }
        Ok(())
    }

    fn read_sector(&self, folder: u16, slot: u32) -> Result<Vec<u8>> {
        self.file(folder)?
            .read_at(self.offset(slot), self.sector_size as usize)
    }
}

/// In-memory sector storage
#[derive(Default)]
pub struct MemorySectorIo {
    folders: RwLock<HashMap<u16, Mutex<HashMap<u32, Vec<u8>>>>>,
}

impl MemorySectorIo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SectorIo for MemorySectorIo {
    fn create_folder(&self, folder: u16, _path: &Path, _capacity: u32) -> Result<()> {
        self.folders.write().insert(folder, Mutex::new(HashMap::new()));
        Ok(())
    }

    fn open_folder(&self, folder: u16, _path: &Path) -> Result<()> {
        self.folders
            .write()
            .entry(folder)
            .or_insert_with(|| Mutex::new(HashMap::new()));
        Ok(())
    }

    fn resize_folder(&self, folder: u16, capacity: u32) -> Result<()> {
        let folders = self.folders.read();
        let slots = folders
            .get(&folder)
            .ok_or(ContractManagerError::FolderNotFound(folder))?;
        slots.lock().retain(|&slot, _| slot < capacity);
        Ok(())
    }

    fn remove_folder(&self, folder: u16) -> Result<()> {
        self.folders
            .write()
            .remove(&folder)
            .map(|_| ())
            .ok_or(ContractManagerError::FolderNotFound(folder))
    }

    fn write_sector(&self, folder: u16, slot: u32, data: &[u8]) -> Result<()> {
        let folders = self.folders.read();
        let slots = folders
            .get(&folder)
            .ok_or(ContractManagerError::FolderNotFound(folder))?;
        slots.lock().insert(slot, data.to_vec());
        Ok(())
    }

    fn read_sector(&self, folder: u16, slot: u32) -> Result<Vec<u8>> {
        let folders = self.folders.read();
        let slots = folders
            .get(&folder)
            .ok_or(ContractManagerError::FolderNotFound(folder))?;
        let data = slots.lock().get(&slot).cloned();
        data.ok_or_else(|| {
            ContractManagerError::Corruption(format!(
                "slot {} of folder {} holds no data",
                slot, folder
            ))
        })
    }
}
