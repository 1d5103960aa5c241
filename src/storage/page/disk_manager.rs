//! Disk manager for named, page-structured files.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{AriesError, Result};
use crate::storage::page::{Page, PageId, PAGE_SIZE};

/// Manages the files of one database directory.
///
/// The disk manager handles:
/// - Opening, creating and removing named files
/// - Caching open file handles so every caller shares one [`DbFile`]
/// - Syncing every open file on demand
pub struct DiskManager {
    /// Directory holding every database file.
    dir: PathBuf,
    /// Open file handles by file name.
    files: RwLock<HashMap<String, Arc<DbFile>>>,
}

impl DiskManager {
    /// Opens a database directory, creating it if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the database directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(AriesError::InvalidArgument(format!(
                "Invalid database file name {name:?}"
            )));
        }
        Ok(())
    }

    /// Returns true if the named file exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name) || self.dir.join(name).exists()
    }

    /// Opens an existing file.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::NotFound`] if the file does not exist.
    pub fn open(&self, name: &str) -> Result<Arc<DbFile>> {
        Self::validate_name(name)?;
        if let Some(file) = self.files.read().get(name) {
            return Ok(Arc::clone(file));
        }

        let mut files = self.files.write();
        if let Some(file) = files.get(name) {
            return Ok(Arc::clone(file));
        }

        let path = self.dir.join(name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AriesError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let handle = Arc::new(DbFile::new(name, path, file));
        files.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Opens a file, creating an empty one if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open_or_create(&self, name: &str) -> Result<Arc<DbFile>> {
        match self.open(name) {
            Err(AriesError::NotFound(_)) => {}
            other => return other,
        }

        let mut files = self.files.write();
        if let Some(file) = files.get(name) {
            return Ok(Arc::clone(file));
        }

        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let handle = Arc::new(DbFile::new(name, path, file));
        files.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Creates a file, truncating any existing contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(&self, name: &str) -> Result<Arc<DbFile>> {
        let handle = self.open_or_create(name)?;
        handle.set_len(0)?;
        Ok(handle)
    }

    /// Removes a file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`AriesError::NotFound`] if the file does not exist.
    pub fn remove(&self, name: &str) -> Result<()> {
        Self::validate_name(name)?;
        self.files.write().remove(name);
        match fs::remove_file(self.dir.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(AriesError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Syncs every open file to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if any sync fails.
    pub fn sync_all(&self) -> Result<()> {
        let files: Vec<Arc<DbFile>> = self.files.read().values().cloned().collect();
        for file in files {
            file.sync()?;
        }
        Ok(())
    }

    /// Reads a page, returning zeroes for pages past the end of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or read.
    pub fn read_page(&self, page_id: &PageId) -> Result<Page> {
        let file = self.open_or_create(&page_id.file_name)?;
        let mut page = Page::new(page_id.clone());
        file.read_at(page_id.offset(), &mut page.data[..])?;
        Ok(page)
    }

    /// Writes a page to its file.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_page(&self, page: &Page) -> Result<()> {
        let file = self.open_or_create(&page.id.file_name)?;
        file.write_at(page.id.offset(), &page.data[..])
    }
}

/// Shared handle to one open database file.
///
/// All positioned I/O goes through a single lock, so a `read_at` never
/// observes half of a concurrent `write_at`.
pub struct DbFile {
    /// File name relative to the database directory.
    name: String,
    /// Full path of the file.
    path: PathBuf,
    /// Underlying file handle.
    file: Mutex<File>,
}

impl DbFile {
    fn new(name: &str, path: PathBuf, file: File) -> Self {
        Self {
            name: name.to_string(),
            path,
            file: Mutex::new(file),
        }
    }

    /// Returns the file name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the full path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads `buf.len()` bytes starting at `offset`.
    ///
    /// Bytes past the end of the file read as zero. Returns the number of
    /// bytes that were actually present in the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        buf[filled..].fill(0);
        Ok(filled)
    }

    /// Writes all of `data` starting at `offset`, extending the file if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Reads the entire file into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Returns the size of the file in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Returns true if the file holds no bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncates or extends the file to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the resize fails.
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.lock().set_len(len)?;
        Ok(())
    }

    /// Returns the number of whole or partial pages in the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn num_pages(&self) -> Result<u32> {
        let pages = self.len()?.div_ceil(PAGE_SIZE as u64);
        u32::try_from(pages)
            .map_err(|_| AriesError::PageError(format!("File {} has too many pages", self.name)))
    }

    /// Flushes all written data to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for DbFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbFile").field("name", &self.name).finish()
    }
}
