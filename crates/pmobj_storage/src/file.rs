//! File-backed pool for persistent storage.

use crate::backend::{cacheline_span, check_range, MemFlags, PersistentMemory};
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A pool whose durable contents live in a file.
///
/// The pool image is held in memory; stores update the image, a flush
/// writes the covering cachelines back to the file, and a drain syncs the
/// file data to disk. Data survives process restarts.
///
/// # Durability
///
/// - `flush()` writes the range to the OS page cache
/// - `drain()` calls `File::sync_data()` to make it durable
///
/// # Exclusive access
///
/// The file is locked exclusively while the pool is open; a second open of
/// the same file fails with [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use pmobj_storage::{FilePool, MemFlags, PersistentMemory};
/// use std::path::Path;
///
/// let mut pool = FilePool::create(Path::new("pool.bin"), 1 << 20).unwrap();
/// pool.write(4096, b"persistent data", MemFlags::NONE).unwrap();
/// ```
#[derive(Debug)]
pub struct FilePool {
    path: PathBuf,
    file: RwLock<File>,
    image: RwLock<Vec<u8>>,
    dirty_since_sync: RwLock<bool>,
}

impl FilePool {
    /// Creates a new zeroed pool file of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already exists or cannot be created.
    pub fn create(path: &Path, size: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Self::lock(&file)?;
        file.set_len(size)?;
        file.sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            image: RwLock::new(vec![0u8; size as usize]),
            dirty_since_sync: RwLock::new(false),
        })
    }

    /// Opens an existing pool file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, read or locked.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::lock(&file)?;

        let size = file.metadata()?.len();
        let mut image = vec![0u8; size as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut image)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            image: RwLock::new(image),
            dirty_since_sync: RwLock::new(false),
        })
    }

    /// Opens the pool at `path`, creating it with `size` bytes if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SizeMismatch`] if an existing file has a
    /// different size, or any error from [`Self::create`]/[`Self::open`].
    pub fn open_or_create(path: &Path, size: u64) -> StorageResult<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            return Self::create(path, size);
        }

        let pool = Self::open(path)?;
        let actual = pool.size();
        if actual != size {
            return Err(StorageError::SizeMismatch {
                expected: size,
                actual,
            });
        }
        Ok(pool)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(file: &File) -> StorageResult<()> {
        file.try_lock_exclusive().map_err(|_| StorageError::Locked)
    }

    fn write_back(&self, offset: u64, len: usize) -> StorageResult<()> {
        let size = self.size();
        check_range(offset, len, size)?;
        if len == 0 {
            return Ok(());
        }

        let (start, span) = cacheline_span(offset, len, size);
        let image = self.image.read();
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(start))?;
        file.write_all(&image[start as usize..start as usize + span])?;
        *self.dirty_since_sync.write() = true;
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        let mut dirty = self.dirty_since_sync.write();
        if *dirty {
            self.file.write().sync_data()?;
            *dirty = false;
        }
        Ok(())
    }

    fn store(&self, offset: u64, len: usize, flags: MemFlags, apply: impl FnOnce(&mut [u8])) -> StorageResult<()> {
        {
            let mut image = self.image.write();
            let range = check_range(offset, len, image.len() as u64)?;
            apply(&mut image[range]);
        }

        if flags.contains(MemFlags::NO_FLUSH) {
            return Ok(());
        }
        self.write_back(offset, len)?;
        if !flags.contains(MemFlags::NO_DRAIN) {
            self.sync()?;
        }
        Ok(())
    }
}

impl PersistentMemory for FilePool {
    fn size(&self) -> u64 {
        self.image.read().len() as u64
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let image = self.image.read();
        let range = check_range(offset, buf.len(), image.len() as u64)?;
        buf.copy_from_slice(&image[range]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8], flags: MemFlags) -> StorageResult<()> {
        self.store(offset, data.len(), flags, |dst| dst.copy_from_slice(data))
    }

    fn fill(&mut self, offset: u64, value: u8, len: usize, flags: MemFlags) -> StorageResult<()> {
        self.store(offset, len, flags, |dst| dst.fill(value))
    }

    fn flush(&mut self, offset: u64, len: usize) -> StorageResult<()> {
        self.write_back(offset, len)
    }

    fn drain(&mut self) -> StorageResult<()> {
        self.sync()
    }
}

impl Drop for FilePool {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&*self.file.read());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");

        let pool = FilePool::create(&path, 4096).unwrap();
        assert_eq!(pool.size(), 4096);
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn file_create_existing_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");

        let pool = FilePool::create(&path, 4096).unwrap();
        drop(pool);
        assert!(FilePool::create(&path, 4096).is_err());
    }

    #[test]
    fn file_persisted_write_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");

        {
            let mut pool = FilePool::create(&path, 4096).unwrap();
            pool.write(128, b"persistent data", MemFlags::NONE).unwrap();
        }

        let pool = FilePool::open(&path).unwrap();
        let mut buf = [0u8; 15];
        pool.read(128, &mut buf).unwrap();
        assert_eq!(&buf, b"persistent data");
    }

    #[test]
    fn file_unflushed_write_is_lost() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");

        {
            let mut pool = FilePool::create(&path, 4096).unwrap();
            pool.write(128, b"volatile", MemFlags::NO_FLUSH).unwrap();

            let mut buf = [0u8; 8];
            pool.read(128, &mut buf).unwrap();
            assert_eq!(&buf, b"volatile");
        }

        let pool = FilePool::open(&path).unwrap();
        let mut buf = [0u8; 8];
        pool.read(128, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn file_explicit_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");

        {
            let mut pool = FilePool::create(&path, 4096).unwrap();
            pool.write_u64(256, 77, MemFlags::NO_FLUSH).unwrap();
            pool.persist(256, 8).unwrap();
        }

        let pool = FilePool::open(&path).unwrap();
        assert_eq!(pool.read_u64(256).unwrap(), 77);
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");

        let _pool = FilePool::create(&path, 4096).unwrap();
        assert!(matches!(FilePool::open(&path), Err(StorageError::Locked)));
    }

    #[test]
    fn file_open_or_create_checks_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("pool.bin");

        drop(FilePool::open_or_create(&path, 8192).unwrap());
        assert!(FilePool::open_or_create(&path, 8192).is_ok());
        assert!(matches!(
            FilePool::open_or_create(&path, 4096),
            Err(StorageError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn file_read_out_of_bounds_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");

        let pool = FilePool::create(&path, 128).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            pool.read(120, &mut buf),
            Err(StorageError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn file_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");

        let pool = FilePool::create(&path, 64).unwrap();
        assert_eq!(pool.path(), path);
    }
}
