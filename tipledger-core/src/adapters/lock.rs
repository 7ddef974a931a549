//! Exclusive data directory lock
//!
//! The ledger assumes a single writer process. The lock is taken when the
//! context opens and released on drop.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::domain::result::{Error, Result};

pub struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    const LOCK_FILE: &'static str = "tipledger.lock";

    /// Acquire the lock without blocking
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(Self::LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = holder.trim();
            return Err(Error::config(if holder.is_empty() {
                format!("data directory already in use ({})", path.display())
            } else {
                format!(
                    "data directory already in use by process {} ({})",
                    holder,
                    path.display()
                )
            }));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!(path = %path.display(), "acquired data directory lock");

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_fails_until_released() {
        let dir = tempdir().unwrap();
        let lock = DataDirLock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());

        let err = DataDirLock::acquire(dir.path()).err().unwrap();
        assert!(matches!(err, Error::Config(_)));

        drop(lock);
        assert!(DataDirLock::acquire(dir.path()).is_ok());
    }
}
