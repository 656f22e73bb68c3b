use std::fs::File;

use log::warn;
use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};

/// Single-writer exclusion: a mutex for threads of this process plus an
/// advisory lock on the data file for other processes.
pub(crate) struct WriterLock {
    mutex: Mutex<()>,
}

/// Held for the lifetime of a write transaction.
pub(crate) struct WriterGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    file: &'a File,
}

impl WriterLock {
    pub(crate) fn new() -> Self {
        WriterLock {
            mutex: Mutex::new(()),
        }
    }

    /// Blocks until the writer lock is available.
    pub(crate) fn lock<'a>(&'a self, file: &'a File) -> Result<WriterGuard<'a>> {
        let guard = self.mutex.lock();
        fs2::FileExt::lock_exclusive(file)?;
        Ok(WriterGuard {
            _guard: guard,
            file,
        })
    }

    /// Fails with `Busy` instead of waiting.
    pub(crate) fn try_lock<'a>(&'a self, file: &'a File) -> Result<WriterGuard<'a>> {
        let guard = self.mutex.try_lock().ok_or(Error::Busy)?;
        match fs2::FileExt::try_lock_exclusive(file) {
            Ok(()) => Ok(WriterGuard {
                _guard: guard,
                file,
            }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(Error::Busy)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(self.file) {
            warn!("failed to release the writer file lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn second_writer_is_busy() {
        let file = tempfile().unwrap();
        let lock = WriterLock::new();
        let guard = lock.try_lock(&file).unwrap();
        assert!(matches!(lock.try_lock(&file), Err(Error::Busy)));
        drop(guard);
        assert!(lock.try_lock(&file).is_ok());
    }
}
