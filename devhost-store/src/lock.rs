use devhost_core::DevhostError;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Advisory exclusive lock serializing concurrent writers of a store file.
///
/// The lock lives on a `.lock` sibling of the guarded file so the data file
/// itself can still be atomically renamed over. Held for the duration of a
/// read-modify-write cycle; released on drop.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until the exclusive lock is acquired.
    pub fn acquire(guarded: &Path) -> Result<Self, DevhostError> {
        let lock_path = lock_path_for(guarded);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(DevhostError::StateConflict(format!(
                    "could not lock {}: {}",
                    lock_path.display(),
                    std::io::Error::last_os_error()
                )));
            }
        }

        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

fn lock_path_for(guarded: &Path) -> std::path::PathBuf {
    let mut os = guarded.as_os_str().to_os_string();
    os.push(".lock");
    os.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_lock_sibling() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("devhost.json");
        let _lock = FileLock::acquire(&data).unwrap();
        assert!(dir.path().join("devhost.json.lock").exists());
        assert!(!data.exists(), "lock must not create the data file");
    }

    #[test]
    fn reacquire_after_drop() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("devhost.json");
        drop(FileLock::acquire(&data).unwrap());
        // Releasing on drop means a second acquire does not deadlock
        drop(FileLock::acquire(&data).unwrap());
    }
}
