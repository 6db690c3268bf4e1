//! Single-instance guard built on an exclusively locked pid file.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{self, Path, PathBuf},
    process,
};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::error::PidFileError;

/// Attempts made when the path is swapped out from under a freshly locked descriptor.
const MAX_LOCK_ATTEMPTS: usize = 3;

/// An exclusively locked pid file owned by the running daemon.
///
/// The lock lives as long as the open descriptor, so the guard must be kept
/// alive for the whole supervision lifetime. Dropping it releases the lock and
/// removes the file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: Option<File>,
    pid: u32,
    worker: Option<u32>,
}

impl PidFile {
    /// Claims `path` for the current process without ever blocking.
    ///
    /// Parent directories are created as needed. Fails with
    /// [`PidFileError::AlreadyRunning`] when another holder owns the lock.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, PidFileError> {
        let path = resolve(path.as_ref())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| PidFileError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        for _ in 0..MAX_LOCK_ATTEMPTS {
            let file = open_for_lock(&path)?;
            try_lock(&file, &path)?;

            if !refers_to(&file, &path) {
                debug!("Pid file {:?} was replaced while locking; retrying", path);
                continue;
            }

            let mut guard = Self {
                path,
                file: Some(file),
                pid: process::id(),
                worker: None,
            };
            guard.write_contents()?;
            info!("Claimed pid file {:?} for pid {}", guard.path, guard.pid);
            return Ok(guard);
        }

        Err(PidFileError::AlreadyRunning { path })
    }

    /// Checks whether `path` is free without creating or modifying it.
    pub fn probe(path: impl AsRef<Path>) -> Result<(), PidFileError> {
        let path = resolve(path.as_ref())?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(PidFileError::Open { path, source }),
        };

        try_lock(&file, &path)?;
        FileExt::unlock(&file).map_err(|source| PidFileError::Unlock { path, source })
    }

    /// Absolute location of the pid file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Process id recorded on the first line.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns `false` once the guard has been released.
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Rewrites the file with the supervised worker's id on a second line.
    pub fn record_worker(&mut self, worker: Option<u32>) -> Result<(), PidFileError> {
        self.worker = worker;
        self.write_contents()
    }

    /// Removes the file and drops the lock. Releasing twice is a no-op.
    ///
    /// The file is unlinked while still locked so that a concurrent acquirer
    /// can never lock the inode that is about to disappear. A path that no
    /// longer points at the locked inode belongs to someone else and is kept.
    pub fn release(&mut self) -> Result<(), PidFileError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };

        let removed = if !refers_to(&file, &self.path) {
            warn!(
                "Pid file {:?} was removed or replaced; leaving the path alone",
                self.path
            );
            Ok(())
        } else {
            match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    warn!("Pid file {:?} was already removed", self.path);
                    Ok(())
                }
                Err(source) => Err(PidFileError::Remove {
                    path: self.path.clone(),
                    source,
                }),
            }
        };
        let unlocked = FileExt::unlock(&file).map_err(|source| PidFileError::Unlock {
            path: self.path.clone(),
            source,
        });
        drop(file);

        removed.and(unlocked)?;
        info!("Released pid file {:?}", self.path);
        Ok(())
    }

    fn write_contents(&mut self) -> Result<(), PidFileError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        let mut contents = format!("{}\n", self.pid);
        if let Some(worker) = self.worker {
            contents.push_str(&format!("{worker}\n"));
        }

        overwrite(file, contents.as_bytes()).map_err(|source| PidFileError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

fn overwrite(file: &mut File, contents: &[u8]) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(contents)?;
    file.sync_data()
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("Failed to release pid file on drop: {err}");
        }
    }
}

/// Reads the daemon pid from the first line of a pid file.
pub fn read_pid(path: impl AsRef<Path>) -> Option<u32> {
    read_line(path.as_ref(), 0)
}

/// Reads the worker pid from the second line, when it is recorded.
pub fn read_worker_pid(path: impl AsRef<Path>) -> Option<u32> {
    read_line(path.as_ref(), 1)
}

fn read_line(path: &Path, index: usize) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content.lines().nth(index)?.trim().parse::<u32>().ok()
}

fn resolve(path: &Path) -> Result<PathBuf, PidFileError> {
    path::absolute(path).map_err(|source| PidFileError::Resolve {
        path: path.to_path_buf(),
        source,
    })
}

fn open_for_lock(path: &Path) -> Result<File, PidFileError> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options.open(path).map_err(|source| PidFileError::Open {
        path: path.to_path_buf(),
        source,
    })
}

fn try_lock(file: &File, path: &Path) -> Result<(), PidFileError> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
            Err(PidFileError::AlreadyRunning {
                path: path.to_path_buf(),
            })
        }
        Err(source) => Err(PidFileError::Lock {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(unix)]
fn refers_to(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(test)]
impl PidFile {
    /// Guard over a read-only descriptor, so every rewrite of the file fails.
    pub(crate) fn read_only(path: &Path) -> Self {
        fs::write(path, format!("{}\n", process::id())).unwrap();
        Self {
            path: path.to_path_buf(),
            file: Some(File::open(path).unwrap()),
            pid: process::id(),
            worker: None,
        }
    }
}
