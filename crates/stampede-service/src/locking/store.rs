//! Backends holding the lock records of a [`DistributedLockProvider`](super::DistributedLockProvider).

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

/// Atomic storage for lock records shared between collapsers.
///
/// A record is identified by its key and tagged with the owner that created it. Records expire
/// once their lease runs out, after which any owner may acquire the key again.
pub trait LockStore: Send + Sync {
    /// Creates the record for `key` unless another unexpired record exists.
    ///
    /// Returns `true` if the record was created, `false` if the key is held by someone else, or by
    /// `owner` itself through another acquisition.
    fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<bool>;

    /// Removes the record for `key`, but only if it is still owned by `owner`.
    fn release(&self, key: &str, owner: &str) -> Result<()>;
}

impl fmt::Debug for dyn LockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<LockStore>")
    }
}

/// Keeps lock records in memory.
///
/// Collapsers that share one store share their locks, which makes this a stand-in for an external
/// store in tests and in single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    records: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The owner of the unexpired record for `key`, if any.
    pub fn owner(&self, key: &str) -> Option<String> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(owner, _)| owner.clone())
    }
}

impl LockStore for MemoryLockStore {
    fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<bool> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if let Some((_, expires)) = records.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }

        records.insert(key.to_owned(), (owner.to_owned(), now + lease));
        Ok(true)
    }

    fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.get(key).is_some_and(|(held_by, _)| held_by == owner) {
            records.remove(key);
        }
        Ok(())
    }
}

/// Keeps lock records as files in a directory shared by all participants.
///
/// Every key maps to `<sha256 of key>.lock`, holding the owner and the lease expiry. Records are
/// only read and replaced while holding an exclusive OS lock on the `.guard` file of the
/// directory, so checking a record and taking it over is one step for every participant. The OS
/// drops that lock when its holder exits; how long a record stays valid is decided by its lease
/// alone.
///
/// Records are written to a temporary file first and then renamed into place, so a record is
/// never observed half-written.
#[derive(Debug, Clone)]
pub struct FilesystemLockStore {
    path: PathBuf,
}

impl FilesystemLockStore {
    /// Opens the store rooted at `path`, creating the directory if necessary.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(path.join(".tmp")).with_context(|| {
            format!("failed to create lock directory at {}", path.display())
        })?;
        Ok(Self { path })
    }

    /// The directory holding the lock records.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.path.join(format!("{digest:x}.lock"))
    }

    /// Locks the whole directory until the returned file is dropped.
    fn lock_directory(&self) -> Result<File> {
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path.join(".guard"))
            .context("failed to open lock directory guard")?;
        guard
            .lock_exclusive()
            .context("failed to lock the lock directory")?;
        Ok(guard)
    }

    fn write_record(&self, record: &LockRecord, path: &Path) -> Result<()> {
        let mut temp_file =
            NamedTempFile::new_in(self.path.join(".tmp")).context("failed to create tempfile")?;
        write!(temp_file, "{}\n{}", record.owner, record.expires_ms)
            .context("failed to write lock record")?;
        temp_file
            .persist(path)
            .map_err(|err| err.error)
            .context("failed to create lock record")?;
        Ok(())
    }
}

impl LockStore for FilesystemLockStore {
    fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<bool> {
        let path = self.record_path(key);
        let _guard = self.lock_directory()?;
        let now = unix_millis(SystemTime::now());

        if let Some(existing) = LockRecord::read(&path)? {
            if existing.expires_ms > now {
                return Ok(false);
            }
            tracing::debug!(
                key,
                previous_owner = %existing.owner,
                "Taking over expired lock record"
            );
        }

        let record = LockRecord {
            owner: owner.to_owned(),
            expires_ms: now.saturating_add(lease.as_millis() as u64),
        };
        self.write_record(&record, &path)?;
        Ok(true)
    }

    fn release(&self, key: &str, owner: &str) -> Result<()> {
        let path = self.record_path(key);
        let _guard = self.lock_directory()?;
        match LockRecord::read(&path)? {
            Some(record) if record.owner == owner => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err).context("failed to remove lock record"),
            },
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LockRecord {
    owner: String,
    expires_ms: u64,
}

impl LockRecord {
    fn read(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("failed to read lock record"),
        };

        let (owner, expires) = contents
            .split_once('\n')
            .with_context(|| format!("malformed lock record at {}", path.display()))?;
        let expires_ms = expires
            .trim()
            .parse()
            .with_context(|| format!("malformed lock expiry at {}", path.display()))?;

        Ok(Some(Self {
            owner: owner.to_owned(),
            expires_ms,
        }))
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
