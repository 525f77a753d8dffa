//! Credential and sentry storage collaborator.

use crate::error::StorageError;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Supplies logon credentials and persists the sentry file.
///
/// `write_sentry_chunk` takes `&self`; implementations synchronize internally
/// so the client can share them behind an `Arc`.
pub trait Credentials: Send + Sync {
    fn account_name(&self) -> String;

    fn password(&self) -> String;

    /// Hash of the current sentry file, `None` if there is none
    fn sentry_hash(&self) -> Option<Vec<u8>>;

    fn write_sentry_chunk(&self, filename: &str, offset: u64, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Largest sentry file a server may make us write
pub const MAX_SENTRY_FILE_SIZE: u64 = 1024 * 1024;

/// End offset of a chunk, rejecting overflow and anything past the size cap
fn chunk_end(offset: u64, len: usize) -> Result<u64, StorageError> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| StorageError::Other(format!("chunk at offset {offset} overflows")))?;
    if end > MAX_SENTRY_FILE_SIZE {
        return Err(StorageError::Other(format!(
            "chunk ends at {end}, past the {MAX_SENTRY_FILE_SIZE} byte sentry limit"
        )));
    }
    Ok(end)
}

fn digest(contents: &[u8]) -> Vec<u8> {
    Sha256::digest(contents).to_vec()
}

#[derive(Debug, Default)]
struct SentryFile {
    filename: String,
    contents: Vec<u8>,
}

/// In-memory credentials, mainly for tests and simulators
#[derive(Debug)]
pub struct MemoryCredentials {
    account_name: String,
    password: String,
    sentry: Mutex<Option<SentryFile>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryCredentials {
    pub fn new(account_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            password: password.into(),
            sentry: Mutex::new(None),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Start with an existing sentry file
    pub fn with_sentry(self, filename: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        *self.sentry.lock().unwrap_or_else(PoisonError::into_inner) = Some(SentryFile {
            filename: filename.into(),
            contents: contents.into(),
        });
        self
    }

    /// Make every subsequent write fail as if the disk were full
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of write attempts seen
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn sentry_filename(&self) -> Option<String> {
        self.sentry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.filename.clone())
    }

    pub fn sentry_contents(&self) -> Option<Vec<u8>> {
        self.sentry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.contents.clone())
    }
}

impl Credentials for MemoryCredentials {
    fn account_name(&self) -> String {
        self.account_name.clone()
    }

    fn password(&self) -> String {
        self.password.clone()
    }

    fn sentry_hash(&self) -> Option<Vec<u8>> {
        self.sentry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| digest(&s.contents))
    }

    fn write_sentry_chunk(&self, filename: &str, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Full(filename.to_string()));
        }

        // Both fit in usize once under the cap
        let end = chunk_end(offset, bytes.len())? as usize;
        let offset = offset as usize;
        let mut guard = self.sentry.lock().unwrap_or_else(PoisonError::into_inner);
        let sentry = guard.get_or_insert_with(SentryFile::default);
        if sentry.filename != filename {
            sentry.filename = filename.to_string();
            sentry.contents.clear();
        }
        if sentry.contents.len() < end {
            sentry.contents.resize(end, 0);
        }
        sentry.contents[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}

/// Credentials whose sentry file lives in a directory on disk
#[derive(Debug)]
pub struct FileCredentials {
    account_name: String,
    password: String,
    dir: PathBuf,
    current: Mutex<Option<PathBuf>>,
}

impl FileCredentials {
    /// `sentry_filename` names a previously written sentry in `dir`, if any
    pub fn new(
        account_name: impl Into<String>,
        password: impl Into<String>,
        dir: impl Into<PathBuf>,
        sentry_filename: Option<&str>,
    ) -> Self {
        let dir = dir.into();
        let current = sentry_filename.map(|name| dir.join(name));
        Self {
            account_name: account_name.into(),
            password: password.into(),
            dir,
            current: Mutex::new(current),
        }
    }
}

impl Credentials for FileCredentials {
    fn account_name(&self) -> String {
        self.account_name.clone()
    }

    fn password(&self) -> String {
        self.password.clone()
    }

    fn sentry_hash(&self) -> Option<Vec<u8>> {
        let path = self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()?;
        fs::read(path).ok().map(|contents| digest(&contents))
    }

    fn write_sentry_chunk(&self, filename: &str, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        // Only the final path component is honored
        let name = std::path::Path::new(filename)
            .file_name()
            .ok_or_else(|| StorageError::Other(format!("invalid sentry filename: {filename}")))?;
        let path = self.dir.join(name);
        chunk_end(offset, bytes.len())?;

        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        file.sync_all()?;

        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(path);
        Ok(())
    }
}
