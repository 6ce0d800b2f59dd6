//! Persistent key/value slots.
//!
//! Backends are deliberately dumb: they move strings in and out of named
//! slots and report failures as [`StoreError`]. Serialization, validation and
//! expiry live in the consent store service.
//!
//! Backend calls are synchronous; services run them through [`offload`] so
//! file I/O happens on tokio's blocking pool rather than on async workers.
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;

use crate::gate::error::StoreError;

pub trait StorageBackend: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Runs blocking backend work on tokio's blocking pool.
pub async fn offload<T, E, F>(work: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| E::from(StoreError::Io(format!("storage task failed: {error}"))))?
}

/// In-process slots, optionally bounded by a byte quota over keys and values.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    slots: Arc<DashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects writes once keys and values together would exceed `bytes`.
    pub fn with_quota(self, bytes: usize) -> Self {
        Self { quota: Some(bytes), ..self }
    }

    fn used_bytes_except(&self, key: &str) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.key() != key)
            .map(|entry| entry.key().len() + entry.value().len())
            .sum()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.slots.get(key).map(|value| value.clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if let Some(quota) = self.quota {
            let needed = key.len() + value.len();
            let available = quota.saturating_sub(self.used_bytes_except(key));
            if needed > available {
                return Err(StoreError::QuotaExceeded { key: key.to_string(), needed, available });
            }
        }
        self.slots.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.slots.remove(key);
        Ok(())
    }
}

/// One JSON file per slot inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_of(key)) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(StoreError::Io(error.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_of(key);
        let staging = path.with_extension("json.tmp");
        fs::create_dir_all(&self.dir)
            .and_then(|_| fs::write(&staging, value))
            .and_then(|_| fs::rename(&staging, &path))
            .map_err(|error| StoreError::Io(error.to_string()))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_of(key)) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                Err(StoreError::Io(error.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    #[test]
    fn unit_memory_storage_quota() {
        let storage = MemoryStorage::new().with_quota(16);
        storage.set("k", "0123456789").unwrap();
        // Overwriting a slot only counts its new size.
        storage.set("k", "01234567890123").unwrap();
        assert_eq!(
            storage.set("other", "xyz").unwrap_err(),
            StoreError::QuotaExceeded { key: "other".into(), needed: 8, available: 1 }
        );
        storage.remove("k").unwrap();
        storage.set("other", "xyz").unwrap();
        assert_eq!(storage.get("other").unwrap().as_deref(), Some("xyz"));
        assert_eq!(storage.get("k").unwrap(), None);
    }

    #[test]
    fn unit_file_storage_round_trip() {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let dir = std::env::temp_dir().join(format!("consentgate-{}-{}", std::process::id(), nanos));
        let storage = FileStorage::new(&dir);

        assert_eq!(storage.get("consentgate:consent").unwrap(), None);
        storage.set("consentgate:consent", "{\"a\":1}").unwrap();
        assert_eq!(storage.get("consentgate:consent").unwrap().as_deref(), Some("{\"a\":1}"));
        assert!(dir.join("consentgate_consent.json").exists());
        storage.remove("consentgate:consent").unwrap();
        storage.remove("consentgate:consent").unwrap();
        assert_eq!(storage.get("consentgate:consent").unwrap(), None);

        fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unit_offload_leaves_the_runtime_free() {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let dir = std::env::temp_dir().join(format!("consentgate-offload-{}-{}", std::process::id(), nanos));
        let storage = Arc::new(FileStorage::new(&dir));

        // The blocking side waits on a task of this single-threaded runtime.
        let (tx, rx) = std::sync::mpsc::channel::<String>();
        let writer = storage.clone();
        let sender = tokio::spawn(async move { tx.send("{\"a\":1}".to_string()).unwrap() });
        offload(move || {
            let raw = rx.recv().map_err(|error| StoreError::Io(error.to_string()))?;
            writer.set("consentgate:audit", &raw)
        })
        .await
        .unwrap();
        sender.await.unwrap();

        let reader = storage.clone();
        let raw = offload(move || reader.get("consentgate:audit")).await.unwrap();
        assert_eq!(raw.as_deref(), Some("{\"a\":1}"));

        let error = offload(|| Err::<(), _>(StoreError::Io("disk full".into()))).await.unwrap_err();
        assert_eq!(error, StoreError::Io("disk full".into()));

        fs::remove_dir_all(dir).unwrap();
    }
}
