use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::memory::InMemory;
use slatedb::object_store::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::watch::{EventLog, EventType, WatchEvent};
use pkg_constants::controller::CAS_MAX_ATTEMPTS;
use pkg_constants::state::EVENT_LOG_CAPACITY;

/// Every stored object is wrapped in a version envelope. Versions start at 1
/// and bump on every write, so writers can detect that someone got in between
/// their read and their write.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u64,
    value: serde_json::Value,
}

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed; the new version is returned.
    Committed(u64),
    /// Someone else wrote first; `current` is the version now in the store.
    Conflict { current: u64 },
}

/// Versioned state store backed by SlateDB on a local filesystem.
/// In production this would use S3/R2/MinIO via the `object_store` crate.
///
/// All mutations go through a single write lock, which is what makes
/// compare-and-swap atomic within the process. Reads are lock-free.
#[derive(Clone)]
pub struct StateStore {
    db: Db,
    events: EventLog,
    write_lock: Arc<Mutex<()>>,
}

impl StateStore {
    /// Open (or create) a state store rooted at `path` on the local filesystem.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        info!("Opening SlateDB state store at {}", path);

        // Ensure the data directory exists before opening the object store
        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory {}: {}", path, e))?;

        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| anyhow::anyhow!("Failed to create local object store: {}", e))?,
        );
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open SlateDB: {}", e))?;
        Ok(Self::wrap(db))
    }

    /// Open a store backed by in-memory object storage. Used by tests.
    pub async fn new_in_memory() -> anyhow::Result<Self> {
        let object_store = Arc::new(InMemory::new());
        // Flushing to RAM is free; the default 100ms WAL flush interval
        // would make every durable write block for up to a full tick.
        let settings = slatedb::config::Settings {
            flush_interval: Some(std::time::Duration::from_millis(1)),
            ..Default::default()
        };
        let db = Db::builder(Path::from("/"), object_store)
            .with_settings(settings)
            .build()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open in-memory SlateDB: {}", e))?;
        Ok(Self::wrap(db))
    }

    fn wrap(db: Db) -> Self {
        Self {
            db,
            events: EventLog::new(EVENT_LOG_CAPACITY),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Retrieve a value and its version, or `None` if the key does not exist.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<(serde_json::Value, u64)>> {
        match self.db.get(key.as_bytes()).await {
            Ok(Some(bytes)) => {
                let envelope: Envelope = serde_json::from_slice(&bytes)?;
                Ok(Some((envelope.value, envelope.version)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("SlateDB get failed: {}", e)),
        }
    }

    /// Typed variant of [`get`](Self::get).
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> anyhow::Result<Option<(T, u64)>> {
        match self.get(key).await? {
            Some((value, version)) => Ok(Some((serde_json::from_value(value)?, version))),
            None => Ok(None),
        }
    }

    /// Unconditional write. Bumps the version past whatever is stored.
    /// Reserved for uncontended records; contended writers use
    /// [`compare_and_swap`](Self::compare_and_swap).
    pub async fn put(&self, key: &str, value: serde_json::Value) -> anyhow::Result<u64> {
        let _guard = self.write_lock.lock().await;
        let version = self.current_version(key).await? + 1;
        self.write_envelope(key, version, value).await?;
        Ok(version)
    }

    /// Typed variant of [`put`](Self::put).
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<u64> {
        self.put(key, serde_json::to_value(value)?).await
    }

    /// Write only if the stored version still equals `expected_version`.
    /// `expected_version` of 0 means "create only" (the key must not exist).
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: serde_json::Value,
    ) -> anyhow::Result<CasOutcome> {
        let _guard = self.write_lock.lock().await;
        let current = self.current_version(key).await?;
        if current != expected_version {
            return Ok(CasOutcome::Conflict { current });
        }
        let version = current + 1;
        self.write_envelope(key, version, value).await?;
        Ok(CasOutcome::Committed(version))
    }

    /// Typed variant of [`compare_and_swap`](Self::compare_and_swap).
    pub async fn cas_json<T: Serialize>(
        &self,
        key: &str,
        expected_version: u64,
        value: &T,
    ) -> anyhow::Result<CasOutcome> {
        self.compare_and_swap(key, expected_version, serde_json::to_value(value)?)
            .await
    }

    /// Read-modify-write with conflict retry. `f` mutates the object and
    /// returns whether anything changed; unchanged objects are not rewritten.
    /// Returns `Ok(true)` if a write landed, `Ok(false)` if the key is
    /// missing or `f` declined to change it.
    pub async fn update_json<T, F>(&self, key: &str, mut f: F) -> anyhow::Result<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut T) -> bool,
    {
        for _ in 0..CAS_MAX_ATTEMPTS {
            let Some((mut obj, version)) = self.get_json::<T>(key).await? else {
                return Ok(false);
            };
            if !f(&mut obj) {
                return Ok(false);
            }
            match self.cas_json(key, version, &obj).await? {
                CasOutcome::Committed(_) => return Ok(true),
                CasOutcome::Conflict { .. } => continue,
            }
        }
        anyhow::bail!(
            "update of {} gave up after {} conflicting writes",
            key,
            CAS_MAX_ATTEMPTS
        )
    }

    /// Delete a key from the store.
    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        self.db
            .delete(key.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB delete failed: {}", e))?;
        self.events.emit(EventType::Delete, key.to_string()).await;
        Ok(())
    }

    /// List all entries whose keys start with `prefix`, as
    /// `(key, value, version)`.
    pub async fn list_prefix(
        &self,
        prefix: &str,
    ) -> anyhow::Result<Vec<(String, serde_json::Value, u64)>> {
        let mut results = Vec::new();
        let mut iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB scan_prefix failed: {}", e))?;

        while let Ok(Some(kv)) = iter.next().await {
            let key = String::from_utf8_lossy(&kv.key).to_string();
            if let Ok(envelope) = serde_json::from_slice::<Envelope>(&kv.value) {
                results.push((key, envelope.value, envelope.version));
            }
        }
        Ok(results)
    }

    /// Typed variant of [`list_prefix`](Self::list_prefix).
    /// Entries that fail to decode as `T` are skipped.
    pub async fn list_prefix_json<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> anyhow::Result<Vec<(String, T, u64)>> {
        let entries = self.list_prefix(prefix).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value, version)| {
                let obj: T = serde_json::from_value(value).ok()?;
                Some((key, obj, version))
            })
            .collect())
    }

    /// Subscribe to the change-notification feed.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Access the underlying event log (sequence queries, replay).
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Gracefully close the state store.
    pub async fn close(self) -> anyhow::Result<()> {
        info!("Closing SlateDB state store");
        self.db
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB close failed: {}", e))
    }

    async fn current_version(&self, key: &str) -> anyhow::Result<u64> {
        match self.db.get(key.as_bytes()).await {
            Ok(Some(bytes)) => {
                let envelope: Envelope = serde_json::from_slice(&bytes)?;
                Ok(envelope.version)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(anyhow::anyhow!("SlateDB get failed: {}", e)),
        }
    }

    async fn write_envelope(
        &self,
        key: &str,
        version: u64,
        value: serde_json::Value,
    ) -> anyhow::Result<()> {
        let envelope = Envelope { version, value };
        let bytes = serde_json::to_vec(&envelope)?;
        self.db
            .put(key.as_bytes(), &bytes)
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB put failed: {}", e))?;
        self.events.emit(EventType::Put, key.to_string()).await;
        Ok(())
    }
}
