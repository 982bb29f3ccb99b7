use crate::core::{
    CacheError, FileStoreParams, GroupId, InstanceId, PassivationEntry, Result, SweepReport,
};
use crate::store::{PassivationStore, SweepListener};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{Level, event};

/// File-backed passivation store.
///
/// Each entry is one MessagePack file plus a small timestamp sidecar, laid
/// out as `<base>/<sessions|groups>/<bucket>/<hex-id>.entry`. The bucket is a
/// stable hash of the identity modulo the configured fan-out, so directories
/// stay small and the layout survives restarts. The sidecar lets the sweep
/// judge idleness without deserializing entries.
pub struct FileStore {
    params: FileStoreParams,
    max_size: Option<usize>,
    /// Serializes passivate/activate/sweep per identity
    locks: Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl FileStore {
    pub fn new(params: FileStoreParams, max_size: Option<usize>) -> Self {
        Self {
            params,
            max_size,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn root(&self, grouped: bool) -> PathBuf {
        let dir = if grouped {
            &self.params.groups_dir
        } else {
            &self.params.sessions_dir
        };
        self.params.base_dir.join(dir)
    }

    fn bucket(&self, id: &InstanceId) -> u32 {
        let digest = Sha256::digest(id.as_str().as_bytes());
        let prefix = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        prefix % self.params.subdirectory_count
    }

    fn entry_path(&self, id: &InstanceId, grouped: bool) -> PathBuf {
        self.root(grouped)
            .join(self.bucket(id).to_string())
            .join(format!("{}.entry", hex::encode(id.as_str().as_bytes())))
    }

    fn ts_path(&self, id: &InstanceId, grouped: bool) -> PathBuf {
        self.entry_path(id, grouped).with_extension("ts")
    }

    fn id_from_stem(path: &Path) -> Option<InstanceId> {
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        let id = String::from_utf8(bytes).ok()?;
        Some(InstanceId::new(id))
    }

    async fn identity_lock(&self, id: &InstanceId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| CacheError::StoreUnavailable(err.to_string()))?;
        }

        let tmp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|err| CacheError::StoreUnavailable(err.to_string()))?;
        file.write_all(bytes)
            .await
            .map_err(|err| CacheError::StoreUnavailable(err.to_string()))?;
        file.sync_data()
            .await
            .map_err(|err| CacheError::StoreUnavailable(err.to_string()))?;
        drop(file);

        fs::rename(&tmp_path, path)
            .await
            .map_err(|err| CacheError::StoreUnavailable(err.to_string()))
    }

    /// Delete an entry's file pair, ignoring files that are already gone.
    async fn delete_pair(&self, id: &InstanceId, grouped: bool) {
        for path in [self.entry_path(id, grouped), self.ts_path(id, grouped)] {
            if let Err(err) = fs::remove_file(&path).await {
                if err.kind() != ErrorKind::NotFound {
                    event!(Level::WARN, id = %id, error = %err, "failed to delete store file");
                }
            }
        }
    }

    /// All sidecar files under both roots, tagged with their root.
    async fn sidecar_files(&self) -> Result<Vec<(bool, PathBuf)>> {
        let mut found = Vec::new();

        for grouped in [false, true] {
            let root = self.root(grouped);
            let mut buckets = match fs::read_dir(&root).await {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(CacheError::StoreUnavailable(err.to_string())),
            };

            while let Some(bucket) = buckets
                .next_entry()
                .await
                .map_err(|err| CacheError::StoreUnavailable(err.to_string()))?
            {
                let file_type = bucket
                    .file_type()
                    .await
                    .map_err(|err| CacheError::StoreUnavailable(err.to_string()))?;
                if !file_type.is_dir() {
                    continue;
                }

                let mut files = fs::read_dir(bucket.path())
                    .await
                    .map_err(|err| CacheError::StoreUnavailable(err.to_string()))?;
                while let Some(file) = files
                    .next_entry()
                    .await
                    .map_err(|err| CacheError::StoreUnavailable(err.to_string()))?
                {
                    let path = file.path();
                    if path.extension().and_then(|ext| ext.to_str()) == Some("ts") {
                        found.push((grouped, path));
                    }
                }
            }
        }

        Ok(found)
    }

    /// Expire the oldest entries until the store fits its capacity again.
    async fn enforce_max_size(&self) -> Result<()> {
        let Some(max_size) = self.max_size else {
            return Ok(());
        };

        let mut aged: Vec<(DateTime<Utc>, InstanceId, bool)> = Vec::new();
        for (grouped, ts_path) in self.sidecar_files().await? {
            let Some(id) = Self::id_from_stem(&ts_path) else {
                continue;
            };
            if let Ok(bytes) = fs::read(&ts_path).await {
                if let Ok(last_access) = rmp_serde::from_slice::<DateTime<Utc>>(&bytes) {
                    aged.push((last_access, id, grouped));
                }
            }
        }

        if aged.len() <= max_size {
            return Ok(());
        }

        aged.sort_by(|a, b| a.0.cmp(&b.0));
        let overflow = aged.len() - max_size;
        for (_, id, grouped) in aged.into_iter().take(overflow) {
            let lock = self.identity_lock(&id).await;
            // A busy identity is being activated or rewritten; leave it to
            // the next capacity check
            let Ok(_held) = lock.try_lock() else {
                continue;
            };
            self.delete_pair(&id, grouped).await;
            event!(Level::WARN, id = %id, "store at capacity, oldest entry expired");
        }

        Ok(())
    }
}

#[async_trait]
impl PassivationStore for FileStore {
    async fn start(&self) -> Result<()> {
        for grouped in [false, true] {
            fs::create_dir_all(self.root(grouped))
                .await
                .map_err(|err| CacheError::StoreUnavailable(err.to_string()))?;
        }
        Ok(())
    }

    async fn passivate(&self, entry: PassivationEntry) -> Result<()> {
        let id = entry.id.clone();
        let grouped = entry.group.is_some();

        let bytes = rmp_serde::to_vec(&entry)
            .map_err(|err| CacheError::StoreUnavailable(format!("encode entry: {}", err)))?;
        let ts_bytes = rmp_serde::to_vec(&entry.last_access)
            .map_err(|err| CacheError::StoreUnavailable(format!("encode timestamp: {}", err)))?;

        {
            let lock = self.identity_lock(&id).await;
            let _held = lock.lock().await;
            Self::write_atomic(&self.entry_path(&id, grouped), &bytes).await?;
            Self::write_atomic(&self.ts_path(&id, grouped), &ts_bytes).await?;
        }

        self.enforce_max_size().await
    }

    async fn activate(&self, id: &InstanceId) -> Result<PassivationEntry> {
        let lock = self.identity_lock(id).await;
        let _held = lock.lock().await;

        for grouped in [false, true] {
            let entry_path = self.entry_path(id, grouped);
            let bytes = match fs::read(&entry_path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(CacheError::StoreUnavailable(err.to_string())),
            };

            // Take semantics: the files go away whether or not the payload
            // decodes, so a corrupt entry cannot be activated twice
            fs::remove_file(&entry_path)
                .await
                .map_err(|err| CacheError::StoreUnavailable(err.to_string()))?;
            if let Err(err) = fs::remove_file(self.ts_path(id, grouped)).await {
                if err.kind() != ErrorKind::NotFound {
                    event!(Level::WARN, id = %id, error = %err, "failed to delete timestamp sidecar");
                }
            }

            return rmp_serde::from_slice(&bytes)
                .map_err(|err| CacheError::CorruptEntry(id.clone(), err.to_string()));
        }

        Err(CacheError::NotFound(id.clone()))
    }

    async fn remove(&self, id: &InstanceId) -> Result<bool> {
        let lock = self.identity_lock(id).await;
        let _held = lock.lock().await;

        let mut removed = false;
        for grouped in [false, true] {
            match fs::remove_file(self.entry_path(id, grouped)).await {
                Ok(()) => removed = true,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(CacheError::StoreUnavailable(err.to_string())),
            }
            if let Err(err) = fs::remove_file(self.ts_path(id, grouped)).await {
                if err.kind() != ErrorKind::NotFound {
                    event!(Level::WARN, id = %id, error = %err, "failed to delete timestamp sidecar");
                }
            }
        }

        Ok(removed)
    }

    async fn sweep(
        &self,
        idle_timeout: Duration,
        listener: &dyn SweepListener,
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut expired: Vec<(InstanceId, Option<GroupId>)> = Vec::new();

        let Ok(idle_limit) = chrono::Duration::from_std(idle_timeout) else {
            return Ok(report);
        };

        for (grouped, ts_path) in self.sidecar_files().await? {
            report.scanned += 1;

            let Some(id) = Self::id_from_stem(&ts_path) else {
                report.failed += 1;
                event!(Level::WARN, path = %ts_path.display(), "unparseable store filename");
                continue;
            };

            let lock = self.identity_lock(&id).await;
            let _held = lock.lock().await;

            // Re-read under the lock: the entry may have been activated or
            // refreshed since the directory scan
            let ts_bytes = match fs::read(&ts_path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    report.failed += 1;
                    event!(Level::WARN, id = %id, error = %err, "failed to read timestamp sidecar");
                    continue;
                }
            };

            match rmp_serde::from_slice::<DateTime<Utc>>(&ts_bytes) {
                Err(err) => {
                    // An unreadable sidecar leaves idleness unknowable; drop
                    // the pair rather than keep it forever
                    event!(Level::WARN, id = %id, error = %err, "corrupt timestamp sidecar, removing entry");
                    self.delete_pair(&id, grouped).await;
                    report.failed += 1;
                }
                Ok(last_access) => {
                    let idle = Utc::now().signed_duration_since(last_access);
                    if idle > idle_limit {
                        let group = match fs::read(self.entry_path(&id, grouped)).await {
                            Ok(bytes) => rmp_serde::from_slice::<PassivationEntry>(&bytes)
                                .map(|entry| entry.group)
                                .unwrap_or(None),
                            Err(_) => None,
                        };
                        self.delete_pair(&id, grouped).await;
                        report.expired += 1;
                        expired.push((id, group));
                    }
                }
            }
        }

        for (id, group) in expired {
            listener.entry_expired(&id, group.as_ref()).await;
        }

        Ok(report)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.sidecar_files().await?.len())
    }

    async fn contains(&self, id: &InstanceId) -> Result<bool> {
        for grouped in [false, true] {
            match fs::metadata(self.entry_path(id, grouped)).await {
                Ok(_) => return Ok(true),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(CacheError::StoreUnavailable(err.to_string())),
            }
        }
        Ok(false)
    }
}
