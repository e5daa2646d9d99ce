use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use sha1::{Digest, Sha1};
use tokio::fs as async_fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::key::CacheKey;
use super::meta::PersistedEntry;

pub(super) const MAX_SUFFIXES: u32 = 1000;
const META_SUFFIX: &str = ".meta";

/// Sharded file layout: `<root>/<hex[0..2]>/<hex[2..4]>/<hex>.<n>` with a
/// `<hex>.<n>.meta` sidecar next to each data file.
#[derive(Debug, Clone)]
pub(crate) struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(super) fn shard_dir(&self, key: &CacheKey) -> PathBuf {
        let digest = key.digest();
        self.root.join(&digest[..2]).join(&digest[2..4])
    }

    pub(crate) fn meta_path(data_path: &Path) -> PathBuf {
        let mut name = data_path.as_os_str().to_owned();
        name.push(META_SUFFIX);
        PathBuf::from(name)
    }

    pub(crate) fn is_meta(path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(META_SUFFIX))
    }

    /// Data path a sidecar belongs to.
    pub(crate) fn data_path_for(meta_path: &Path) -> Option<PathBuf> {
        let name = meta_path.file_name()?.to_str()?;
        let stem = name.strip_suffix(META_SUFFIX)?;
        Some(meta_path.with_file_name(stem))
    }

    /// Creates an empty data file under the first free suffix, skipping
    /// paths still queued for deletion.
    pub(super) async fn allocate(
        &self,
        key: &CacheKey,
        pending: &HashSet<PathBuf>,
    ) -> Result<PathBuf> {
        let dir = self.shard_dir(key);
        async_fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create cache shard {}", dir.display()))?;
        for n in 0..MAX_SUFFIXES {
            let path = dir.join(format!("{}.{n}", key.digest()));
            if pending.contains(&path) {
                continue;
            }
            let mut options = async_fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            {
                options.mode(0o600);
            }
            match options.open(&path).await {
                Ok(_) => return Ok(path),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create {}", path.display()));
                }
            }
        }
        bail!("no free cache file slot for {}", key)
    }

    /// Data files for `key`, in suffix order.
    pub(super) async fn list_variants(&self, key: &CacheKey) -> Result<Vec<PathBuf>> {
        let dir = self.shard_dir(key);
        let mut entries = match async_fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let prefix = format!("{}.", key.digest());
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(n) = suffix.parse::<u32>() else {
                continue;
            };
            if entry.file_type().await?.is_file() {
                found.push((n, entry.path()));
            }
        }
        found.sort_by_key(|(n, _)| *n);
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    pub(super) async fn read_meta(data_path: &Path) -> Option<PersistedEntry> {
        let meta_path = Self::meta_path(data_path);
        let data = match async_fs::read(&meta_path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(error = %err, path = %meta_path.display(), "failed to read cache metadata");
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, path = %meta_path.display(), "failed to parse cache metadata");
                None
            }
        }
    }

    pub(super) async fn write_meta(data_path: &Path, entry: &PersistedEntry) -> Result<()> {
        let meta_path = Self::meta_path(data_path);
        let data = serde_json::to_vec(entry)?;
        let mut options = async_fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let mut file = options
            .open(&meta_path)
            .await
            .with_context(|| format!("failed to write cache metadata {}", meta_path.display()))?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    pub(super) async fn content_digest(path: &Path) -> Result<String> {
        let mut file = async_fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Removes a data file and its sidecar, then any shard directories left
    /// empty. Missing files are not an error.
    pub(crate) async fn remove_entry_files(&self, data_path: &Path) -> u64 {
        let mut reclaimed = 0;
        for path in [data_path.to_path_buf(), Self::meta_path(data_path)] {
            let size = async_fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            match async_fs::remove_file(&path).await {
                Ok(()) => reclaimed += size,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "failed to remove cache file");
                }
            }
        }
        self.prune_empty_shards(data_path).await;
        reclaimed
    }

    async fn dir_is_empty(path: &Path) -> bool {
        let mut entries = match async_fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        matches!(entries.next_entry().await, Ok(None))
    }

    async fn prune_empty_shards(&self, data_path: &Path) {
        let mut dir = data_path.parent();
        while let Some(shard) = dir {
            if shard == self.root || !shard.starts_with(&self.root) {
                break;
            }
            if !Self::dir_is_empty(shard).await {
                break;
            }
            let _ = async_fs::remove_dir(shard).await;
            dir = shard.parent();
        }
    }

    /// Startup pass: drops data files whose sidecar never got written and
    /// sidecars whose data file is gone.
    pub(super) async fn remove_orphans(&self) -> Result<u64> {
        let mut removed = 0u64;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match async_fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let mut files = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if file_type.is_file() {
                    files.push(entry.path());
                }
            }
            let names: HashSet<PathBuf> = files.iter().cloned().collect();
            for path in &files {
                let orphan = if Self::is_meta(path) {
                    Self::data_path_for(path).is_none_or(|data| !names.contains(&data))
                } else {
                    !names.contains(&Self::meta_path(path))
                };
                if orphan {
                    debug!(path = %path.display(), "removing orphaned cache file");
                    if async_fs::remove_file(path).await.is_ok() {
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}
