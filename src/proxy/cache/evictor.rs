use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tokio::fs as async_fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::deleter::Deleter;
use super::store::CacheStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EvictionStats {
    pub total_bytes: u64,
    pub queued: u64,
    pub queued_bytes: u64,
}

struct CachedFile {
    size: u64,
    accessed: SystemTime,
}

async fn walk(root: &Path) -> Result<Vec<(PathBuf, u64, SystemTime)>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match async_fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if metadata.is_dir() {
                stack.push(entry.path());
            } else if metadata.is_file() {
                let accessed = metadata
                    .accessed()
                    .or_else(|_| metadata.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                files.push((entry.path(), metadata.len(), accessed));
            }
        }
    }
    Ok(files)
}

/// One pass: when the tree under `root` is over `max_bytes`, queue the
/// least recently accessed data files until the rest fits.
pub(crate) async fn sweep(root: &Path, max_bytes: u64, deleter: &Deleter) -> Result<EvictionStats> {
    let files = walk(root).await?;
    let mut stats = EvictionStats {
        total_bytes: files.iter().map(|(_, size, _)| size).sum(),
        ..EvictionStats::default()
    };
    if stats.total_bytes <= max_bytes {
        return Ok(stats);
    }

    let mut grouped: HashMap<PathBuf, CachedFile> = HashMap::new();
    for (path, size, accessed) in files {
        let (data_path, is_meta) = match CacheStore::data_path_for(&path) {
            Some(data) if CacheStore::is_meta(&path) => (data, true),
            _ => (path, false),
        };
        let slot = grouped.entry(data_path).or_insert(CachedFile {
            size: 0,
            accessed: SystemTime::UNIX_EPOCH,
        });
        slot.size += size;
        if !is_meta {
            slot.accessed = accessed;
        }
    }

    let mut ordered: Vec<(PathBuf, CachedFile)> = grouped.into_iter().collect();
    ordered.sort_by(|a, b| b.1.accessed.cmp(&a.1.accessed));

    let mut running = 0u64;
    for (path, file) in ordered {
        running = running.saturating_add(file.size);
        if running <= max_bytes || deleter.is_pending(&path) {
            continue;
        }
        debug!(path = %path.display(), size = file.size, "evicting cache file");
        stats.queued += 1;
        stats.queued_bytes += file.size;
        deleter.queue(path).await;
    }
    Ok(stats)
}

pub(super) fn spawn_evictor(
    root: PathBuf,
    max_bytes: u64,
    interval: Duration,
    deleter: Deleter,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match sweep(&root, max_bytes, &deleter).await {
                Ok(stats) if stats.queued > 0 => {
                    info!(
                        total_bytes = stats.total_bytes,
                        evicted = stats.queued,
                        evicted_bytes = stats.queued_bytes,
                        "cache over budget; evicting"
                    );
                    crate::metrics::record_cache_eviction(stats.queued, stats.queued_bytes);
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "cache eviction sweep failed"),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, FileTimes};
    use tempfile::TempDir;

    fn write_with_atime(path: &Path, len: usize, accessed: SystemTime) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![b'x'; len]).unwrap();
        let file = File::options().write(true).open(path).unwrap();
        file.set_times(FileTimes::new().set_accessed(accessed).set_modified(accessed))
            .unwrap();
    }

    #[tokio::test]
    async fn under_budget_queues_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let deleter = Deleter::spawn(CacheStore::new(dir.path().to_path_buf()), 8);
        write_with_atime(&dir.path().join("aa/bb/aabb.0"), 100, SystemTime::now());
        let stats = sweep(dir.path(), 1000, &deleter).await?;
        assert_eq!(stats.total_bytes, 100);
        assert_eq!(stats.queued, 0);
        Ok(())
    }

    #[tokio::test]
    async fn evicts_least_recently_accessed_first() -> Result<()> {
        let dir = TempDir::new()?;
        let deleter = Deleter::spawn(CacheStore::new(dir.path().to_path_buf()), 8);
        let now = SystemTime::now();
        let oldest = dir.path().join("aa/bb/aabb.0");
        let middle = dir.path().join("aa/bb/aabb.1");
        let newest = dir.path().join("cc/dd/ccdd.0");
        write_with_atime(&oldest, 400, now - Duration::from_secs(300));
        write_with_atime(&middle, 400, now - Duration::from_secs(200));
        write_with_atime(&newest, 400, now - Duration::from_secs(100));
        std::fs::write(CacheStore::meta_path(&newest), vec![b'm'; 50])?;

        let stats = sweep(dir.path(), 900, &deleter).await?;
        deleter.flush().await;

        assert_eq!(stats.total_bytes, 1250);
        assert_eq!(stats.queued, 1);
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
        Ok(())
    }
}
