use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use super::store::CacheStore;

enum Job {
    Delete(PathBuf),
    Flush(oneshot::Sender<()>),
}

/// Single-consumer deletion queue. Producers never touch the filesystem;
/// the worker removes each data file together with its sidecar.
#[derive(Clone)]
pub(crate) struct Deleter {
    tx: mpsc::Sender<Job>,
    pending: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Deleter {
    pub(crate) fn spawn(store: CacheStore, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pending = Arc::new(Mutex::new(HashSet::new()));
        tokio::spawn(run(rx, store, pending.clone()));
        Self { tx, pending }
    }

    pub(crate) fn is_pending(&self, path: &Path) -> bool {
        self.pending.lock().contains(path)
    }

    pub(crate) fn pending_snapshot(&self) -> HashSet<PathBuf> {
        self.pending.lock().clone()
    }

    /// Waits for queue space when the worker is behind.
    pub(crate) async fn queue(&self, path: PathBuf) {
        if !self.pending.lock().insert(path.clone()) {
            return;
        }
        trace!(path = %path.display(), "queueing cache file for deletion");
        if let Err(err) = self.tx.send(Job::Delete(path)).await {
            let Job::Delete(path) = err.0 else {
                return;
            };
            warn!(path = %path.display(), "deletion worker stopped; dropping request");
            self.pending.lock().remove(&path);
        }
    }

    /// Resolves once every deletion queued before the call has run.
    pub(crate) async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Job::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run(mut rx: mpsc::Receiver<Job>, store: CacheStore, pending: Arc<Mutex<HashSet<PathBuf>>>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Delete(path) => {
                let reclaimed = store.remove_entry_files(&path).await;
                pending.lock().remove(&path);
                crate::metrics::record_cache_deletion(reclaimed);
                trace!(path = %path.display(), reclaimed, "deleted cache file");
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
