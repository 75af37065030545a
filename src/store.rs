use crate::types::ScanJob;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Result persistence as seen by the scan core. Durability is a
/// collaborator concern; the core only needs these operations.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert or replace a job snapshot.
    async fn put(&self, job: ScanJob);
    async fn get(&self, id: Uuid) -> Option<ScanJob>;
    /// The most recent `limit` jobs, oldest first.
    async fn list(&self, limit: usize) -> Vec<ScanJob>;
    async fn count(&self) -> usize;
}

/// In-memory store keeping insertion order for recency queries.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<Uuid, ScanJob>,
    order: Vec<Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn put(&self, job: ScanJob) {
        let mut inner = self.inner.lock().await;
        if !inner.jobs.contains_key(&job.id) {
            inner.order.push(job.id);
        }
        inner.jobs.insert(job.id, job);
    }

    async fn get(&self, id: Uuid) -> Option<ScanJob> {
        self.inner.lock().await.jobs.get(&id).cloned()
    }

    async fn list(&self, limit: usize) -> Vec<ScanJob> {
        let inner = self.inner.lock().await;
        let skip = inner.order.len().saturating_sub(limit);
        inner.order[skip..]
            .iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    async fn count(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }
}
