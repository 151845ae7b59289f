use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use patch_types::{ChunkId, ChunkInfo};
use tokio::sync::Semaphore;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, warn};

use crate::{Result, SourceError};

/// The remote chunk store, reduced to deliver-or-fail. Transport, auth and
/// compression live behind this seam.
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    async fn fetch_chunk(&self, id: &ChunkId) -> Result<Bytes>;
}

/// Fetches chunks from the remote store.
///
/// Unlike the blocking sources, the cloud source manages its own concurrency
/// (a semaphore rather than a bound worker thread) and retries transient
/// failures with jittered exponential backoff. Completed fetches are posted
/// back to the dispatch loop as messages by the tasks that awaited them.
pub struct CloudSource {
    provider: Arc<dyn CloudProvider>,
    chunk_info: Arc<HashMap<ChunkId, ChunkInfo>>,
    concurrency: Arc<Semaphore>,
    max_attempts: usize,
    base_delay: Duration,
    /// Backpressure hint: bytes the constructor still expects to need from
    /// the cloud. Providers may consult this to pace prefetch or connection
    /// pools.
    required_bytes: AtomicU64,
}

impl CloudSource {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        chunk_info: Arc<HashMap<ChunkId, ChunkInfo>>,
        concurrency: usize,
        max_attempts: usize,
    ) -> Self {
        Self {
            provider,
            chunk_info,
            concurrency: Arc::new(Semaphore::new(concurrency.max(1))),
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(250),
            required_bytes: AtomicU64::new(0),
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Posts the byte count the rest of the run still requires from this
    /// source.
    pub fn post_required_bytes(&self, bytes: u64) {
        self.required_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn required_bytes(&self) -> u64 {
        self.required_bytes.load(Ordering::Relaxed)
    }

    /// Fetches and verifies one chunk, holding a concurrency permit for the
    /// duration.
    pub async fn fetch(&self, id: ChunkId) -> Result<Bytes> {
        let _permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SourceError::Aborted)?;

        let strategy = ExponentialBackoff::from_millis(self.base_delay.as_millis() as u64)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_attempts - 1);

        let data = Retry::spawn(strategy, || self.provider.fetch_chunk(&id)).await?;

        if let Some(info) = self.chunk_info.get(&id) {
            if data.len() != info.window_size as usize {
                warn!(%id, got = data.len(), want = info.window_size, "cloud chunk size mismatch");
                return Err(SourceError::HashMismatch(id));
            }
            if ChunkId::from_data(&data) != info.sha_hash {
                warn!(%id, "cloud chunk SHA mismatch");
                return Err(SourceError::HashMismatch(id));
            }
        }
        debug!(%id, len = data.len(), "cloud chunk fetched");
        Ok(data)
    }
}
