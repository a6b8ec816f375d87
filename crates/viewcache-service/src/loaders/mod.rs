//! Loaders turn image files into [`ImageRecord`]s.
//!
//! A loader is a blocking operation: it reads and decodes a file on the calling thread. The caches
//! run loaders on the blocking thread pool of the runtime, see [`BlockingLoader`] and
//! [`RaceLoader`](crate::caching::RaceLoader).

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::caching::{CacheLoader, ImageKey, ImageRecord, LoadResult};

mod full;
mod preview;
mod quick;

pub use full::FullImageLoader;
pub use quick::QuickImageLoader;

/// Loads the image for a key.
///
/// Implementations must be safe to call concurrently and must not share mutable state between
/// calls.
pub trait LoadImage: Send + Sync + 'static {
    /// Reads and decodes the image for `key`.
    fn load(&self, key: &ImageKey) -> LoadResult<ImageRecord>;

    /// A short name used to tag logs and metrics.
    fn name(&self) -> &'static str {
        "custom"
    }
}

impl<F> LoadImage for F
where
    F: Fn(&ImageKey) -> LoadResult<ImageRecord> + Send + Sync + 'static,
{
    fn load(&self, key: &ImageKey) -> LoadResult<ImageRecord> {
        self(key)
    }
}

/// Runs `loader` and reports how long it took.
fn timed_load(loader: &dyn LoadImage, key: &ImageKey) -> LoadResult<ImageRecord> {
    let name = loader.name();
    let start = Instant::now();
    let result = loader.load(key);
    let elapsed = start.elapsed();

    metric!(
        timer("loader.duration") = elapsed,
        "loader" => name,
        "status" => match &result {
            Ok(_) => "ok",
            Err(err) => err.metrics_tag(),
        },
    );
    tracing::trace!(%key, loader = name, ?elapsed, ok = result.is_ok(), "Loader finished");

    result
}

/// Runs `loader` for `key` on the blocking thread pool.
pub(crate) fn spawn_load(
    loader: Arc<dyn LoadImage>,
    key: ImageKey,
) -> JoinHandle<LoadResult<ImageRecord>> {
    tokio::task::spawn_blocking(move || timed_load(&*loader, &key))
}

/// Adapts a blocking [`LoadImage`] to the [`CacheLoader`] interface of a
/// [`Cache`](crate::caching::Cache).
#[derive(Clone)]
pub struct BlockingLoader {
    loader: Arc<dyn LoadImage>,
}

impl BlockingLoader {
    pub fn new(loader: impl LoadImage) -> Self {
        Self {
            loader: Arc::new(loader),
        }
    }
}

impl std::fmt::Debug for BlockingLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BlockingLoader")
            .field(&self.loader.name())
            .finish()
    }
}

impl CacheLoader for BlockingLoader {
    fn load(&self, key: ImageKey) -> BoxFuture<'static, LoadResult<Arc<ImageRecord>>> {
        let handle = spawn_load(Arc::clone(&self.loader), key);
        Box::pin(async move { handle.await?.map(Arc::new) })
    }
}
