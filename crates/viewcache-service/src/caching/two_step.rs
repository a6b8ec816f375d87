use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};

use crate::loaders::{self, LoadImage};
use crate::receiver::ReceiveImage;

use super::{Cache, CacheIndex, CacheLoader, ImageKey, ImageRecord, LoadResult};

type LoadHandle = JoinHandle<LoadResult<ImageRecord>>;

/// State shared between the [`RaceLoader`], the loader of its cache and its background
/// continuations.
struct RaceState {
    slow: Arc<dyn LoadImage>,
    fast: Arc<dyn LoadImage>,
    receiver: Arc<dyn ReceiveImage>,
    /// The key that was requested most recently. Only records for this key reach the receiver.
    last_requested: Mutex<Option<ImageKey>>,
    index: CacheIndex,
}

enum Winner {
    Slow(Result<LoadResult<ImageRecord>, JoinError>),
    Fast(Result<LoadResult<ImageRecord>, JoinError>),
}

fn joined(result: Result<LoadResult<ImageRecord>, JoinError>) -> LoadResult<ImageRecord> {
    result.unwrap_or_else(|err| Err(err.into()))
}

impl RaceState {
    fn mark_requested(&self, key: &ImageKey) {
        *self.last_requested.lock() = Some(key.clone());
    }

    /// Hands `record` to the receiver, unless another key has been requested since.
    ///
    /// The check and the delivery happen under the marker lock, so a request for a different key
    /// either happens before the check or after the delivery.
    ///
    /// A quick record is also held back once the cache holds the full image for its key. This
    /// happens when an image is evicted and requested again while its first upgrade is still
    /// running, and keeps the receiver from going back from full to quick.
    fn notify(&self, record: &Arc<ImageRecord>) {
        let last_requested = self.last_requested.lock();
        let fidelity = record.fidelity();
        if last_requested.as_ref() != Some(record.key()) {
            metric!(
                counter("receiver.suppressed") += 1,
                "fidelity" => fidelity.as_ref(),
                "reason" => "superseded",
            );
            tracing::trace!(key = %record.key(), "Suppressing image for superseded request");
            return;
        }

        let upgraded = !record.is_full_resolution()
            && self
                .index
                .peek(record.key())
                .is_some_and(|resident| resident.is_full_resolution());
        if upgraded {
            metric!(
                counter("receiver.suppressed") += 1,
                "fidelity" => fidelity.as_ref(),
                "reason" => "upgraded",
            );
            tracing::trace!(key = %record.key(), "Suppressing quick image, full image is cached");
            return;
        }

        metric!(counter("receiver.notify") += 1, "fidelity" => fidelity.as_ref());
        self.receiver.receive(Arc::clone(record));
    }

    /// Runs both loaders for `key` and returns whichever result arrives first.
    ///
    /// If the fast loader wins, the slow result replaces it in the cache once it arrives.
    async fn race(self: Arc<Self>, key: ImageKey) -> LoadResult<Arc<ImageRecord>> {
        let mut slow = loaders::spawn_load(Arc::clone(&self.slow), key.clone());
        let mut fast = loaders::spawn_load(Arc::clone(&self.fast), key.clone());

        let winner = tokio::select! {
            // The full image is preferred if both are ready.
            biased;
            result = &mut slow => Winner::Slow(result),
            result = &mut fast => Winner::Fast(result),
        };

        match winner {
            Winner::Slow(result) => {
                metric!(counter("race.winner") += 1, "loader" => "slow");
                tracing::trace!(%key, "Full image arrived first");
                Self::discard(key, fast);

                let record = Arc::new(joined(result)?);
                self.notify(&record);
                Ok(record)
            }
            Winner::Fast(result) => match joined(result) {
                Ok(record) => {
                    metric!(counter("race.winner") += 1, "loader" => "fast");
                    tracing::trace!(%key, "Quick image arrived first");

                    let record = Arc::new(record);
                    self.notify(&record);
                    tokio::spawn(Arc::clone(&self).upgrade(key, slow));
                    Ok(record)
                }
                Err(err) => {
                    metric!(counter("race.winner") += 1, "loader" => "fallback");
                    tracing::debug!(
                        %key,
                        error = &err as &dyn std::error::Error,
                        "Quick load failed, waiting for full image"
                    );

                    let record = Arc::new(joined(slow.await)?);
                    self.notify(&record);
                    Ok(record)
                }
            },
        }
    }

    /// Waits for the full image that lost against a quick one and swaps it into the cache.
    async fn upgrade(self: Arc<Self>, key: ImageKey, slow: LoadHandle) {
        let record = match joined(slow.await) {
            Ok(record) => Arc::new(record),
            Err(err) => {
                // The quick record stays in the cache, there is no retry.
                metric!(counter("race.background.failure") += 1, "reason" => err.metrics_tag());
                tracing::error!(
                    %key,
                    error = &err as &dyn std::error::Error,
                    "Failed to load full image"
                );
                return;
            }
        };

        if let Err(err) = self.index.replace(key.clone(), Arc::clone(&record)) {
            tracing::error!(
                %key,
                error = &err as &dyn std::error::Error,
                "Failed to store full image"
            );
        }
        self.notify(&record);
    }

    /// Drops the result of a quick load that lost the race once it arrives.
    fn discard(key: ImageKey, fast: LoadHandle) {
        tokio::spawn(async move {
            let result = joined(fast.await);
            metric!(counter("race.discarded") += 1, "status" => match &result {
                Ok(_) => "ok",
                Err(err) => err.metrics_tag(),
            });
            tracing::trace!(%key, "Discarding quick image");
        });
    }
}

/// The loader of the cache inside a [`RaceLoader`].
struct RaceLoad {
    state: Arc<RaceState>,
}

impl CacheLoader for RaceLoad {
    fn load(&self, key: ImageKey) -> BoxFuture<'static, LoadResult<Arc<ImageRecord>>> {
        Box::pin(Arc::clone(&self.state).race(key))
    }
}

/// A two-step image cache that answers as fast as possible and upgrades to full fidelity later.
///
/// Every load races a slow loader, which produces the full image, against a fast loader, which
/// produces a quick stand-in like a thumbnail. Whichever finishes first is cached, returned and
/// pushed to the receiver. If the quick record won, the full one replaces it in the cache once it
/// is done, and is pushed to the receiver a second time.
///
/// Only records for the most recently requested key reach the receiver. Loads for keys that have
/// been superseded still run to completion and populate the cache, but stay silent.
pub struct RaceLoader {
    state: Arc<RaceState>,
    cache: Cache<RaceLoad>,
    runtime: Handle,
}

impl fmt::Debug for RaceLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaceLoader")
            .field("slow", &self.state.slow.name())
            .field("fast", &self.state.fast.name())
            .field("last_requested", &*self.state.last_requested.lock())
            .field("cache", &self.cache)
            .finish()
    }
}

impl RaceLoader {
    /// Creates a new race loader with an empty cache of the given capacity.
    ///
    /// This must be called from within a tokio runtime, which runs all loads.
    pub fn new(
        slow: impl LoadImage,
        fast: impl LoadImage,
        receiver: impl ReceiveImage,
        capacity: NonZeroUsize,
    ) -> Self {
        Self::with_runtime(slow, fast, receiver, capacity, Handle::current())
    }

    /// Creates a new race loader running its loads on the given runtime.
    pub fn with_runtime(
        slow: impl LoadImage,
        fast: impl LoadImage,
        receiver: impl ReceiveImage,
        capacity: NonZeroUsize,
        runtime: Handle,
    ) -> Self {
        let index = CacheIndex::new(capacity);
        let state = Arc::new(RaceState {
            slow: Arc::new(slow),
            fast: Arc::new(fast),
            receiver: Arc::new(receiver),
            last_requested: Mutex::new(None),
            index: index.clone(),
        });
        let loader = RaceLoad {
            state: Arc::clone(&state),
        };

        Self {
            state,
            cache: Cache::with_index(loader, index),
            runtime,
        }
    }

    /// Returns the record for `key`, racing both loaders if it is not cached.
    ///
    /// `key` becomes the most recently requested key. A cached record is returned as is, without
    /// notifying the receiver.
    pub async fn get_or_load(&self, key: ImageKey) -> LoadResult<Arc<ImageRecord>> {
        self.state.mark_requested(&key);
        self.cache.get_or_load(key).await
    }

    /// Races both loaders for `key`, bypassing the cache lookup.
    ///
    /// `key` becomes the most recently requested key. The winning record is not inserted into the
    /// cache, but a full record arriving after a quick one is, as it replaces the quick one.
    pub async fn load(&self, key: ImageKey) -> LoadResult<Arc<ImageRecord>> {
        self.state.mark_requested(&key);
        Arc::clone(&self.state).race(key).await
    }

    /// Loads `key` into the cache ahead of time, without making it the most recently requested key.
    pub async fn prefetch(&self, key: ImageKey) -> LoadResult<Arc<ImageRecord>> {
        self.cache.get_or_load(key).await
    }

    /// Blocking version of [`load`](Self::load).
    ///
    /// This blocks the current thread until the race is decided. It must not be called from within
    /// the runtime, nor from a thread that has to stay responsive like a UI event loop.
    pub fn load_blocking(&self, key: ImageKey) -> LoadResult<Arc<ImageRecord>> {
        self.runtime.block_on(self.load(key))
    }

    /// Blocking version of [`get_or_load`](Self::get_or_load).
    ///
    /// The same restrictions as for [`load_blocking`](Self::load_blocking) apply.
    pub fn get_or_load_blocking(&self, key: ImageKey) -> LoadResult<Arc<ImageRecord>> {
        self.runtime.block_on(self.get_or_load(key))
    }

    /// The most recently requested key.
    pub fn last_requested(&self) -> Option<ImageKey> {
        self.state.last_requested.lock().clone()
    }

    /// The cache holding the winning records.
    pub fn cache(&self) -> &CacheIndex {
        self.cache.index()
    }
}
