use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::utils::futures::CallOnDrop;

use super::{ImageKey, ImageRecord, LoadError, LoadResult};

type LoadChannel = Shared<oneshot::Receiver<LoadResult<Arc<ImageRecord>>>>;
type LoadSender = oneshot::Sender<LoadResult<Arc<ImageRecord>>>;

/// The capability a [`Cache`] uses to produce records for missing keys.
///
/// The returned future is spawned onto the runtime and runs to completion even if every caller
/// waiting for it goes away.
pub trait CacheLoader: Send + Sync + 'static {
    fn load(&self, key: ImageKey) -> BoxFuture<'static, LoadResult<Arc<ImageRecord>>>;
}

impl<L: CacheLoader + ?Sized> CacheLoader for Arc<L> {
    fn load(&self, key: ImageKey) -> BoxFuture<'static, LoadResult<Arc<ImageRecord>>> {
        (**self).load(key)
    }
}

/// A resident record together with its cache bookkeeping.
struct Slot {
    record: Arc<ImageRecord>,
    /// Comparative age, see [`IndexState::touch`].
    score: i64,
    /// Insertion sequence number, used to break ties between equal scores.
    inserted: u64,
}

struct InFlight {
    id: u64,
    channel: LoadChannel,
}

struct IndexState {
    capacity: NonZeroUsize,
    slots: HashMap<ImageKey, Slot>,
    in_flight: HashMap<ImageKey, InFlight>,
    next_seq: u64,
}

impl IndexState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Marks an access to `key`.
    ///
    /// The accessed record gains one point and every other resident record loses one, so records
    /// that are requested more often than their peers build up a lead over them.
    fn touch(&mut self, key: &ImageKey) {
        for (slot_key, slot) in self.slots.iter_mut() {
            if slot_key == key {
                slot.score += 1;
            } else {
                slot.score -= 1;
            }
        }
    }

    /// Evicts the record with the lowest score, the oldest one among equals.
    fn evict_one(&mut self) -> LoadResult<()> {
        let victim = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| (slot.score, slot.inserted))
            .map(|(key, _)| key.clone())
            .ok_or(LoadError::CapacityInvariantViolation)?;

        if let Some(slot) = self.slots.remove(&victim) {
            tracing::debug!(key = %victim, score = slot.score, "Evicting image from cache");
            metric!(counter("caches.eviction") += 1);
        }
        Ok(())
    }

    /// Inserts a record for a key that is not resident yet, evicting if the cache is full.
    fn insert_new(&mut self, key: ImageKey, record: Arc<ImageRecord>) -> LoadResult<()> {
        debug_assert!(!self.slots.contains_key(&key));
        if self.slots.len() >= self.capacity.get() {
            self.evict_one()?;
        }
        let inserted = self.next_seq();
        self.slots.insert(
            key,
            Slot {
                record,
                score: 0,
                inserted,
            },
        );
        if self.slots.len() > self.capacity.get() {
            tracing::error!(
                len = self.slots.len(),
                capacity = self.capacity.get(),
                "Image cache exceeds its capacity"
            );
            return Err(LoadError::CapacityInvariantViolation);
        }
        metric!(gauge("caches.memory.size") = self.slots.len() as u64);
        Ok(())
    }

    /// Stores the result of a finished load and returns the record callers should see.
    ///
    /// In case the key was already populated by a [`CacheIndex::replace`] while the load was
    /// running, the resident record wins and the loaded one is dropped.
    fn complete_load(
        &mut self,
        key: ImageKey,
        record: Arc<ImageRecord>,
    ) -> LoadResult<Arc<ImageRecord>> {
        if let Some(slot) = self.slots.get(&key) {
            tracing::trace!(%key, "Dropping loaded image, key was replaced while loading");
            return Ok(Arc::clone(&slot.record));
        }
        self.insert_new(key, Arc::clone(&record))?;
        Ok(record)
    }

    /// Removes the in-flight marker for `key`, if it still belongs to the load with `id`.
    fn finish_load(&mut self, key: &ImageKey, id: u64) {
        if self.in_flight.get(key).is_some_and(|load| load.id == id) {
            self.in_flight.remove(key);
        }
    }
}

/// The shared, bounded key-to-record index of a [`Cache`].
///
/// All structural mutations (insert, evict, replace, remove) are serialized by a single lock,
/// which is never held while a loader runs. The index is cheap to clone; clones refer to the same
/// index.
#[derive(Clone)]
pub struct CacheIndex {
    state: Arc<Mutex<IndexState>>,
}

impl fmt::Debug for CacheIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheIndex")
            .field("capacity", &state.capacity)
            .field("in-memory items", &state.slots.len())
            .field("running loads", &state.in_flight.len())
            .finish()
    }
}

impl CacheIndex {
    /// Creates an empty index that holds at most `capacity` records.
    pub fn new(capacity: NonZeroUsize) -> Self {
        let state = IndexState {
            capacity,
            slots: HashMap::with_capacity(capacity.get()),
            in_flight: HashMap::new(),
            next_seq: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Replaces the record stored for `key`.
    ///
    /// The previous record is released from the cache. If `key` is not resident it is inserted,
    /// evicting another record if the cache is full. This does not count as an access, scores are
    /// left untouched and a newly inserted key starts with a score of `0`.
    pub fn replace(&self, key: ImageKey, record: Arc<ImageRecord>) -> LoadResult<()> {
        metric!(counter("caches.replace") += 1);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.slots.get_mut(&key) {
            Some(slot) => {
                tracing::trace!(%key, fidelity = %record.fidelity(), "Replacing cached image");
                drop(std::mem::replace(&mut slot.record, record));
                Ok(())
            }
            None => {
                tracing::trace!(%key, "Inserting replacement for image that is not cached");
                state.insert_new(key, record)
            }
        }
    }

    /// Removes `key` from the cache, returning the removed record.
    pub fn remove(&self, key: &ImageKey) -> Option<Arc<ImageRecord>> {
        self.state.lock().slots.remove(key).map(|slot| slot.record)
    }

    /// Removes all records. Running loads are not affected and will still insert their results.
    pub fn clear(&self) {
        let slots = std::mem::take(&mut self.state.lock().slots);
        tracing::debug!(count = slots.len(), "Clearing image cache");
    }

    /// Returns the record for `key` without counting it as an access.
    pub fn peek(&self, key: &ImageKey) -> Option<Arc<ImageRecord>> {
        let state = self.state.lock();
        state.slots.get(key).map(|slot| Arc::clone(&slot.record))
    }

    /// The current score of `key`, if it is resident.
    pub fn score(&self, key: &ImageKey) -> Option<i64> {
        self.state.lock().slots.get(key).map(|slot| slot.score)
    }

    pub fn contains(&self, key: &ImageKey) -> bool {
        self.state.lock().slots.contains_key(key)
    }

    /// All resident keys, in no particular order.
    pub fn keys(&self) -> Vec<ImageKey> {
        self.state.lock().slots.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.state.lock().capacity
    }

    fn touch(&self, key: &ImageKey) {
        self.state.lock().touch(key);
    }
}

/// A bounded in-memory cache of decoded images.
///
/// Missing records are produced by a [`CacheLoader`]. Concurrent requests for the same missing key
/// are coalesced onto a single load, whose result (or error) every one of them receives. Errors
/// are never cached, so a request after a failure starts a fresh load.
///
/// Eviction does not follow plain LRU: every access to a record raises its score by one and lowers
/// the score of all other resident records by one. When a new key has to be inserted into a full
/// cache, the record with the lowest score is evicted.
pub struct Cache<L> {
    index: CacheIndex,
    loader: Arc<L>,
}

impl<L> Clone for Cache<L> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Cache {
            index: self.index.clone(),
            loader: Arc::clone(&self.loader),
        }
    }
}

impl<L> fmt::Debug for Cache<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache").field("index", &self.index).finish()
    }
}

impl<L: CacheLoader> Cache<L> {
    /// Creates an empty cache holding at most `capacity` records.
    pub fn new(loader: L, capacity: NonZeroUsize) -> Self {
        Self::with_index(loader, CacheIndex::new(capacity))
    }

    /// Creates a cache on top of an existing index.
    ///
    /// This allows the loader to keep a handle to the index, for example to
    /// [`replace`](CacheIndex::replace) records it loaded earlier.
    pub fn with_index(loader: L, index: CacheIndex) -> Self {
        Self {
            index,
            loader: Arc::new(loader),
        }
    }

    /// The index backing this cache.
    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    /// Returns the cached record for `key`, loading it on a miss.
    ///
    /// The load is deduplicated between concurrent requests: all of them wait for the same load and
    /// receive the same record or error. A successful load is stored in the cache, a failed one
    /// leaves no trace.
    ///
    /// # Errors
    ///
    /// Returns the error of the [`CacheLoader`]. If the load task was torn down before it finished
    /// (for instance because the runtime shut down), [`LoadError::InternalError`] is returned.
    pub async fn get_or_load(&self, key: ImageKey) -> LoadResult<Arc<ImageRecord>> {
        metric!(counter("caches.access") += 1);

        let (channel, pending) = {
            let mut state = self.index.state.lock();
            if let Some(slot) = state.slots.get(&key) {
                let record = Arc::clone(&slot.record);
                state.touch(&key);
                metric!(counter("caches.memory.hit") += 1);
                tracing::trace!(%key, "Serving image from cache");
                return Ok(record);
            }

            if let Some(load) = state.in_flight.get(&key) {
                // A concurrent cache lookup was deduplicated.
                metric!(counter("caches.channel.hit") += 1);
                (load.channel.clone(), None)
            } else {
                metric!(counter("caches.channel.miss") += 1);
                let id = state.next_seq();
                let (sender, receiver) = oneshot::channel();
                let channel = receiver.shared();
                let evicted = state.in_flight.insert(
                    key.clone(),
                    InFlight {
                        id,
                        channel: channel.clone(),
                    },
                );
                debug_assert!(evicted.is_none());
                (channel, Some((id, sender)))
            }
        };

        // The load is registered, spawn it outside of the lock.
        if let Some((id, sender)) = pending {
            self.spawn_load(key.clone(), id, sender);
        }

        let result = channel
            .await
            .unwrap_or_else(|_cancelled| Err(LoadError::InternalError));

        if result.is_ok() {
            self.index.touch(&key);
        }
        result
    }

    /// See [`CacheIndex::replace`].
    pub fn replace(&self, key: ImageKey, record: Arc<ImageRecord>) -> LoadResult<()> {
        self.index.replace(key, record)
    }

    /// Spawns the load for `key` as a separate task, which reports its result to `sender`.
    ///
    /// NOTE: The load is spawned eagerly and does not depend on anyone awaiting the channel.
    fn spawn_load(&self, key: ImageKey, id: u64, sender: LoadSender) {
        // Clears the in-flight marker in case the task is torn down before completion, so the
        // next request can start over.
        let remove_load_token = {
            let state = Arc::clone(&self.index.state);
            let key = key.clone();
            CallOnDrop::new(move || state.lock().finish_load(&key, id))
        };

        let state = Arc::clone(&self.index.state);
        let load = self.loader.load(key.clone());
        let task = async move {
            metric!(counter("caches.computation") += 1);
            tracing::debug!(%key, "Loading image");
            let result = load.await;

            remove_load_token.disarm();
            let result = {
                // Finishing the load and storing its result happen under one lock, so concurrent
                // callers either see the in-flight load or the stored record.
                let mut state = state.lock();
                state.finish_load(&key, id);
                result.and_then(|record| state.complete_load(key.clone(), record))
            };
            if let Err(err) = &result {
                tracing::debug!(%key, error = err as &dyn std::error::Error, "Failed to load image");
            }
            sender.send(result).ok();
        };
        tokio::spawn(task);
    }
}
