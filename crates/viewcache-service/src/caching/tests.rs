use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::sleep;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use image::RgbaImage;
use parking_lot::Mutex;

use crate::loaders::LoadImage;
use crate::receiver::ReceiveImage;

use super::*;

fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter("viewcache_service=trace")
        .with_test_writer()
        .try_init()
        .ok();
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

fn record(key: &ImageKey, fidelity: Fidelity) -> ImageRecord {
    ImageRecord::new(
        key.clone(),
        RgbaImage::new(1, 1),
        Rgb::BLACK,
        (1, 1),
        fidelity,
    )
}

/// An async [`CacheLoader`] that counts its invocations.
#[derive(Clone, Default)]
struct CountingLoader {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    error: Arc<Mutex<Option<LoadError>>>,
}

impl CountingLoader {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail_with(&self, error: Option<LoadError>) {
        *self.error.lock() = error;
    }
}

impl CacheLoader for CountingLoader {
    fn load(&self, key: ImageKey) -> BoxFuture<'static, LoadResult<Arc<ImageRecord>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        let error = self.error.lock().clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            match error {
                Some(error) => Err(error),
                None => Ok(Arc::new(record(&key, Fidelity::Full))),
            }
        })
    }
}

/// A blocking [`LoadImage`] that takes a fixed time.
#[derive(Clone)]
struct DelayedLoader {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    /// Delays for the upcoming calls, in reverse order. Once empty, `delay` applies.
    script: Arc<Mutex<Vec<u64>>>,
    result: Result<Fidelity, LoadError>,
}

impl DelayedLoader {
    fn new(millis: u64, fidelity: Fidelity) -> Self {
        Self {
            calls: Default::default(),
            delay: Duration::from_millis(millis),
            script: Default::default(),
            result: Ok(fidelity),
        }
    }

    fn failing(millis: u64, error: LoadError) -> Self {
        Self {
            result: Err(error),
            ..Self::new(millis, Fidelity::Full)
        }
    }

    /// Uses the given delays for the next calls, one per call.
    fn scripted(millis: &[u64], fidelity: Fidelity) -> Self {
        let loader = Self::new(0, fidelity);
        loader.script.lock().extend(millis.iter().rev());
        loader
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LoadImage for DelayedLoader {
    fn load(&self, key: &ImageKey) -> LoadResult<ImageRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.lock().pop().map(Duration::from_millis);
        sleep(delay.unwrap_or(self.delay));
        let fidelity = self.result.clone()?;
        Ok(record(key, fidelity))
    }
}

/// Collects everything it receives.
#[derive(Clone, Default)]
struct Received(Arc<Mutex<Vec<Arc<ImageRecord>>>>);

impl Received {
    fn summary(&self) -> Vec<(String, Fidelity)> {
        self.0
            .lock()
            .iter()
            .map(|record| (record.key().to_string(), record.fidelity()))
            .collect()
    }
}

impl ReceiveImage for Received {
    fn receive(&self, record: Arc<ImageRecord>) {
        self.0.lock().push(record);
    }
}

async fn wait(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[tokio::test]
async fn test_loads_an_image() {
    setup();

    let loader = CountingLoader::default();
    let cache = Cache::new(loader.clone(), capacity(1));

    let record = cache.get_or_load("test.png".into()).await.unwrap();
    assert_eq!(record.key(), &ImageKey::new("test.png"));
    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn test_loads_the_same_image_only_once() {
    setup();

    let loader = CountingLoader::default();
    let cache = Cache::new(loader.clone(), capacity(1));

    let first = cache.get_or_load("test.png".into()).await.unwrap();
    let second = cache.get_or_load("./test.png".into()).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn test_drops_old_images() {
    setup();

    let loader = CountingLoader::default();
    let cache = Cache::new(loader.clone(), capacity(1));

    for key in ["test1.png", "test1.png", "test2.png", "test1.png"] {
        cache.get_or_load(key.into()).await.unwrap();
    }

    assert_eq!(loader.calls(), 3);
    assert_eq!(cache.index().keys(), vec![ImageKey::new("test1.png")]);
}

#[tokio::test]
async fn test_keeps_most_used_image() {
    setup();

    let loader = CountingLoader::default();
    let cache = Cache::new(loader.clone(), capacity(2));
    let index = cache.index();

    let keys = ["A", "A", "B", "A", "C", "A", "B"];
    for key in keys {
        cache.get_or_load(key.into()).await.unwrap();
    }

    assert_eq!(loader.calls(), 4);
    assert!(index.contains(&"A".into()));
    assert!(index.contains(&"B".into()));
    assert!(!index.contains(&"C".into()));
    assert_eq!(index.score(&"A".into()), Some(1));
    assert_eq!(index.score(&"B".into()), Some(1));
}

#[tokio::test]
async fn test_eviction_tie_evicts_oldest() {
    setup();

    let loader = CountingLoader::default();
    let cache = Cache::new(loader.clone(), capacity(2));
    let index = cache.index();

    // A: 1, then B: 1 and A: 0, then A: 1 and B: 0, then B: 1 and A: 0
    for key in ["A", "B", "A", "B"] {
        cache.get_or_load(key.into()).await.unwrap();
    }
    assert_eq!(index.score(&"A".into()), Some(0));
    assert_eq!(index.score(&"B".into()), Some(1));

    cache.get_or_load("C".into()).await.unwrap();
    assert!(!index.contains(&"A".into()));
    assert_eq!(loader.calls(), 3);

    // Replacements enter with a score of 0 and are tied, the older one goes first.
    index.clear();
    for key in ["X", "Y"] {
        index
            .replace(key.into(), Arc::new(record(&key.into(), Fidelity::Quick)))
            .unwrap();
    }
    cache.get_or_load("Z".into()).await.unwrap();
    assert!(!index.contains(&"X".into()));
    assert!(index.contains(&"Y".into()));
    assert_eq!(loader.calls(), 4);
}

#[tokio::test]
async fn test_coalesces_concurrent_loads() {
    setup();

    let loader = CountingLoader::with_delay(Duration::from_millis(50));
    let cache = Cache::new(loader.clone(), capacity(2));

    let requests = (0..8).map(|_| cache.get_or_load("test.png".into()));
    let records = future::join_all(requests).await;

    assert_eq!(loader.calls(), 1);
    let first = records[0].as_ref().unwrap();
    for record in &records {
        assert!(Arc::ptr_eq(first, record.as_ref().unwrap()));
    }
    // every waiter counts as an access
    assert_eq!(cache.index().score(&"test.png".into()), Some(8));
}

#[tokio::test]
async fn test_coalesces_errors() {
    setup();

    let loader = CountingLoader::with_delay(Duration::from_millis(50));
    loader.fail_with(Some(LoadError::DecodeFailure("bad magic".into())));
    let cache = Cache::new(loader.clone(), capacity(2));

    let requests = (0..4).map(|_| cache.get_or_load("test.png".into()));
    let results = future::join_all(requests).await;

    assert_eq!(loader.calls(), 1);
    for result in results {
        assert_eq!(result.unwrap_err(), LoadError::DecodeFailure("bad magic".into()));
    }
    assert!(cache.index().is_empty());
}

#[tokio::test]
async fn test_failure_is_not_cached() {
    setup();

    let loader = CountingLoader::default();
    let cache = Cache::new(loader.clone(), capacity(2));

    loader.fail_with(Some(LoadError::NotFound));
    let result = cache.get_or_load("test.png".into()).await;
    assert_eq!(result.unwrap_err(), LoadError::NotFound);
    assert!(!cache.index().contains(&"test.png".into()));

    loader.fail_with(None);
    let record = cache.get_or_load("test.png".into()).await.unwrap();
    assert!(record.is_full_resolution());
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_replace_releases_previous_record() {
    setup();

    let loader = CountingLoader::default();
    let cache = Cache::new(loader.clone(), capacity(2));
    let key = ImageKey::new("test.png");

    let previous: Weak<ImageRecord> = {
        let record = cache.get_or_load(key.clone()).await.unwrap();
        Arc::downgrade(&record)
    };
    assert!(previous.upgrade().is_some());

    let replacement = Arc::new(record(&key, Fidelity::Quick));
    cache.replace(key.clone(), Arc::clone(&replacement)).unwrap();
    assert!(previous.upgrade().is_none());

    let record = cache.get_or_load(key).await.unwrap();
    assert!(Arc::ptr_eq(&record, &replacement));
    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn test_replace_does_not_count_as_access() {
    setup();

    let loader = CountingLoader::default();
    let cache = Cache::new(loader.clone(), capacity(2));
    let index = cache.index();

    cache.get_or_load("A".into()).await.unwrap();
    index
        .replace("A".into(), Arc::new(record(&"A".into(), Fidelity::Full)))
        .unwrap();
    assert_eq!(index.score(&"A".into()), Some(1));

    // absent keys are inserted, evicting if needed
    index
        .replace("B".into(), Arc::new(record(&"B".into(), Fidelity::Full)))
        .unwrap();
    index
        .replace("C".into(), Arc::new(record(&"C".into(), Fidelity::Full)))
        .unwrap();
    assert_eq!(index.len(), 2);
    assert!(index.contains(&"A".into()));
    assert_eq!(index.score(&"C".into()), Some(0));
    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn test_replace_while_loading_wins() {
    setup();

    let loader = CountingLoader::with_delay(Duration::from_millis(100));
    let cache = Cache::new(loader.clone(), capacity(2));
    let key = ImageKey::new("test.png");

    let load = tokio::spawn({
        let cache = cache.clone();
        let key = key.clone();
        async move { cache.get_or_load(key).await }
    });
    wait(20).await;

    let replacement = Arc::new(record(&key, Fidelity::Quick));
    cache.replace(key.clone(), Arc::clone(&replacement)).unwrap();

    let record = load.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&record, &replacement));
    assert!(Arc::ptr_eq(&cache.index().peek(&key).unwrap(), &replacement));
    assert_eq!(cache.index().len(), 1);
}

#[tokio::test]
async fn test_len_never_exceeds_capacity() {
    setup();

    let loader = CountingLoader::default();
    let cache = Cache::new(loader.clone(), capacity(3));
    let index = cache.index();

    let keys = ["a", "b", "a", "c", "d", "a", "e", "f", "b", "b", "g", "a"];
    for (i, key) in keys.into_iter().enumerate() {
        if i % 4 == 3 {
            let replacement = Arc::new(record(&key.into(), Fidelity::Quick));
            index.replace(key.into(), replacement).unwrap();
        } else {
            cache.get_or_load(key.into()).await.unwrap();
        }
        assert!(index.len() <= 3);
    }

    index.clear();
    assert!(index.is_empty());
    assert_eq!(index.capacity().get(), 3);
}

#[tokio::test]
async fn test_evicted_record_outlives_cache_while_held() {
    setup();

    let loader = CountingLoader::default();
    let cache = Cache::new(loader.clone(), capacity(1));

    let held = cache.get_or_load("A".into()).await.unwrap();
    let weak = Arc::downgrade(&held);
    cache.get_or_load("B".into()).await.unwrap();

    assert!(!cache.index().contains(&"A".into()));
    assert_eq!(held.key(), &ImageKey::new("A"));
    drop(held);
    assert!(weak.upgrade().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_race_receives_twice_with_slow_loader() {
    setup();

    let slow = DelayedLoader::new(100, Fidelity::Full);
    let fast = DelayedLoader::new(50, Fidelity::Quick);
    let received = Received::default();
    let loader = RaceLoader::new(slow.clone(), fast.clone(), received.clone(), capacity(1));

    let record = loader.get_or_load("test.png".into()).await.unwrap();
    assert_eq!(record.fidelity(), Fidelity::Quick);

    wait(200).await;

    assert_eq!(slow.calls(), 1);
    assert_eq!(fast.calls(), 1);
    assert_eq!(
        received.summary(),
        vec![
            ("test.png".to_owned(), Fidelity::Quick),
            ("test.png".to_owned(), Fidelity::Full),
        ]
    );

    let cached = loader.cache().peek(&"test.png".into()).unwrap();
    assert!(cached.is_full_resolution());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_race_receives_once_with_fast_loader() {
    setup();

    let slow = DelayedLoader::new(20, Fidelity::Full);
    let fast = DelayedLoader::new(300, Fidelity::Quick);
    let received = Received::default();
    let loader = RaceLoader::new(slow.clone(), fast.clone(), received.clone(), capacity(1));

    let record = loader.load("test.png".into()).await.unwrap();
    assert!(record.is_full_resolution());

    wait(400).await;

    assert_eq!(fast.calls(), 1);
    assert_eq!(
        received.summary(),
        vec![("test.png".to_owned(), Fidelity::Full)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_race_loser_is_not_cached() {
    setup();

    let slow = DelayedLoader::new(20, Fidelity::Full);
    let fast = DelayedLoader::new(100, Fidelity::Quick);
    let received = Received::default();
    let loader = RaceLoader::new(slow, fast.clone(), received.clone(), capacity(2));

    let record = loader.get_or_load("test.png".into()).await.unwrap();
    assert!(record.is_full_resolution());

    // let the quick load finish as well
    wait(200).await;

    assert_eq!(fast.calls(), 1);
    assert_eq!(loader.cache().len(), 1);
    let cached = loader.cache().peek(&"test.png".into()).unwrap();
    assert!(Arc::ptr_eq(&cached, &record));
    assert_eq!(
        received.summary(),
        vec![("test.png".to_owned(), Fidelity::Full)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_race_coalesces_concurrent_requests() {
    setup();

    let slow = DelayedLoader::new(100, Fidelity::Full);
    let fast = DelayedLoader::new(20, Fidelity::Quick);
    let received = Received::default();
    let loader = RaceLoader::new(slow.clone(), fast.clone(), received.clone(), capacity(1));

    let key = ImageKey::new("test.png");
    let requests = (0..8).map(|_| loader.get_or_load(key.clone()));
    let records = future::join_all(requests).await;

    let first = records[0].as_ref().unwrap();
    for record in &records {
        assert!(Arc::ptr_eq(first, record.as_ref().unwrap()));
    }

    wait(200).await;

    assert_eq!(slow.calls(), 1);
    assert_eq!(fast.calls(), 1);
    assert_eq!(
        received.summary(),
        vec![
            ("test.png".to_owned(), Fidelity::Quick),
            ("test.png".to_owned(), Fidelity::Full),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_race_never_downgrades_after_eviction() {
    setup();

    // Calls happen in the order A, B, C, A. The first upgrade of A outlives its eviction and
    // lands before the second quick load of A.
    let slow = DelayedLoader::scripted(&[200, 1000, 1000, 400], Fidelity::Full);
    let fast = DelayedLoader::scripted(&[20, 20, 20, 300], Fidelity::Quick);
    let received = Received::default();
    let loader = RaceLoader::new(slow, fast, received.clone(), capacity(2));

    for name in ["A", "B", "C"] {
        let record = loader.get_or_load(name.into()).await.unwrap();
        assert_eq!(record.fidelity(), Fidelity::Quick);
    }
    assert!(!loader.cache().contains(&"A".into()));

    let again = loader.get_or_load("A".into()).await.unwrap();
    assert!(again.is_full_resolution());

    // the second upgrade of A
    wait(200).await;

    assert_eq!(
        received.summary(),
        vec![
            ("A".to_owned(), Fidelity::Quick),
            ("B".to_owned(), Fidelity::Quick),
            ("C".to_owned(), Fidelity::Quick),
            ("A".to_owned(), Fidelity::Full),
            ("A".to_owned(), Fidelity::Full),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_race_suppresses_superseded_requests() {
    setup();

    let slow = DelayedLoader::new(150, Fidelity::Full);
    let fast = DelayedLoader::new(30, Fidelity::Quick);
    let received = Received::default();
    let loader = RaceLoader::new(slow, fast, received.clone(), capacity(2));

    let first = loader.get_or_load("first.png".into()).await.unwrap();
    assert_eq!(first.fidelity(), Fidelity::Quick);
    loader.get_or_load("second.png".into()).await.unwrap();
    assert_eq!(loader.last_requested(), Some("second.png".into()));

    wait(300).await;

    let summary = received.summary();
    assert_eq!(summary[0], ("first.png".to_owned(), Fidelity::Quick));
    assert!(!summary.contains(&("first.png".to_owned(), Fidelity::Full)));
    assert!(summary.contains(&("second.png".to_owned(), Fidelity::Full)));
    assert_eq!(summary.len(), 3);

    // the superseded load still finished and upgraded the cache
    let cached = loader.cache().peek(&"first.png".into()).unwrap();
    assert!(cached.is_full_resolution());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_race_background_failure_keeps_quick_record() {
    setup();

    let slow = DelayedLoader::failing(100, LoadError::DecodeFailure("truncated".into()));
    let fast = DelayedLoader::new(20, Fidelity::Quick);
    let received = Received::default();
    let loader = RaceLoader::new(slow.clone(), fast, received.clone(), capacity(1));

    let record = loader.get_or_load("test.png".into()).await.unwrap();
    assert_eq!(record.fidelity(), Fidelity::Quick);

    wait(200).await;

    assert_eq!(
        received.summary(),
        vec![("test.png".to_owned(), Fidelity::Quick)]
    );
    let cached = loader.get_or_load("test.png".into()).await.unwrap();
    assert!(Arc::ptr_eq(&record, &cached));
    assert_eq!(slow.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_race_falls_back_to_slow_loader() {
    setup();

    let slow = DelayedLoader::new(50, Fidelity::Full);
    let fast = DelayedLoader::failing(0, LoadError::ThumbnailUnavailable);
    let received = Received::default();
    let loader = RaceLoader::new(slow, fast.clone(), received.clone(), capacity(1));

    let record = loader.get_or_load("test.png".into()).await.unwrap();
    assert!(record.is_full_resolution());
    assert_eq!(fast.calls(), 1);
    assert_eq!(
        received.summary(),
        vec![("test.png".to_owned(), Fidelity::Full)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_race_propagates_slow_failure() {
    setup();

    let slow = DelayedLoader::failing(10, LoadError::NotFound);
    let fast = DelayedLoader::new(100, Fidelity::Quick);
    let received = Received::default();
    let loader = RaceLoader::new(slow, fast.clone(), received.clone(), capacity(1));

    let result = loader.get_or_load("test.png".into()).await;
    assert_eq!(result.unwrap_err(), LoadError::NotFound);

    wait(200).await;

    assert_eq!(fast.calls(), 1);
    assert!(received.summary().is_empty());
    assert!(loader.cache().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_race_cache_hit_does_not_notify() {
    setup();

    let slow = DelayedLoader::new(10, Fidelity::Full);
    let fast = DelayedLoader::new(100, Fidelity::Quick);
    let received = Received::default();
    let loader = RaceLoader::new(slow.clone(), fast, received.clone(), capacity(1));

    loader.get_or_load("test.png".into()).await.unwrap();
    loader.get_or_load("test.png".into()).await.unwrap();

    assert_eq!(slow.calls(), 1);
    assert_eq!(received.summary().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prefetch_does_not_notify() {
    setup();

    let slow = DelayedLoader::new(10, Fidelity::Full);
    let fast = DelayedLoader::new(100, Fidelity::Quick);
    let received = Received::default();
    let loader = RaceLoader::new(slow.clone(), fast, received.clone(), capacity(2));

    loader.get_or_load("current.png".into()).await.unwrap();
    loader.prefetch("next.png".into()).await.unwrap();

    assert_eq!(loader.last_requested(), Some("current.png".into()));
    assert_eq!(
        received.summary(),
        vec![("current.png".to_owned(), Fidelity::Full)]
    );

    // served from the cache once it is requested
    loader.get_or_load("next.png".into()).await.unwrap();
    assert_eq!(slow.calls(), 2);
}

#[test]
fn test_blocking_bridge() {
    setup();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let slow = DelayedLoader::new(10, Fidelity::Full);
    let fast = DelayedLoader::new(100, Fidelity::Quick);
    let received = Received::default();
    let loader = RaceLoader::with_runtime(
        slow.clone(),
        fast,
        received.clone(),
        capacity(1),
        runtime.handle().clone(),
    );

    let record = loader.get_or_load_blocking("test.png".into()).unwrap();
    assert!(record.is_full_resolution());
    let again = loader.get_or_load_blocking("test.png".into()).unwrap();
    assert!(Arc::ptr_eq(&record, &again));

    let direct = loader.load_blocking("test.png".into()).unwrap();
    assert!(!Arc::ptr_eq(&record, &direct));
    assert_eq!(slow.calls(), 2);
    assert_eq!(received.summary().len(), 2);
}
