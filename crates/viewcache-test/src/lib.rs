//! Helpers for testing the image caches and loaders.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Fixture files written into it are deleted together with the
//!    directory once the handle is dropped, and loads racing against that will fail with
//!    `NotFound`.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use parking_lot::Mutex;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use viewcache_service::caching::{Fidelity, ImageKey, ImageRecord, LoadError, LoadResult};
use viewcache_service::loaders::LoadImage;
use viewcache_service::receiver::ReceiveImage;

pub use tempfile::TempDir;

/// Header bytes of the fake raw files written by [`write_raw_with_preview`].
const RAW_MAGIC: &[u8] = b"VCRAW\x00\x01\x00";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the viewcache crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("viewcache_service=trace,viewcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes a PNG of the given size, filled with a single color.
pub fn write_png(dir: &Path, name: &str, (width, height): (u32, u32), color: [u8; 3]) -> PathBuf {
    let [r, g, b] = color;
    let image = RgbaImage::from_pixel(width, height, Rgba([r, g, b, 255]));
    let path = dir.join(name);
    image.save_with_format(&path, ImageFormat::Png).unwrap();
    path
}

/// Encodes a JPEG of the given size, filled with a single color.
pub fn encode_jpeg((width, height): (u32, u32), color: [u8; 3]) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Jpeg).unwrap();
    buf.into_inner()
}

/// Writes a file in a made up raw format that embeds a JPEG preview after a short header.
///
/// The image crate does not know the format, so only the preview can be decoded.
pub fn write_raw_with_preview(
    dir: &Path,
    name: &str,
    preview_size: (u32, u32),
    color: [u8; 3],
) -> PathBuf {
    let mut data = RAW_MAGIC.to_vec();
    data.extend(encode_jpeg(preview_size, color));
    data.extend(std::iter::repeat_n(0x5a, 1024));

    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// Creates a record with a 1x1 black image.
pub fn record(key: impl Into<ImageKey>, fidelity: Fidelity) -> ImageRecord {
    ImageRecord::new(
        key.into(),
        RgbaImage::new(1, 1),
        viewcache_service::caching::Rgb::BLACK,
        (1, 1),
        fidelity,
    )
}

/// Asserts that two colors differ by at most `tolerance` in every channel.
///
/// JPEG encoding does not preserve colors exactly.
#[track_caller]
pub fn assert_color_near(actual: [u8; 3], expected: [u8; 3], tolerance: u8) {
    for (a, e) in actual.into_iter().zip(expected) {
        assert!(
            a.abs_diff(e) <= tolerance,
            "color {actual:?} is not within {tolerance} of {expected:?}"
        );
    }
}

/// A blocking loader that takes a fixed time and counts its invocations.
#[derive(Clone, Debug)]
pub struct DelayedLoader {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    result: Result<Fidelity, LoadError>,
}

impl DelayedLoader {
    /// A loader producing 1x1 records of the given fidelity after `millis` milliseconds.
    pub fn new(millis: u64, fidelity: Fidelity) -> Self {
        Self {
            calls: Default::default(),
            delay: Duration::from_millis(millis),
            result: Ok(fidelity),
        }
    }

    /// A loader failing with `error` after `millis` milliseconds.
    pub fn failing(millis: u64, error: LoadError) -> Self {
        Self {
            calls: Default::default(),
            delay: Duration::from_millis(millis),
            result: Err(error),
        }
    }

    /// How often the loader was called.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LoadImage for DelayedLoader {
    fn load(&self, key: &ImageKey) -> LoadResult<ImageRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let fidelity = self.result.clone()?;
        Ok(record(key.clone(), fidelity))
    }

    fn name(&self) -> &'static str {
        "delayed"
    }
}

/// A receiver that collects everything it receives.
#[derive(Clone, Debug, Default)]
pub struct Collector {
    records: Arc<Mutex<Vec<Arc<ImageRecord>>>>,
}

impl Collector {
    /// The keys and fidelities of all records received so far, as `(path, fidelity)` pairs.
    pub fn summary(&self) -> Vec<(String, Fidelity)> {
        self.records
            .lock()
            .iter()
            .map(|record| (record.key().to_string(), record.fidelity()))
            .collect()
    }
}

impl ReceiveImage for Collector {
    fn receive(&self, record: Arc<ImageRecord>) {
        self.records.lock().push(record);
    }
}
