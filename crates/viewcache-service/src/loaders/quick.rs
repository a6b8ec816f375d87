use std::path::PathBuf;

use image::{DynamicImage, ImageReader, RgbaImage};
use sha2::{Digest, Sha256};

use crate::caching::{Fidelity, ImageKey, ImageRecord, LoadError, LoadResult, Rgb};
use crate::config::ThumbnailConfig;

use super::preview;
use super::LoadImage;

/// Produces a quick, low resolution stand-in for an image without decoding the file itself.
///
/// The thumbnail is taken from the first source that has one:
///
/// 1. A sidecar PNG in the configured thumbnail directory, see [`thumbnail_path`](Self::thumbnail_path).
/// 2. A JPEG preview embedded near the start of the file.
///
/// The actual size of the image is read from the file header.
#[derive(Clone, Debug)]
pub struct QuickImageLoader {
    config: ThumbnailConfig,
}

impl QuickImageLoader {
    pub fn new(config: ThumbnailConfig) -> Self {
        Self { config }
    }

    /// The path of the sidecar thumbnail for `key`, if a thumbnail directory is configured.
    ///
    /// Sidecars are named after the hex encoded SHA-256 digest of the key.
    pub fn thumbnail_path(&self, key: &ImageKey) -> Option<PathBuf> {
        let dir = self.config.cache_dir.as_ref()?;
        let digest = Sha256::digest(key.to_string().as_bytes());
        Some(dir.join(format!("{}.png", hex::encode(digest))))
    }

    fn load_sidecar(&self, key: &ImageKey) -> LoadResult<Option<DynamicImage>> {
        let Some(path) = self.thumbnail_path(key) else {
            return Ok(None);
        };
        let reader = match ImageReader::open(&path) {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match reader.with_guessed_format()?.decode() {
            Ok(image) => Ok(Some(image)),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = &err as &dyn std::error::Error,
                    "Ignoring broken thumbnail"
                );
                Ok(None)
            }
        }
    }

    fn shrink(&self, image: DynamicImage) -> DynamicImage {
        let max = self.config.max_size;
        if image.width() > max || image.height() > max {
            image.thumbnail(max, max)
        } else {
            image
        }
    }
}

impl LoadImage for QuickImageLoader {
    fn load(&self, key: &ImageKey) -> LoadResult<ImageRecord> {
        // Opening the file first makes a missing file a `NotFound`, regardless of thumbnails.
        let header_size = match ImageReader::open(key.path())?
            .with_guessed_format()?
            .into_dimensions()
        {
            Ok(size) => Some(size),
            Err(err) => match LoadError::from(err) {
                LoadError::DecodeFailure(_) => None,
                other => return Err(other),
            },
        };

        let thumbnail = match self.load_sidecar(key)? {
            Some(image) => image,
            None => preview::load_preview(
                key.path(),
                self.config.preview_scan_limit,
                self.config.min_preview_size,
            )?
            .ok_or(LoadError::ThumbnailUnavailable)?,
        };

        // Without a readable header, the thumbnail is the best guess for the size.
        let actual_size = header_size.unwrap_or((thumbnail.width(), thumbnail.height()));
        let pixels = self.shrink(thumbnail).into_rgba8();
        let average_color = corner_average_color(&pixels);

        Ok(ImageRecord::new(
            key.clone(),
            pixels,
            average_color,
            actual_size,
            Fidelity::Quick,
        ))
    }

    fn name(&self) -> &'static str {
        "quick"
    }
}

/// The mean of the four corner pixels.
fn corner_average_color(pixels: &RgbaImage) -> Rgb {
    let (width, height) = pixels.dimensions();
    if width == 0 || height == 0 {
        return Rgb::BLACK;
    }
    let (right, bottom) = (width - 1, height - 1);
    Rgb::average(
        [(0, 0), (right, 0), (0, bottom), (right, bottom)]
            .into_iter()
            .map(|(x, y)| Rgb::from(*pixels.get_pixel(x, y))),
    )
}
