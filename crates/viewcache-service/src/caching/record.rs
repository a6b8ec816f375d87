use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use image::RgbaImage;

/// The key of an image in the cache.
///
/// This is the lexically normalized path of the image file: `.` components are dropped and `..`
/// components are resolved against their parent. The filesystem is not consulted, so symlinks are
/// not resolved.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageKey {
    path: Arc<Path>,
}

impl ImageKey {
    /// Creates a key for the given path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut normalized = PathBuf::new();
        for component in path.as_ref().components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => match normalized.components().next_back() {
                    Some(Component::Normal(_)) => {
                        normalized.pop();
                    }
                    // `/..` is `/`
                    Some(Component::RootDir | Component::Prefix(_)) => {}
                    _ => normalized.push(".."),
                },
                other => normalized.push(other.as_os_str()),
            }
        }
        Self {
            path: normalized.into(),
        }
    }

    /// The normalized path of the image file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageKey({:?})", self.path)
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl From<&str> for ImageKey {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for ImageKey {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

impl From<&Path> for ImageKey {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for ImageKey {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

/// An opaque RGB color.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub const BLACK: Rgb = Rgb([0, 0, 0]);

    /// The channel-wise mean of the given colors, truncated.
    ///
    /// Returns [`Rgb::BLACK`] for an empty iterator.
    pub fn average(colors: impl IntoIterator<Item = Rgb>) -> Rgb {
        let mut sum = [0u64; 3];
        let mut count = 0u64;
        for Rgb(color) in colors {
            for (acc, channel) in sum.iter_mut().zip(color) {
                *acc += u64::from(channel);
            }
            count += 1;
        }
        if count == 0 {
            return Rgb::BLACK;
        }
        Rgb(sum.map(|acc| (acc / count) as u8))
    }
}

impl From<image::Rgba<u8>> for Rgb {
    fn from(pixel: image::Rgba<u8>) -> Self {
        let [r, g, b, _] = pixel.0;
        Rgb([r, g, b])
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b] = self.0;
        write!(f, "#{r:02x}{g:02x}{b:02x}")
    }
}

/// Whether a record holds the full image or a quick stand-in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fidelity {
    /// Decoded from the original file at full resolution.
    Full,
    /// A thumbnail or preview, to be replaced by the full image.
    Quick,
}

impl Fidelity {
    pub fn is_full(self) -> bool {
        matches!(self, Self::Full)
    }
}

impl AsRef<str> for Fidelity {
    fn as_ref(&self) -> &str {
        match self {
            Self::Full => "full",
            Self::Quick => "quick",
        }
    }
}

impl fmt::Display for Fidelity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// The decoded pixels of a record.
///
/// This exclusively owns the pixel buffer, which is released when the value is dropped.
pub struct DecodedImage {
    pixels: RgbaImage,
}

impl DecodedImage {
    pub fn new(pixels: RgbaImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Size of the pixel buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.pixels.as_raw().len()
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

impl Drop for DecodedImage {
    fn drop(&mut self) {
        metric!(counter("images.released") += 1);
        metric!(time_raw("images.released.size") = self.byte_len() as u64);
    }
}

/// A decoded image together with the metadata the viewer needs to display it.
///
/// Records are created by a loader and shared as `Arc<ImageRecord>`. The cache holds one handle
/// per resident key, and the pixels are released once the cache and every caller have dropped
/// their handles.
#[derive(Debug)]
pub struct ImageRecord {
    key: ImageKey,
    image: DecodedImage,
    average_color: Rgb,
    actual_width: u32,
    actual_height: u32,
    fidelity: Fidelity,
}

impl ImageRecord {
    /// Creates a new record.
    ///
    /// `actual_size` is the size of the source image, which for quick records usually differs from
    /// the size of the decoded `image`.
    pub fn new(
        key: ImageKey,
        image: RgbaImage,
        average_color: Rgb,
        actual_size: (u32, u32),
        fidelity: Fidelity,
    ) -> Self {
        let (actual_width, actual_height) = actual_size;
        Self {
            key,
            image: DecodedImage::new(image),
            average_color,
            actual_width,
            actual_height,
            fidelity,
        }
    }

    pub fn key(&self) -> &ImageKey {
        &self.key
    }

    pub fn image(&self) -> &DecodedImage {
        &self.image
    }

    pub fn average_color(&self) -> Rgb {
        self.average_color
    }

    pub fn actual_width(&self) -> u32 {
        self.actual_width
    }

    pub fn actual_height(&self) -> u32 {
        self.actual_height
    }

    pub fn fidelity(&self) -> Fidelity {
        self.fidelity
    }

    pub fn is_full_resolution(&self) -> bool {
        self.fidelity.is_full()
    }
}
