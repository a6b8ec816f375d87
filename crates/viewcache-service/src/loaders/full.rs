use image::{DynamicImage, ImageDecoder, ImageReader, RgbaImage};

use crate::caching::{Fidelity, ImageKey, ImageRecord, LoadResult, Rgb};

use super::LoadImage;

/// Decodes the complete image file at full resolution.
///
/// The format is detected from the file contents, and the EXIF orientation is applied, so the
/// record is upright.
#[derive(Clone, Debug, Default)]
pub struct FullImageLoader;

impl FullImageLoader {
    pub fn new() -> Self {
        Self
    }
}

impl LoadImage for FullImageLoader {
    fn load(&self, key: &ImageKey) -> LoadResult<ImageRecord> {
        let mut decoder = ImageReader::open(key.path())?
            .with_guessed_format()?
            .into_decoder()?;
        let orientation = decoder.orientation()?;
        let mut image = DynamicImage::from_decoder(decoder)?;
        image.apply_orientation(orientation);

        let pixels = image.into_rgba8();
        let average_color = sampled_average_color(&pixels);
        let actual_size = pixels.dimensions();

        tracing::trace!(%key, width = actual_size.0, height = actual_size.1, "Decoded image");

        Ok(ImageRecord::new(
            key.clone(),
            pixels,
            average_color,
            actual_size,
            Fidelity::Full,
        ))
    }

    fn name(&self) -> &'static str {
        "full"
    }
}

/// Approximates the average color from the corners and the edge midpoints of the image.
///
/// Images narrower than two pixels use their top left pixel.
fn sampled_average_color(pixels: &RgbaImage) -> Rgb {
    let (width, height) = pixels.dimensions();
    if width == 0 || height == 0 {
        return Rgb::BLACK;
    }
    if width < 2 {
        return Rgb::from(*pixels.get_pixel(0, 0));
    }

    let (right, bottom) = (width - 1, height - 1);
    let (center, middle) = (width / 2, height / 2);
    let samples = [
        (0, 0),
        (0, bottom),
        (right, 0),
        (right, bottom),
        (center, 0),
        (0, middle),
        (center, bottom),
        (right, middle),
    ];

    Rgb::average(
        samples
            .into_iter()
            .map(|(x, y)| Rgb::from(*pixels.get_pixel(x, y))),
    )
}
