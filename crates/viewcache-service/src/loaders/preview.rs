//! Extraction of embedded JPEG previews.
//!
//! Camera raw files and some container formats embed a JPEG preview near the start of the file.
//! The preview is found by scanning for the JPEG start of image marker and the following end of
//! image marker, without understanding the container.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use image::{DynamicImage, ImageFormat};

const START_OF_IMAGE: [u8; 3] = [0xFF, 0xD8, 0xFF];
const END_OF_IMAGE: [u8; 2] = [0xFF, 0xD9];

/// Only this many candidate start markers are considered.
const MAX_CANDIDATES: usize = 8;

/// Reads up to `limit` bytes from the start of the file at `path`.
pub fn read_head(path: &Path, limit: usize) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut data = Vec::with_capacity(limit.min(64 * 1024));
    file.take(limit as u64).read_to_end(&mut data)?;
    Ok(data)
}

/// Finds the first embedded JPEG stream of at least `min_size` bytes.
///
/// A stream at offset `0` is the file itself and is skipped, the quick path does not decode the
/// whole image.
pub fn find_embedded_jpeg(data: &[u8], min_size: usize) -> Option<&[u8]> {
    let starts = data
        .windows(START_OF_IMAGE.len())
        .enumerate()
        .skip(1)
        .filter(|(_, window)| *window == START_OF_IMAGE)
        .map(|(offset, _)| offset)
        .take(MAX_CANDIDATES);

    for start in starts {
        let Some(end_offset) = data[start..]
            .windows(END_OF_IMAGE.len())
            .position(|window| window == END_OF_IMAGE)
        else {
            continue;
        };
        let end = start + end_offset + END_OF_IMAGE.len();
        if end - start >= min_size {
            return Some(&data[start..end]);
        }
    }

    None
}

/// Decodes the embedded preview of the file at `path`, if it has one.
///
/// Returns `Ok(None)` if there is no preview, or if it cannot be decoded.
pub fn load_preview(
    path: &Path,
    scan_limit: usize,
    min_size: usize,
) -> io::Result<Option<DynamicImage>> {
    let data = read_head(path, scan_limit)?;
    let Some(jpeg) = find_embedded_jpeg(&data, min_size) else {
        return Ok(None);
    };

    match image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg) {
        Ok(image) => Ok(Some(image)),
        Err(err) => {
            tracing::debug!(
                path = %path.display(),
                error = &err as &dyn std::error::Error,
                "Embedded preview is not a valid JPEG"
            );
            Ok(None)
        }
    }
}
