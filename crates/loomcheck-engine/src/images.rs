use std::path::{Path, PathBuf};
use std::thread;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DEFAULT_MAX_DIMENSION: u32 = 1024;
pub const DEFAULT_JPEG_QUALITY: u8 = 80;
pub const NORMALIZED_MIME: &str = "image/jpeg";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("failed reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed data URI: {0}")]
    DataUri(String),
    #[error("input is not a decodable image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("JPEG encoding failed: {0}")]
    Encode(#[source] image::ImageError),
}

/// An inspection or reference image as the caller supplied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Bytes(Vec<u8>),
    DataUri(String),
    Path(PathBuf),
}

impl ImageSource {
    pub fn label(&self) -> String {
        match self {
            Self::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
            Self::DataUri(_) => "<data uri>".to_string(),
            Self::Path(path) => path.display().to_string(),
        }
    }

    fn load(&self) -> Result<Vec<u8>, NormalizeError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::DataUri(uri) => decode_data_uri(uri),
            Self::Path(path) => std::fs::read(path).map_err(|source| NormalizeError::Read {
                path: path.clone(),
                source,
            }),
        }
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_dimension: u32,
    pub jpeg_quality: u8,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    pub mime_type: String,
    pub base64_data: String,
    pub width: u32,
    pub height: u32,
    /// SHA-256 of the source bytes, before re-encoding.
    pub sha256: String,
}

/// Decode, bound to `max_dimension` on the longest side (never upscaling),
/// flatten transparency onto white and re-encode as JPEG.
pub fn normalize_image(
    source: &ImageSource,
    limits: ImageLimits,
) -> Result<NormalizedImage, NormalizeError> {
    let bytes = source.load()?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let decoded = image::load_from_memory(&bytes).map_err(NormalizeError::Decode)?;

    let flattened = flatten_onto_white(&decoded);
    let (width, height) = flattened.dimensions();
    let bound = limits.max_dimension.max(1);
    let resized = if width > bound || height > bound {
        DynamicImage::ImageRgb8(flattened)
            .resize(bound, bound, FilterType::Triangle)
            .to_rgb8()
    } else {
        flattened
    };

    let mut encoded = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut encoded, limits.jpeg_quality.clamp(1, 100));
    encoder
        .encode_image(&resized)
        .map_err(NormalizeError::Encode)?;

    Ok(NormalizedImage {
        mime_type: NORMALIZED_MIME.to_string(),
        base64_data: BASE64.encode(encoded),
        width: resized.width(),
        height: resized.height(),
        sha256,
    })
}

/// Normalize every source on its own thread, preserving input order. The
/// first failure (by input position) is returned with its index.
pub fn normalize_all(
    sources: &[ImageSource],
    limits: ImageLimits,
) -> Result<Vec<NormalizedImage>, (usize, NormalizeError)> {
    let results: Vec<Result<NormalizedImage, NormalizeError>> = thread::scope(|scope| {
        let handles: Vec<_> = sources
            .iter()
            .map(|source| scope.spawn(move || normalize_image(source, limits)))
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    });

    results
        .into_iter()
        .enumerate()
        .map(|(index, result)| result.map_err(|err| (index, err)))
        .collect()
}

pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>, NormalizeError> {
    let trimmed = uri.trim();
    let Some(rest) = trimmed.strip_prefix("data:") else {
        return Err(NormalizeError::DataUri("missing 'data:' prefix".to_string()));
    };
    let Some((header, payload)) = rest.split_once(',') else {
        return Err(NormalizeError::DataUri("missing ',' separator".to_string()));
    };
    if !header.split(';').any(|part| part.eq_ignore_ascii_case("base64")) {
        return Err(NormalizeError::DataUri(
            "only base64 data URIs are supported".to_string(),
        ));
    }
    let compact: String = payload.chars().filter(|ch| !ch.is_whitespace()).collect();
    BASE64
        .decode(compact.as_bytes())
        .map_err(|err| NormalizeError::DataUri(format!("invalid base64 payload: {err}")))
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend =
            |channel: u8| -> u8 { (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8 };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}
