//! Size-tiered quality reduction for uploaded photos.
//!
//! Larger files are re-encoded at lower quality; small files and GIFs pass
//! through untouched. Decoding is bounded by a pixel ceiling and oversized
//! images are scaled down to fit a square before re-encoding.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageError, ImageFormat, ImageReader};
use std::io::Cursor;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors that can occur while re-encoding a photo
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error(
        "Input image exceeds pixel limit ({pixels} > {limit} pixels). \
         Try to resize the image or reduce its quality before upload"
    )]
    PixelLimit { pixels: u64, limit: u64 },

    #[error("Failed to decode image: {0}")]
    Decode(#[source] ImageError),

    #[error("Failed to encode image: {0}")]
    Encode(#[source] ImageError),

    #[error("Transcoding task failed: {0}")]
    Task(String),
}

/// Size thresholds (inclusive lower bound, bytes) and the JPEG quality kept
pub const QUALITY_TIERS: [(usize, u8); 4] = [
    (3_000_000, 40),
    (2_000_000, 45),
    (1_000_000, 50),
    (200_000, 75),
];

/// Quality to re-encode a file of `size` bytes at, or `None` to keep it as is
pub fn quality_for_size(size: usize) -> Option<u8> {
    QUALITY_TIERS
        .iter()
        .find(|(threshold, _)| size >= *threshold)
        .map(|(_, quality)| *quality)
}

/// Decode bounds for untrusted input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeLimits {
    /// Refuse to decode images with more pixels than this
    pub max_pixels: u64,
    /// Scale down so neither side exceeds this
    pub max_dimension: u32,
}

impl Default for TranscodeLimits {
    fn default() -> Self {
        Self {
            max_pixels: 500_000_000,
            max_dimension: 8000,
        }
    }
}

/// What the transcoder did with a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeOutcome {
    /// Original bytes kept
    Unchanged,
    /// JPEG re-encoded at `quality`, ending up `width` x `height`
    Reencoded { quality: u8, width: u32, height: u32 },
    /// Lossless format scaled down to fit, same format family
    Downscaled { width: u32, height: u32 },
}

#[derive(Debug, Clone)]
pub struct Transcoded {
    pub bytes: Bytes,
    pub outcome: TranscodeOutcome,
    /// MIME type of `bytes` as detected or encoded
    pub content_type: String,
}

/// MIME type sniffed from `data`, falling back to the declared one
fn detected_content_type(data: &[u8], declared: &str) -> String {
    image::guess_format(data)
        .map(|format| format.to_mime_type().to_string())
        .unwrap_or_else(|_| declared.to_string())
}

impl Transcoded {
    fn unchanged(bytes: Bytes, declared: &str) -> Self {
        Self {
            content_type: detected_content_type(&bytes, declared),
            bytes,
            outcome: TranscodeOutcome::Unchanged,
        }
    }
}

/// Photo re-encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct Transcoder {
    limits: TranscodeLimits,
}

impl Transcoder {
    pub fn new(limits: TranscodeLimits) -> Self {
        Self { limits }
    }

    /// Re-encode on the blocking pool
    pub async fn transcode_blocking(
        &self,
        data: Bytes,
        content_type: String,
    ) -> Result<Transcoded, TranscodeError> {
        let transcoder = *self;
        tokio::task::spawn_blocking(move || transcoder.transcode(data, &content_type))
            .await
            .map_err(|e| TranscodeError::Task(e.to_string()))?
    }

    /// Reduce quality according to the size tier of `data`.
    ///
    /// Only JPEG honours a quality; PNG and WebP are kept as they are unless
    /// they exceed the dimension cap. A re-encode that does not shrink the
    /// file is discarded.
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    pub fn transcode(&self, data: Bytes, content_type: &str) -> Result<Transcoded, TranscodeError> {
        let Some(quality) = quality_for_size(data.len()) else {
            debug!("Below smallest quality tier, keeping original");
            return Ok(Transcoded::unchanged(data, content_type));
        };

        if content_type.eq_ignore_ascii_case("image/gif") {
            debug!("GIF input, keeping original");
            return Ok(Transcoded::unchanged(data, content_type));
        }

        let format = match image::guess_format(&data) {
            Ok(format @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP)) => format,
            other => {
                debug!(format = ?other.ok(), "Format is not re-encoded, keeping original");
                return Ok(Transcoded::unchanged(data, content_type));
            }
        };

        let mut reader = ImageReader::with_format(Cursor::new(data.as_ref()), format);
        // The pixel ceiling below replaces the reader's allocation limits.
        reader.no_limits();
        let mut decoder = reader.into_decoder().map_err(TranscodeError::Decode)?;

        let (width, height) = decoder.dimensions();
        let pixels = u64::from(width) * u64::from(height);
        if pixels > self.limits.max_pixels {
            return Err(TranscodeError::PixelLimit {
                pixels,
                limit: self.limits.max_pixels,
            });
        }

        let max = self.limits.max_dimension;
        let oversized = width > max || height > max;
        if format != ImageFormat::Jpeg && !oversized {
            debug!(format = ?format, "Lossless format within bounds, keeping original");
            drop(decoder);
            return Ok(Transcoded::unchanged(data, content_type));
        }

        let orientation = decoder
            .orientation()
            .unwrap_or(Orientation::NoTransforms);
        let mut image = DynamicImage::from_decoder(decoder).map_err(TranscodeError::Decode)?;
        image.apply_orientation(orientation);

        if oversized {
            image = image.resize(max, max, FilterType::Lanczos3);
        }

        let bytes = encode(&image, format, quality)?;
        let (width, height) = (image.width(), image.height());

        if !oversized && bytes.len() >= data.len() {
            debug!(output_bytes = bytes.len(), "Re-encode did not shrink the file, keeping original");
            return Ok(Transcoded::unchanged(data, content_type));
        }

        let outcome = match format {
            ImageFormat::Jpeg => TranscodeOutcome::Reencoded {
                quality,
                width,
                height,
            },
            _ => TranscodeOutcome::Downscaled { width, height },
        };

        debug!(
            ?outcome,
            output_bytes = bytes.len(),
            "Photo re-encoded"
        );

        Ok(Transcoded {
            bytes: Bytes::from(bytes),
            outcome,
            content_type: format.to_mime_type().to_string(),
        })
    }
}

/// Encode in the same format family; only JPEG honours `quality`
fn encode(image: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>, TranscodeError> {
    let mut out = Vec::new();

    let result = match format {
        ImageFormat::Png => image.write_with_encoder(PngEncoder::new_with_quality(
            &mut out,
            CompressionType::Best,
            PngFilterType::Adaptive,
        )),
        ImageFormat::WebP => DynamicImage::ImageRgba8(image.to_rgba8())
            .write_with_encoder(WebPEncoder::new_lossless(&mut out)),
        _ => DynamicImage::ImageRgb8(image.to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality)),
    };

    result.map_err(TranscodeError::Encode)?;
    Ok(out)
}
