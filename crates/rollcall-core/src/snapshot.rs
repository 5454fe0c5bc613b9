//! Raw video frames and the capture taken at the moment of recognition.

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{LandmarkSet, NamedScore};

/// JPEG quality used when none is configured.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Largest width or height a JPEG can carry.
pub const MAX_FRAME_DIMENSION: u32 = 65_535;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("empty frame ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
    #[error("frame too large ({width}x{height}, max {MAX_FRAME_DIMENSION} per side)")]
    TooLarge { width: u32, height: u32 },
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Pixel layout of a raw video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Packed 8-bit RGB, 3 bytes/pixel.
    Rgb8,
    /// 8-bit grayscale, 1 byte/pixel.
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }

    fn color_type(&self) -> ExtendedColorType {
        match self {
            PixelFormat::Rgb8 => ExtendedColorType::Rgb8,
            PixelFormat::Gray8 => ExtendedColorType::L8,
        }
    }
}

/// A raw camera frame as handed over by the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl VideoFrame {
    /// Byte length implied by the dimensions, `None` if it overflows `usize`.
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.format.bytes_per_pixel())
    }

    /// Encode the frame as a JPEG still.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, SnapshotError> {
        if self.width == 0 || self.height == 0 {
            return Err(SnapshotError::EmptyFrame {
                width: self.width,
                height: self.height,
            });
        }
        let too_large = || SnapshotError::TooLarge {
            width: self.width,
            height: self.height,
        };
        if self.width > MAX_FRAME_DIMENSION || self.height > MAX_FRAME_DIMENSION {
            return Err(too_large());
        }
        let expected = self.expected_len().ok_or_else(too_large)?;
        if self.data.len() < expected {
            return Err(SnapshotError::InvalidLength {
                expected,
                actual: self.data.len(),
            });
        }

        let mut out = Vec::new();
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
            encoder.encode(&self.data[..expected], self.width, self.height, self.format.color_type())?;
        }
        Ok(out)
    }
}

/// JPEG still of the recognition instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StillImage {
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

/// Everything frozen at the recognition instant, handed to whoever commits the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSnapshot {
    /// `None` when the detector supplied no frame or encoding failed.
    pub image: Option<StillImage>,
    pub landmarks: LandmarkSet,
    pub coefficients: Option<Vec<NamedScore>>,
    pub captured_at: DateTime<Utc>,
}

/// Freezes the capture triple on recognition.
#[derive(Debug, Clone, Copy)]
pub struct Snapshotter {
    quality: u8,
}

impl Default for Snapshotter {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl Snapshotter {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }

    /// Capture the still, landmarks and coefficients.
    ///
    /// Image encoding is best-effort: a failure is logged and the snapshot
    /// is returned without an image.
    pub fn capture(
        &self,
        frame: Option<&VideoFrame>,
        landmarks: &LandmarkSet,
        coefficients: Option<&[NamedScore]>,
    ) -> CaptureSnapshot {
        let image = frame.and_then(|f| match f.encode_jpeg(self.quality) {
            Ok(jpeg) => Some(StillImage {
                width: f.width,
                height: f.height,
                jpeg,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "capture still could not be encoded; keeping landmarks only");
                None
            }
        });

        CaptureSnapshot {
            image,
            landmarks: landmarks.clone(),
            coefficients: coefficients.map(<[NamedScore]>::to_vec),
            captured_at: Utc::now(),
        }
    }
}
