use image::{imageops, RgbImage};

use crate::roi::{Roi, RoiError};

/// A decoded camera frame with timestamp metadata.
///
/// Once built a frame is never mutated, so sharing it behind an `Arc` is the
/// snapshot a consumer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedFrame {
    image: RgbImage,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl TimestampedFrame {
    pub fn new(image: RgbImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            image,
            captured_at_ms,
            seq,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Copy the ROI block into a new frame with the same timestamp and sequence number.
    pub fn crop(&self, roi: &Roi) -> Result<TimestampedFrame, FrameError> {
        roi.validate_for(self.width(), self.height())?;
        let image =
            imageops::crop_imm(&self.image, roi.xmin, roi.ymin, roi.width, roi.height).to_image();
        Ok(TimestampedFrame {
            image,
            captured_at_ms: self.captured_at_ms,
            seq: self.seq,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("cannot crop frame: {0}")]
    Crop(#[from] RoiError),
}
