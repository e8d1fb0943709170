use serde::{Deserialize, Serialize};

/// Rectangular region of a frame that gets persisted, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub xmin: u32,
    pub ymin: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for Roi {
    fn default() -> Self {
        Self {
            xmin: 240,
            ymin: 100,
            width: 260,
            height: 1040,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoiError {
    #[error("ROI width and height must be positive, got {width}x{height}")]
    Empty { width: u32, height: u32 },
    #[error(
        "ROI {xmin},{ymin} {width}x{height} does not fit in a {frame_width}x{frame_height} frame"
    )]
    OutOfBounds {
        xmin: u32,
        ymin: u32,
        width: u32,
        height: u32,
        frame_width: u32,
        frame_height: u32,
    },
}

impl Roi {
    pub fn new(xmin: u32, ymin: u32, width: u32, height: u32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
        }
    }

    /// Exclusive right edge.
    pub fn xmax(&self) -> u64 {
        self.xmin as u64 + self.width as u64
    }

    /// Exclusive bottom edge.
    pub fn ymax(&self) -> u64 {
        self.ymin as u64 + self.height as u64
    }

    /// Check that the region is non-empty and lies inside a frame of the given size.
    pub fn validate_for(&self, frame_width: u32, frame_height: u32) -> Result<(), RoiError> {
        if self.width == 0 || self.height == 0 {
            return Err(RoiError::Empty {
                width: self.width,
                height: self.height,
            });
        }
        if self.xmax() > frame_width as u64 || self.ymax() > frame_height as u64 {
            return Err(RoiError::OutOfBounds {
                xmin: self.xmin,
                ymin: self.ymin,
                width: self.width,
                height: self.height,
                frame_width,
                frame_height,
            });
        }
        Ok(())
    }
}
