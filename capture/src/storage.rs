use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::ImageFormat;
use roi_capture_common::config::FileKey;
use roi_capture_common::frame::TimestampedFrame;
use roi_capture_common::plan::TimingPlan;
use roi_capture_common::roi::Roi;
use serde::Serialize;
use tracing::debug;

pub const MANIFEST_FILE: &str = "session.json";

const PREVIEW_JPEG_QUALITY: u8 = 80;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to create output directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("failed to write image {0}: {1}")]
    WriteImage(PathBuf, image::ImageError),
    #[error("failed to write manifest {0}: {1}")]
    WriteManifest(PathBuf, std::io::Error),
    #[error("failed to encode manifest: {0}")]
    EncodeManifest(#[from] serde_json::Error),
    #[error("failed to encode preview: {0}")]
    EncodePreview(image::ImageError),
}

/// What was asked of a run, written next to its images.
#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub started_at: String,
    pub camera_id: u32,
    pub run_index: u64,
    pub roi: Roi,
    pub timing: TimingPlan,
    pub file_key: FileKey,
    pub boundary_epsilon_secs: f64,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Encode `frame` as PNG at `path`. The file is opened and closed per call.
pub fn write_png(path: &Path, frame: &TimestampedFrame) -> Result<(), StorageError> {
    frame
        .image()
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| StorageError::WriteImage(path.to_path_buf(), e))?;
    debug!(path = %path.display(), seq = frame.seq, "wrote capture");
    Ok(())
}

pub fn write_manifest(run_dir: &Path, manifest: &RunManifest) -> Result<(), StorageError> {
    let path = run_dir.join(MANIFEST_FILE);
    let body = serde_json::to_vec_pretty(manifest)?;
    std::fs::write(&path, body).map_err(|e| StorageError::WriteManifest(path, e))
}

/// JPEG bytes for the live preview endpoint.
pub fn encode_preview(frame: &TimestampedFrame) -> Result<Vec<u8>, StorageError> {
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, PREVIEW_JPEG_QUALITY)
        .encode_image(frame.image())
        .map_err(StorageError::EncodePreview)?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn gradient(width: u32, height: u32) -> TimestampedFrame {
        let image = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 128]));
        TimestampedFrame::new(image, 0, 3)
    }

    #[test]
    fn png_round_trips_pixels() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("1.00.png");
        let frame = gradient(30, 40);
        write_png(&path, &frame).unwrap();

        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (30, 40));
        assert_eq!(&decoded, frame.image());
    }

    #[test]
    fn png_into_missing_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gone").join("0.00.png");
        let err = write_png(&path, &gradient(2, 2)).unwrap_err();
        assert!(matches!(err, StorageError::WriteImage(..)));
    }

    #[test]
    fn manifest_is_json() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = RunManifest {
            started_at: "2026-02-18T09:30:00Z".into(),
            camera_id: 1,
            run_index: 4,
            roi: Roi::new(1, 2, 3, 4),
            timing: TimingPlan::default(),
            file_key: FileKey::Scheduled,
            boundary_epsilon_secs: 0.01,
            frame_width: 720,
            frame_height: 1280,
        };
        write_manifest(tmp.path(), &manifest).unwrap();

        let raw = std::fs::read_to_string(tmp.path().join(MANIFEST_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["run_index"], 4);
        assert_eq!(value["file_key"], "scheduled");
        assert_eq!(value["roi"]["height"], 4);
        assert_eq!(value["timing"]["phases"][0]["end_point"], 900.0);
    }

    #[test]
    fn preview_is_a_jpeg() {
        let bytes = encode_preview(&gradient(16, 16)).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
