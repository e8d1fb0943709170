//! Frame sources that keep the latest-frame slot filled.
//!
//! A source owns its acquisition loop and publishes every decoded frame into a
//! [`LatestFrameSlot`]; nothing downstream ever waits on it.

pub mod mjpeg;
pub mod pattern;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use roi_capture_common::config::{CameraConfig, SourceMode};
use roi_capture_common::frame::TimestampedFrame;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::slot::LatestFrameSlot;

static SEQ_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("failed to decode JPEG: {0}")]
    Decode(#[from] image::ImageError),
}

fn next_seq() -> u64 {
    SEQ_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Decode one JPEG into an RGB8 frame stamped with the current wall time.
pub fn decode_jpeg(jpeg: &[u8], seq: u64) -> Result<TimestampedFrame, SourceError> {
    let rgb = image::load_from_memory(jpeg)?.to_rgb8();
    Ok(TimestampedFrame::new(rgb, Utc::now().timestamp_millis(), seq))
}

/// Spawn the acquisition loop selected by `[camera].source`.
pub fn spawn_source(
    camera: &CameraConfig,
    slot: LatestFrameSlot,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    info!(camera_id = camera.id, source = ?camera.source, "starting frame source");
    match camera.source {
        SourceMode::Mjpeg => tokio::spawn(mjpeg::run_mjpeg_source(camera.url.clone(), slot, cancel)),
        SourceMode::Polling => {
            let url = camera.url.replace("/stream", "/frame");
            tokio::spawn(mjpeg::run_polling_source(
                url,
                camera.frame_interval(),
                slot,
                cancel,
            ))
        }
        SourceMode::Pattern => tokio::spawn(pattern::run_pattern_source(
            camera.width,
            camera.height,
            camera.frame_interval(),
            slot,
            cancel,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::ExtendedColorType;
    use std::time::Duration;

    #[test]
    fn decodes_jpeg_to_rgb() {
        let pixels = vec![128u8; 8 * 6 * 3];
        let mut jpeg = Vec::new();
        JpegEncoder::new(&mut jpeg)
            .encode(&pixels, 8, 6, ExtendedColorType::Rgb8)
            .unwrap();

        let frame = decode_jpeg(&jpeg, 11).unwrap();
        assert_eq!((frame.width(), frame.height()), (8, 6));
        assert_eq!(frame.seq, 11);
    }

    #[test]
    fn rejects_non_jpeg() {
        assert!(matches!(
            decode_jpeg(b"not an image", 0),
            Err(SourceError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn pattern_source_fills_the_slot() {
        let camera = CameraConfig {
            width: 32,
            height: 24,
            fps: 100.0,
            ..CameraConfig::default()
        };
        let slot = LatestFrameSlot::new();
        let cancel = CancellationToken::new();
        let handle = spawn_source(&camera, slot.clone(), cancel.clone());

        let frame = slot.wait_for_frame(Duration::from_secs(2)).await.unwrap();
        assert_eq!((frame.width(), frame.height()), (32, 24));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
