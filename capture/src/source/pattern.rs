use std::time::Duration;

use chrono::Utc;
use image::{Rgb, RgbImage};
use roi_capture_common::frame::TimestampedFrame;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::next_seq;
use crate::slot::LatestFrameSlot;

/// Diagonal RGB gradient that scrolls by `phase` pixels per frame.
pub fn gradient_frame(width: u32, height: u32, phase: u32, seq: u64) -> TimestampedFrame {
    let image = RgbImage::from_fn(width, height, |x, y| {
        let d = x.wrapping_add(y).wrapping_add(phase);
        Rgb([d as u8, (y >> 2) as u8, (x >> 2) as u8])
    });
    TimestampedFrame::new(image, Utc::now().timestamp_millis(), seq)
}

/// Publish a synthetic frame every `interval` until cancelled.
pub async fn run_pattern_source(
    width: u32,
    height: u32,
    interval: Duration,
    slot: LatestFrameSlot,
    cancel: CancellationToken,
) {
    if width == 0 || height == 0 {
        warn!(width, height, "pattern source has an empty frame size, not starting");
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        width,
        height,
        interval_ms = interval.as_millis() as u64,
        "publishing test pattern frames"
    );

    let mut phase = 0u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        slot.publish(gradient_frame(width, height, phase, next_seq()));
        phase = phase.wrapping_add(4);
    }
}
