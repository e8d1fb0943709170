use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{decode_jpeg, next_seq, SourceError};
use crate::slot::LatestFrameSlot;

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for a `multipart/x-mixed-replace` JPEG stream.
pub struct MultipartParser {
    buffer: BytesMut,
    state: ParseState,
    /// Offset into `buffer` already scanned for the next boundary.
    scanned: usize,
}

impl Default for MultipartParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scanned: 0,
        }
    }

    /// Feed one network chunk, returning every JPEG it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut jpegs = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        self.buffer.advance(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks.
                        if self.buffer.len() > BOUNDARY.len() {
                            let excess = self.buffer.len() - BOUNDARY.len();
                            self.buffer.advance(excess);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        self.buffer.advance(pos + HEADER_END.len());
                        self.scanned = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.scanned..], BOUNDARY)
                    else {
                        self.scanned = self.buffer.len().saturating_sub(BOUNDARY.len());
                        break;
                    };
                    let jpeg_end = self.scanned + pos;
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };
                    if end > 0 {
                        jpegs.push(self.buffer[..end].to_vec());
                    }
                    self.buffer.advance(jpeg_end + BOUNDARY.len());
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }
        jpegs
    }
}

/// Consume the MJPEG stream into the slot until cancelled.
/// Reconnects with exponential backoff on failure.
pub async fn run_mjpeg_source(url: String, slot: LatestFrameSlot, cancel: CancellationToken) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        info!(url, "connecting to MJPEG stream");
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = consume_stream(&url, &slot) => r,
        };
        match result {
            Ok(()) => {
                info!("stream ended cleanly, reconnecting");
                backoff = Duration::from_secs(2);
            }
            Err(e) => {
                error!(error = %e, "stream error, reconnecting in {:?}", backoff);
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn consume_stream(url: &str, slot: &LatestFrameSlot) -> Result<(), SourceError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(SourceError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(SourceError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(SourceError::HttpStatus(response.status().as_u16()));
    }

    info!(status = %response.status(), "connected to MJPEG stream");

    let mut byte_stream = response.bytes_stream();
    let mut parser = MultipartParser::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(SourceError::HttpStream)?;
        for jpeg in parser.push(&chunk) {
            let seq = next_seq();
            match decode_jpeg(&jpeg, seq) {
                Ok(frame) => {
                    debug!(seq, bytes = jpeg.len(), "publishing frame");
                    slot.publish(frame);
                }
                Err(e) => warn!(error = %e, seq, "failed to decode JPEG, skipping frame"),
            }
        }
    }

    Ok(())
}

/// Polling-based fallback: periodically fetch single frames.
pub async fn run_polling_source(
    frame_url: String,
    interval: Duration,
    slot: LatestFrameSlot,
    cancel: CancellationToken,
) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(url = frame_url, interval_ms = interval.as_millis() as u64, "polling camera frames");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match fetch_frame(&client, &frame_url).await {
            Ok(bytes) => {
                let seq = next_seq();
                match decode_jpeg(&bytes, seq) {
                    Ok(frame) => slot.publish(frame),
                    Err(e) => warn!(error = %e, seq, "failed to decode JPEG, skipping frame"),
                }
            }
            Err(e) => warn!(error = %e, "failed to fetch camera frame"),
        }
    }
}

async fn fetch_frame(client: &reqwest::Client, url: &str) -> Result<bytes::Bytes, SourceError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(SourceError::HttpConnect)?;
    if !resp.status().is_success() {
        return Err(SourceError::HttpStatus(resp.status().as_u16()));
    }
    resp.bytes().await.map_err(SourceError::HttpStream)
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
