use std::{
    time::{Duration, SystemTime, UNIX_EPOCH},
    vec::IntoIter,
};

use engine::{Detection, Frame, FrameSource, Result, decode_data_url};
use log::warn;
use serde::Deserialize;

/// One line of a recording.
#[derive(Debug, Deserialize)]
struct RecordedFrame {
    timestamp_ms: u64,
    #[serde(default)]
    detections: Vec<Detection>,
    /// Snapshot as a `data:` URL or bare base64.
    #[serde(default)]
    snapshot: Option<String>,
}

/// Replays frames recorded as JSON lines.
#[derive(Debug)]
pub struct ReplaySource {
    lines: IntoIter<String>,
    line_number: usize,
}

impl ReplaySource {
    pub fn new(contents: &str) -> Self {
        Self {
            lines: contents
                .lines()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .into_iter(),
            line_number: 0,
        }
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        for line in self.lines.by_ref() {
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }

            let recorded = serde_json::from_str::<RecordedFrame>(&line).inspect_err(|err| {
                warn!(target: "replay", "line {} is not a frame: {err}", self.line_number);
            })?;
            let snapshot = recorded.snapshot.and_then(|snapshot| {
                let decoded = decode_data_url(&snapshot);
                if decoded.is_none() {
                    warn!(target: "replay", "ignored undecodable snapshot on line {}", self.line_number);
                }
                decoded
            });

            return Ok(Some(Frame {
                captured_at: frame_time(recorded.timestamp_ms),
                detections: recorded.detections,
                snapshot,
            }));
        }

        Ok(None)
    }
}

/// The instant a replayed frame at `timestamp_ms` was captured.
pub fn frame_time(timestamp_ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(timestamp_ms)
}
