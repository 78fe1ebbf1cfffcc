use std::{fmt::Debug, time::SystemTime};

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    models::DetectionSettings,
    tracker::BoundingBox,
};

/// One object reported by the upstream detector for a frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Identity assigned by the upstream tracker.
    pub subject: String,
    pub class: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// The detections of one captured frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub captured_at: SystemTime,
    pub detections: Vec<Detection>,
    /// Encoded image of the frame attached to alerts it raises.
    pub snapshot: Option<Vec<u8>>,
}

/// A source of frames such as a camera stream or a recording.
#[cfg_attr(test, automock)]
pub trait FrameSource: Debug {
    /// Gets the next frame.
    ///
    /// Returns `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// What a [`Detection`] means for fall tracking.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DetectionKind {
    Fall,
    Recovered,
    Ignored,
}

/// Sorts detections into falls and recoveries.
#[derive(Clone, Debug)]
pub struct DetectionFilter {
    fall_class: String,
    recovered_class: Option<String>,
    confidence_threshold: f32,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self::from(&DetectionSettings::default())
    }
}

impl From<&DetectionSettings> for DetectionFilter {
    fn from(settings: &DetectionSettings) -> Self {
        Self {
            fall_class: settings.fall_class.clone(),
            recovered_class: settings.recovered_class.clone(),
            confidence_threshold: settings.confidence_threshold,
        }
    }
}

impl DetectionFilter {
    pub fn fall_class(&self) -> &str {
        &self.fall_class
    }

    /// Classifies `detection`.
    ///
    /// Detections below the confidence threshold are ignored. Fails if the confidence is
    /// not within `[0, 1]` or the subject identity is empty.
    pub fn classify(&self, detection: &Detection) -> Result<DetectionKind> {
        if !(0.0..=1.0).contains(&detection.confidence) {
            return Err(Error::invalid(format!(
                "confidence {} of {} is out of range",
                detection.confidence, detection.subject
            )));
        }
        if detection.subject.trim().is_empty() {
            return Err(Error::invalid("subject identity is empty"));
        }
        if detection.confidence < self.confidence_threshold {
            return Ok(DetectionKind::Ignored);
        }

        let kind = if detection.class == self.fall_class {
            DetectionKind::Fall
        } else if self.recovered_class.as_deref() == Some(detection.class.as_str()) {
            DetectionKind::Recovered
        } else {
            DetectionKind::Ignored
        };

        Ok(kind)
    }
}
