use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{impl_identifiable, urgency::FallState};

/// Source category of alerts raised by a live camera stream.
pub const LIVE_CAMERA: &str = "live_camera";

/// Source category of alerts raised by manually uploaded test media.
pub const TEST_UPLOAD: &str = "test_upload";

/// A persisted fall incident.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FallAlert {
    #[serde(skip_serializing, default)]
    pub id: Option<i64>,
    /// The instant the alert was created.
    pub timestamp: SystemTime,
    /// Source category, e.g. [`LIVE_CAMERA`].
    pub detected_by: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub fall_state: Option<FallState>,
    #[serde(default)]
    pub time_on_ground_secs: Option<f64>,
    #[serde(default)]
    pub subject: Option<String>,
    /// Encoded snapshot image of the frame that raised or last refreshed the alert.
    #[serde(default, skip_serializing)]
    pub snapshot: Option<Vec<u8>>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    #[serde(default)]
    pub acknowledged_at: Option<SystemTime>,
    /// `Some(false)` marks a false positive, `None` means not reviewed.
    #[serde(default)]
    pub is_accurate: Option<bool>,
    #[serde(default)]
    pub accuracy_marked_by: Option<String>,
    #[serde(default)]
    pub accuracy_marked_at: Option<SystemTime>,
    #[serde(default)]
    pub updated_at: Option<SystemTime>,
}

impl_identifiable!(FallAlert);

impl FallAlert {
    /// Creates a new unacknowledged alert from `fields`.
    pub fn new(detected_by: &str, fields: &AlertFields, timestamp: SystemTime) -> Self {
        let mut alert = Self {
            id: None,
            timestamp,
            detected_by: detected_by.to_string(),
            description: String::new(),
            confidence: None,
            class_name: String::new(),
            metadata: None,
            fall_state: None,
            time_on_ground_secs: None,
            subject: None,
            snapshot: None,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            is_accurate: None,
            accuracy_marked_by: None,
            accuracy_marked_at: None,
            updated_at: None,
        };
        alert.apply(fields);
        alert
    }

    /// Overwrites incident fields with `fields`.
    ///
    /// A missing snapshot in `fields` keeps the previous one.
    pub fn apply(&mut self, fields: &AlertFields) {
        self.description = fields.description.clone();
        self.confidence = fields.confidence;
        self.class_name = fields.class_name.clone();
        self.metadata = fields.metadata.clone();
        self.fall_state = fields.fall_state;
        self.time_on_ground_secs = fields.time_on_ground_secs;
        self.subject = fields.subject.clone();
        if fields.snapshot.is_some() {
            self.snapshot = fields.snapshot.clone();
        }
    }

    /// Folds a later incident into this alert without lowering its severity.
    ///
    /// A less severe incident only refreshes confidence, metadata and snapshot. The
    /// stored fall state keeps its subject and time on the ground.
    pub fn refresh(&mut self, fields: &AlertFields) {
        let stored = self.fall_state.map(FallState::severity);
        let incoming = fields.fall_state.map(FallState::severity);
        if incoming >= stored {
            self.apply(fields);
            return;
        }

        self.confidence = fields.confidence;
        self.metadata = fields.metadata.clone();
        if fields.snapshot.is_some() {
            self.snapshot = fields.snapshot.clone();
        }
    }

    /// Marks this alert as reviewed by `user`.
    pub fn mark_acknowledged(&mut self, user: &str, at: SystemTime) {
        self.acknowledged = true;
        self.acknowledged_by = Some(user.to_string());
        self.acknowledged_at = Some(at);
    }

    /// Records whether this alert was a real fall.
    pub fn mark_accuracy(&mut self, user: &str, is_accurate: bool, at: SystemTime) {
        self.is_accurate = Some(is_accurate);
        self.accuracy_marked_by = Some(user.to_string());
        self.accuracy_marked_at = Some(at);
    }

    /// Gets the CSS color of the alert's fall state, gray if not set.
    pub fn urgency_color(&self) -> &'static str {
        self.fall_state
            .map(|state| state.info().css_color)
            .unwrap_or("gray")
    }

    /// Gets the display name of the alert's fall state.
    pub fn urgency_display(&self) -> &'static str {
        self.fall_state
            .map(|state| state.info().display)
            .unwrap_or("Unknown")
    }
}

/// Incident fields written when an alert is created or refreshed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlertFields {
    pub description: String,
    pub confidence: Option<f32>,
    pub class_name: String,
    pub metadata: Option<Value>,
    pub fall_state: Option<FallState>,
    pub time_on_ground_secs: Option<f64>,
    pub subject: Option<String>,
    pub snapshot: Option<Vec<u8>>,
}

/// Filter for listing stored alerts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlertFilter {
    /// Restricts to these source categories when not empty.
    pub detected_by: Vec<String>,
    /// Restricts to acknowledged (`Some(true)`) or new (`Some(false)`) alerts.
    pub acknowledged: Option<bool>,
    /// Includes [`TEST_UPLOAD`] alerts.
    pub include_tests: bool,
    pub limit: Option<usize>,
}
