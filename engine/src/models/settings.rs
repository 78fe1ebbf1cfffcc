use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use super::{LIVE_CAMERA, deserialize_with_ok_or_default};
use crate::{
    error::{Error, Result},
    tracker::TrackerConfig,
    urgency::UrgencyThresholds,
};

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub alerts: AlertSettings,
    #[serde(default)]
    pub detection: DetectionSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

impl Settings {
    /// Loads settings from a JSON file.
    ///
    /// Missing fields fall back to their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|err| Error::Settings(format!("{}: {err}", path.display())))?;

        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| Error::Settings(err.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackerSettings {
    #[serde(default = "alert_after_millis_default")]
    pub alert_after_millis: u64,
    #[serde(default = "urgent_after_millis_default")]
    pub urgent_after_millis: u64,
    #[serde(default = "sticky_urgent_after_millis_default")]
    pub sticky_urgent_after_millis: u64,
    #[serde(default = "movement_threshold_default")]
    pub movement_threshold: f32,
    #[serde(default = "missed_grace_millis_default")]
    pub missed_grace_millis: u64,
    #[serde(default = "max_missed_default")]
    pub max_missed: u32,
    #[serde(default)]
    pub missed_spacing_millis: u64,
    #[serde(default = "stale_timeout_millis_default")]
    pub stale_timeout_millis: u64,
    #[serde(default = "persistent_window_millis_default")]
    pub persistent_window_millis: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            alert_after_millis: alert_after_millis_default(),
            urgent_after_millis: urgent_after_millis_default(),
            sticky_urgent_after_millis: sticky_urgent_after_millis_default(),
            movement_threshold: movement_threshold_default(),
            missed_grace_millis: missed_grace_millis_default(),
            max_missed: max_missed_default(),
            missed_spacing_millis: 0,
            stale_timeout_millis: stale_timeout_millis_default(),
            persistent_window_millis: persistent_window_millis_default(),
        }
    }
}

impl From<&TrackerSettings> for TrackerConfig {
    fn from(settings: &TrackerSettings) -> Self {
        Self {
            thresholds: UrgencyThresholds {
                alert_after: Duration::from_millis(settings.alert_after_millis),
                urgent_after: Duration::from_millis(settings.urgent_after_millis),
                sticky_urgent_after: Duration::from_millis(settings.sticky_urgent_after_millis),
            },
            movement_threshold: settings.movement_threshold,
            missed_grace: Duration::from_millis(settings.missed_grace_millis),
            max_missed: settings.max_missed,
            missed_spacing: Duration::from_millis(settings.missed_spacing_millis),
            stale_timeout: Duration::from_millis(settings.stale_timeout_millis),
            persistent_window: Duration::from_millis(settings.persistent_window_millis),
        }
    }
}

fn alert_after_millis_default() -> u64 {
    10000
}

fn urgent_after_millis_default() -> u64 {
    30000
}

fn sticky_urgent_after_millis_default() -> u64 {
    25000
}

fn movement_threshold_default() -> f32 {
    20.0
}

fn missed_grace_millis_default() -> u64 {
    2000
}

fn max_missed_default() -> u32 {
    10
}

fn stale_timeout_millis_default() -> u64 {
    120000 // 2 minutes
}

fn persistent_window_millis_default() -> u64 {
    5000
}

/// Where the alert coalescer reads the latest alert of a category from.
#[derive(
    Clone, Copy, PartialEq, Eq, Default, Debug, Serialize, Deserialize, EnumIter, Display, EnumString,
)]
pub enum CoalesceStrategy {
    /// An in-memory slot per category updated on alert creation.
    #[default]
    LastAlertCache,
    /// A query for the latest stored record of the category.
    LatestRecord,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertSettings {
    #[serde(default = "category_default")]
    pub category: String,
    #[serde(default = "coalesce_window_millis_default")]
    pub coalesce_window_millis: u64,
    #[serde(default, deserialize_with = "deserialize_with_ok_or_default")]
    pub strategy: CoalesceStrategy,
    #[serde(default = "description_default")]
    pub description: String,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            category: category_default(),
            coalesce_window_millis: coalesce_window_millis_default(),
            strategy: CoalesceStrategy::default(),
            description: description_default(),
        }
    }
}

impl AlertSettings {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_millis)
    }
}

fn category_default() -> String {
    LIVE_CAMERA.to_string()
}

fn coalesce_window_millis_default() -> u64 {
    30000
}

fn description_default() -> String {
    "Fall detected via live camera".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionSettings {
    #[serde(default = "fall_class_default")]
    pub fall_class: String,
    /// Class reported by the detector once a subject is back on their feet.
    #[serde(default)]
    pub recovered_class: Option<String>,
    #[serde(default = "confidence_threshold_default")]
    pub confidence_threshold: f32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            fall_class: fall_class_default(),
            recovered_class: None,
            confidence_threshold: confidence_threshold_default(),
        }
    }
}

fn fall_class_default() -> String {
    "Fall-Detected".to_string()
}

fn confidence_threshold_default() -> f32 {
    0.7
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "fps_default")]
    pub fps: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self { fps: fps_default() }
    }
}

fn fps_default() -> u32 {
    30
}
