use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// The classification of a tracked subject lying on the ground.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Debug,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[repr(usize)]
pub enum FallState {
    /// On the ground for a short while, watching.
    #[default]
    Monitoring,
    /// On the ground long enough to warrant attention.
    Alert,
    /// On the ground and motionless for a long time.
    Urgent,
    /// Got back up unaided.
    ///
    /// Never computed by [`classify`], only assigned by the caller.
    Recovered,
}

impl FallState {
    /// Gets the static display information of this state.
    pub fn info(self) -> &'static StateInfo {
        &STATE_INFOS[self as usize]
    }

    /// Whether this state warrants an alert record.
    pub fn is_alerting(self) -> bool {
        matches!(self, FallState::Alert | FallState::Urgent)
    }

    /// Relative severity used to detect escalations.
    pub fn severity(self) -> u8 {
        match self {
            FallState::Monitoring | FallState::Recovered => 0,
            FallState::Alert => 1,
            FallState::Urgent => 2,
        }
    }
}

/// Whether a state calls for someone to intervene.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Display)]
pub enum NeedsHelp {
    No,
    Possibly,
    Yes,
}

/// Read-only display information attached to a [`FallState`].
#[derive(PartialEq, Debug)]
pub struct StateInfo {
    pub description: &'static str,
    pub needs_help: NeedsHelp,
    /// Short level label used for on-frame overlays.
    pub level: &'static str,
    /// Human readable state name.
    pub display: &'static str,
    /// Overlay color in BGR order.
    pub color_bgr: (u8, u8, u8),
    pub css_color: &'static str,
}

/// Display information for a subject that is not tracked.
pub static UNKNOWN_STATE_INFO: StateInfo = StateInfo {
    description: "Unknown state",
    needs_help: NeedsHelp::Possibly,
    level: "Unknown",
    display: "Unknown",
    color_bgr: (128, 128, 128),
    css_color: "gray",
};

// Indexed by `FallState as usize`
static STATE_INFOS: [StateInfo; 4] = [
    StateInfo {
        description: "Person on the ground, monitoring",
        needs_help: NeedsHelp::No,
        level: "Monitoring",
        display: "Monitoring",
        color_bgr: (0, 255, 255),
        css_color: "yellow",
    },
    StateInfo {
        description: "Person on the ground for a while",
        needs_help: NeedsHelp::Possibly,
        level: "Alert",
        display: "Alert",
        color_bgr: (0, 165, 255),
        css_color: "orange",
    },
    StateInfo {
        description: "Person motionless on the ground for a long time",
        needs_help: NeedsHelp::Yes,
        level: "Urgent alert",
        display: "Urgent",
        color_bgr: (0, 0, 255),
        css_color: "red",
    },
    StateInfo {
        description: "Person got back up unaided",
        needs_help: NeedsHelp::No,
        level: "Recovered",
        display: "Recovered",
        color_bgr: (0, 255, 0),
        css_color: "green",
    },
];

/// Time thresholds driving [`classify`].
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct UrgencyThresholds {
    /// Elapsed time after which [`FallState::Monitoring`] becomes [`FallState::Alert`].
    pub alert_after: Duration,
    /// Elapsed time after which a motionless subject becomes [`FallState::Urgent`].
    pub urgent_after: Duration,
    /// Elapsed time after which an already urgent subject can no longer be downgraded.
    pub sticky_urgent_after: Duration,
}

impl Default for UrgencyThresholds {
    fn default() -> Self {
        Self {
            alert_after: Duration::from_secs(10),
            urgent_after: Duration::from_secs(30),
            sticky_urgent_after: Duration::from_secs(25),
        }
    }
}

/// Classifies a subject from its time on the ground and movement history.
///
/// An urgent subject past [`UrgencyThresholds::sticky_urgent_after`] stays urgent even if
/// movement is observed afterward. [`FallState::Recovered`] is never returned.
pub fn classify(
    elapsed: Duration,
    movement_detected: bool,
    current: FallState,
    thresholds: &UrgencyThresholds,
) -> FallState {
    if current == FallState::Urgent && elapsed > thresholds.sticky_urgent_after {
        return FallState::Urgent;
    }

    if elapsed > thresholds.urgent_after {
        if movement_detected {
            FallState::Alert
        } else {
            FallState::Urgent
        }
    } else if elapsed > thresholds.alert_after {
        FallState::Alert
    } else {
        FallState::Monitoring
    }
}
