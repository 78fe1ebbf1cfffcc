use std::time::{Duration, SystemTime};

use super::Point;
use crate::urgency::{FallState, UrgencyThresholds, classify};

/// The temporal history and classification of one tracked subject.
#[derive(Clone, PartialEq, Debug)]
pub struct PersonState {
    first_detected: SystemTime,
    last_seen: SystemTime,
    last_position: Option<Point>,
    /// Once `true`, never reset for the life of the track.
    movement_detected: bool,
    current_state: FallState,
    /// Set once the subject stays urgent past the sticky threshold.
    sticky_urgent: bool,
    /// Consecutive missed ticks since the last matching detection.
    missed_detections: u32,
    max_missed: u32,
    /// The instant the last miss was counted.
    last_missed: Option<SystemTime>,
}

impl PersonState {
    pub(super) fn new(now: SystemTime, position: Point, max_missed: u32) -> Self {
        Self {
            first_detected: now,
            last_seen: now,
            last_position: Some(position),
            movement_detected: false,
            current_state: FallState::Monitoring,
            sticky_urgent: false,
            missed_detections: 0,
            max_missed,
            last_missed: None,
        }
    }

    pub fn first_detected(&self) -> SystemTime {
        self.first_detected
    }

    pub fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    pub fn last_position(&self) -> Option<Point> {
        self.last_position
    }

    pub fn movement_detected(&self) -> bool {
        self.movement_detected
    }

    pub fn current_state(&self) -> FallState {
        self.current_state
    }

    /// Whether the subject is urgent for the rest of the track's life.
    pub fn is_sticky_urgent(&self) -> bool {
        self.sticky_urgent
    }

    pub fn missed_detections(&self) -> u32 {
        self.missed_detections
    }

    pub fn max_missed(&self) -> u32 {
        self.max_missed
    }

    /// Time spent on the ground as of `now`.
    pub fn time_on_ground(&self, now: SystemTime) -> Duration {
        now.duration_since(self.first_detected).unwrap_or_default()
    }

    /// Time since the last matching detection as of `now`.
    pub fn unseen_for(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_seen).unwrap_or_default()
    }

    /// Whether the missed tick tolerance is exhausted.
    pub fn is_missed_out(&self) -> bool {
        self.missed_detections >= self.max_missed
    }

    pub fn is_stale(&self, now: SystemTime, timeout: Duration) -> bool {
        self.unseen_for(now) > timeout
    }

    /// Records a matching detection at `position`.
    ///
    /// Returns `true` if movement was detected by this observation.
    pub(super) fn observe(&mut self, now: SystemTime, position: Point, threshold: f32) -> bool {
        self.last_seen = now;
        self.missed_detections = 0;
        self.last_missed = None;
        self.update_movement(position, threshold)
    }

    /// Detects whether the subject moved more than `threshold` from its last position.
    ///
    /// The last position only advances when movement is detected so that slow drift
    /// accumulates until it crosses the threshold.
    pub(super) fn update_movement(&mut self, position: Point, threshold: f32) -> bool {
        let Some(last_position) = self.last_position else {
            self.last_position = Some(position);
            return false;
        };

        let moved = last_position.distance(position) > threshold;
        if moved {
            self.movement_detected = true;
            self.last_position = Some(position);
        }

        moved
    }

    /// Counts a missed tick if the subject has been unseen for longer than `grace`.
    ///
    /// When `spacing` is non-zero, misses closer than `spacing` to the previously counted
    /// one are ignored. Returns `true` if a miss was counted.
    pub(super) fn mark_missed(
        &mut self,
        now: SystemTime,
        grace: Duration,
        spacing: Duration,
    ) -> bool {
        if self.unseen_for(now) <= grace {
            return false;
        }
        if let Some(last_missed) = self.last_missed
            && now.duration_since(last_missed).unwrap_or_default() < spacing
        {
            return false;
        }

        self.missed_detections += 1;
        self.last_missed = Some(now);
        true
    }

    /// Recomputes [`Self::current_state`] as of `now`.
    pub(super) fn reclassify(
        &mut self,
        now: SystemTime,
        thresholds: &UrgencyThresholds,
    ) -> (FallState, Duration) {
        let elapsed = self.time_on_ground(now);
        let current = if self.sticky_urgent {
            FallState::Urgent
        } else {
            self.current_state
        };
        self.current_state = classify(elapsed, self.movement_detected, current, thresholds);
        if self.current_state == FallState::Urgent && elapsed > thresholds.sticky_urgent_after {
            self.sticky_urgent = true;
        }

        (self.current_state, elapsed)
    }

    pub(super) fn set_state(&mut self, state: FallState) {
        self.current_state = state;
    }
}
