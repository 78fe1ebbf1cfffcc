use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use log::{debug, warn};
use ordered_hash_map::OrderedHashMap;

use super::{BoundingBox, PersonState, Point};
use crate::{
    error::{Error, Result},
    urgency::{FallState, UNKNOWN_STATE_INFO, UrgencyThresholds},
};

/// Runtime configuration of a [`TrackRegistry`].
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct TrackerConfig {
    pub thresholds: UrgencyThresholds,
    /// Center displacement in pixels above which a subject counts as moving.
    pub movement_threshold: f32,
    /// How long a subject can stay unseen before sweeps count it as missed.
    pub missed_grace: Duration,
    /// Number of counted misses before a track is evicted.
    pub max_missed: u32,
    /// Minimum interval between two counted misses, zero counts every sweep.
    pub missed_spacing: Duration,
    /// How long a subject can stay unseen before it is evicted regardless of misses.
    pub stale_timeout: Duration,
    /// How recently a subject must have been seen to remain displayed.
    pub persistent_window: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            thresholds: UrgencyThresholds::default(),
            movement_threshold: 20.0,
            missed_grace: Duration::from_secs(2),
            max_missed: 10,
            missed_spacing: Duration::ZERO,
            stale_timeout: Duration::from_secs(120),
            persistent_window: Duration::from_secs(5),
        }
    }
}

/// An owned, consistent copy of a tracked subject's state at some instant.
#[derive(Clone, PartialEq, Debug)]
pub struct TrackSnapshot {
    pub subject: String,
    pub first_detected: SystemTime,
    pub last_seen: SystemTime,
    pub state: FallState,
    pub elapsed: Duration,
    pub movement_detected: bool,
    pub last_position: Option<Point>,
    pub missed_detections: u32,
}

impl TrackSnapshot {
    fn new(subject: &str, person: &PersonState, now: SystemTime) -> Self {
        Self {
            subject: subject.to_string(),
            first_detected: person.first_detected(),
            last_seen: person.last_seen(),
            state: person.current_state(),
            elapsed: person.time_on_ground(now),
            movement_detected: person.movement_detected(),
            last_position: person.last_position(),
            missed_detections: person.missed_detections(),
        }
    }
}

/// Keyed collection of [`PersonState`], one per subject identity.
///
/// Subjects are kept in first-seen order. A subject evicted and seen again starts a new
/// track with a fresh time on the ground.
#[derive(Debug, Default)]
pub struct TrackRegistry {
    tracks: OrderedHashMap<String, PersonState>,
    config: TrackerConfig,
}

impl TrackRegistry {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            tracks: OrderedHashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Records an observation of `subject` at `bbox`.
    ///
    /// Returns the recomputed [`FallState`] and the time on the ground. Fails without
    /// touching the track if `subject` is empty or `now` is earlier than its last
    /// observation.
    pub fn update(
        &mut self,
        subject: &str,
        bbox: BoundingBox,
        now: SystemTime,
    ) -> Result<(FallState, Duration)> {
        if subject.trim().is_empty() {
            return Err(Error::invalid("subject identity is empty"));
        }

        let position = bbox.center();
        let result = match self.tracks.get_mut(subject) {
            Some(person) => {
                if now < person.last_seen() {
                    warn!(target: "tracker", "rejected out-of-order observation of {subject}");
                    return Err(Error::invalid(format!(
                        "observation of {subject} is older than its last observation"
                    )));
                }
                if person.observe(now, position, self.config.movement_threshold) {
                    debug!(target: "tracker", "{subject} moved to {position:?}");
                }
                person.reclassify(now, &self.config.thresholds)
            }
            None => {
                let mut person = PersonState::new(now, position, self.config.max_missed);
                let result = person.reclassify(now, &self.config.thresholds);

                debug!(target: "tracker", "tracking new subject {subject} at {position:?}");
                self.tracks.insert(subject.to_string(), person);
                result
            }
        };

        Ok(result)
    }

    /// Counts a missed tick for every subject unseen for longer than the grace period.
    ///
    /// This must be called once per tick, including ticks without any detection. Returns
    /// the subjects evicted for exhausting their missed tick tolerance.
    pub fn sweep_missed(&mut self, now: SystemTime) -> Vec<String> {
        let subjects = self.tracks.keys().cloned().collect::<Vec<_>>();
        let mut evicted = Vec::new();

        for subject in subjects {
            let Some(person) = self.tracks.get_mut(&subject) else {
                continue;
            };
            if person.mark_missed(now, self.config.missed_grace, self.config.missed_spacing)
                && person.is_missed_out()
            {
                evicted.push(subject);
            }
        }

        for subject in evicted.iter() {
            self.tracks.remove(subject);
            debug!(target: "tracker", "evicted {subject} after too many missed detections");
        }

        evicted
    }

    /// Removes every subject unseen for longer than the stale timeout.
    pub fn evict_stale(&mut self, now: SystemTime) -> Vec<String> {
        let timeout = self.config.stale_timeout;
        let evicted = self
            .tracks
            .iter()
            .filter(|(_, person)| person.is_stale(now, timeout))
            .map(|(subject, _)| subject.clone())
            .collect::<Vec<_>>();

        for subject in evicted.iter() {
            self.tracks.remove(subject);
            debug!(target: "tracker", "evicted stale subject {subject}");
        }

        evicted
    }

    /// Evicts stale subjects then returns all remaining tracks.
    pub fn active_states(&mut self, now: SystemTime) -> Vec<TrackSnapshot> {
        self.evict_stale(now);
        self.snapshots(now, |_| true)
    }

    /// Returns tracks seen within the persistent window or currently urgent.
    ///
    /// Used for display continuity, does not evict.
    pub fn persistent_states(&self, now: SystemTime) -> Vec<TrackSnapshot> {
        let window = self.config.persistent_window;
        self.snapshots(now, |person| {
            person.unseen_for(now) <= window || person.current_state() == FallState::Urgent
        })
    }

    pub fn has_urgent_cases(&self) -> bool {
        self.tracks
            .iter()
            .any(|(_, person)| person.current_state() == FallState::Urgent)
    }

    /// Gets the state of `subject` if it is tracked.
    pub fn state(&self, subject: &str, now: SystemTime) -> Option<TrackSnapshot> {
        self.tracks
            .get(subject)
            .map(|person| TrackSnapshot::new(subject, person, now))
    }

    /// Gets an overlay label such as `Alert (15s)` for `subject`.
    pub fn state_label(&self, subject: &str, now: SystemTime) -> Option<String> {
        self.tracks.get(subject).map(|person| {
            format!(
                "{} ({}s)",
                person.current_state().info().level,
                person.time_on_ground(now).as_secs()
            )
        })
    }

    /// Gets the overlay color of `subject` in BGR order, gray if not tracked.
    pub fn state_color(&self, subject: &str) -> (u8, u8, u8) {
        self.tracks
            .get(subject)
            .map(|person| person.current_state().info().color_bgr)
            .unwrap_or(UNKNOWN_STATE_INFO.color_bgr)
    }

    /// Labels `subject` as [`FallState::Recovered`].
    ///
    /// The label holds until the next [`Self::update`] reclassifies the subject. Returns
    /// `false` if `subject` is not tracked or stays urgent past the sticky threshold.
    pub fn mark_recovered(&mut self, subject: &str) -> bool {
        match self.tracks.get_mut(subject) {
            Some(person) if person.is_sticky_urgent() => {
                warn!(target: "tracker", "ignored recovery of {subject}, still urgent");
                false
            }
            Some(person) => {
                person.set_state(FallState::Recovered);
                debug!(target: "tracker", "{subject} recovered");
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, subject: &str) -> bool {
        self.tracks.remove(subject).is_some()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    fn snapshots(
        &self,
        now: SystemTime,
        predicate: impl Fn(&PersonState) -> bool,
    ) -> Vec<TrackSnapshot> {
        self.tracks
            .iter()
            .filter(|(_, person)| predicate(person))
            .map(|(subject, person)| TrackSnapshot::new(subject, person, now))
            .collect()
    }
}

/// A [`TrackRegistry`] shared between multiple frame loops.
///
/// Every operation holds the lock for its whole duration.
#[derive(Clone, Debug, Default)]
pub struct SharedTrackRegistry {
    inner: Arc<Mutex<TrackRegistry>>,
}

impl SharedTrackRegistry {
    pub fn new(registry: TrackRegistry) -> Self {
        Self {
            inner: Arc::new(Mutex::new(registry)),
        }
    }

    /// Runs `f` with exclusive access to the registry.
    pub fn with<T>(&self, f: impl FnOnce(&mut TrackRegistry) -> T) -> T {
        f(&mut self.lock())
    }

    pub fn update(
        &self,
        subject: &str,
        bbox: BoundingBox,
        now: SystemTime,
    ) -> Result<(FallState, Duration)> {
        self.lock().update(subject, bbox, now)
    }

    pub fn sweep_missed(&self, now: SystemTime) -> Vec<String> {
        self.lock().sweep_missed(now)
    }

    pub fn active_states(&self, now: SystemTime) -> Vec<TrackSnapshot> {
        self.lock().active_states(now)
    }

    pub fn persistent_states(&self, now: SystemTime) -> Vec<TrackSnapshot> {
        self.lock().persistent_states(now)
    }

    pub fn has_urgent_cases(&self) -> bool {
        self.lock().has_urgent_cases()
    }

    fn lock(&self) -> MutexGuard<'_, TrackRegistry> {
        // Mutations validate before writing, a poisoned registry is still consistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::UNIX_EPOCH};

    use super::*;

    fn at(secs: f64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_secs_f64(secs)
    }

    fn bbox_at(x: f32, y: f32) -> BoundingBox {
        BoundingBox::new(x - 20.0, y - 40.0, x + 20.0, y + 40.0).unwrap()
    }

    #[test]
    fn update_new_subject_starts_monitoring() {
        let mut registry = TrackRegistry::default();

        let (state, elapsed) = registry.update("a", bbox_at(100.0, 100.0), at(0.0)).unwrap();
        assert_eq!(state, FallState::Monitoring);
        assert_eq!(elapsed, Duration::ZERO);

        let snapshot = registry.state("a", at(0.0)).unwrap();
        assert_eq!(snapshot.first_detected, at(0.0));
        assert_eq!(snapshot.last_seen, at(0.0));
        assert_eq!(snapshot.last_position, Some(Point::new(100.0, 100.0)));
        assert_eq!(snapshot.missed_detections, 0);
    }

    #[test]
    fn update_escalates_and_sticks_urgent() {
        let mut registry = TrackRegistry::default();
        registry.update("a", bbox_at(100.0, 100.0), at(0.0)).unwrap();

        let (state, elapsed) = registry.update("a", bbox_at(100.0, 100.0), at(15.0)).unwrap();
        assert_eq!(state, FallState::Alert);
        assert_eq!(elapsed.as_secs(), 15);
        assert!(!registry.state("a", at(15.0)).unwrap().movement_detected);

        let (state, _) = registry.update("a", bbox_at(100.0, 100.0), at(35.0)).unwrap();
        assert_eq!(state, FallState::Urgent);

        let (state, _) = registry.update("a", bbox_at(400.0, 400.0), at(50.0)).unwrap();
        assert_eq!(state, FallState::Urgent);
        assert!(registry.state("a", at(50.0)).unwrap().movement_detected);
    }

    #[test]
    fn update_long_duration_with_movement_is_alert() {
        let mut registry = TrackRegistry::default();
        registry.update("a", bbox_at(100.0, 100.0), at(0.0)).unwrap();
        registry.update("a", bbox_at(200.0, 100.0), at(5.0)).unwrap();

        let (state, _) = registry.update("a", bbox_at(200.0, 100.0), at(31.0)).unwrap();
        assert_eq!(state, FallState::Alert);
    }

    #[test]
    fn update_rejects_empty_subject() {
        let mut registry = TrackRegistry::default();

        let err = registry.update("  ", bbox_at(0.0, 0.0), at(0.0)).unwrap_err();
        assert!(err.is_invalid_input());
        assert!(registry.is_empty());
    }

    #[test]
    fn update_rejects_out_of_order_without_mutation() {
        let mut registry = TrackRegistry::default();
        registry.update("a", bbox_at(100.0, 100.0), at(10.0)).unwrap();
        let before = registry.state("a", at(10.0)).unwrap();

        let err = registry
            .update("a", bbox_at(500.0, 500.0), at(5.0))
            .unwrap_err();
        assert!(err.is_invalid_input());
        assert_eq!(registry.state("a", at(10.0)).unwrap(), before);
    }

    #[test]
    fn sweep_missed_evicts_after_tolerance() {
        let mut registry = TrackRegistry::default();
        registry.update("b", bbox_at(0.0, 0.0), at(0.0)).unwrap();

        let mut evicted_at = None;
        for tick in 0..11 {
            let secs = 3.0 + 2.0 * tick as f64;
            if !registry.sweep_missed(at(secs)).is_empty() {
                evicted_at = Some(tick + 1);
                break;
            }
        }

        assert_eq!(evicted_at, Some(10));
        assert!(registry.state("b", at(21.0)).is_none());
    }

    #[test]
    fn sweep_missed_ignores_recently_seen() {
        let mut registry = TrackRegistry::default();
        registry.update("a", bbox_at(0.0, 0.0), at(0.0)).unwrap();

        assert!(registry.sweep_missed(at(1.0)).is_empty());
        assert!(registry.sweep_missed(at(2.0)).is_empty());
        assert_eq!(registry.state("a", at(2.0)).unwrap().missed_detections, 0);
    }

    #[test]
    fn update_resets_missed_detections() {
        let mut registry = TrackRegistry::default();
        registry.update("a", bbox_at(0.0, 0.0), at(0.0)).unwrap();
        for tick in 0..9 {
            registry.sweep_missed(at(3.0 + tick as f64));
        }
        assert_eq!(registry.state("a", at(11.0)).unwrap().missed_detections, 9);

        registry.update("a", bbox_at(0.0, 0.0), at(11.5)).unwrap();
        assert_eq!(registry.state("a", at(11.5)).unwrap().missed_detections, 0);

        // A single further miss does not evict
        assert!(registry.sweep_missed(at(14.0)).is_empty());
        assert_eq!(registry.state("a", at(14.0)).unwrap().missed_detections, 1);
    }

    #[test]
    fn active_states_evicts_stale() {
        let mut registry = TrackRegistry::new(TrackerConfig {
            max_missed: u32::MAX,
            ..TrackerConfig::default()
        });
        registry.update("old", bbox_at(0.0, 0.0), at(0.0)).unwrap();
        registry.update("new", bbox_at(0.0, 0.0), at(100.0)).unwrap();

        let active = registry.active_states(at(120.0));
        assert_eq!(active.len(), 2);

        let active = registry.active_states(at(120.5));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].subject, "new");
        assert!(registry.state("old", at(120.5)).is_none());
    }

    #[test]
    fn evict_stale_is_independent_of_missed() {
        let mut registry = TrackRegistry::default();
        registry.update("a", bbox_at(0.0, 0.0), at(0.0)).unwrap();

        // No sweep ever ran so the missed counter is still zero
        assert_eq!(registry.evict_stale(at(121.0)), vec!["a".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn reappearance_after_eviction_restarts_clock() {
        let mut registry = TrackRegistry::default();
        registry.update("a", bbox_at(0.0, 0.0), at(0.0)).unwrap();
        registry.update("a", bbox_at(0.0, 0.0), at(20.0)).unwrap();
        registry.evict_stale(at(200.0));

        let (state, elapsed) = registry.update("a", bbox_at(0.0, 0.0), at(200.0)).unwrap();
        assert_eq!(state, FallState::Monitoring);
        assert_eq!(elapsed, Duration::ZERO);
    }

    #[test]
    fn persistent_states_keeps_recent_and_urgent() {
        let mut registry = TrackRegistry::default();
        registry.update("urgent", bbox_at(0.0, 0.0), at(0.0)).unwrap();
        registry.update("urgent", bbox_at(0.0, 0.0), at(31.0)).unwrap();
        registry.update("recent", bbox_at(0.0, 0.0), at(30.0)).unwrap();
        registry.update("faded", bbox_at(0.0, 0.0), at(20.0)).unwrap();

        let subjects = registry
            .persistent_states(at(40.0))
            .into_iter()
            .map(|snapshot| snapshot.subject)
            .collect::<Vec<_>>();
        assert_eq!(subjects, vec!["urgent".to_string()]);

        let subjects = registry
            .persistent_states(at(34.0))
            .into_iter()
            .map(|snapshot| snapshot.subject)
            .collect::<Vec<_>>();
        assert_eq!(subjects, vec!["urgent".to_string(), "recent".to_string()]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn has_urgent_cases() {
        let mut registry = TrackRegistry::default();
        registry.update("a", bbox_at(0.0, 0.0), at(0.0)).unwrap();
        assert!(!registry.has_urgent_cases());

        registry.update("a", bbox_at(0.0, 0.0), at(31.0)).unwrap();
        assert!(registry.has_urgent_cases());
    }

    #[test]
    fn state_label_and_color() {
        let mut registry = TrackRegistry::default();
        registry.update("a", bbox_at(0.0, 0.0), at(0.0)).unwrap();
        registry.update("a", bbox_at(0.0, 0.0), at(15.0)).unwrap();

        assert_eq!(
            registry.state_label("a", at(15.9)),
            Some("Alert (15s)".to_string())
        );
        assert_eq!(registry.state_color("a"), (0, 165, 255));
        assert_eq!(registry.state_label("missing", at(15.0)), None);
        assert_eq!(registry.state_color("missing"), (128, 128, 128));
    }

    #[test]
    fn mark_recovered_until_next_update() {
        let mut registry = TrackRegistry::default();
        registry.update("a", bbox_at(0.0, 0.0), at(0.0)).unwrap();
        registry.update("a", bbox_at(0.0, 0.0), at(12.0)).unwrap();

        assert!(registry.mark_recovered("a"));
        assert_eq!(
            registry.state("a", at(12.0)).unwrap().state,
            FallState::Recovered
        );
        assert!(!registry.mark_recovered("missing"));

        let (state, _) = registry.update("a", bbox_at(0.0, 0.0), at(13.0)).unwrap();
        assert_eq!(state, FallState::Alert);
    }

    #[test]
    fn mark_recovered_refused_once_sticky_urgent() {
        let mut registry = TrackRegistry::default();
        registry.update("a", bbox_at(0.0, 0.0), at(0.0)).unwrap();
        let (state, _) = registry.update("a", bbox_at(0.0, 0.0), at(31.0)).unwrap();
        assert_eq!(state, FallState::Urgent);

        assert!(!registry.mark_recovered("a"));
        assert_eq!(
            registry.state("a", at(31.5)).unwrap().state,
            FallState::Urgent
        );
        assert!(registry.has_urgent_cases());

        let (state, _) = registry
            .update("a", bbox_at(300.0, 300.0), at(33.0))
            .unwrap();
        assert_eq!(state, FallState::Urgent);
        assert!(registry.state("a", at(33.0)).unwrap().movement_detected);
    }

    #[test]
    fn remove_and_clear() {
        let mut registry = TrackRegistry::default();
        registry.update("a", bbox_at(0.0, 0.0), at(0.0)).unwrap();
        registry.update("b", bbox_at(0.0, 0.0), at(0.0)).unwrap();

        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn shared_registry_serializes_updates() {
        let shared = SharedTrackRegistry::default();
        let handles = (0..4)
            .map(|index| {
                let shared = shared.clone();
                thread::spawn(move || {
                    let subject = format!("subject-{index}");
                    for tick in 0..50 {
                        shared
                            .update(&subject, bbox_at(0.0, 0.0), at(tick as f64))
                            .unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let active = shared.active_states(at(49.0));
        assert_eq!(active.len(), 4);
        assert!(active.iter().all(|snapshot| snapshot.state == FallState::Urgent));
        assert!(shared.has_urgent_cases());
    }
}
