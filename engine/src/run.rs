use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, warn};
use serde_json::json;

use crate::{
    coalescer::{AlertCoalescer, AlertStore, Coalesced},
    detect::{DetectionFilter, DetectionKind, Frame, FrameSource},
    error::Result,
    models::{AlertFields, Settings},
    tracker::{BoundingBox, TrackRegistry, TrackerConfig},
    urgency::FallState,
};

/// A tracked subject whose state escalated into an alerting state.
#[derive(Clone, Debug, PartialEq)]
pub struct FallIncident {
    pub subject: String,
    pub state: FallState,
    pub elapsed: Duration,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// The state of one subject after a frame updated it.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackUpdate {
    pub subject: String,
    pub state: FallState,
    pub elapsed: Duration,
}

/// The alert outcome of one [`FallIncident`].
#[derive(Clone, Debug, PartialEq)]
pub struct IncidentAlert {
    pub incident: FallIncident,
    pub outcome: Coalesced,
}

/// Everything a processed frame changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReport {
    pub updates: Vec<TrackUpdate>,
    pub recovered: Vec<String>,
    pub evicted: Vec<String>,
    pub alerts: Vec<IncidentAlert>,
    /// Number of detections skipped for being invalid.
    pub rejected: usize,
}

/// Drives a [`TrackRegistry`] from the frames of one source and raises alerts.
#[derive(Debug)]
pub struct Monitor<S> {
    category: String,
    description: String,
    registry: TrackRegistry,
    filter: DetectionFilter,
    coalescer: Arc<AlertCoalescer<S>>,
}

impl<S: AlertStore> Monitor<S> {
    pub fn new(
        category: impl Into<String>,
        config: TrackerConfig,
        filter: DetectionFilter,
        coalescer: Arc<AlertCoalescer<S>>,
    ) -> Self {
        Self {
            category: category.into(),
            description: "Fall detected".to_string(),
            registry: TrackRegistry::new(config),
            filter,
            coalescer,
        }
    }

    /// Creates a monitor for the source category configured in `settings`.
    pub fn from_settings(settings: &Settings, coalescer: Arc<AlertCoalescer<S>>) -> Self {
        let mut monitor = Self::new(
            settings.alerts.category.clone(),
            TrackerConfig::from(&settings.tracker),
            DetectionFilter::from(&settings.detection),
            coalescer,
        );
        monitor.description = settings.alerts.description.clone();
        monitor
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn registry(&self) -> &TrackRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TrackRegistry {
        &mut self.registry
    }

    /// Processes the detections of one frame.
    ///
    /// Invalid detections are logged and skipped. A failure to persist an alert is
    /// logged and does not abort the frame.
    pub fn process_frame(&mut self, frame: &Frame) -> FrameReport {
        let now = frame.captured_at;
        let mut report = FrameReport::default();
        let mut incidents = Vec::new();

        for detection in frame.detections.iter() {
            let kind = match self.filter.classify(detection) {
                Ok(kind) => kind,
                Err(err) => {
                    warn!(target: "monitor", "skipped detection: {err}");
                    report.rejected += 1;
                    continue;
                }
            };

            match kind {
                DetectionKind::Fall => {
                    let previous = self
                        .registry
                        .state(&detection.subject, now)
                        .map(|snapshot| snapshot.state)
                        .unwrap_or_default();
                    let (state, elapsed) =
                        match self.registry.update(&detection.subject, detection.bbox, now) {
                            Ok(result) => result,
                            Err(err) => {
                                warn!(target: "monitor", "skipped detection: {err}");
                                report.rejected += 1;
                                continue;
                            }
                        };

                    if state.is_alerting() && state.severity() > previous.severity() {
                        if state == FallState::Urgent {
                            warn!(target: "monitor", "{} needs help, on the ground for {}s", detection.subject, elapsed.as_secs());
                        }
                        incidents.push(FallIncident {
                            subject: detection.subject.clone(),
                            state,
                            elapsed,
                            confidence: detection.confidence,
                            bbox: detection.bbox,
                        });
                    }
                    report.updates.push(TrackUpdate {
                        subject: detection.subject.clone(),
                        state,
                        elapsed,
                    });
                }
                DetectionKind::Recovered => {
                    if self.registry.mark_recovered(&detection.subject) {
                        report.recovered.push(detection.subject.clone());
                    }
                }
                DetectionKind::Ignored => (),
            }
        }

        report.evicted = self.registry.sweep_missed(now);
        report.evicted.extend(self.registry.evict_stale(now));

        for incident in incidents {
            let fields = self.alert_fields(&incident, frame.snapshot.clone());
            match self.coalescer.coalesce(&self.category, now, &fields) {
                Ok(outcome) => report.alerts.push(IncidentAlert { incident, outcome }),
                Err(err) => {
                    error!(target: "monitor", "failed to raise alert for {}: {err}", incident.subject);
                }
            }
        }

        report
    }

    /// Processes frames from `source` until it is exhausted.
    ///
    /// When `fps` is set, frames are paced to that rate. Returns the number of frames
    /// processed.
    pub fn run(
        &mut self,
        source: &mut impl FrameSource,
        fps: Option<u32>,
        mut on_report: impl FnMut(&FrameReport),
    ) -> Result<usize> {
        let mut frames = 0;

        loop_with_fps(fps, || {
            let Some(frame) = source.next_frame()? else {
                return Ok(false);
            };

            let report = self.process_frame(&frame);
            on_report(&report);
            frames += 1;
            Ok(true)
        })?;

        debug!(target: "monitor", "{} source exhausted after {frames} frames", self.category);
        Ok(frames)
    }

    fn alert_fields(&self, incident: &FallIncident, snapshot: Option<Vec<u8>>) -> AlertFields {
        let elapsed = incident.elapsed.as_secs_f64();

        AlertFields {
            description: format!(
                "{} ({}, {}s on the ground)",
                self.description,
                incident.state.info().display,
                incident.elapsed.as_secs()
            ),
            confidence: Some(incident.confidence),
            class_name: self.filter.fall_class().to_string(),
            metadata: Some(json!({
                "subject": incident.subject,
                "bbox": incident.bbox,
                "state": incident.state,
                "time_on_ground": elapsed,
                "needs_help": incident.state.info().needs_help,
            })),
            fall_state: Some(incident.state),
            time_on_ground_secs: Some(elapsed),
            subject: Some(incident.subject.clone()),
            snapshot,
        }
    }
}

/// Calls `on_tick` until it returns `false`, sleeping between ticks to hold `fps`.
///
/// Without `fps`, ticks run back to back.
fn loop_with_fps(fps: Option<u32>, mut on_tick: impl FnMut() -> Result<bool>) -> Result<()> {
    let nanos_per_frame = fps
        .filter(|fps| *fps > 0)
        .map(|fps| (1_000_000_000 / fps) as u128);

    loop {
        let start = Instant::now();

        if !on_tick()? {
            return Ok(());
        }

        let Some(nanos_per_frame) = nanos_per_frame else {
            continue;
        };
        let elapsed_nanos = start.elapsed().as_nanos();
        if elapsed_nanos <= nanos_per_frame {
            thread::sleep(Duration::new(0, (nanos_per_frame - elapsed_nanos) as u32));
        } else {
            debug!(target: "monitor", "ticking running late at {}ms", elapsed_nanos / 1_000_000);
        }
    }
}
