mod coalescer;
mod database;
mod detect;
mod error;
mod models;
mod run;
mod tracker;
mod urgency;

pub use {
    coalescer::{AlertCoalescer, AlertStore, Coalesced},
    database::{Database, DatabaseEvent, Identifiable, decode_data_url},
    detect::{Detection, DetectionFilter, DetectionKind, Frame, FrameSource},
    error::{Error, Result},
    models::*,
    run::{FallIncident, FrameReport, IncidentAlert, Monitor, TrackUpdate},
    strum::{IntoEnumIterator, ParseError},
    tracker::{
        BoundingBox, PersonState, Point, SharedTrackRegistry, TrackRegistry, TrackSnapshot,
        TrackerConfig,
    },
    urgency::{FallState, NeedsHelp, StateInfo, UNKNOWN_STATE_INFO, UrgencyThresholds, classify},
};
