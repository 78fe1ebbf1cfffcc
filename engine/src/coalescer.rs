use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use log::{debug, info, warn};
#[cfg(test)]
use mockall::automock;

use crate::{
    error::{Error, Result},
    models::{AlertFields, AlertSettings, CoalesceStrategy},
};

/// The persistence operations needed to coalesce alerts.
#[cfg_attr(test, automock)]
pub trait AlertStore: Debug {
    /// Gets the id and creation time of the latest alert of `category`.
    fn most_recent_alert(&self, category: &str) -> Result<Option<(i64, SystemTime)>>;

    /// Creates a new alert of `category` at `at` and returns its id.
    fn create_alert(&self, category: &str, fields: &AlertFields, at: SystemTime) -> Result<i64>;

    /// Overwrites the incident fields of alert `id` without moving its creation time.
    fn refresh_alert(&self, id: i64, fields: &AlertFields, at: SystemTime) -> Result<()>;
}

/// The outcome of [`AlertCoalescer::coalesce`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Coalesced {
    Created(i64),
    Refreshed(i64),
}

impl Coalesced {
    pub fn id(self) -> i64 {
        match self {
            Coalesced::Created(id) | Coalesced::Refreshed(id) => id,
        }
    }
}

/// Folds incidents of one category raised close together into a single alert.
///
/// The coalescing window is measured from the creation of the alert, refreshing an
/// alert does not extend it.
#[derive(Debug)]
pub struct AlertCoalescer<S> {
    store: S,
    window: Duration,
    strategy: CoalesceStrategy,
    /// Latest `(id, created at)` per category, only read by [`CoalesceStrategy::LastAlertCache`].
    last_alerts: Mutex<HashMap<String, (i64, SystemTime)>>,
}

impl<S: AlertStore> AlertCoalescer<S> {
    pub fn new(store: S, window: Duration, strategy: CoalesceStrategy) -> Self {
        Self {
            store,
            window,
            strategy,
            last_alerts: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(store: S, settings: &AlertSettings) -> Self {
        Self::new(store, settings.coalesce_window(), settings.strategy)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn strategy(&self) -> CoalesceStrategy {
        self.strategy
    }

    /// Gets the id of the alert of `category` a new incident at `now` should reuse.
    ///
    /// Returns `None` if there is no alert of `category` or the latest one is at least
    /// one window old.
    pub fn should_reuse(&self, category: &str, now: SystemTime) -> Result<Option<i64>> {
        let last_alerts = self.lock();
        self.reusable(&last_alerts, category, now)
    }

    /// Records an alert of `category` created outside of [`Self::coalesce`].
    pub fn record_alert(&self, category: &str, id: i64, at: SystemTime) {
        self.lock().insert(category.to_string(), (id, at));
    }

    /// Refreshes the alert of `category` within the window or creates a new one.
    ///
    /// At most one alert is created per category and window even when called
    /// concurrently.
    pub fn coalesce(
        &self,
        category: &str,
        now: SystemTime,
        fields: &AlertFields,
    ) -> Result<Coalesced> {
        let mut last_alerts = self.lock();

        if let Some(id) = self.reusable(&last_alerts, category, now)? {
            match self.store.refresh_alert(id, fields, now) {
                Ok(()) => {
                    info!(target: "coalescer", "refreshed alert {id} for {category}");
                    return Ok(Coalesced::Refreshed(id));
                }
                Err(Error::NotFound(_)) => {
                    warn!(target: "coalescer", "alert {id} for {category} is gone, creating a new one");
                    last_alerts.remove(category);
                }
                Err(err) => return Err(err),
            }
        }

        let id = self.store.create_alert(category, fields, now)?;
        last_alerts.insert(category.to_string(), (id, now));
        info!(target: "coalescer", "created alert {id} for {category}");

        Ok(Coalesced::Created(id))
    }

    fn reusable(
        &self,
        last_alerts: &HashMap<String, (i64, SystemTime)>,
        category: &str,
        now: SystemTime,
    ) -> Result<Option<i64>> {
        let latest = match self.strategy {
            CoalesceStrategy::LastAlertCache => last_alerts.get(category).copied(),
            CoalesceStrategy::LatestRecord => self.store.most_recent_alert(category)?,
        };
        let Some((id, created_at)) = latest else {
            return Ok(None);
        };

        // A clock earlier than the alert counts as inside the window
        let age = now.duration_since(created_at).unwrap_or_default();
        if age < self.window {
            debug!(target: "coalescer", "alert {id} for {category} is {}ms old, reusing", age.as_millis());
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (i64, SystemTime)>> {
        self.last_alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
