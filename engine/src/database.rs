use std::{
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine, prelude::BASE64_STANDARD};
use log::{debug, error, info};
use rusqlite::{
    Connection, OptionalExtension, Params, params_from_iter,
    types::{Null, Value},
};
use tokio::sync::broadcast::{Receiver, Sender, channel};

use crate::{
    coalescer::AlertStore,
    error::{Error, Result},
    models::{AlertFields, AlertFilter, FallAlert, TEST_UPLOAD},
};

const ALERTS: &str = "alerts";

#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum DatabaseEvent {
    AlertCreated(FallAlert),
    AlertUpdated(FallAlert),
    AlertDeleted(i64),
}

pub trait Identifiable {
    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);
}

#[macro_export]
macro_rules! impl_identifiable {
    ($type:ty) => {
        impl $crate::database::Identifiable for $type {
            fn id(&self) -> Option<i64> {
                self.id
            }

            fn set_id(&mut self, id: i64) {
                self.id = Some(id);
            }
        }
    };
}

/// SQLite backed storage of [`FallAlert`]s.
///
/// Each row keeps the alert as JSON next to the columns it is queried by. Snapshots are
/// kept out of the JSON in their own column.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    events: Sender<DatabaseEvent>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {ALERTS} (
                id INTEGER PRIMARY KEY,
                detected_by TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                acknowledged INTEGER NOT NULL DEFAULT 0,
                snapshot BLOB,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {ALERTS}_detected_by_timestamp
                ON {ALERTS} (detected_by, timestamp);
            "#
        ))?;

        Ok(Self {
            conn: Mutex::new(conn),
            events: channel(16).0,
        })
    }

    pub fn subscribe(&self) -> Receiver<DatabaseEvent> {
        self.events.subscribe()
    }

    /// Inserts `alert` and assigns its id.
    pub fn insert_alert(&self, alert: &mut FallAlert) -> Result<i64> {
        let json = serde_json::to_string(&alert)?;
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO {ALERTS} (id, detected_by, timestamp, acknowledged, snapshot, data) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6);"
            ),
            (
                Null,
                &alert.detected_by,
                to_millis(alert.timestamp),
                alert.acknowledged,
                &alert.snapshot,
                &json,
            ),
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        alert.set_id(id);
        debug!(target: "database", "inserted alert {id} for {}", alert.detected_by);
        let _ = self.events.send(DatabaseEvent::AlertCreated(alert.clone()));
        Ok(id)
    }

    pub fn query_alert(&self, id: i64) -> Result<Option<FallAlert>> {
        let conn = self.lock();
        query_one(
            &conn,
            &format!("SELECT id, snapshot, data FROM {ALERTS} WHERE id = ?1;"),
            [id],
        )
    }

    /// Lists alerts matching `filter`, newest first.
    pub fn query_alerts(&self, filter: &AlertFilter) -> Result<Vec<FallAlert>> {
        let mut conditions = Vec::new();
        let mut params = Vec::<Value>::new();
        if !filter.include_tests {
            conditions.push("detected_by != ?".to_string());
            params.push(Value::Text(TEST_UPLOAD.to_string()));
        }
        if !filter.detected_by.is_empty() {
            let placeholders = vec!["?"; filter.detected_by.len()].join(", ");
            conditions.push(format!("detected_by IN ({placeholders})"));
            params.extend(filter.detected_by.iter().cloned().map(Value::Text));
        }
        if let Some(acknowledged) = filter.acknowledged {
            conditions.push("acknowledged = ?".to_string());
            params.push(Value::Integer(acknowledged as i64));
        }

        let mut sql = format!("SELECT id, snapshot, data FROM {ALERTS}");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let conn = self.lock();
        query_all(&conn, &sql, params_from_iter(params))
    }

    /// Gets the most recently created alert of `category`.
    pub fn latest_alert(&self, category: &str) -> Result<Option<FallAlert>> {
        let conn = self.lock();
        query_one(
            &conn,
            &format!(
                "SELECT id, snapshot, data FROM {ALERTS} WHERE detected_by = ?1 \
                 ORDER BY timestamp DESC, id DESC LIMIT 1;"
            ),
            [category],
        )
    }

    pub fn update_alert(&self, alert: &FallAlert) -> Result<()> {
        let Some(id) = alert.id() else {
            return Err(Error::invalid("cannot update an alert without id"));
        };

        write_alert(&self.lock(), id, alert)?;
        let _ = self.events.send(DatabaseEvent::AlertUpdated(alert.clone()));
        Ok(())
    }

    /// Marks alert `id` as reviewed by `user`, optionally recording its accuracy.
    pub fn acknowledge_alert(
        &self,
        id: i64,
        user: &str,
        at: SystemTime,
        is_accurate: Option<bool>,
    ) -> Result<FallAlert> {
        let alert = self.modify_alert(id, |alert| {
            alert.mark_acknowledged(user, at);
            if let Some(is_accurate) = is_accurate {
                alert.mark_accuracy(user, is_accurate, at);
            }
        })?;
        info!(target: "database", "alert {id} acknowledged by {user}");

        Ok(alert)
    }

    pub fn mark_alert_accuracy(
        &self,
        id: i64,
        user: &str,
        is_accurate: bool,
        at: SystemTime,
    ) -> Result<FallAlert> {
        self.modify_alert(id, |alert| alert.mark_accuracy(user, is_accurate, at))
    }

    pub fn delete_alert(&self, id: i64) -> Result<()> {
        let deleted = self
            .lock()
            .execute(&format!("DELETE FROM {ALERTS} WHERE id = ?1;"), [id])?;
        if deleted == 0 {
            return Err(Error::NotFound(id));
        }

        let _ = self.events.send(DatabaseEvent::AlertDeleted(id));
        Ok(())
    }

    /// Reads, modifies then writes back alert `id` while holding the connection.
    fn modify_alert(&self, id: i64, f: impl FnOnce(&mut FallAlert)) -> Result<FallAlert> {
        let conn = self.lock();
        let mut alert = query_one(
            &conn,
            &format!("SELECT id, snapshot, data FROM {ALERTS} WHERE id = ?1;"),
            [id],
        )?
        .ok_or(Error::NotFound(id))?;

        f(&mut alert);
        write_alert(&conn, id, &alert)?;
        drop(conn);

        let _ = self.events.send(DatabaseEvent::AlertUpdated(alert.clone()));
        Ok(alert)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AlertStore for Database {
    fn most_recent_alert(&self, category: &str) -> Result<Option<(i64, SystemTime)>> {
        Ok(self
            .latest_alert(category)?
            .and_then(|alert| alert.id().map(|id| (id, alert.timestamp))))
    }

    fn create_alert(&self, category: &str, fields: &AlertFields, at: SystemTime) -> Result<i64> {
        let mut alert = FallAlert::new(category, fields, at);
        self.insert_alert(&mut alert).inspect_err(|err| {
            error!(target: "database", "failed to create alert for {category}: {err}");
        })
    }

    fn refresh_alert(&self, id: i64, fields: &AlertFields, at: SystemTime) -> Result<()> {
        self.modify_alert(id, |alert| {
            alert.refresh(fields);
            alert.updated_at = Some(at);
        })
        .inspect_err(|err| {
            error!(target: "database", "failed to refresh alert {id}: {err}");
        })
        .map(|_| ())
    }
}

/// Decodes a snapshot sent as `data:<mime>;base64,<payload>` or as bare base64.
///
/// Returns `None` if the payload is not valid base64.
pub fn decode_data_url(value: &str) -> Option<Vec<u8>> {
    let payload = match value.split_once(',') {
        Some((header, payload)) if header.starts_with("data:") => payload,
        Some(_) => return None,
        None => value,
    };

    BASE64_STANDARD.decode(payload.trim()).ok()
}

fn to_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}

fn write_alert(conn: &Connection, id: i64, alert: &FallAlert) -> Result<()> {
    let json = serde_json::to_string(alert)?;
    let updated = conn.execute(
        &format!(
            "UPDATE {ALERTS} SET detected_by = ?2, timestamp = ?3, acknowledged = ?4, \
             snapshot = ?5, data = ?6 WHERE id = ?1;"
        ),
        (
            id,
            &alert.detected_by,
            to_millis(alert.timestamp),
            alert.acknowledged,
            &alert.snapshot,
            &json,
        ),
    )?;
    if updated == 0 {
        return Err(Error::NotFound(id));
    }

    Ok(())
}

type AlertRow = (i64, Option<Vec<u8>>, String);

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn into_alert((id, snapshot, data): AlertRow) -> Result<FallAlert> {
    let mut alert = serde_json::from_str::<FallAlert>(&data)?;
    alert.set_id(id);
    alert.snapshot = snapshot;
    Ok(alert)
}

fn query_one(conn: &Connection, sql: &str, params: impl Params) -> Result<Option<FallAlert>> {
    conn.query_row(sql, params, map_row)
        .optional()?
        .map(into_alert)
        .transpose()
}

fn query_all(conn: &Connection, sql: &str, params: impl Params) -> Result<Vec<FallAlert>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter().map(into_alert).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        models::{LIVE_CAMERA, TEST_UPLOAD},
        urgency::FallState,
    };

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn fields(confidence: f32) -> AlertFields {
        AlertFields {
            description: "Fall detected".to_string(),
            confidence: Some(confidence),
            class_name: "Fall-Detected".to_string(),
            fall_state: Some(FallState::Alert),
            subject: Some("1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn insert_and_query_alert() {
        let db = Database::open_in_memory().unwrap();
        let mut alert = FallAlert::new(
            LIVE_CAMERA,
            &AlertFields {
                snapshot: Some(vec![0xff, 0xd8]),
                ..fields(0.8)
            },
            at(0),
        );

        let id = db.insert_alert(&mut alert).unwrap();
        assert_eq!(alert.id, Some(id));

        let stored = db.query_alert(id).unwrap().unwrap();
        assert_eq!(stored, alert);
        assert_eq!(stored.snapshot, Some(vec![0xff, 0xd8]));
        assert!(db.query_alert(id + 1).unwrap().is_none());
    }

    #[test]
    fn query_alerts_newest_first_with_filter() {
        let db = Database::open_in_memory().unwrap();
        for (category, secs) in [(LIVE_CAMERA, 0), (TEST_UPLOAD, 10), (LIVE_CAMERA, 20)] {
            db.create_alert(category, &fields(0.9), at(secs)).unwrap();
        }
        db.acknowledge_alert(1, "nurse", at(30), None).unwrap();

        let alerts = db.query_alerts(&AlertFilter::default()).unwrap();
        assert_eq!(
            alerts.iter().map(|alert| alert.id).collect::<Vec<_>>(),
            vec![Some(3), Some(1)]
        );

        let pending = db
            .query_alerts(&AlertFilter {
                acknowledged: Some(false),
                include_tests: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            pending.iter().map(|alert| alert.id).collect::<Vec<_>>(),
            vec![Some(3), Some(2)]
        );

        let limited = db
            .query_alerts(&AlertFilter {
                include_tests: true,
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, Some(3));
    }

    #[test]
    fn query_alerts_filters_category_and_acknowledged_in_sql() {
        let db = Database::open_in_memory().unwrap();
        for (category, secs) in [
            (LIVE_CAMERA, 0),
            ("ward_b", 5),
            (TEST_UPLOAD, 10),
            (LIVE_CAMERA, 20),
            ("ward_b", 25),
        ] {
            db.create_alert(category, &fields(0.9), at(secs)).unwrap();
        }
        db.acknowledge_alert(4, "nurse", at(30), Some(true)).unwrap();
        db.acknowledge_alert(5, "nurse", at(30), None).unwrap();

        let ids = |filter: AlertFilter| {
            db.query_alerts(&filter)
                .unwrap()
                .into_iter()
                .map(|alert| alert.id.unwrap())
                .collect::<Vec<_>>()
        };

        assert_eq!(
            ids(AlertFilter {
                detected_by: vec![LIVE_CAMERA.to_string(), "ward_b".to_string()],
                ..Default::default()
            }),
            vec![5, 4, 2, 1]
        );
        assert_eq!(
            ids(AlertFilter {
                detected_by: vec![TEST_UPLOAD.to_string()],
                ..Default::default()
            }),
            Vec::<i64>::new()
        );
        assert_eq!(
            ids(AlertFilter {
                acknowledged: Some(true),
                ..Default::default()
            }),
            vec![5, 4]
        );
        assert_eq!(
            ids(AlertFilter {
                detected_by: vec!["ward_b".to_string()],
                acknowledged: Some(false),
                limit: Some(5),
                ..Default::default()
            }),
            vec![2]
        );
        assert_eq!(
            ids(AlertFilter {
                limit: Some(0),
                ..Default::default()
            }),
            Vec::<i64>::new()
        );

        let conn = db.lock();
        let acknowledged = conn
            .query_row(
                &format!("SELECT acknowledged FROM {ALERTS} WHERE id = 4;"),
                [],
                |row| row.get::<_, bool>(0),
            )
            .unwrap();
        assert!(acknowledged);
    }

    #[test]
    fn latest_alert_per_category() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.latest_alert(LIVE_CAMERA).unwrap().is_none());

        db.create_alert(LIVE_CAMERA, &fields(0.8), at(0)).unwrap();
        let id = db.create_alert(LIVE_CAMERA, &fields(0.9), at(40)).unwrap();
        db.create_alert(TEST_UPLOAD, &fields(0.9), at(50)).unwrap();

        assert_eq!(
            db.most_recent_alert(LIVE_CAMERA).unwrap(),
            Some((id, at(40)))
        );
    }

    #[test]
    fn acknowledge_and_accuracy_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_alert(LIVE_CAMERA, &fields(0.8), at(0)).unwrap();

        db.acknowledge_alert(id, "nurse", at(60), Some(true))
            .unwrap();
        db.mark_alert_accuracy(id, "doctor", false, at(90)).unwrap();

        let alert = db.query_alert(id).unwrap().unwrap();
        assert!(alert.acknowledged);
        assert_eq!(alert.acknowledged_by.as_deref(), Some("nurse"));
        assert_eq!(alert.acknowledged_at, Some(at(60)));
        assert_eq!(alert.is_accurate, Some(false));
        assert_eq!(alert.accuracy_marked_by.as_deref(), Some("doctor"));
        assert_eq!(alert.accuracy_marked_at, Some(at(90)));
    }

    #[test]
    fn refresh_alert_keeps_creation_time() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_alert(LIVE_CAMERA, &fields(0.8), at(0)).unwrap();

        db.refresh_alert(
            id,
            &AlertFields {
                fall_state: Some(FallState::Urgent),
                ..fields(0.95)
            },
            at(10),
        )
        .unwrap();

        let alert = db.query_alert(id).unwrap().unwrap();
        assert_eq!(alert.timestamp, at(0));
        assert_eq!(alert.updated_at, Some(at(10)));
        assert_eq!(alert.confidence, Some(0.95));
        assert_eq!(alert.fall_state, Some(FallState::Urgent));
    }

    #[test]
    fn refresh_alert_with_lower_severity_keeps_urgent() {
        let db = Database::open_in_memory().unwrap();
        let urgent = AlertFields {
            fall_state: Some(FallState::Urgent),
            time_on_ground_secs: Some(31.0),
            ..fields(0.8)
        };
        let id = db.create_alert(LIVE_CAMERA, &urgent, at(0)).unwrap();

        db.refresh_alert(
            id,
            &AlertFields {
                time_on_ground_secs: Some(11.0),
                subject: Some("2".to_string()),
                snapshot: Some(vec![7]),
                ..fields(0.9)
            },
            at(5),
        )
        .unwrap();

        let alert = db.query_alert(id).unwrap().unwrap();
        assert_eq!(alert.fall_state, Some(FallState::Urgent));
        assert_eq!(alert.subject.as_deref(), Some("1"));
        assert_eq!(alert.time_on_ground_secs, Some(31.0));
        assert_eq!(alert.confidence, Some(0.9));
        assert_eq!(alert.snapshot, Some(vec![7]));
        assert_eq!(alert.updated_at, Some(at(5)));
    }

    #[test]
    fn mutations_on_missing_alert_are_not_found() {
        let db = Database::open_in_memory().unwrap();

        assert!(matches!(
            db.acknowledge_alert(7, "nurse", at(0), None),
            Err(Error::NotFound(7))
        ));
        assert!(matches!(db.delete_alert(7), Err(Error::NotFound(7))));
        assert!(matches!(
            db.refresh_alert(7, &fields(0.8), at(0)),
            Err(Error::NotFound(7))
        ));

        let alert = FallAlert::new(LIVE_CAMERA, &fields(0.8), at(0));
        assert!(db.update_alert(&alert).unwrap_err().is_invalid_input());
    }

    #[test]
    fn update_alert_overwrites_record() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_alert(LIVE_CAMERA, &fields(0.8), at(0)).unwrap();
        let mut alert = db.query_alert(id).unwrap().unwrap();

        alert.description = "Resident found on the floor".to_string();
        alert.snapshot = Some(vec![1, 2, 3]);
        db.update_alert(&alert).unwrap();

        assert_eq!(db.query_alert(id).unwrap().unwrap(), alert);
    }

    #[test]
    fn delete_alert() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_alert(LIVE_CAMERA, &fields(0.8), at(0)).unwrap();

        db.delete_alert(id).unwrap();
        assert!(db.query_alert(id).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_receives_events() {
        let db = Database::open_in_memory().unwrap();
        let mut receiver = db.subscribe();

        let id = db.create_alert(LIVE_CAMERA, &fields(0.8), at(0)).unwrap();
        db.acknowledge_alert(id, "nurse", at(5), None).unwrap();
        db.delete_alert(id).unwrap();

        assert!(matches!(
            receiver.recv().await.unwrap(),
            DatabaseEvent::AlertCreated(alert) if alert.id == Some(id)
        ));
        assert!(matches!(
            receiver.recv().await.unwrap(),
            DatabaseEvent::AlertUpdated(alert) if alert.acknowledged
        ));
        assert!(matches!(
            receiver.recv().await.unwrap(),
            DatabaseEvent::AlertDeleted(deleted) if deleted == id
        ));
    }

    #[test]
    fn decode_data_url_variants() {
        assert_eq!(
            decode_data_url("data:image/jpeg;base64,/9g="),
            Some(vec![0xff, 0xd8])
        );
        assert_eq!(decode_data_url("/9g="), Some(vec![0xff, 0xd8]));
        assert_eq!(decode_data_url("data:image/jpeg;base64,@@@"), None);
        assert_eq!(decode_data_url("garbage,/9g="), None);
    }
}
