//! Task ledger: one row per dispatched task, kept as an audit trail.
//!
//! All stages share the `_sluice_tasks` table; a [`TaskLedger`] handle is
//! scoped to one stage.

use std::sync::Arc;

use chrono::Duration;
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use tracing::debug;

use crate::domain::{
    ExternalHandle, QueueError, Result, TaskId, TaskRecord, TaskStatus, TaskUpdate,
};
use crate::ports::{IdGenerator, UlidGenerator};
use crate::store::{Store, from_unix, to_unix, validate_name};

const TABLE: &str = "_sluice_tasks";

const COLUMNS: &str = "task_id, stage, status, task_index, claimed_count, external_handle, error, created_at, updated_at";

#[derive(Clone)]
pub struct TaskLedger {
    store: Store,
    stage: String,
    ids: Arc<dyn IdGenerator>,
}

impl std::fmt::Debug for TaskLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLedger").field("stage", &self.stage).finish()
    }
}

impl TaskLedger {
    pub fn open(store: Store, stage: &str) -> Result<Self> {
        validate_name(stage)?;
        store.conn()?.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (\
             task_id TEXT PRIMARY KEY, \
             stage TEXT NOT NULL, \
             status TEXT NOT NULL, \
             task_index INTEGER NOT NULL, \
             claimed_count INTEGER NOT NULL DEFAULT 0, \
             external_handle TEXT, \
             error TEXT, \
             created_at REAL NOT NULL, \
             updated_at REAL NOT NULL);\
             CREATE INDEX IF NOT EXISTS {TABLE}_stage_status ON {TABLE} (stage, status);"
        ))?;
        let ids = Arc::new(UlidGenerator::new(store.clock().clone()));
        Ok(Self {
            store,
            stage: stage.to_string(),
            ids,
        })
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Insert a new task with the next per-stage index.
    pub fn create(&self, status: TaskStatus) -> Result<TaskRecord> {
        let now = self.store.now();
        let task_id = self.ids.generate_task_id();

        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let task_index: i64 = tx.query_row(
            &format!("SELECT COALESCE(MAX(task_index) + 1, 0) FROM {TABLE} WHERE stage = ?1"),
            [&self.stage],
            |row| row.get(0),
        )?;
        tx.execute(
            &format!(
                "INSERT INTO {TABLE} ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, 0, NULL, NULL, ?5, ?5)"
            ),
            params![
                task_id.to_string(),
                self.stage,
                status.as_str(),
                task_index,
                to_unix(now)
            ],
        )?;
        tx.commit()?;

        debug!(stage = %self.stage, task_id = %task_id, task_index, %status, "task created");
        Ok(TaskRecord {
            task_id,
            stage: self.stage.clone(),
            status,
            task_index: task_index as u64,
            claimed_count: 0,
            external_handle: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Merge `update` into a task and refresh its `updated_at`.
    pub fn update(&self, task_id: TaskId, update: TaskUpdate) -> Result<TaskRecord> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut record = tx
            .query_row(
                &format!("SELECT {COLUMNS} FROM {TABLE} WHERE task_id = ?1 AND stage = ?2"),
                params![task_id.to_string(), self.stage],
                decode_row,
            )
            .optional()?
            .ok_or(QueueError::UnknownTask(task_id))??;

        update.apply(&mut record);
        record.updated_at = self.store.now();
        tx.execute(
            &format!(
                "UPDATE {TABLE} SET status = ?1, claimed_count = ?2, external_handle = ?3, \
                 error = ?4, updated_at = ?5 WHERE task_id = ?6"
            ),
            params![
                record.status.as_str(),
                record.claimed_count as i64,
                record.external_handle.as_ref().map(ExternalHandle::as_str),
                record.error,
                to_unix(record.updated_at),
                task_id.to_string()
            ],
        )?;
        tx.commit()?;

        debug!(stage = %self.stage, task_id = %task_id, status = %record.status, "task updated");
        Ok(record)
    }

    pub fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        let conn = self.store.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM {TABLE} WHERE task_id = ?1 AND stage = ?2"),
            params![task_id.to_string(), self.stage],
            decode_row,
        )
        .optional()?
        .transpose()
    }

    /// Every task of this stage, in dispatch order.
    pub fn list(&self) -> Result<Vec<TaskRecord>> {
        self.select("stage = ?1", params![self.stage])
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        self.select("stage = ?1 AND status = ?2", params![self.stage, status.as_str()])
    }

    pub fn count_by_status(&self, status: TaskStatus) -> Result<u64> {
        let conn = self.store.conn()?;
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {TABLE} WHERE stage = ?1 AND status = ?2"),
            params![self.stage, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Tasks in `status` whose last update is younger than `max_age`.
    pub fn count_recent(&self, status: TaskStatus, max_age: Duration) -> Result<u64> {
        let since = self
            .store
            .now()
            .checked_sub_signed(max_age)
            .map_or(f64::MIN, to_unix);
        let conn = self.store.conn()?;
        let n: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {TABLE} WHERE stage = ?1 AND status = ?2 AND updated_at >= ?3"
            ),
            params![self.stage, status.as_str(), since],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Non-terminal tasks not updated for longer than `max_age`.
    ///
    /// Nothing acts on these automatically; a watchdog may resubmit or mark
    /// them failed.
    pub fn stale(&self, max_age: Duration) -> Result<Vec<TaskRecord>> {
        let Some(cutoff) = self.store.now().checked_sub_signed(max_age) else {
            return Ok(Vec::new());
        };
        let cutoff = to_unix(cutoff);
        self.select(
            "stage = ?1 AND status IN ('created', 'submitted', 'started') AND updated_at < ?2",
            params![self.stage, cutoff],
        )
    }

    fn select(&self, condition: &str, params: impl rusqlite::Params) -> Result<Vec<TaskRecord>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM {TABLE} WHERE {condition} ORDER BY task_index"
        ))?;
        let rows = stmt
            .query_map(params, decode_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }
}

/// Stored text that fails to parse surfaces as `Corrupt` through the inner
/// result; the outer one carries rusqlite's own errors.
fn decode_row(row: &Row<'_>) -> rusqlite::Result<Result<TaskRecord>> {
    let raw = RawTask {
        task_id: row.get(0)?,
        stage: row.get(1)?,
        status: row.get(2)?,
        task_index: row.get(3)?,
        claimed_count: row.get(4)?,
        external_handle: row.get(5)?,
        error: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    };
    Ok(raw.into_record())
}

struct RawTask {
    task_id: String,
    stage: String,
    status: String,
    task_index: i64,
    claimed_count: i64,
    external_handle: Option<String>,
    error: Option<String>,
    created_at: f64,
    updated_at: f64,
}

impl RawTask {
    fn into_record(self) -> Result<TaskRecord> {
        let task_id: TaskId = self
            .task_id
            .parse()
            .map_err(|_| QueueError::Corrupt(format!("task id `{}`", self.task_id)))?;
        Ok(TaskRecord {
            task_id,
            stage: self.stage,
            status: self.status.parse().map_err(QueueError::Corrupt)?,
            task_index: self.task_index as u64,
            claimed_count: self.claimed_count as u64,
            external_handle: self.external_handle.map(ExternalHandle::new),
            error: self.error,
            created_at: from_unix(self.created_at)?,
            updated_at: from_unix(self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::ports::ManualClock;

    fn ledger() -> (TaskLedger, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let store = Store::in_memory_with_clock(Arc::new(clock.clone())).unwrap();
        (store.ledger("transform").unwrap(), clock)
    }

    #[test]
    fn create_assigns_increasing_task_index() {
        let (ledger, _) = ledger();
        let a = ledger.create(TaskStatus::Created).unwrap();
        let b = ledger.create(TaskStatus::Created).unwrap();
        assert_eq!((a.task_index, b.task_index), (0, 1));
        assert_ne!(a.task_id, b.task_id);
        assert_eq!(ledger.get(a.task_id).unwrap(), Some(a));
    }

    struct FixedIds(ulid::Ulid);

    impl IdGenerator for FixedIds {
        fn generate_task_id(&self) -> TaskId {
            TaskId::from(self.0)
        }
    }

    #[test]
    fn task_ids_come_from_the_generator() {
        let (ledger, _) = ledger();
        let ulid = ulid::Ulid::from_parts(1, 7);
        let ledger = ledger.with_id_generator(Arc::new(FixedIds(ulid)));

        let task = ledger.create(TaskStatus::Created).unwrap();
        assert_eq!(task.task_id, TaskId::from(ulid));
        // Same id twice violates the primary key.
        assert!(matches!(
            ledger.create(TaskStatus::Created),
            Err(QueueError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn task_index_is_per_stage() {
        let (ledger, _) = ledger();
        ledger.create(TaskStatus::Created).unwrap();
        let other = ledger.store.ledger("load").unwrap();
        assert_eq!(other.create(TaskStatus::Created).unwrap().task_index, 0);
        assert_eq!(ledger.list().unwrap().len(), 1);
    }

    #[test]
    fn update_merges_fields_and_refreshes_timestamp() {
        let (ledger, clock) = ledger();
        let task = ledger.create(TaskStatus::Created).unwrap();
        clock.advance(Duration::seconds(5));

        let updated = ledger
            .update(
                task.task_id,
                TaskUpdate::status(TaskStatus::Submitted).with_handle(ExternalHandle::new("job-7")),
            )
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Submitted);
        assert_eq!(updated.updated_at - task.updated_at, Duration::seconds(5));

        let done = ledger
            .update(task.task_id, TaskUpdate::status(TaskStatus::Done).with_claimed(12))
            .unwrap();
        assert_eq!(done.claimed_count, 12);
        assert_eq!(done.external_handle, Some(ExternalHandle::new("job-7")));
        assert_eq!(ledger.get(task.task_id).unwrap(), Some(done));
    }

    #[test]
    fn update_of_unknown_task_fails() {
        let (ledger, _) = ledger();
        let missing = TaskId::from(ulid::Ulid::new());
        let err = ledger
            .update(missing, TaskUpdate::status(TaskStatus::Done))
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownTask(id) if id == missing));
    }

    #[test]
    fn list_and_count_by_status() {
        let (ledger, _) = ledger();
        let a = ledger.create(TaskStatus::Created).unwrap();
        ledger.create(TaskStatus::Created).unwrap();
        ledger
            .update(a.task_id, TaskUpdate::status(TaskStatus::Failed).with_error("boom"))
            .unwrap();

        assert_eq!(ledger.count_by_status(TaskStatus::Created).unwrap(), 1);
        let failed = ledger.list_by_status(TaskStatus::Failed).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn unbounded_windows_do_not_overflow() {
        let (ledger, _) = ledger();
        ledger.create(TaskStatus::Submitted).unwrap();
        assert_eq!(ledger.count_recent(TaskStatus::Submitted, Duration::MAX).unwrap(), 1);
        assert!(ledger.stale(Duration::MAX).unwrap().is_empty());
    }

    #[test]
    fn stale_reports_only_old_unfinished_tasks() {
        let (ledger, clock) = ledger();
        let old = ledger.create(TaskStatus::Submitted).unwrap();
        let finished = ledger.create(TaskStatus::Started).unwrap();
        ledger
            .update(finished.task_id, TaskUpdate::status(TaskStatus::Done))
            .unwrap();
        clock.advance(Duration::minutes(10));
        let fresh = ledger.create(TaskStatus::Started).unwrap();

        let stale = ledger.stale(Duration::minutes(5)).unwrap();
        assert_eq!(stale.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![old.task_id]);
        assert_eq!(ledger.count_recent(TaskStatus::Started, Duration::minutes(5)).unwrap(), 1);
        assert_ne!(fresh.task_id, old.task_id);
    }
}
