//! Durable ack queue over one `SQLite` table.
//!
//! Table layout: `_id INTEGER PRIMARY KEY AUTOINCREMENT`, `_ts REAL` (insert
//! time, then the time of the last status change), `_status INTEGER`, plus
//! one column per payload field seen so far.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, Row, Rows, Statement, TransactionBehavior, params};
use serde::Deserialize;
use tracing::{debug, info};

use super::schema::SchemaRegistry;
use super::{ID_COLUMN, STATUS_COLUMN, TS_COLUMN};
use crate::app::status::QueueCounts;
use crate::domain::value::validate_field_name;
use crate::domain::{
    ColumnType, FieldValue, ItemId, ItemStatus, Lease, QueueError, QueueItem, Record, Result,
};
use crate::store::{
    Store, from_unix, is_duplicate_column, quote_ident, to_unix, validate_name,
};

const PENDING: i64 = 1;
const LEASED: i64 = 2;

/// Per-queue settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// A lease older than this is returned to pending by the sweep.
    pub lease_timeout_secs: f64,

    /// Chance that an eligible call actually runs the sweep.
    pub sweep_probability: f64,

    /// How long `count()` may serve a memoised value.
    pub count_ttl_secs: f64,

    /// `put` blocks while the queue holds at least this many records.
    pub max_size: Option<u64>,

    /// Physically remove rows once acked.
    pub delete_on_ack: bool,

    pub backpressure_poll_ms: u64,

    /// Payload column with a uniqueness constraint; duplicate inserts are ignored.
    pub unique_column: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            lease_timeout_secs: 300.0,
            sweep_probability: 0.05,
            count_ttl_secs: 10.0,
            max_size: None,
            delete_on_ack: false,
            backpressure_poll_ms: 1_000,
            unique_column: None,
        }
    }
}

impl QueueOptions {
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_sweep_probability(mut self, probability: f64) -> Self {
        self.sweep_probability = probability;
        self
    }

    pub fn with_unique_column(mut self, column: impl Into<String>) -> Self {
        self.unique_column = Some(column.into());
        self
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn with_delete_on_ack(mut self, delete_on_ack: bool) -> Self {
        self.delete_on_ack = delete_on_ack;
        self
    }

    pub fn with_backpressure_poll(mut self, poll: Duration) -> Self {
        self.backpressure_poll_ms = poll.as_millis() as u64;
        self
    }

    pub fn with_count_ttl(mut self, ttl: Duration) -> Self {
        self.count_ttl_secs = ttl.as_secs_f64();
        self
    }

    /// Saturates at the largest representable duration.
    pub fn lease_timeout(&self) -> chrono::Duration {
        let micros = self.lease_timeout_secs.max(0.0) * 1_000_000.0;
        if micros < i64::MAX as f64 {
            chrono::Duration::microseconds(micros as i64)
        } else {
            chrono::Duration::MAX
        }
    }

    pub fn count_ttl(&self) -> Duration {
        Duration::try_from_secs_f64(self.count_ttl_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_ms.max(1))
    }
}

/// A named durable queue with lease/ack semantics.
///
/// Handles are `Send + Sync`; share one behind an `Arc` between tasks of the
/// same process, or open another handle through a separate [`Store`] on the
/// same file from another process.
pub struct AckQueue {
    store: Store,
    name: String,
    table: String,
    options: QueueOptions,
    schema: Mutex<SchemaRegistry>,
    count_cache: Mutex<Option<(Instant, u64)>>,
    last_sweep: Mutex<Option<DateTime<Utc>>>,
    indexed: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for AckQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckQueue")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl AckQueue {
    /// Open a queue, creating its table and indexes if needed.
    pub fn open(store: Store, name: &str, mut options: QueueOptions) -> Result<Self> {
        validate_name(name)?;
        if let Some(column) = &options.unique_column {
            validate_field_name(column).map_err(|_| QueueError::InvalidName(column.clone()))?;
        }
        options.sweep_probability = options.sweep_probability.clamp(0.0, 1.0);

        let table = quote_ident(name);
        let schema = {
            let mut conn = store.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 _id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 _ts REAL NOT NULL, \
                 _status INTEGER NOT NULL);\
                 CREATE INDEX IF NOT EXISTS {index} ON {table} (_status);",
                index = quote_ident(&format!("{name}__status_idx")),
            ))?;

            let mut schema = SchemaRegistry::load(&tx, name)?;
            if let Some(column) = &options.unique_column {
                if !schema.contains(column) {
                    add_column(&tx, &table, column, None)?;
                }
                tx.execute_batch(&format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS {index} ON {table} ({col});",
                    index = quote_ident(&format!("{name}__{column}_uniq")),
                    col = quote_ident(column),
                ))?;
                schema = SchemaRegistry::load(&tx, name)?;
            }
            tx.commit()?;
            schema
        };

        debug!(queue = name, columns = schema.len(), "opened queue");
        Ok(Self {
            store,
            name: name.to_string(),
            table,
            options,
            schema: Mutex::new(schema),
            count_cache: Mutex::new(None),
            last_sweep: Mutex::new(None),
            indexed: Mutex::new(HashSet::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Quoted table identifier, for composing joins.
    pub(crate) fn table(&self) -> &str {
        &self.table
    }

    /// Snapshot of the known payload columns.
    pub fn schema(&self) -> Result<SchemaRegistry> {
        Ok(self.schema_guard()?.clone())
    }

    /// Insert records. Returns how many rows were stored; rows whose dedup
    /// column value already exists are skipped.
    ///
    /// The batch is validated as a whole: an empty record, a bad field name
    /// or a type conflict aborts the call with nothing inserted. Blocks while
    /// the queue is at `max_size`.
    pub fn put(&self, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        // Fail fast on malformed batches before waiting for capacity. A stale
        // registry can only miss columns, never report a false conflict.
        self.schema_guard()?.plan(records)?;
        self.wait_for_capacity()?;

        let mut schema = self.schema_guard()?;
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut fresh = SchemaRegistry::load(&tx, &self.name)?;
        let (rows, change) = fresh.plan(records)?;
        for (column, ty) in &change.new_columns {
            if !add_column(&tx, &self.table, column, Some(*ty))? {
                debug!(queue = %self.name, column = %column, "column added concurrently");
                let current = SchemaRegistry::load(&tx, &self.name)?;
                if let Some(existing) = current.column(column).and_then(|c| c.ty)
                    && existing != *ty
                {
                    return Err(QueueError::SchemaConflict {
                        column: column.clone(),
                        expected: existing,
                        found: *ty,
                    });
                }
            }
        }

        let now = to_unix(self.store.now());
        let mut inserted = 0;
        for row in &rows {
            let columns = row.names().map(quote_ident).collect::<Vec<_>>().join(", ");
            let placeholders = (0..row.len())
                .map(|i| format!("?{}", i + 3))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT OR IGNORE INTO {} (_ts, _status, {columns}) VALUES (?1, ?2, {placeholders})",
                self.table
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            let mut values: Vec<&dyn ToSql> = vec![&now, &PENDING];
            values.extend(row.iter().map(|(_, v)| v as &dyn ToSql));
            inserted += stmt.execute(values.as_slice())?;
        }
        tx.commit()?;

        if !change.is_empty() {
            debug!(
                queue = %self.name,
                added = ?change.new_columns,
                "schema grown"
            );
        }
        fresh.apply(&change);
        *schema = fresh;
        drop(conn);
        drop(schema);
        self.invalidate_count();

        if inserted < rows.len() {
            debug!(queue = %self.name, skipped = rows.len() - inserted, "ignored duplicate records");
        }
        Ok(inserted)
    }

    /// [`put`](Self::put) for JSON objects.
    pub fn put_json(&self, values: &[serde_json::Value]) -> Result<usize> {
        let records = values
            .iter()
            .enumerate()
            .map(|(index, v)| {
                Record::from_json(v).map_err(|reason| QueueError::InvalidRecord { index, reason })
            })
            .collect::<Result<Vec<_>>>()?;
        self.put(&records)
    }

    /// Atomically claim up to `n` pending items, oldest first.
    ///
    /// With `random_offset` the scan starts at a random position inside the
    /// pending set, trading FIFO order for less contention between workers.
    /// Never blocks; returns fewer items when fewer are pending.
    pub fn lease(&self, n: usize, random_offset: bool) -> Result<Lease> {
        self.maybe_recycle_stale_leases()?;
        if n == 0 {
            return Ok(Lease::default());
        }
        let offset = if random_offset {
            random_offset_within(self.raw_pending_count()?, n)
        } else {
            0
        };
        let candidates = format!(
            "SELECT _id FROM {} WHERE _status < {LEASED} ORDER BY _id",
            self.table
        );
        self.lease_candidates(&candidates, n, offset)
    }

    pub fn lease_one(&self) -> Result<Option<(ItemId, Record)>> {
        let lease = self.lease(1, false)?;
        Ok(lease.ids.into_iter().zip(lease.payloads).next())
    }

    /// Claim rows selected by `candidates` (a `SELECT` of `_id`s, ordered,
    /// without `LIMIT`) in one conditional update.
    ///
    /// The claim and the status change are a single statement, so two
    /// workers can never receive the same id.
    pub(crate) fn lease_candidates(&self, candidates: &str, n: usize, offset: u64) -> Result<Lease> {
        let sql = format!(
            "UPDATE {table} SET _status = ?1, _ts = ?2 \
             WHERE _id IN ({candidates} LIMIT ?3 OFFSET ?4) AND _status < {LEASED} \
             RETURNING *",
            table = self.table,
        );
        let now = to_unix(self.store.now());
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let items = decode_rows(stmt.query(params![LEASED, now, limit, offset])?)?;
        let lease = Lease::from_items(items);
        if !lease.is_empty() {
            debug!(queue = %self.name, leased = lease.len(), "leased items");
        }
        Ok(lease)
    }

    /// Mark leased ids as acked.
    ///
    /// Re-acking an acked id is a no-op. Ids that are missing, pending or
    /// failed abort the call with [`QueueError::UnknownKey`] and nothing is
    /// changed. Returns how many ids changed status.
    pub fn ack(&self, ids: &[ItemId]) -> Result<usize> {
        self.settle(ids, ItemStatus::Acked)
    }

    /// Mark leased ids as failed (terminal). Same rules as [`ack`](Self::ack).
    pub fn fail(&self, ids: &[ItemId]) -> Result<usize> {
        self.settle(ids, ItemStatus::Failed)
    }

    fn settle(&self, ids: &[ItemId], target: ItemStatus) -> Result<usize> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = {
            let mut stmt = tx.prepare(&format!(
                "SELECT _id, _status FROM {} WHERE _id IN ({})",
                self.table,
                id_list(&ids)
            ))?;
            stmt.query_map([], |row| Ok((ItemId::new(row.get(0)?), row.get::<_, i64>(1)?)))?
                .collect::<std::result::Result<HashMap<_, _>, _>>()?
        };

        // Under delete_on_ack an acked row is gone; AUTOINCREMENT guarantees
        // any id at or below the sequence was allocated once.
        let removal = self.options.delete_on_ack && target == ItemStatus::Acked;
        let high_water = if removal && current.len() < ids.len() {
            tx.query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = ?1",
                [&self.name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .unwrap_or(0)
        } else {
            0
        };

        let mut changing = Vec::new();
        let mut unknown = Vec::new();
        for id in &ids {
            match current.get(id) {
                Some(&code) => match ItemStatus::from_code(code) {
                    Some(ItemStatus::Leased) => changing.push(*id),
                    Some(status) if status == target => {}
                    Some(_) => unknown.push(*id),
                    None => return Err(QueueError::Corrupt(format!("status code {code} on item {id}"))),
                },
                None if removal && id.get() > 0 && id.get() <= high_water => {}
                None => unknown.push(*id),
            }
        }
        if !unknown.is_empty() {
            return Err(QueueError::UnknownKey(unknown));
        }

        if !changing.is_empty() {
            let list = id_list(&changing);
            let now = to_unix(self.store.now());
            tx.execute(
                &format!(
                    "UPDATE {} SET _status = ?1, _ts = ?2 WHERE _id IN ({list})",
                    self.table
                ),
                params![target.code(), now],
            )?;
            if removal {
                tx.execute(&format!("DELETE FROM {} WHERE _id IN ({list})", self.table), [])?;
            }
        }
        tx.commit()?;
        drop(conn);

        if removal && !changing.is_empty() {
            self.invalidate_count();
        }
        Ok(changing.len())
    }

    /// Total records, memoised for `count_ttl`.
    ///
    /// Writes through this handle invalidate the memo; writes from other
    /// connections show up once it expires.
    pub fn count(&self) -> Result<u64> {
        let ttl = self.options.count_ttl();
        if let Some((at, n)) = *self.count_guard()?
            && at.elapsed() < ttl
        {
            return Ok(n);
        }
        let n = self.exact_count()?;
        *self.count_guard()? = Some((Instant::now(), n));
        Ok(n)
    }

    pub fn exact_count(&self) -> Result<u64> {
        self.count_where("1 = 1")
    }

    /// Records eligible for lease. Answered from the `_status` index.
    pub fn pending_count(&self) -> Result<u64> {
        self.maybe_recycle_stale_leases()?;
        self.raw_pending_count()
    }

    pub fn leased_count(&self) -> Result<u64> {
        self.count_where(&format!("_status = {LEASED}"))
    }

    /// Records in a terminal status (acked or failed).
    pub fn done_count(&self) -> Result<u64> {
        self.count_where(&format!("_status > {LEASED}"))
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT _status, COUNT(*) FROM {} GROUP BY _status",
            self.table
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut counts = QueueCounts::default();
        for (code, n) in rows {
            let n = n as u64;
            match ItemStatus::from_code(code) {
                Some(ItemStatus::Pending) => counts.pending += n,
                Some(ItemStatus::Leased) => counts.leased += n,
                Some(ItemStatus::Acked) => counts.acked += n,
                Some(ItemStatus::Failed) => counts.failed += n,
                None => return Err(QueueError::Corrupt(format!("status code {code}"))),
            }
        }
        Ok(counts)
    }

    pub(crate) fn raw_pending_count(&self) -> Result<u64> {
        self.count_where(&format!("_status < {LEASED}"))
    }

    fn count_where(&self, condition: &str) -> Result<u64> {
        let conn = self.store.conn()?;
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE {condition}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Read items in id order, any status, without leasing them.
    pub fn peek(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY _id LIMIT ?1", self.table))?;
        decode_rows(stmt.query([i64::try_from(limit).unwrap_or(i64::MAX)])?)
    }

    pub fn get(&self, id: ItemId) -> Result<Option<QueueItem>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT * FROM {} WHERE _id = ?1", self.table))?;
        Ok(decode_rows(stmt.query([id.get()])?)?.into_iter().next())
    }

    /// Move every lease older than the lease timeout back to pending.
    ///
    /// This is the crash-recovery path: items leased by a worker that never
    /// acked become leasable again. Returns how many items were recycled.
    pub fn recycle_stale_leases(&self) -> Result<usize> {
        let now = self.store.now();
        // A timeout reaching past the calendar range never expires anything.
        let recycled = match now.checked_sub_signed(self.options.lease_timeout()) {
            Some(cutoff) => {
                let conn = self.store.conn()?;
                conn.execute(
                    &format!(
                        "UPDATE {} SET _status = ?1, _ts = ?2 WHERE _status = ?3 AND _ts < ?4",
                        self.table
                    ),
                    params![PENDING, to_unix(now), LEASED, to_unix(cutoff)],
                )?
            }
            None => 0,
        };
        *self.sweep_guard()? = Some(now);
        if recycled > 0 {
            info!(queue = %self.name, recycled, "recycled stale leases");
        } else {
            debug!(queue = %self.name, "no stale leases");
        }
        Ok(recycled)
    }

    /// Run the sweep at most once per lease timeout, and then only with
    /// `sweep_probability`. Returns `None` when the sweep was skipped.
    pub fn maybe_recycle_stale_leases(&self) -> Result<Option<usize>> {
        let now = self.store.now();
        if let Some(last) = *self.sweep_guard()?
            && now - last < self.options.lease_timeout()
        {
            return Ok(None);
        }
        if rand::random::<f64>() >= self.options.sweep_probability {
            return Ok(None);
        }
        self.recycle_stale_leases().map(Some)
    }

    /// Whether `column` exists, re-reading the table if another writer may
    /// have added it since this handle last looked.
    pub fn has_column(&self, column: &str) -> Result<bool> {
        if column == ID_COLUMN || self.schema_guard()?.contains(column) {
            return Ok(true);
        }
        let mut schema = self.schema_guard()?;
        let conn = self.store.conn()?;
        *schema = SchemaRegistry::load(&conn, &self.name)?;
        Ok(schema.contains(column))
    }

    /// Create an index on `column` once it exists. Returns whether the column
    /// is indexed now.
    pub fn ensure_index(&self, column: &str) -> Result<bool> {
        if column == ID_COLUMN || self.indexed_guard()?.contains(column) {
            return Ok(true);
        }
        if !self.has_column(column)? {
            return Ok(false);
        }
        {
            let conn = self.store.conn()?;
            conn.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {table} ({col});",
                index = quote_ident(&format!("{}__{column}_idx", self.name)),
                table = self.table,
                col = quote_ident(column),
            ))?;
        }
        self.indexed_guard()?.insert(column.to_string());
        Ok(true)
    }

    /// Block until the queue has room below `max_size`.
    fn wait_for_capacity(&self) -> Result<()> {
        let Some(max_size) = self.options.max_size else {
            return Ok(());
        };
        let poll = self.options.backpressure_poll();
        let started = Instant::now();
        let mut waits: u64 = 0;
        while self.exact_count()? >= max_size {
            waits += 1;
            std::thread::sleep(poll);
            if waits.is_power_of_two() {
                info!(
                    queue = %self.name,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "waiting for queue to drain"
                );
            }
        }
        if waits > 0 {
            info!(
                queue = %self.name,
                waited_ms = started.elapsed().as_millis() as u64,
                "finished waiting for capacity"
            );
        }
        Ok(())
    }

    fn invalidate_count(&self) {
        if let Ok(mut cache) = self.count_cache.lock() {
            *cache = None;
        }
    }

    fn schema_guard(&self) -> Result<MutexGuard<'_, SchemaRegistry>> {
        self.schema.lock().map_err(|_| QueueError::LockPoisoned)
    }

    fn count_guard(&self) -> Result<MutexGuard<'_, Option<(Instant, u64)>>> {
        self.count_cache.lock().map_err(|_| QueueError::LockPoisoned)
    }

    fn sweep_guard(&self) -> Result<MutexGuard<'_, Option<DateTime<Utc>>>> {
        self.last_sweep.lock().map_err(|_| QueueError::LockPoisoned)
    }

    fn indexed_guard(&self) -> Result<MutexGuard<'_, HashSet<String>>> {
        self.indexed.lock().map_err(|_| QueueError::LockPoisoned)
    }
}

/// Add a payload column. Returns `false` when another writer added it first.
fn add_column(conn: &Connection, table: &str, column: &str, ty: Option<ColumnType>) -> Result<bool> {
    let decl = ty.map(ColumnType::sql_type).unwrap_or("");
    let sql = format!("ALTER TABLE {table} ADD COLUMN {} {decl}", quote_ident(column));
    match conn.execute_batch(&sql) {
        Ok(()) => Ok(true),
        Err(e) if is_duplicate_column(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn random_offset_within(available: u64, n: usize) -> u64 {
    let n = n as u64;
    if available > n {
        rand::thread_rng().gen_range(0..=available - n)
    } else {
        0
    }
}

/// Ids are integers, so inlining them cannot inject SQL.
fn id_list(ids: &[ItemId]) -> String {
    ids.iter()
        .map(|id| id.get().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn column_names(stmt: &Statement<'_>) -> Vec<String> {
    stmt.column_names().into_iter().map(String::from).collect()
}

/// Decode `SELECT *`/`RETURNING *` rows.
///
/// Column names are read once the first row exists: `SQLite` re-prepares a
/// statement on its first step when another connection changed the schema,
/// so names taken right after `prepare` can miss new columns.
fn decode_rows(mut rows: Rows<'_>) -> Result<Vec<QueueItem>> {
    let mut names: Option<Vec<String>> = None;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        let stmt: &Statement<'_> = row.as_ref();
        let names = names.get_or_insert_with(|| column_names(stmt));
        items.push(decode_item(row, names)?);
    }
    Ok(items)
}

fn decode_item(row: &Row<'_>, names: &[String]) -> Result<QueueItem> {
    let mut id = None;
    let mut ts = None;
    let mut status = None;
    let mut payload = Record::new();
    for (i, name) in names.iter().enumerate() {
        match name.as_str() {
            ID_COLUMN => id = Some(row.get::<_, i64>(i)?),
            TS_COLUMN => ts = Some(row.get::<_, f64>(i)?),
            STATUS_COLUMN => status = Some(row.get::<_, i64>(i)?),
            _ => {
                if let Some(value) = FieldValue::from_sql(row.get_ref(i)?) {
                    payload.insert(name.clone(), value);
                }
            }
        }
    }
    let (Some(id), Some(ts), Some(code)) = (id, ts, status) else {
        return Err(QueueError::Corrupt("row is missing system columns".to_string()));
    };
    let status = ItemStatus::from_code(code)
        .ok_or_else(|| QueueError::Corrupt(format!("status code {code} on item {id}")))?;
    Ok(QueueItem {
        id: ItemId::new(id),
        enqueued_at: from_unix(ts)?,
        status,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::ports::ManualClock;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
    }

    fn store_with_clock() -> (Store, ManualClock) {
        let clock = ManualClock::new(start());
        let store = Store::in_memory_with_clock(Arc::new(clock.clone())).unwrap();
        (store, clock)
    }

    fn quiet() -> QueueOptions {
        QueueOptions::default().with_sweep_probability(0.0)
    }

    fn records(n: i64) -> Vec<Record> {
        (0..n).map(|i| Record::new().with("idx", i)).collect()
    }

    #[test]
    fn lease_is_fifo_and_marks_items_leased() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        assert_eq!(q.put(&records(5)).unwrap(), 5);

        let lease = q.lease(3, false).unwrap();
        let idx: Vec<i64> = lease
            .payloads
            .iter()
            .map(|r| r.get("idx").and_then(FieldValue::as_i64).unwrap())
            .collect();
        assert_eq!(idx, vec![0, 1, 2]);
        assert_eq!(q.pending_count().unwrap(), 2);
        assert_eq!(q.leased_count().unwrap(), 3);

        for item in q.peek(3).unwrap() {
            assert_eq!(item.status, ItemStatus::Leased);
        }
    }

    #[test]
    fn lease_returns_fewer_when_short() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        q.put(&records(2)).unwrap();
        assert_eq!(q.lease(10, false).unwrap().len(), 2);
        assert!(q.lease(10, false).unwrap().is_empty());
        assert!(q.lease_one().unwrap().is_none());
    }

    #[test]
    fn ack_is_idempotent() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        q.put(&records(3)).unwrap();
        let lease = q.lease(3, false).unwrap();

        assert_eq!(q.ack(&lease.ids).unwrap(), 3);
        assert_eq!(q.ack(&lease.ids).unwrap(), 0);
        assert_eq!(q.done_count().unwrap(), 3);
    }

    #[test]
    fn ack_of_pending_item_is_rejected_atomically() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        q.put(&records(2)).unwrap();
        let (leased, _) = q.lease_one().unwrap().unwrap();
        let pending = ItemId::new(leased.get() + 1);

        let err = q.ack(&[leased, pending]).unwrap_err();
        assert!(matches!(err, QueueError::UnknownKey(ref ids) if ids == &[pending]));
        assert_eq!(q.get(leased).unwrap().unwrap().status, ItemStatus::Leased);
    }

    #[test]
    fn ack_of_missing_id_is_rejected() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        let err = q.ack(&[ItemId::new(42)]).unwrap_err();
        assert!(matches!(err, QueueError::UnknownKey(_)));
    }

    #[test]
    fn fail_is_terminal_and_cannot_be_acked() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        q.put(&records(1)).unwrap();
        let (id, _) = q.lease_one().unwrap().unwrap();

        assert_eq!(q.fail(&[id]).unwrap(), 1);
        assert_eq!(q.fail(&[id]).unwrap(), 0);
        assert!(matches!(q.ack(&[id]), Err(QueueError::UnknownKey(_))));
        assert_eq!(q.counts().unwrap().failed, 1);
        assert_eq!(q.pending_count().unwrap(), 0);
    }

    #[test]
    fn delete_on_ack_removes_rows_and_reack_is_noop() {
        let store = Store::in_memory().unwrap();
        let q = store
            .queue("q", quiet().with_delete_on_ack(true))
            .unwrap();
        q.put(&records(4)).unwrap();
        let lease = q.lease(2, false).unwrap();

        assert_eq!(q.ack(&lease.ids).unwrap(), 2);
        assert_eq!(q.exact_count().unwrap(), 2);
        assert_eq!(q.ack(&lease.ids).unwrap(), 0);
        // Never allocated.
        assert!(matches!(q.ack(&[ItemId::new(99)]), Err(QueueError::UnknownKey(_))));
    }

    #[test]
    fn ids_are_not_reused_after_delete() {
        let store = Store::in_memory().unwrap();
        let q = store
            .queue("q", quiet().with_delete_on_ack(true))
            .unwrap();
        q.put(&records(1)).unwrap();
        let (first, _) = q.lease_one().unwrap().unwrap();
        q.ack(&[first]).unwrap();

        q.put(&records(1)).unwrap();
        let (second, _) = q.lease_one().unwrap().unwrap();
        assert!(second > first);
    }

    #[test]
    fn duplicate_dedup_values_are_ignored() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet().with_unique_column("key")).unwrap();

        let put = q
            .put(&[
                Record::new().with("key", 1).with("v", "a"),
                Record::new().with("key", 1).with("v", "b"),
                Record::new().with("key", 2).with("v", "c"),
            ])
            .unwrap();
        assert_eq!(put, 2);
        assert_eq!(q.put(&[Record::new().with("key", 2)]).unwrap(), 0);
        assert_eq!(q.exact_count().unwrap(), 2);

        let items = q.peek(10).unwrap();
        assert_eq!(items[0].payload.get("v").and_then(FieldValue::as_str), Some("a"));
    }

    #[test]
    fn dedup_column_type_survives_reopen() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet().with_unique_column("key")).unwrap();
        q.put(&[Record::new().with("key", "k1")]).unwrap();

        let reopened = store.queue("q", quiet().with_unique_column("key")).unwrap();
        let err = reopened.put(&[Record::new().with("key", 5)]).unwrap_err();
        assert!(matches!(err, QueueError::SchemaConflict { .. }));
    }

    #[test]
    fn new_fields_grow_the_schema_and_missing_fields_read_back_absent() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        q.put(&[Record::new().with("idx", 0)]).unwrap();
        q.put(&[Record::new().with("idx", 1).with("label", "x")]).unwrap();
        q.put(&[Record::new().with("idx", 2)]).unwrap();

        let lease = q.lease(3, false).unwrap();
        assert!(!lease.payloads[0].contains("label"));
        assert_eq!(lease.payloads[1].get("label").and_then(FieldValue::as_str), Some("x"));
        assert!(!lease.payloads[2].contains("label"));
        assert_eq!(q.schema().unwrap().len(), 2);
    }

    #[test]
    fn schema_conflict_rejects_the_whole_batch() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        q.put(&[Record::new().with("idx", 0)]).unwrap();

        let err = q
            .put(&[Record::new().with("idx", 1), Record::new().with("idx", "two")])
            .unwrap_err();
        assert!(matches!(err, QueueError::SchemaConflict { ref column, .. } if column == "idx"));
        assert_eq!(q.exact_count().unwrap(), 1);
    }

    #[test]
    fn integers_widen_into_real_columns() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        q.put(&[Record::new().with("score", 0.5)]).unwrap();
        q.put(&[Record::new().with("score", 3)]).unwrap();

        let items = q.peek(2).unwrap();
        assert_eq!(items[1].payload.get("score"), Some(&FieldValue::Real(3.0)));
    }

    #[test]
    fn put_json_rejects_nested_values() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        let err = q
            .put_json(&[json!({"a": 1}), json!({"a": {"b": 2}})])
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidRecord { index: 1, .. }));
        assert_eq!(q.exact_count().unwrap(), 0);
        assert_eq!(q.put_json(&[json!({"a": 1, "s": "t"})]).unwrap(), 1);
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        assert_eq!(q.put(&[]).unwrap(), 0);
    }

    #[test]
    fn stale_leases_are_recycled_after_timeout() {
        let (store, clock) = store_with_clock();
        let q = store
            .queue("q", quiet().with_lease_timeout(Duration::from_secs(60)))
            .unwrap();
        q.put(&records(3)).unwrap();
        q.lease(3, false).unwrap();

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(q.recycle_stale_leases().unwrap(), 0);

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(q.recycle_stale_leases().unwrap(), 3);
        assert_eq!(q.pending_count().unwrap(), 3);
        assert_eq!(q.lease(3, false).unwrap().len(), 3);
    }

    #[test]
    fn ack_after_recycle_is_rejected() {
        let (store, clock) = store_with_clock();
        let q = store
            .queue("q", quiet().with_lease_timeout(Duration::from_secs(1)))
            .unwrap();
        q.put(&records(1)).unwrap();
        let (id, _) = q.lease_one().unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(2));
        q.recycle_stale_leases().unwrap();

        assert!(matches!(q.ack(&[id]), Err(QueueError::UnknownKey(_))));
    }

    #[test]
    fn sweep_runs_at_most_once_per_timeout() {
        let (store, clock) = store_with_clock();
        let q = store
            .queue(
                "q",
                QueueOptions::default()
                    .with_sweep_probability(1.0)
                    .with_lease_timeout(Duration::from_secs(10)),
            )
            .unwrap();
        q.put(&records(1)).unwrap();

        assert_eq!(q.maybe_recycle_stale_leases().unwrap(), Some(0));
        q.lease(1, false).unwrap();
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(q.maybe_recycle_stale_leases().unwrap(), None);

        clock.advance(chrono::Duration::seconds(6));
        assert_eq!(q.maybe_recycle_stale_leases().unwrap(), Some(1));
    }

    #[test]
    fn zero_probability_never_sweeps() {
        let (store, clock) = store_with_clock();
        let q = store.queue("q", quiet()).unwrap();
        clock.advance(chrono::Duration::days(1));
        assert_eq!(q.maybe_recycle_stale_leases().unwrap(), None);
    }

    #[test]
    fn memoised_count_is_invalidated_by_local_writes() {
        let store = Store::in_memory().unwrap();
        let q = store
            .queue("q", quiet().with_count_ttl(Duration::from_secs(3600)))
            .unwrap();
        assert_eq!(q.count().unwrap(), 0);
        q.put(&records(2)).unwrap();
        assert_eq!(q.count().unwrap(), 2);
    }

    #[test]
    fn memoised_count_lags_writes_from_other_handles() {
        let store = Store::in_memory().unwrap();
        let opts = quiet().with_count_ttl(Duration::from_secs(3600));
        let reader = store.queue("q", opts.clone()).unwrap();
        let writer = store.queue("q", opts).unwrap();
        assert_eq!(reader.count().unwrap(), 0);
        writer.put(&records(2)).unwrap();

        assert_eq!(reader.count().unwrap(), 0);
        assert_eq!(reader.exact_count().unwrap(), 2);
    }

    #[test]
    fn random_offset_lease_stays_in_range() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        q.put(&records(10)).unwrap();
        let lease = q.lease(4, true).unwrap();
        assert_eq!(lease.len(), 4);
        assert!(lease.ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(q.pending_count().unwrap(), 6);
    }

    #[test]
    fn ensure_index_waits_for_the_column() {
        let store = Store::in_memory().unwrap();
        let q = store.queue("q", quiet()).unwrap();
        assert!(!q.ensure_index("idx").unwrap());
        q.put(&records(1)).unwrap();
        assert!(q.ensure_index("idx").unwrap());
        assert!(q.ensure_index("_id").unwrap());
    }

    #[test]
    fn invalid_queue_names_are_rejected() {
        let store = Store::in_memory().unwrap();
        assert!(matches!(
            store.queue("bad name", quiet()),
            Err(QueueError::InvalidName(_))
        ));
        assert!(matches!(
            store.queue("q", quiet().with_unique_column("_key")),
            Err(QueueError::InvalidName(_))
        ));
    }

    #[test]
    fn huge_timeouts_saturate_instead_of_overflowing() {
        let (store, clock) = store_with_clock();
        let q = store
            .queue(
                "q",
                QueueOptions::default()
                    .with_sweep_probability(1.0)
                    .with_lease_timeout(Duration::MAX)
                    .with_count_ttl(Duration::MAX),
            )
            .unwrap();
        assert_eq!(q.options().lease_timeout(), chrono::Duration::MAX);
        q.put(&records(2)).unwrap();
        assert_eq!(q.lease(1, false).unwrap().len(), 1);

        clock.advance(chrono::Duration::days(365 * 100));
        assert_eq!(q.recycle_stale_leases().unwrap(), 0);
        assert_eq!(q.leased_count().unwrap(), 1);
        assert_eq!(q.count().unwrap(), 2);

        let opts = QueueOptions {
            lease_timeout_secs: 1e13,
            count_ttl_secs: f64::INFINITY,
            ..quiet()
        };
        assert_eq!(opts.count_ttl(), Duration::MAX);
        let q = store.queue("r", opts.with_sweep_probability(1.0)).unwrap();
        q.put(&records(1)).unwrap();
        assert_eq!(q.lease(1, false).unwrap().len(), 1);
        assert_eq!(q.count().unwrap(), 1);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: QueueOptions = toml::from_str("lease_timeout_secs = 0.5\nmax_size = 8").unwrap();
        assert_eq!(opts.lease_timeout(), chrono::Duration::milliseconds(500));
        assert_eq!(opts.max_size, Some(8));
        assert_eq!(opts.sweep_probability, 0.05);
        assert!(!opts.delete_on_ack);
    }
}
