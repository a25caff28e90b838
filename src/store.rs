use rusqlite::types::ToSql;
use rusqlite::{Connection, params};
use std::sync::Mutex;

use crate::config::Synchronous;
use crate::migrations;
use crate::models::api_key::{
    ApiKey, ApiKeyPermission, ApiKeyUsageRow, NewApiKeyUsage, ServiceAccount,
};
use crate::models::dashboard::Dashboard;
use crate::models::drop::{
    DEFAULT_DROP_NAME, DEFAULT_EVENTS_RETENTION_MS, DEFAULT_TRACES_RETENTION_MS, DropRecord,
    DropRetention, DropWithRetention,
};
use crate::models::event::{DropStats, NewWideEvent, StreamStats, WideEventRow};
use crate::models::trace::{NewSpan, SpanRow};
use crate::models::user::{Role, UserDropPermission, UserProfile};
use crate::query_builder::{CompiledQuery, Entity};

/// The embedded row store. One process-wide connection; SQLite serializes
/// writes through the WAL, readers proceed concurrently.
pub struct Store {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub synchronous: Synchronous,
    pub busy_timeout_ms: u64,
    pub wal_autocheckpoint_pages: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            synchronous: Synchronous::Normal,
            busy_timeout_ms: 5_000,
            wal_autocheckpoint_pages: 1_000,
        }
    }
}

/// Effective retention for one drop, as consumed by the pruner. `None`
/// disables pruning for that stream.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub drop_id: i64,
    pub traces_retention_ms: Option<i64>,
    pub events_retention_ms: Option<i64>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Stored 0 means the same as NULL: pruning disabled.
fn normalize_retention(ms: Option<i64>) -> Option<i64> {
    ms.filter(|v| *v > 0)
}

const SPAN_COLUMNS: &str = "id, drop_id, trace_id, span_id, parent_span_id, service_name, \
     operation_name, start_time, end_time, duration_ms, status, attributes, created_at";

const EVENT_COLUMNS: &str = "id, drop_id, trace_id, service_name, operation_type, field_name, \
     outcome, duration_ms, user_id, error_count, rpc_call_count, attributes, created_at";

fn span_from_row(row: &rusqlite::Row) -> rusqlite::Result<SpanRow> {
    let attributes: String = row.get(11)?;
    Ok(SpanRow {
        id: row.get(0)?,
        drop_id: row.get(1)?,
        trace_id: row.get(2)?,
        span_id: row.get(3)?,
        parent_span_id: row.get(4)?,
        service_name: row.get(5)?,
        operation_name: row.get(6)?,
        start_time: row.get(7)?,
        end_time: row.get(8)?,
        duration_ms: row.get(9)?,
        status: row.get(10)?,
        attributes: serde_json::from_str(&attributes).unwrap_or(serde_json::Value::Null),
        created_at: row.get(12)?,
    })
}

fn event_from_row(row: &rusqlite::Row) -> rusqlite::Result<WideEventRow> {
    let attributes: String = row.get(11)?;
    Ok(WideEventRow {
        id: row.get(0)?,
        drop_id: row.get(1)?,
        trace_id: row.get(2)?,
        service_name: row.get(3)?,
        operation_type: row.get(4)?,
        field_name: row.get(5)?,
        outcome: row.get(6)?,
        duration_ms: row.get(7)?,
        user_id: row.get(8)?,
        error_count: row.get(9)?,
        rpc_call_count: row.get(10)?,
        attributes: serde_json::from_str(&attributes).unwrap_or(serde_json::Value::Null),
        created_at: row.get(12)?,
    })
}

fn profile_from_row(row: &rusqlite::Row) -> rusqlite::Result<UserProfile> {
    let role: String = row.get(2)?;
    Ok(UserProfile {
        user_id: row.get(0)?,
        email: row.get(1)?,
        role: Role::parse(&role).unwrap_or(Role::Member),
        disabled: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        last_login_at: row.get(6)?,
    })
}

fn api_key_from_row(row: &rusqlite::Row) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        id: row.get(0)?,
        service_account_id: row.get(1)?,
        name: row.get(2)?,
        key_prefix: row.get(3)?,
        key_hash: row.get(4)?,
        created_by_user_id: row.get(5)?,
        created_at: row.get(6)?,
        revoked_at: row.get(7)?,
    })
}

const API_KEY_COLUMNS: &str = "id, service_account_id, name, key_prefix, key_hash, created_by_user_id, created_at, revoked_at";

impl Store {
    pub fn open(path: &str, opts: &StoreOptions) -> anyhow::Result<Self> {
        Self::init(Connection::open(path)?, opts)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?, &StoreOptions::default())
    }

    fn init(conn: Connection, opts: &StoreOptions) -> anyhow::Result<Self> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA foreign_keys=ON;\n\
             PRAGMA synchronous={};\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA wal_autocheckpoint={};",
            opts.synchronous.as_pragma(),
            opts.busy_timeout_ms,
            opts.wal_autocheckpoint_pages,
        ))?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    // ── Drop registry ──

    pub fn default_drop_id(&self) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        let id = conn.query_row(
            "SELECT id FROM drops WHERE name = ?1",
            params![DEFAULT_DROP_NAME],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Resolve a drop selector to an id.
    ///
    /// Empty selects the default drop. All-digit input is an id lookup; a
    /// miss falls back to the default drop when creation is allowed (ids are
    /// never minted from user input). Anything else is a name lookup,
    /// creating the drop when allowed.
    pub fn resolve_drop(&self, selector: &str, allow_create: bool) -> anyhow::Result<Option<i64>> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Ok(Some(self.default_drop_id()?));
        }
        if selector.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(id) = selector.parse::<i64>() {
                if let Some(found) = self.get_drop(id)? {
                    return Ok(Some(found.id));
                }
            }
            if allow_create {
                return Ok(Some(self.default_drop_id()?));
            }
            return Ok(None);
        }
        if let Some(found) = self.get_drop_by_name(selector)? {
            return Ok(Some(found.id));
        }
        if allow_create {
            return Ok(Some(self.create_drop(selector, None)?.id));
        }
        Ok(None)
    }

    pub fn get_drop(&self, id: i64) -> anyhow::Result<Option<DropRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, name, label, created_at FROM drops WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(DropRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                label: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn get_drop_by_name(&self, name: &str) -> anyhow::Result<Option<DropRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, name, label, created_at FROM drops WHERE name = ?1")?;
        let mut rows = stmt.query_map(params![name], |row| {
            Ok(DropRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                label: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn create_drop(&self, name: &str, label: Option<&str>) -> anyhow::Result<DropRecord> {
        let created_at = now_ms();
        let id = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO drops (name, label, created_at) VALUES (?1, ?2, ?3)",
                params![name, label, created_at],
            )?;
            let id = conn.last_insert_rowid();
            ensure_retention_row(&conn, id)?;
            id
        };
        Ok(DropRecord {
            id,
            name: name.to_string(),
            label: label.map(str::to_string),
            created_at,
        })
    }

    pub fn count_drops(&self) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM drops", [], |row| row.get(0))?)
    }

    pub fn list_drops(&self) -> anyhow::Result<Vec<DropWithRetention>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT d.id, d.name, d.label, d.created_at, r.drop_id IS NOT NULL, \
             r.traces_retention_ms, r.events_retention_ms \
             FROM drops d LEFT JOIN drop_retention r ON r.drop_id = d.id \
             ORDER BY d.id ASC",
        )?;
        let rows = stmt
            .query_map([], drop_with_retention_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drops on which the user holds any permission row.
    pub fn list_drops_for_user(&self, user_id: &str) -> anyhow::Result<Vec<DropWithRetention>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT d.id, d.name, d.label, d.created_at, r.drop_id IS NOT NULL, \
             r.traces_retention_ms, r.events_retention_ms \
             FROM drops d \
             JOIN user_drop_permissions p ON p.drop_id = d.id AND p.user_id = ?1 \
             LEFT JOIN drop_retention r ON r.drop_id = d.id \
             ORDER BY d.id ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id], drop_with_retention_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_drop_label(&self, drop_id: i64, label: Option<&str>) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE drops SET label = ?2 WHERE id = ?1",
            params![drop_id, label],
        )?;
        Ok(count > 0)
    }

    /// Cascade per the ownership rules: telemetry, dashboards, retention and
    /// permission rows go with the drop; usage rows stay with `drop_id`
    /// cleared. One transaction.
    pub fn delete_drop(&self, drop_id: i64) -> anyhow::Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM trace_spans WHERE drop_id = ?1",
            params![drop_id],
        )?;
        tx.execute(
            "DELETE FROM wide_events WHERE drop_id = ?1",
            params![drop_id],
        )?;
        tx.execute(
            "DELETE FROM dashboards WHERE drop_id = ?1",
            params![drop_id],
        )?;
        tx.execute(
            "DELETE FROM drop_retention WHERE drop_id = ?1",
            params![drop_id],
        )?;
        tx.execute(
            "DELETE FROM user_drop_permissions WHERE drop_id = ?1",
            params![drop_id],
        )?;
        tx.execute(
            "DELETE FROM api_key_permissions WHERE drop_id = ?1",
            params![drop_id],
        )?;
        tx.execute(
            "UPDATE api_key_usage SET drop_id = NULL WHERE drop_id = ?1",
            params![drop_id],
        )?;
        let count = tx.execute("DELETE FROM drops WHERE id = ?1", params![drop_id])?;
        tx.commit()?;
        Ok(count > 0)
    }

    // ── Retention ──

    pub fn get_retention(&self, drop_id: i64) -> anyhow::Result<DropRetention> {
        let conn = self.conn.lock().unwrap();
        ensure_retention_row(&conn, drop_id)?;
        let retention = conn.query_row(
            "SELECT drop_id, traces_retention_ms, events_retention_ms, updated_at \
             FROM drop_retention WHERE drop_id = ?1",
            params![drop_id],
            |row| {
                Ok(DropRetention {
                    drop_id: row.get(0)?,
                    traces_retention_ms: row.get(1)?,
                    events_retention_ms: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )?;
        Ok(retention)
    }

    pub fn set_retention(
        &self,
        drop_id: i64,
        traces_retention_ms: Option<i64>,
        events_retention_ms: Option<i64>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        ensure_retention_row(&conn, drop_id)?;
        conn.execute(
            "UPDATE drop_retention SET traces_retention_ms = ?2, events_retention_ms = ?3, \
             updated_at = ?4 WHERE drop_id = ?1",
            params![
                drop_id,
                normalize_retention(traces_retention_ms),
                normalize_retention(events_retention_ms),
                now_ms()
            ],
        )?;
        Ok(())
    }

    /// Effective policies for every drop, for the pruner sweep. Drops without
    /// a retention row (pre-registry databases) get the defaults; stored
    /// NULL/0 stays disabled.
    pub fn retention_policies(&self) -> anyhow::Result<Vec<RetentionPolicy>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT d.id, r.drop_id IS NOT NULL, r.traces_retention_ms, r.events_retention_ms \
             FROM drops d LEFT JOIN drop_retention r ON r.drop_id = d.id ORDER BY d.id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let drop_id: i64 = row.get(0)?;
                let has_row: bool = row.get(1)?;
                let (traces, events) = if has_row {
                    (row.get(2)?, row.get(3)?)
                } else {
                    (
                        Some(DEFAULT_TRACES_RETENTION_MS),
                        Some(DEFAULT_EVENTS_RETENTION_MS),
                    )
                };
                Ok(RetentionPolicy {
                    drop_id,
                    traces_retention_ms: traces,
                    events_retention_ms: events,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|p| RetentionPolicy {
                traces_retention_ms: normalize_retention(p.traces_retention_ms),
                events_retention_ms: normalize_retention(p.events_retention_ms),
                ..p
            })
            .collect())
    }

    pub fn retention_policy(&self, drop_id: i64) -> anyhow::Result<RetentionPolicy> {
        let retention = self.get_retention(drop_id)?;
        Ok(RetentionPolicy {
            drop_id,
            traces_retention_ms: normalize_retention(retention.traces_retention_ms),
            events_retention_ms: normalize_retention(retention.events_retention_ms),
        })
    }

    // ── Telemetry writes ──

    /// Insert a batch of spans in receipt order inside one transaction; the
    /// commit is the single fsync boundary. All-or-nothing.
    pub fn insert_spans(&self, drop_id: i64, spans: &[NewSpan]) -> anyhow::Result<usize> {
        if spans.is_empty() {
            return Ok(0);
        }
        let created_at = now_ms();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO trace_spans (drop_id, trace_id, span_id, parent_span_id, \
                 service_name, operation_name, start_time, end_time, duration_ms, status, \
                 attributes, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for span in spans {
                stmt.execute(params![
                    drop_id,
                    span.trace_id,
                    span.span_id,
                    span.parent_span_id,
                    span.service_name,
                    span.operation_name,
                    span.start_time,
                    span.end_time,
                    span.duration_ms,
                    span.status,
                    serde_json::to_string(&span.attributes)?,
                    created_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(spans.len())
    }

    pub fn insert_events(&self, drop_id: i64, events: &[NewWideEvent]) -> anyhow::Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let created_at = now_ms();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO wide_events (drop_id, trace_id, service_name, operation_type, \
                 field_name, outcome, duration_ms, user_id, error_count, rpc_call_count, \
                 attributes, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for event in events {
                stmt.execute(params![
                    drop_id,
                    event.trace_id,
                    event.service_name,
                    event.operation_type,
                    event.field_name,
                    event.outcome,
                    event.duration_ms,
                    event.user_id,
                    event.error_count,
                    event.rpc_call_count,
                    serde_json::to_string(&event.attributes)?,
                    created_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(events.len())
    }

    /// Bounded range delete: at most `batch_limit` rows older than `cutoff`,
    /// so one call never holds the write lock long.
    pub fn delete_older_than(
        &self,
        drop_id: i64,
        entity: Entity,
        cutoff: i64,
        batch_limit: i64,
    ) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let table = entity.table();
        let count = conn.execute(
            &format!(
                "DELETE FROM {table} WHERE id IN \
                 (SELECT id FROM {table} WHERE drop_id = ?1 AND created_at < ?2 LIMIT ?3)"
            ),
            params![drop_id, cutoff, batch_limit],
        )?;
        Ok(count)
    }

    pub fn clear_drop(&self, drop_id: i64) -> anyhow::Result<(usize, usize)> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let spans = tx.execute(
            "DELETE FROM trace_spans WHERE drop_id = ?1",
            params![drop_id],
        )?;
        let events = tx.execute(
            "DELETE FROM wide_events WHERE drop_id = ?1",
            params![drop_id],
        )?;
        tx.commit()?;
        Ok((spans, events))
    }

    // ── Telemetry reads ──

    pub fn query_spans(
        &self,
        drop_id: i64,
        compiled: &CompiledQuery,
    ) -> anyhow::Result<Vec<SpanRow>> {
        self.query_telemetry(drop_id, Entity::Traces, compiled, span_from_row)
    }

    pub fn query_events(
        &self,
        drop_id: i64,
        compiled: &CompiledQuery,
    ) -> anyhow::Result<Vec<WideEventRow>> {
        self.query_telemetry(drop_id, Entity::Events, compiled, event_from_row)
    }

    fn query_telemetry<T>(
        &self,
        drop_id: i64,
        entity: Entity,
        compiled: &CompiledQuery,
        map_row: fn(&rusqlite::Row) -> rusqlite::Result<T>,
    ) -> anyhow::Result<Vec<T>> {
        let columns = match entity {
            Entity::Traces => SPAN_COLUMNS,
            Entity::Events => EVENT_COLUMNS,
        };
        let mut sql = format!("SELECT {columns} FROM {} WHERE drop_id = ?", entity.table());
        for condition in &compiled.conditions {
            sql.push_str(" AND ");
            sql.push_str(condition);
        }
        sql.push_str(&format!(
            " ORDER BY created_at {order}, id {order} LIMIT ? OFFSET ?",
            order = compiled.order
        ));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let mut param_refs: Vec<&dyn ToSql> = Vec::with_capacity(compiled.params.len() + 3);
        param_refs.push(&drop_id);
        for p in &compiled.params {
            param_refs.push(p.as_ref());
        }
        param_refs.push(&compiled.limit);
        param_refs.push(&compiled.offset);

        let rows = stmt
            .query_map(param_refs.as_slice(), map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Trace drill-down: spans by start time, correlated events by arrival.
    pub fn get_trace(
        &self,
        drop_id: i64,
        trace_id: &str,
    ) -> anyhow::Result<(Vec<SpanRow>, Vec<WideEventRow>)> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SPAN_COLUMNS} FROM trace_spans \
             WHERE drop_id = ?1 AND trace_id = ?2 ORDER BY start_time ASC, id ASC"
        ))?;
        let spans = stmt
            .query_map(params![drop_id, trace_id], span_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM wide_events \
             WHERE drop_id = ?1 AND trace_id = ?2 ORDER BY created_at ASC, id ASC"
        ))?;
        let events = stmt
            .query_map(params![drop_id, trace_id], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((spans, events))
    }

    pub fn recent_spans(&self, drop_id: i64, limit: i64) -> anyhow::Result<Vec<SpanRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SPAN_COLUMNS} FROM trace_spans WHERE drop_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![drop_id, limit], span_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn recent_events(&self, drop_id: i64, limit: i64) -> anyhow::Result<Vec<WideEventRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM wide_events WHERE drop_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![drop_id, limit], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn stats(&self, drop_id: i64) -> anyhow::Result<DropStats> {
        let conn = self.conn.lock().unwrap();
        let traces = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = 'error'), 0) \
             FROM trace_spans WHERE drop_id = ?1",
            params![drop_id],
            |row| {
                Ok(StreamStats {
                    total: row.get(0)?,
                    errors: row.get(1)?,
                })
            },
        )?;
        let events = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(outcome = 'error' OR error_count > 0), 0) \
             FROM wide_events WHERE drop_id = ?1",
            params![drop_id],
            |row| {
                Ok(StreamStats {
                    total: row.get(0)?,
                    errors: row.get(1)?,
                })
            },
        )?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT service_name FROM trace_spans WHERE drop_id = ?1 \
             UNION SELECT DISTINCT service_name FROM wide_events WHERE drop_id = ?1 \
             ORDER BY 1",
        )?;
        let services = stmt
            .query_map(params![drop_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DropStats {
            traces,
            events,
            services,
        })
    }

    pub fn list_services(&self, drop_id: i64) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT service_name FROM trace_spans WHERE drop_id = ?1 \
             UNION SELECT DISTINCT service_name FROM wide_events WHERE drop_id = ?1 \
             ORDER BY 1",
        )?;
        let services = stmt
            .query_map(params![drop_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(services)
    }

    // ── User profiles ──

    pub fn count_profiles(&self) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM user_profiles", [], |row| row.get(0))?)
    }

    pub fn get_profile(&self, user_id: &str) -> anyhow::Result<Option<UserProfile>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, email, role, disabled, created_at, updated_at, last_login_at \
             FROM user_profiles WHERE user_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![user_id], profile_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_profiles(&self) -> anyhow::Result<Vec<UserProfile>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, email, role, disabled, created_at, updated_at, last_login_at \
             FROM user_profiles ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], profile_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Emails are lower-cased on write.
    pub fn insert_profile(
        &self,
        user_id: &str,
        email: &str,
        role: Role,
    ) -> anyhow::Result<UserProfile> {
        let now = now_ms();
        let email = email.to_lowercase();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user_profiles (user_id, email, role, disabled, created_at, updated_at, last_login_at) \
             VALUES (?1, ?2, ?3, 0, ?4, ?4, ?4)",
            params![user_id, email, role.as_str(), now],
        )?;
        Ok(UserProfile {
            user_id: user_id.to_string(),
            email,
            role,
            disabled: false,
            created_at: now,
            updated_at: now,
            last_login_at: Some(now),
        })
    }

    pub fn touch_login(&self, user_id: &str, email: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE user_profiles SET email = ?2, last_login_at = ?3, updated_at = ?3 \
             WHERE user_id = ?1",
            params![user_id, email.to_lowercase(), now_ms()],
        )?;
        Ok(())
    }

    /// Admin-email promotion: role forced to admin, disabled flag cleared.
    pub fn promote_admin(&self, user_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE user_profiles SET role = 'admin', disabled = 0, updated_at = ?2 \
             WHERE user_id = ?1",
            params![user_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn update_profile(
        &self,
        user_id: &str,
        role: Option<Role>,
        disabled: Option<bool>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut count = 0;
        if let Some(role) = role {
            count = conn.execute(
                "UPDATE user_profiles SET role = ?2, updated_at = ?3 WHERE user_id = ?1",
                params![user_id, role.as_str(), now_ms()],
            )?;
        }
        if let Some(disabled) = disabled {
            count = conn.execute(
                "UPDATE user_profiles SET disabled = ?2, updated_at = ?3 WHERE user_id = ?1",
                params![user_id, disabled, now_ms()],
            )?;
        }
        Ok(count > 0)
    }

    // ── User drop permissions ──

    pub fn user_permissions(&self, user_id: &str) -> anyhow::Result<Vec<UserDropPermission>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, drop_id, can_ingest, can_query FROM user_drop_permissions \
             WHERE user_id = ?1 ORDER BY drop_id ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(UserDropPermission {
                    user_id: row.get(0)?,
                    drop_id: row.get(1)?,
                    can_ingest: row.get(2)?,
                    can_query: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn user_drop_permission(
        &self,
        user_id: &str,
        drop_id: i64,
    ) -> anyhow::Result<Option<UserDropPermission>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, drop_id, can_ingest, can_query FROM user_drop_permissions \
             WHERE user_id = ?1 AND drop_id = ?2",
        )?;
        let mut rows = stmt.query_map(params![user_id, drop_id], |row| {
            Ok(UserDropPermission {
                user_id: row.get(0)?,
                drop_id: row.get(1)?,
                can_ingest: row.get(2)?,
                can_query: row.get(3)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn has_any_permissions(&self, user_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM user_drop_permissions WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Replace the user's grants wholesale. Entries with both flags false are
    /// not stored; the absence of a row is the canonical "no access".
    pub fn replace_user_permissions(
        &self,
        user_id: &str,
        grants: &[(i64, bool, bool)],
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM user_drop_permissions WHERE user_id = ?1",
            params![user_id],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO user_drop_permissions (user_id, drop_id, can_ingest, can_query) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (drop_id, can_ingest, can_query) in grants {
                if !can_ingest && !can_query {
                    continue;
                }
                stmt.execute(params![user_id, drop_id, can_ingest, can_query])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ── Service accounts ──

    pub fn create_service_account(
        &self,
        id: &str,
        name: &str,
        created_by_user_id: &str,
    ) -> anyhow::Result<ServiceAccount> {
        let created_at = now_ms();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO service_accounts (id, name, created_by_user_id, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![id, name, created_by_user_id, created_at],
        )?;
        Ok(ServiceAccount {
            id: id.to_string(),
            name: name.to_string(),
            created_by_user_id: created_by_user_id.to_string(),
            created_at,
        })
    }

    pub fn list_service_accounts(&self, owner: &str) -> anyhow::Result<Vec<ServiceAccount>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, created_by_user_id, created_at FROM service_accounts \
             WHERE created_by_user_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![owner], |row| {
                Ok(ServiceAccount {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_by_user_id: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_service_account(&self, id: &str) -> anyhow::Result<Option<ServiceAccount>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, created_by_user_id, created_at FROM service_accounts WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(ServiceAccount {
                id: row.get(0)?,
                name: row.get(1)?,
                created_by_user_id: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn delete_service_account(&self, id: &str, owner: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM service_accounts WHERE id = ?1 AND created_by_user_id = ?2",
            params![id, owner],
        )?;
        Ok(count > 0)
    }

    // ── API keys ──

    pub fn create_api_key(&self, key: &ApiKey, grants: &[(i64, bool, bool)]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO api_keys (id, service_account_id, name, key_prefix, key_hash, \
             created_by_user_id, created_at, revoked_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                key.id,
                key.service_account_id,
                key.name,
                key.key_prefix,
                key.key_hash,
                key.created_by_user_id,
                key.created_at,
                key.revoked_at,
            ],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO api_key_permissions (api_key_id, drop_id, can_ingest, can_query) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (drop_id, can_ingest, can_query) in grants {
                if !can_ingest && !can_query {
                    continue;
                }
                stmt.execute(params![key.id, drop_id, can_ingest, can_query])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_api_keys(&self, owner: &str) -> anyhow::Result<Vec<ApiKey>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE created_by_user_id = ?1 \
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt
            .query_map(params![owner], api_key_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Token lookup used by auth: SHA-256 of the raw token, revoked keys
    /// excluded.
    pub fn find_api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> anyhow::Result<Option<(ApiKey, Vec<ApiKeyPermission>)>> {
        let key = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(&format!(
                "SELECT {API_KEY_COLUMNS} FROM api_keys \
                 WHERE key_hash = ?1 AND revoked_at IS NULL"
            ))?;
            let mut rows = stmt.query_map(params![key_hash], api_key_from_row)?;
            rows.next().transpose()?
        };
        match key {
            Some(key) => {
                let perms = self.api_key_permissions(&key.id)?;
                Ok(Some((key, perms)))
            }
            None => Ok(None),
        }
    }

    pub fn api_key_permissions(&self, api_key_id: &str) -> anyhow::Result<Vec<ApiKeyPermission>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT api_key_id, drop_id, can_ingest, can_query FROM api_key_permissions \
             WHERE api_key_id = ?1 ORDER BY drop_id ASC",
        )?;
        let rows = stmt
            .query_map(params![api_key_id], |row| {
                Ok(ApiKeyPermission {
                    api_key_id: row.get(0)?,
                    drop_id: row.get(1)?,
                    can_ingest: row.get(2)?,
                    can_query: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn revoke_api_key(&self, id: &str, owner: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE api_keys SET revoked_at = ?3 \
             WHERE id = ?1 AND created_by_user_id = ?2 AND revoked_at IS NULL",
            params![id, owner, now_ms()],
        )?;
        Ok(count > 0)
    }

    // ── API key usage ──

    pub fn insert_usage_batch(&self, rows: &[NewApiKeyUsage]) -> anyhow::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let created_at = now_ms();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO api_key_usage (api_key_id, method, path, status, drop_id, ip, \
                 user_agent, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.api_key_id,
                    row.method,
                    row.path,
                    row.status as i64,
                    row.drop_id,
                    row.ip,
                    row.user_agent,
                    created_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_usage_for_user(
        &self,
        owner: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<ApiKeyUsageRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT u.id, u.api_key_id, u.method, u.path, u.status, u.drop_id, u.ip, \
             u.user_agent, u.created_at \
             FROM api_key_usage u JOIN api_keys k ON k.id = u.api_key_id \
             WHERE k.created_by_user_id = ?1 ORDER BY u.created_at DESC, u.id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![owner, limit], |row| {
                Ok(ApiKeyUsageRow {
                    id: row.get(0)?,
                    api_key_id: row.get(1)?,
                    method: row.get(2)?,
                    path: row.get(3)?,
                    status: row.get::<_, i64>(4)? as u16,
                    drop_id: row.get(5)?,
                    ip: row.get(6)?,
                    user_agent: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Settings ──

    pub fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM app_settings WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO app_settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    // ── Dashboards ──

    pub fn list_dashboards(&self, drop_id: i64) -> anyhow::Result<Vec<Dashboard>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, drop_id, name, spec_json, created_at, updated_at FROM dashboards \
             WHERE drop_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![drop_id], dashboard_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_dashboard(&self, id: &str) -> anyhow::Result<Option<Dashboard>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, drop_id, name, spec_json, created_at, updated_at FROM dashboards \
             WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], dashboard_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn create_dashboard(
        &self,
        id: &str,
        drop_id: i64,
        name: &str,
        spec_json: &str,
    ) -> anyhow::Result<()> {
        let now = now_ms();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO dashboards (id, drop_id, name, spec_json, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, drop_id, name, spec_json, now],
        )?;
        Ok(())
    }

    pub fn update_dashboard(&self, id: &str, name: &str, spec_json: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE dashboards SET name = ?2, spec_json = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, name, spec_json, now_ms()],
        )?;
        Ok(count > 0)
    }

    pub fn delete_dashboard(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute("DELETE FROM dashboards WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }
}

fn ensure_retention_row(conn: &Connection, drop_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO drop_retention \
         (drop_id, traces_retention_ms, events_retention_ms, updated_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            drop_id,
            DEFAULT_TRACES_RETENTION_MS,
            DEFAULT_EVENTS_RETENTION_MS,
            now_ms()
        ],
    )?;
    Ok(())
}

fn drop_with_retention_from_row(row: &rusqlite::Row) -> rusqlite::Result<DropWithRetention> {
    let has_retention: bool = row.get(4)?;
    let (traces, events) = if has_retention {
        (row.get(5)?, row.get(6)?)
    } else {
        (
            Some(DEFAULT_TRACES_RETENTION_MS),
            Some(DEFAULT_EVENTS_RETENTION_MS),
        )
    };
    Ok(DropWithRetention {
        drop: DropRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            label: row.get(2)?,
            created_at: row.get(3)?,
        },
        traces_retention_ms: traces,
        events_retention_ms: events,
    })
}

fn dashboard_from_row(row: &rusqlite::Row) -> rusqlite::Result<Dashboard> {
    let spec: String = row.get(3)?;
    Ok(Dashboard {
        id: row.get(0)?,
        drop_id: row.get(1)?,
        name: row.get(2)?,
        spec: serde_json::from_str(&spec).unwrap_or(serde_json::Value::Null),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}
