use rusqlite::{Connection, params};

use crate::models::drop::DEFAULT_DROP_NAME;

/// Base schema. Every statement is idempotent (`IF NOT EXISTS`) so the whole
/// block is safe to run on every startup. The telemetry tables are created in
/// their original drop-less shape; `run` upgrades them in place, which keeps
/// one code path for fresh and pre-partitioning databases alike.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS drops (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        name       TEXT NOT NULL UNIQUE COLLATE NOCASE,
        label      TEXT,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS drop_retention (
        drop_id             INTEGER PRIMARY KEY REFERENCES drops(id) ON DELETE CASCADE,
        traces_retention_ms INTEGER,
        events_retention_ms INTEGER,
        updated_at          INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS trace_spans (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        trace_id       TEXT NOT NULL,
        span_id        TEXT NOT NULL,
        parent_span_id TEXT,
        service_name   TEXT NOT NULL,
        operation_name TEXT NOT NULL DEFAULT '',
        start_time     INTEGER NOT NULL,
        end_time       INTEGER,
        duration_ms    INTEGER,
        status         TEXT NOT NULL DEFAULT 'ok' CHECK(status IN ('ok','error')),
        attributes     TEXT NOT NULL DEFAULT '{}',
        created_at     INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS wide_events (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        trace_id       TEXT,
        service_name   TEXT NOT NULL,
        operation_type TEXT,
        field_name     TEXT,
        outcome        TEXT NOT NULL DEFAULT 'unknown',
        duration_ms    REAL,
        user_id        TEXT,
        error_count    INTEGER NOT NULL DEFAULT 0,
        rpc_call_count INTEGER NOT NULL DEFAULT 0,
        attributes     TEXT NOT NULL DEFAULT '{}',
        created_at     INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS user_profiles (
        user_id       TEXT PRIMARY KEY,
        email         TEXT NOT NULL UNIQUE,
        role          TEXT NOT NULL DEFAULT 'member' CHECK(role IN ('admin','member')),
        disabled      INTEGER NOT NULL DEFAULT 0,
        created_at    INTEGER NOT NULL,
        updated_at    INTEGER NOT NULL,
        last_login_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS user_drop_permissions (
        user_id    TEXT NOT NULL REFERENCES user_profiles(user_id) ON DELETE CASCADE,
        drop_id    INTEGER NOT NULL REFERENCES drops(id) ON DELETE CASCADE,
        can_ingest INTEGER NOT NULL DEFAULT 0,
        can_query  INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, drop_id)
    );

    CREATE TABLE IF NOT EXISTS service_accounts (
        id                 TEXT PRIMARY KEY,
        name               TEXT NOT NULL,
        created_by_user_id TEXT NOT NULL,
        created_at         INTEGER NOT NULL,
        UNIQUE (created_by_user_id, name)
    );

    CREATE TABLE IF NOT EXISTS api_keys (
        id                 TEXT PRIMARY KEY,
        service_account_id TEXT NOT NULL REFERENCES service_accounts(id) ON DELETE CASCADE,
        name               TEXT,
        key_prefix         TEXT NOT NULL,
        key_hash           TEXT NOT NULL UNIQUE,
        created_by_user_id TEXT NOT NULL,
        created_at         INTEGER NOT NULL,
        revoked_at         INTEGER
    );

    CREATE TABLE IF NOT EXISTS api_key_permissions (
        api_key_id TEXT NOT NULL REFERENCES api_keys(id) ON DELETE CASCADE,
        drop_id    INTEGER NOT NULL REFERENCES drops(id) ON DELETE CASCADE,
        can_ingest INTEGER NOT NULL DEFAULT 0,
        can_query  INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (api_key_id, drop_id)
    );

    CREATE TABLE IF NOT EXISTS api_key_usage (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        api_key_id TEXT NOT NULL,
        method     TEXT NOT NULL,
        path       TEXT NOT NULL,
        status     INTEGER NOT NULL,
        drop_id    INTEGER,
        ip         TEXT NOT NULL DEFAULT '',
        user_agent TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_api_key_usage_key ON api_key_usage(api_key_id, created_at DESC);

    CREATE TABLE IF NOT EXISTS app_settings (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS dashboards (
        id         TEXT PRIMARY KEY,
        drop_id    INTEGER NOT NULL REFERENCES drops(id) ON DELETE CASCADE,
        name       TEXT NOT NULL,
        spec_json  TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_dashboards_drop ON dashboards(drop_id);
";

/// Run the schema and all additive migrations. Safe to call on every boot.
pub fn run(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(SCHEMA)?;
    let default_drop_id = seed_default_drop(conn)?;
    add_drop_id_column(conn, "trace_spans", default_drop_id)?;
    add_drop_id_column(conn, "wide_events", default_drop_id)?;
    ensure_telemetry_indexes(conn)?;
    Ok(())
}

/// The reserved default drop always exists; it is created here, not on demand.
fn seed_default_drop(conn: &Connection) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO drops (name, created_at) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        params![DEFAULT_DROP_NAME, chrono::Utc::now().timestamp_millis()],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM drops WHERE name = ?1",
        params![DEFAULT_DROP_NAME],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Pre-partitioning databases stored telemetry without a `drop_id`. Add the
/// column with the default drop as its backfill value.
fn add_drop_id_column(conn: &Connection, table: &str, default_drop_id: i64) -> anyhow::Result<()> {
    if has_column(conn, table, "drop_id")? {
        return Ok(());
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {table} ADD COLUMN drop_id INTEGER NOT NULL DEFAULT {default_drop_id};"
    ))?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.prepare(&format!(
        "SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = ?1"
    ))?
    .query_row(params![column], |row| row.get::<_, i64>(0))
    .map(|n| n > 0)
}

/// Composite indexes serve the recent-list/retention scans and trace
/// drill-down; they depend on `drop_id`, so they are created after the
/// additive step.
fn ensure_telemetry_indexes(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_trace_spans_drop_created ON trace_spans(drop_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_trace_spans_drop_trace   ON trace_spans(drop_id, trace_id);
        CREATE INDEX IF NOT EXISTS idx_trace_spans_service      ON trace_spans(service_name);
        CREATE INDEX IF NOT EXISTS idx_wide_events_drop_created ON wide_events(drop_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_wide_events_drop_trace   ON wide_events(drop_id, trace_id);
        CREATE INDEX IF NOT EXISTS idx_wide_events_service      ON wide_events(service_name);
        CREATE INDEX IF NOT EXISTS idx_wide_events_outcome      ON wide_events(outcome);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let drops: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM drops WHERE name = 'default'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(drops, 1);
    }

    #[test]
    fn telemetry_tables_gain_drop_id() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        assert!(has_column(&conn, "trace_spans", "drop_id").unwrap());
        assert!(has_column(&conn, "wide_events", "drop_id").unwrap());
    }

    #[test]
    fn legacy_rows_backfill_to_default_drop() {
        let conn = Connection::open_in_memory().unwrap();
        // Simulate a pre-partitioning database with existing rows.
        conn.execute_batch(
            "CREATE TABLE wide_events (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                trace_id       TEXT,
                service_name   TEXT NOT NULL,
                operation_type TEXT,
                field_name     TEXT,
                outcome        TEXT NOT NULL DEFAULT 'unknown',
                duration_ms    REAL,
                user_id        TEXT,
                error_count    INTEGER NOT NULL DEFAULT 0,
                rpc_call_count INTEGER NOT NULL DEFAULT 0,
                attributes     TEXT NOT NULL DEFAULT '{}',
                created_at     INTEGER NOT NULL
            );
            INSERT INTO wide_events (service_name, outcome, created_at) VALUES ('gw', 'success', 1);",
        )
        .unwrap();

        run(&conn).unwrap();

        let default_id: i64 = conn
            .query_row("SELECT id FROM drops WHERE name = 'default'", [], |r| {
                r.get(0)
            })
            .unwrap();
        let drop_id: i64 = conn
            .query_row("SELECT drop_id FROM wide_events LIMIT 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(drop_id, default_id);
    }
}
