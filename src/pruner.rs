use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::query_builder::Entity;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct PrunerConfig {
    pub interval: Duration,
    pub batch_size: i64,
    pub max_runtime: Duration,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 5_000,
            max_runtime: Duration::from_millis(250),
        }
    }
}

/// Spawn the retention pruner as a background task (fire-and-forget). Runs
/// once at startup, then on the configured cadence; failures are logged and
/// the next tick retries.
pub fn spawn_pruner(store: Arc<Store>, config: PrunerConfig) {
    tokio::spawn(async move {
        tracing::info!(
            "retention pruner started (interval={}s, batch={}, budget={}ms)",
            config.interval.as_secs(),
            config.batch_size,
            config.max_runtime.as_millis(),
        );
        let mut interval = tokio::time::interval(config.interval);
        loop {
            interval.tick().await;
            let store = store.clone();
            let config = config.clone();
            let result = tokio::task::spawn_blocking(move || run_once(&store, &config, None)).await;
            match result {
                Ok(Ok(deleted)) if deleted > 0 => {
                    tracing::debug!("retention pruner removed {deleted} rows");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!("retention pruner error: {e}"),
                Err(e) => tracing::error!("retention pruner task panicked: {e}"),
            }
        }
    });
}

/// Ad-hoc pass against a single drop, used right after a retention change.
pub fn prune_drop_soon(store: Arc<Store>, config: PrunerConfig, drop_id: i64) {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = run_once(&store, &config, Some(drop_id)) {
            tracing::error!("retention pruning for drop {drop_id} failed: {e}");
        }
    });
}

/// One budget-bound sweep. Deletes in bounded batches so no single
/// transaction holds the write lock long, and stops at the deadline so a
/// large purge never starves readers or ingest.
pub fn run_once(
    store: &Store,
    config: &PrunerConfig,
    only_drop: Option<i64>,
) -> anyhow::Result<u64> {
    let now = chrono::Utc::now().timestamp_millis();
    let deadline = Instant::now() + config.max_runtime;
    let mut total_deleted: u64 = 0;

    let policies = match only_drop {
        Some(drop_id) => vec![store.retention_policy(drop_id)?],
        None => store.retention_policies()?,
    };

    'drops: for policy in policies {
        let streams = [
            (Entity::Traces, policy.traces_retention_ms),
            (Entity::Events, policy.events_retention_ms),
        ];
        for (entity, retention_ms) in streams {
            let Some(retention_ms) = retention_ms else {
                continue;
            };
            let cutoff = now - retention_ms;
            loop {
                let deleted =
                    store.delete_older_than(policy.drop_id, entity, cutoff, config.batch_size)?;
                total_deleted += deleted as u64;
                if deleted == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    break 'drops;
                }
            }
            if Instant::now() >= deadline {
                break 'drops;
            }
        }
    }
    Ok(total_deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::NewWideEvent;
    use crate::models::trace::NewSpan;

    fn config() -> PrunerConfig {
        PrunerConfig::default()
    }

    fn event() -> NewWideEvent {
        NewWideEvent {
            trace_id: None,
            service_name: "svc".to_string(),
            operation_type: None,
            field_name: None,
            outcome: "success".to_string(),
            duration_ms: None,
            user_id: None,
            error_count: 0,
            rpc_call_count: 0,
            attributes: serde_json::json!({}),
        }
    }

    fn span() -> NewSpan {
        NewSpan {
            trace_id: "t1".to_string(),
            span_id: "s1".to_string(),
            parent_span_id: None,
            service_name: "svc".to_string(),
            operation_name: "op".to_string(),
            start_time: 0,
            end_time: None,
            duration_ms: None,
            status: "ok".to_string(),
            attributes: serde_json::Map::new(),
        }
    }

    fn backdate_events(store: &Store, id_at_most: i64, created_at: i64) {
        store.with_conn(|conn| {
            conn.execute(
                "UPDATE wide_events SET created_at = ?1 WHERE id <= ?2",
                rusqlite::params![created_at, id_at_most],
            )
            .unwrap();
        });
    }

    #[test]
    fn expired_rows_are_pruned_and_fresh_rows_survive() {
        let store = Store::open_in_memory().unwrap();
        let drop_id = store.default_drop_id().unwrap();
        let now = chrono::Utc::now().timestamp_millis();

        // One event ten days old, one an hour old; retention of seven days.
        store.insert_events(drop_id, &[event(), event()]).unwrap();
        backdate_events(&store, 1, now - 10 * 86_400_000);
        store.with_conn(|conn| {
            conn.execute(
                "UPDATE wide_events SET created_at = ?1 WHERE id = 2",
                rusqlite::params![now - 3_600_000],
            )
            .unwrap();
        });
        store
            .set_retention(drop_id, None, Some(7 * 86_400_000))
            .unwrap();

        run_once(&store, &config(), None).unwrap();

        let remaining = store.recent_events(drop_id, 100).unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].created_at >= now - 7 * 86_400_000);
    }

    #[test]
    fn disabled_retention_leaves_rows_alone() {
        let store = Store::open_in_memory().unwrap();
        let drop_id = store.default_drop_id().unwrap();
        let now = chrono::Utc::now().timestamp_millis();

        store.insert_spans(drop_id, &[span(), span()]).unwrap();
        store.insert_events(drop_id, &[event()]).unwrap();
        store.with_conn(|conn| {
            conn.execute("UPDATE trace_spans SET created_at = 1", [])
                .unwrap();
        });
        backdate_events(&store, i64::MAX, now - 30 * 86_400_000);

        // 0 and NULL both disable pruning.
        store.set_retention(drop_id, Some(0), None).unwrap();

        let deleted = run_once(&store, &config(), None).unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(store.recent_spans(drop_id, 100).unwrap().len(), 2);
        assert_eq!(store.recent_events(drop_id, 100).unwrap().len(), 1);
    }

    #[test]
    fn retention_applies_per_drop() {
        let store = Store::open_in_memory().unwrap();
        let keep = store.create_drop("keep", None).unwrap().id;
        let purge = store.create_drop("purge", None).unwrap().id;
        let now = chrono::Utc::now().timestamp_millis();

        store.insert_events(keep, &[event()]).unwrap();
        store.insert_events(purge, &[event()]).unwrap();
        backdate_events(&store, i64::MAX, now - 10 * 86_400_000);

        store.set_retention(keep, None, None).unwrap();
        store.set_retention(purge, None, Some(86_400_000)).unwrap();

        run_once(&store, &config(), None).unwrap();
        assert_eq!(store.recent_events(keep, 10).unwrap().len(), 1);
        assert_eq!(store.recent_events(purge, 10).unwrap().len(), 0);
    }

    #[test]
    fn single_drop_invocation_ignores_other_drops() {
        let store = Store::open_in_memory().unwrap();
        let a = store.create_drop("a", None).unwrap().id;
        let b = store.create_drop("b", None).unwrap().id;
        let now = chrono::Utc::now().timestamp_millis();

        store.insert_events(a, &[event()]).unwrap();
        store.insert_events(b, &[event()]).unwrap();
        backdate_events(&store, i64::MAX, now - 10 * 86_400_000);
        store.set_retention(a, None, Some(86_400_000)).unwrap();
        store.set_retention(b, None, Some(86_400_000)).unwrap();

        run_once(&store, &config(), Some(a)).unwrap();
        assert_eq!(store.recent_events(a, 10).unwrap().len(), 0);
        assert_eq!(store.recent_events(b, 10).unwrap().len(), 1);
    }

    #[test]
    fn deletes_proceed_in_batches() {
        let store = Store::open_in_memory().unwrap();
        let drop_id = store.default_drop_id().unwrap();
        let now = chrono::Utc::now().timestamp_millis();

        let rows: Vec<NewWideEvent> = (0..25).map(|_| event()).collect();
        store.insert_events(drop_id, &rows).unwrap();
        backdate_events(&store, i64::MAX, now - 10 * 86_400_000);
        store
            .set_retention(drop_id, None, Some(86_400_000))
            .unwrap();

        let small_batches = PrunerConfig {
            batch_size: 10,
            ..config()
        };
        let deleted = run_once(&store, &small_batches, None).unwrap();
        assert_eq!(deleted, 25);
        assert_eq!(store.recent_events(drop_id, 100).unwrap().len(), 0);
    }
}
