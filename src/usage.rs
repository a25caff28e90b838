use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::models::api_key::NewApiKeyUsage;
use crate::store::Store;

/// Handle for appending API-key usage rows (non-blocking, fire-and-forget).
/// The auth middleware is the sole producer, so each api-key request yields
/// exactly one row.
#[derive(Clone)]
pub struct UsageLogger {
    tx: mpsc::UnboundedSender<NewApiKeyUsage>,
}

impl UsageLogger {
    pub fn log(&self, event: NewApiKeyUsage) {
        let _ = self.tx.send(event);
    }
}

/// Request-scoped slot the HTTP surface fills with the resolved drop id so
/// the middleware can annotate the usage row after the handler ran.
#[derive(Clone, Default)]
pub struct UsageDropId(Arc<Mutex<Option<i64>>>);

impl UsageDropId {
    pub fn set(&self, drop_id: i64) {
        *self.0.lock().unwrap() = Some(drop_id);
    }

    pub fn get(&self) -> Option<i64> {
        *self.0.lock().unwrap()
    }
}

/// Logger wired to a receiver the caller controls; nothing is spawned.
#[cfg(test)]
pub(crate) fn test_logger() -> (UsageLogger, mpsc::UnboundedReceiver<NewApiKeyUsage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (UsageLogger { tx }, rx)
}

const FLUSH_THRESHOLD: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Spawn the background usage writer and return the logger handle.
pub fn spawn(store: Arc<Store>) -> UsageLogger {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(usage_writer(rx, store));
    UsageLogger { tx }
}

/// Batches usage rows and flushes on size or cadence; one transaction per
/// flush.
async fn usage_writer(mut rx: mpsc::UnboundedReceiver<NewApiKeyUsage>, store: Arc<Store>) {
    let mut buffer: Vec<NewApiKeyUsage> = Vec::new();
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= FLUSH_THRESHOLD {
                            flush(&store, std::mem::take(&mut buffer));
                        }
                    }
                    None => {
                        flush(&store, std::mem::take(&mut buffer));
                        return;
                    }
                }
            }
            _ = interval.tick() => {
                if !buffer.is_empty() {
                    flush(&store, std::mem::take(&mut buffer));
                }
            }
        }
    }
}

fn flush(store: &Store, batch: Vec<NewApiKeyUsage>) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    if let Err(e) = store.insert_usage_batch(&batch) {
        tracing::warn!("failed to flush {count} api key usage rows: {e}");
    } else {
        tracing::debug!("flushed {count} api key usage rows");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(drop_id: Option<i64>) -> NewApiKeyUsage {
        NewApiKeyUsage {
            api_key_id: "key-1".to_string(),
            method: "POST".to_string(),
            path: "/v1/events".to_string(),
            status: 200,
            drop_id,
            ip: "127.0.0.1".to_string(),
            user_agent: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn writer_drains_channel_into_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let logger = spawn(store.clone());
        let drop_id = store.default_drop_id().unwrap();

        logger.log(usage(Some(drop_id)));
        logger.log(usage(None));
        drop(logger);

        // The writer flushes the remaining buffer when the channel closes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rows: i64 = store.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM api_key_usage", [], |r| r.get(0))
                .unwrap()
        });
        assert_eq!(rows, 2);
    }

    #[test]
    fn usage_drop_slot_round_trips() {
        let slot = UsageDropId::default();
        assert_eq!(slot.get(), None);
        slot.set(42);
        assert_eq!(slot.get(), Some(42));
    }
}
