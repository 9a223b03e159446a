//! Background writer between the request path and the traffic log store.
//!
//! The gateway hands entries over with a non-blocking `try_send`; a single
//! task drains the queue and appends in order, retrying a bounded number of
//! times. Failures never reach the request, they are logged and counted.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, warn};
use metrics::increment_counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::storage::TrafficLogStore;
use crate::models::{LogEntry, StorageConfig};

const RETRY_BACKOFF: Duration = Duration::from_millis(50);

enum Command {
    Append(LogEntry),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle used by the gateway to record entries
#[derive(Clone)]
pub struct TrafficLogger {
    sender: mpsc::Sender<Command>,
    /// Serializes stamping with enqueueing so queue order is time order.
    stamp: Arc<Mutex<()>>,
}

/// Owner of the writer task, used to shut it down
pub struct LogWriter {
    handle: JoinHandle<()>,
}

impl TrafficLogger {
    /// Start the writer task for `store`
    pub fn spawn(store: Arc<dyn TrafficLogStore>, config: &StorageConfig) -> (Self, LogWriter) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let attempts = config.append_retries.max(1);
        let handle = tokio::spawn(run_writer(store, receiver, attempts));
        let logger = Self {
            sender,
            stamp: Arc::new(Mutex::new(())),
        };
        (logger, LogWriter { handle })
    }

    /// Queue an entry without waiting. Returns `false` if it was dropped.
    pub fn record(&self, entry: LogEntry) -> bool {
        let _order = self.lock_stamp();
        self.enqueue(entry)
    }

    /// Queue the entry `build` makes from the current time. Entries recorded
    /// this way reach the store in timestamp order.
    pub fn record_now<F>(&self, build: F) -> bool
    where
        F: FnOnce(DateTime<Utc>) -> LogEntry,
    {
        let _order = self.lock_stamp();
        self.enqueue(build(Utc::now()))
    }

    fn lock_stamp(&self) -> MutexGuard<'_, ()> {
        self.stamp.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, entry: LogEntry) -> bool {
        match self.sender.try_send(Command::Append(entry)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Traffic log queue is full, dropping entry");
                increment_counter!("guard_log_dropped_total");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Traffic log writer has stopped, dropping entry");
                increment_counter!("guard_log_dropped_total");
                false
            }
        }
    }

    /// Wait until every entry queued before this call has been handled
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Command::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

impl LogWriter {
    /// Flush what is queued through `logger` and stop the writer
    pub async fn shutdown(self, logger: TrafficLogger) {
        logger.flush().await;
        drop(logger);
        self.handle.abort();
        let _ = self.handle.await;
    }
}

async fn run_writer(
    store: Arc<dyn TrafficLogStore>,
    mut receiver: mpsc::Receiver<Command>,
    attempts: u32,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            Command::Append(entry) => append_with_retry(store.as_ref(), &entry, attempts).await,
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn append_with_retry(store: &dyn TrafficLogStore, entry: &LogEntry, attempts: u32) {
    for attempt in 1..=attempts {
        match store.append(entry).await {
            Ok(()) => return,
            Err(e) if attempt < attempts => {
                warn!("Traffic log append failed (attempt {}/{}): {}", attempt, attempts, e);
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => {
                error!(
                    "Giving up on traffic log entry for {} {} from {}: {}",
                    entry.method, entry.path, entry.client_id, e
                );
                increment_counter!("guard_log_append_failures_total");
            }
        }
    }
}
