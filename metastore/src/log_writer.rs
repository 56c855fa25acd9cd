use crate::logs::{append_batch, StoredLogEntry};
use crate::metadata_db::MetadataDb;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const DRAIN_INTERVAL: Duration = Duration::from_millis(250);

struct Shared {
    queue: Mutex<VecDeque<StoredLogEntry>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    shutdown: AtomicBool,
}

/// Bounded queue in front of the `logs` table with a background flush task.
///
/// When the queue is full the oldest entry is dropped so a stalled store
/// never blocks the worker. Store failures degrade to stderr; they never
/// interrupt a run.
pub struct LogWriter {
    shared: Arc<Shared>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LogWriter {
    pub fn spawn(db: MetadataDb, capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });
        let task_shared = shared.clone();
        let task = tokio::spawn(async move {
            drain_loop(db, task_shared).await;
        });
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Non-blocking append; drops the oldest entry when full.
    pub fn enqueue(&self, entry: StoredLogEntry) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(entry);
        }
        self.shared.notify.notify_one();
    }

    /// Number of entries discarded because the consumer stalled.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Waits until the queue drains or `timeout` elapses. Returns whether the
    /// queue is empty.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        self.shared.notify.notify_one();
        loop {
            if self.shared.queue.lock().unwrap().is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Drains the queue and stops the background task. Undrained entries are
    /// dumped to stderr. Idempotent.
    pub async fn shutdown(&self, timeout: Duration) {
        let drained = self.flush(timeout).await;
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .is_err()
            {
                eprintln!("log writer did not stop in time");
            }
        }
        if !drained {
            for entry in self.shared.queue.lock().unwrap().drain(..) {
                eprintln!(
                    "[{}] [{}] [{}] {}",
                    entry.ts, entry.level, entry.component, entry.message
                );
            }
        }
    }
}

async fn drain_loop(db: MetadataDb, shared: Arc<Shared>) {
    loop {
        let batch: Vec<StoredLogEntry> = {
            let mut queue = shared.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        if !batch.is_empty() {
            if let Err(e) = append_batch(&db, &batch).await {
                eprintln!("writing log entries to the metadata store: {e:?}");
                for entry in &batch {
                    eprintln!(
                        "[{}] [{}] [{}] {}",
                        entry.ts, entry.level, entry.component, entry.message
                    );
                }
            }
        }
        if shared.shutdown.load(Ordering::SeqCst) && shared.queue.lock().unwrap().is_empty() {
            return;
        }
        let _ = tokio::time::timeout(DRAIN_INTERVAL, shared.notify.notified()).await;
    }
}
