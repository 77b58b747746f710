use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::memory::{FailureRecord, MemoryService, ModelStat, PerformanceRecord, SuccessPattern};

/// Bound on queued outcome records awaiting the worker.
pub const QUEUE_CAPACITY: usize = 256;

enum LearningEvent {
    Attempt(PerformanceRecord),
    Success(SuccessPattern),
    Failure(FailureRecord),
}

struct Inner {
    queue: std::sync::Mutex<VecDeque<LearningEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    memory: Arc<dyn MemoryService>,
}

/// Async, best-effort outcome recorder. Writes go through a bounded queue
/// drained by one dedicated worker task, so persistence never blocks a
/// job; on backpressure the oldest record is dropped and counted.
#[derive(Clone)]
pub struct LearningRecorder {
    inner: Arc<Inner>,
}

impl LearningRecorder {
    /// Create the recorder and spawn its worker.
    pub fn spawn(memory: Arc<dyn MemoryService>) -> Self {
        let inner = Arc::new(Inner {
            queue: std::sync::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            memory,
        });

        let worker = inner.clone();
        tokio::spawn(async move {
            loop {
                let event = {
                    let mut queue = worker.queue.lock().expect("learning queue poisoned");
                    queue.pop_front()
                };
                match event {
                    Some(event) => worker.store(event).await,
                    None => worker.notify.notified().await,
                }
            }
        });

        Self { inner }
    }

    pub fn record_attempt(&self, record: PerformanceRecord) {
        self.push(LearningEvent::Attempt(record));
    }

    pub fn record_success(&self, pattern: SuccessPattern) {
        self.push(LearningEvent::Success(pattern));
    }

    pub fn record_failure(&self, record: FailureRecord) {
        self.push(LearningEvent::Failure(record));
    }

    /// Records dropped to backpressure since startup.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Outstanding queued records (observability).
    pub fn backlog(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Ranked per-model stats for a (language, task type) pair. An
    /// unreachable memory service yields an empty list and the caller
    /// degrades to priority-based selection.
    pub async fn stats(&self, language: &str, task_type: &str) -> Vec<ModelStat> {
        match self.inner.memory.get_model_stats(language, task_type).await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!("model stats unavailable: {e}");
                Vec::new()
            }
        }
    }

    fn push(&self, event: LearningEvent) {
        {
            let mut queue = self.inner.queue.lock().expect("learning queue poisoned");
            if queue.len() >= QUEUE_CAPACITY {
                queue.pop_front();
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped, "learning queue full — dropped oldest record");
            }
            queue.push_back(event);
        }
        self.inner.notify.notify_one();
    }
}

impl Inner {
    async fn store(&self, event: LearningEvent) {
        let result = match &event {
            LearningEvent::Attempt(record) => self.memory.store_model_performance(record).await,
            LearningEvent::Success(pattern) => self.memory.store_successful_task(pattern).await,
            LearningEvent::Failure(record) => self.memory.store_task_failure(record).await,
        };
        if let Err(e) = result {
            tracing::warn!("learning write failed: {e}");
        }
    }
}
