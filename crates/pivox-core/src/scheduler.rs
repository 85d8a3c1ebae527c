//! Priority task scheduling with bounded, load-adaptive concurrency.
//!
//! Tasks run strictly by `(priority, created_at)` among the eligible set.
//! A task becomes eligible once its dependencies are terminal, its domain
//! is under both its concurrency cap and its rate limit, and a global
//! slot is free. The global level breathes with the resource monitor.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Future;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{ErrorKind, Result};
use crate::monitor::ResourceMonitor;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

/// Dispatcher poll fallback; covers backoff expiry and rate-limit slots
/// opening by time passage.
const DISPATCH_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl TaskPriority {
    /// Lower rank dispatches first.
    fn rank(&self) -> u8 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
            TaskPriority::Background => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Terminal outcome delivered through a task's handle.
#[derive(Debug)]
pub enum TaskResult {
    Completed(serde_json::Value),
    Failed(ErrorKind, String),
    Cancelled,
}

type TaskFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;
type TaskPayload = Box<dyn Fn() -> TaskFuture + Send + Sync>;

/// A unit of work to schedule. The payload closure is re-invoked on retry.
pub struct TaskSpec {
    pub domain: String,
    pub priority: TaskPriority,
    pub max_retries: u32,
    pub dependencies: Vec<Uuid>,
    payload: TaskPayload,
}

impl TaskSpec {
    pub fn new<F, Fut>(domain: impl Into<String>, priority: TaskPriority, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            domain: domain.into(),
            priority,
            max_retries: 0,
            dependencies: Vec::new(),
            payload: Box::new(move || Box::pin(work())),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

pub struct TaskHandle {
    pub id: Uuid,
    rx: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    /// Await the task's terminal outcome. A discarded sender means the
    /// outcome was dropped by cancellation.
    pub async fn result(self) -> TaskResult {
        self.rx.await.unwrap_or(TaskResult::Cancelled)
    }
}

struct QueuedTask {
    id: Uuid,
    domain: String,
    priority: TaskPriority,
    max_retries: u32,
    retry_count: u32,
    dependencies: Vec<Uuid>,
    payload: Arc<TaskPayload>,
    created_seq: u64,
    not_before: Option<tokio::time::Instant>,
    result_tx: oneshot::Sender<TaskResult>,
    cancel_flag: Arc<AtomicBool>,
}

#[derive(Default)]
struct SchedInner {
    queue: Vec<QueuedTask>,
    statuses: HashMap<Uuid, TaskStatus>,
    cancel_flags: HashMap<Uuid, Arc<AtomicBool>>,
    running_count: usize,
    per_domain: HashMap<String, usize>,
    level: usize,
    seq: u64,
}

impl SchedInner {
    fn deps_terminal(&self, task: &QueuedTask) -> bool {
        task.dependencies.iter().all(|dep| {
            self.statuses
                .get(dep)
                .map(|s| s.is_terminal())
                // An unknown dependency can never complete; treat it as
                // terminal rather than wedging the task forever.
                .unwrap_or(true)
        })
    }

    /// Ids eligible to dispatch right now, best-first.
    fn eligible(&self, max_per_domain: usize, now: tokio::time::Instant) -> Vec<Uuid> {
        if self.running_count >= self.level {
            return Vec::new();
        }
        let mut candidates: Vec<&QueuedTask> = self
            .queue
            .iter()
            .filter(|t| t.not_before.map_or(true, |at| now >= at))
            .filter(|t| self.deps_terminal(t))
            .filter(|t| {
                self.per_domain.get(&t.domain).copied().unwrap_or(0) < max_per_domain
            })
            .collect();
        candidates.sort_by_key(|t| (t.priority.rank(), t.created_seq));
        candidates.iter().map(|t| t.id).collect()
    }
}

pub struct TaskScheduler {
    inner: Arc<Mutex<SchedInner>>,
    notify: Arc<Notify>,
    monitor: Arc<ResourceMonitor>,
    rate_limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
    loops: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        monitor: Arc<ResourceMonitor>,
        rate_limiter: Arc<RateLimiter>,
        retry_policy: RetryPolicy,
    ) -> Arc<Self> {
        let mut inner = SchedInner::default();
        inner.level = config.max_concurrent.clamp(config.min_level, config.max_level);
        Arc::new(Self {
            inner: Arc::new(Mutex::new(inner)),
            notify: Arc::new(Notify::new()),
            monitor,
            rate_limiter,
            retry_policy,
            config,
            running: Arc::new(AtomicBool::new(false)),
            loops: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub async fn enqueue(&self, spec: TaskSpec) -> TaskHandle {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let cancel_flag = Arc::new(AtomicBool::new(false));

        {
            let mut inner = self.inner.lock().await;
            inner.seq += 1;
            let seq = inner.seq;
            inner.statuses.insert(id, TaskStatus::Queued);
            inner.cancel_flags.insert(id, Arc::clone(&cancel_flag));
            inner.queue.push(QueuedTask {
                id,
                domain: spec.domain,
                priority: spec.priority,
                max_retries: spec.max_retries,
                retry_count: 0,
                dependencies: spec.dependencies,
                payload: Arc::new(spec.payload),
                created_seq: seq,
                not_before: None,
                result_tx: tx,
                cancel_flag,
            });
        }
        self.notify.notify_one();
        debug!(%id, "task enqueued");
        TaskHandle { id, rx }
    }

    pub async fn status(&self, id: Uuid) -> Option<TaskStatus> {
        self.inner.lock().await.statuses.get(&id).copied()
    }

    pub async fn current_level(&self) -> usize {
        self.inner.lock().await.level
    }

    /// Cancel one task. Queued tasks terminate immediately; an executing
    /// task transitions to cancelled and its in-flight outcome is
    /// discarded when it lands.
    pub async fn cancel(&self, id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner.queue.iter().position(|t| t.id == id) {
            let task = inner.queue.remove(pos);
            inner.statuses.insert(id, TaskStatus::Cancelled);
            let _ = task.result_tx.send(TaskResult::Cancelled);
            return;
        }
        if let Some(flag) = inner.cancel_flags.get(&id) {
            flag.store(true, Ordering::Release);
            inner.statuses.insert(id, TaskStatus::Cancelled);
        }
    }

    pub async fn cancel_all(&self) {
        let ids: Vec<Uuid> = {
            let inner = self.inner.lock().await;
            inner
                .statuses
                .iter()
                .filter(|(_, s)| !s.is_terminal())
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.cancel(id).await;
        }
        self.notify.notify_one();
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("scheduler starting");
        let dispatcher = {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move { scheduler.dispatch_loop().await })
        };
        let adapter = {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move { scheduler.resource_loop().await })
        };
        let mut loops = self.loops.lock();
        loops.push(dispatcher);
        loops.push(adapter);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.notify.notify_waiters();
        for handle in self.loops.lock().drain(..) {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    async fn dispatch_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            let dispatched = self.try_dispatch_one().await;
            if !dispatched {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(DISPATCH_POLL) => {}
                }
            }
        }
    }

    /// Dispatch the best eligible task whose domain the rate limiter
    /// admits. Returns whether anything started.
    async fn try_dispatch_one(self: &Arc<Self>) -> bool {
        let now = tokio::time::Instant::now();
        let candidates = {
            let inner = self.inner.lock().await;
            inner.eligible(self.config.max_per_domain, now)
        };

        for id in candidates {
            let domain = {
                let inner = self.inner.lock().await;
                match inner.queue.iter().find(|t| t.id == id) {
                    Some(task) => task.domain.clone(),
                    None => continue,
                }
            };
            if !self.rate_limiter.would_allow(&domain).await {
                continue;
            }

            let task = {
                let mut inner = self.inner.lock().await;
                if inner.running_count >= inner.level {
                    return false;
                }
                let Some(pos) = inner.queue.iter().position(|t| t.id == id) else {
                    continue;
                };
                let task = inner.queue.remove(pos);
                inner.running_count += 1;
                *inner.per_domain.entry(task.domain.clone()).or_insert(0) += 1;
                inner.statuses.insert(task.id, TaskStatus::Executing);
                task
            };
            self.spawn_task(task);
            return true;
        }
        false
    }

    fn spawn_task(self: &Arc<Self>, task: QueuedTask) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            debug!(id = %task.id, domain = %task.domain, "task executing");
            let result = (task.payload)().await;
            scheduler.complete_task(task, result).await;
        });
    }

    async fn complete_task(&self, task: QueuedTask, result: Result<serde_json::Value>) {
        let mut inner = self.inner.lock().await;
        inner.running_count = inner.running_count.saturating_sub(1);
        if let Some(count) = inner.per_domain.get_mut(&task.domain) {
            *count = count.saturating_sub(1);
        }

        if task.cancel_flag.load(Ordering::Acquire) {
            // Already transitioned to cancelled; the outcome is discarded.
            inner.statuses.insert(task.id, TaskStatus::Cancelled);
            drop(inner);
            self.notify.notify_one();
            return;
        }

        match result {
            Ok(value) => {
                inner.statuses.insert(task.id, TaskStatus::Completed);
                let _ = task.result_tx.send(TaskResult::Completed(value));
            }
            Err(error) => {
                let retryable = self.retry_policy.is_retryable(error.kind());
                if retryable && task.retry_count < task.max_retries {
                    let attempt = task.retry_count;
                    let backoff = self.retry_policy.backoff_for(attempt);
                    debug!(
                        id = %task.id,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "task retrying"
                    );
                    inner.statuses.insert(task.id, TaskStatus::Queued);
                    inner.queue.push(QueuedTask {
                        retry_count: task.retry_count + 1,
                        not_before: Some(tokio::time::Instant::now() + backoff),
                        ..task
                    });
                } else {
                    warn!(id = %task.id, error = %error, "task failed");
                    inner.statuses.insert(task.id, TaskStatus::Failed);
                    let _ = task
                        .result_tx
                        .send(TaskResult::Failed(error.kind(), error.to_string()));
                }
            }
        }
        drop(inner);
        self.notify.notify_one();
    }

    async fn resource_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.resource_check_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while self.running.load(Ordering::Acquire) {
            ticker.tick().await;
            let cpu = self.monitor.cpu_usage();
            let memory = self.monitor.memory_usage();
            let mut inner = self.inner.lock().await;
            let level = inner.level;
            let adjusted = adjust_level(level, cpu, memory, &self.config);
            if adjusted != level {
                info!(from = level, to = adjusted, cpu, memory, "concurrency level adjusted");
                inner.level = adjusted;
                drop(inner);
                self.notify.notify_one();
            }
        }
    }
}

/// Shrink ×0.8 when either usage breaches its threshold; grow ×1.2 once
/// both fall below 70% of threshold; clamp to the configured band.
fn adjust_level(level: usize, cpu: f64, memory: f64, config: &SchedulerConfig) -> usize {
    let overloaded = cpu > config.cpu_threshold || memory > config.memory_threshold;
    let relaxed = cpu < config.cpu_threshold * 0.7 && memory < config.memory_threshold * 0.7;

    let next = if overloaded {
        (level as f64 * 0.8).round() as usize
    } else if relaxed {
        // Rounding alone is a fixed point at small levels.
        ((level as f64 * 1.2).round() as usize).max(level + 1)
    } else {
        level
    };
    next.clamp(config.min_level, config.max_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[test]
    fn test_priority_rank_order() {
        assert!(TaskPriority::Critical.rank() < TaskPriority::High.rank());
        assert!(TaskPriority::High.rank() < TaskPriority::Normal.rank());
        assert!(TaskPriority::Low.rank() < TaskPriority::Background.rank());
    }

    #[test]
    fn test_adjust_level_shrinks_under_load() {
        let cfg = config();
        assert_eq!(adjust_level(10, 0.9, 0.1, &cfg), 8);
        assert_eq!(adjust_level(10, 0.1, 0.95, &cfg), 8);
    }

    #[test]
    fn test_adjust_level_grows_when_relaxed() {
        let cfg = config();
        assert_eq!(adjust_level(10, 0.1, 0.1, &cfg), 12);
        // Growth escapes the small-level fixed point.
        assert_eq!(adjust_level(1, 0.0, 0.0, &cfg), 2);
    }

    #[test]
    fn test_adjust_level_clamps() {
        let cfg = config();
        assert_eq!(adjust_level(32, 0.0, 0.0, &cfg), 32);
        assert_eq!(adjust_level(1, 1.0, 1.0, &cfg), 1);
    }

    #[test]
    fn test_adjust_level_holds_in_band() {
        let cfg = config();
        // Above 70% of threshold but below it: no change either way.
        assert_eq!(adjust_level(10, 0.7, 0.7, &cfg), 10);
    }
}
