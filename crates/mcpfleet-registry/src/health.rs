//! Health monitor (ping loop)
//!
//! Each monitored connection id has one loop: ping, append a [`PingRecord`],
//! schedule the next tick. Failures stretch the delay by `backoff_factor`
//! (capped at `max_interval`); one success restores the base interval.
//! Delays are owned by the [`Scheduler`], so no lock is held across them.
//! Ping failures are recorded and never returned to the caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use mcpfleet_core::{HealthSummary, MonitorConfig, PingRecord, Result, Scheduler};
use tracing::{debug, info, warn};

use crate::safe_await::elapsed_ms;

/// Shortest interval a loop may run at.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// A ping to run each tick.
pub type PingOperation = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// [`Scheduler`] backed by the tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn run_after(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }
}

struct MonitorInner {
    config: MonitorConfig,
    scheduler: Arc<dyn Scheduler>,
    histories: DashMap<String, VecDeque<PingRecord>>,
    /// Connection id → generation of its live loop
    loops: DashMap<String, u64>,
    next_generation: AtomicU64,
}

impl MonitorInner {
    fn is_current(&self, id: &str, generation: u64) -> bool {
        self.loops.get(id).map(|g| *g == generation).unwrap_or(false)
    }

    fn append(&self, id: &str, record: PingRecord) {
        let mut history = self.histories.entry(id.to_string()).or_default();
        history.push_back(record);
        while history.len() > self.config.history_cap.max(1) {
            history.pop_front();
        }
    }

    fn next_delay(&self, current: Duration, base: Duration) -> Duration {
        let cap = self.config.max_interval().max(base);
        let factor = self.config.backoff_factor.max(1.0);
        Duration::try_from_secs_f64(current.as_secs_f64() * factor).map_or(cap, |next| next.min(cap))
    }

    fn schedule(
        self: Arc<Self>,
        id: String,
        generation: u64,
        operation: PingOperation,
        base: Duration,
        current: Duration,
        delay: Duration,
    ) {
        let scheduler = Arc::clone(&self.scheduler);
        scheduler.run_after(
            delay,
            Box::pin(self.tick(id, generation, operation, base, current)),
        );
    }

    async fn tick(
        self: Arc<Self>,
        id: String,
        generation: u64,
        operation: PingOperation,
        base: Duration,
        current: Duration,
    ) {
        if !self.is_current(&id, generation) {
            debug!(connection = %id, "[HealthMonitor] Monitoring stopped, not rescheduling");
            return;
        }

        let started = Instant::now();
        let result = operation().await;
        let elapsed = elapsed_ms(started);

        let next = match &result {
            Ok(()) => {
                self.append(&id, PingRecord::success(elapsed));
                base
            }
            Err(e) => {
                self.append(&id, PingRecord::failure(elapsed, e.to_string()));
                let next = self.next_delay(current, base);
                warn!(
                    connection = %id,
                    error = %e,
                    next_in_secs = next.as_secs_f64(),
                    "[HealthMonitor] Ping failed, backing off"
                );
                next
            }
        };

        if self.is_current(&id, generation) {
            self.schedule(id, generation, operation, base, next, next);
        }
    }
}

pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                scheduler,
                histories: DashMap::new(),
                loops: DashMap::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Start (or restart) the ping loop for `id`. The first ping runs
    /// immediately; `interval` defaults to the configured one.
    pub fn start_monitoring(
        &self,
        id: impl Into<String>,
        operation: PingOperation,
        interval: Option<Duration>,
    ) {
        let id = id.into();
        let base = interval
            .unwrap_or_else(|| self.inner.config.interval())
            .max(MIN_INTERVAL);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        if self.inner.loops.insert(id.clone(), generation).is_some() {
            debug!(connection = %id, "[HealthMonitor] Replacing existing monitor");
        }

        info!(
            connection = %id,
            interval_secs = base.as_secs_f64(),
            "[HealthMonitor] Monitoring started"
        );
        Arc::clone(&self.inner).schedule(id, generation, operation, base, base, Duration::ZERO);
    }

    /// The next scheduled tick observes the stop and does not reschedule.
    pub fn stop_monitoring(&self, id: &str) -> bool {
        let stopped = self.inner.loops.remove(id).is_some();
        if stopped {
            info!(connection = %id, "[HealthMonitor] Monitoring stopped");
        }
        stopped
    }

    pub fn stop_all(&self) {
        self.inner.loops.clear();
    }

    pub fn is_monitoring(&self, id: &str) -> bool {
        self.inner.loops.contains_key(id)
    }

    pub fn monitored(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.loops.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn history(&self, id: &str) -> Vec<PingRecord> {
        self.inner
            .histories
            .get(id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn recent(&self, id: &str, lookback: Duration) -> Vec<PingRecord> {
        let Ok(window) = chrono::Duration::from_std(lookback) else {
            return self.history(id);
        };
        let since = Utc::now() - window;
        self.inner
            .histories
            .get(id)
            .map(|h| h.iter().filter(|r| r.timestamp >= since).cloned().collect())
            .unwrap_or_default()
    }

    /// Success ratio within `lookback` meets the threshold. No records means
    /// unhealthy.
    pub fn is_healthy(&self, id: &str, lookback: Option<Duration>) -> bool {
        let lookback = lookback.unwrap_or_else(|| self.inner.config.lookback());
        let records = self.recent(id, lookback);
        if records.is_empty() {
            return false;
        }
        let successes = records.iter().filter(|r| r.success).count();
        successes as f64 / records.len() as f64 >= self.inner.config.healthy_threshold
    }

    /// Drop records older than `retention` and forget idle ids with no
    /// records left. Returns the number of records removed.
    pub fn cleanup(&self, retention: Option<Duration>) -> usize {
        let retention = retention.unwrap_or_else(|| self.inner.config.retention());
        let Ok(window) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - window;

        let mut removed = 0;
        for mut history in self.inner.histories.iter_mut() {
            let before = history.len();
            history.retain(|r| r.timestamp >= cutoff);
            removed += before - history.len();
        }
        self.inner
            .histories
            .retain(|id, history| !history.is_empty() || self.inner.loops.contains_key(id));

        if removed > 0 {
            debug!(removed, "[HealthMonitor] Pruned ping records");
        }
        removed
    }

    /// Aggregate over every monitored id.
    pub fn summary(&self) -> HealthSummary {
        let lookback = self.inner.config.lookback();
        let monitored = self.monitored();
        let mut unhealthy = Vec::new();
        let mut total = 0usize;
        let mut successes = 0usize;
        let mut response_sum = 0.0;

        for id in &monitored {
            let records = self.recent(id, lookback);
            total += records.len();
            successes += records.iter().filter(|r| r.success).count();
            response_sum += records.iter().map(|r| r.response_time_ms).sum::<f64>();
            if !self.is_healthy(id, Some(lookback)) {
                unhealthy.push(id.clone());
            }
        }

        HealthSummary {
            healthy: monitored.len() - unhealthy.len(),
            monitored: monitored.len(),
            unhealthy,
            success_rate: (total > 0).then(|| successes as f64 / total as f64),
            average_response_time_ms: (total > 0).then(|| response_sum / total as f64),
        }
    }
}
