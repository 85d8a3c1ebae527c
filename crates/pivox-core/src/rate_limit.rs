//! Per-domain request rate limiting over rolling minute/hour/day windows.
//!
//! Admission pushes a timestamp into all three windows; waiters park in a
//! FIFO queue per domain and are resumed oldest-first as slots age out.
//! Dropping a waiting future abandons its place without consuming a slot.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::trace;

use crate::config::RateLimitConfig;
use crate::error::{PivoxError, Result};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Poll fallback when no window bound is imminent, so a queue whose front
/// waiter vanished still makes progress.
const IDLE_POLL: Duration = Duration::from_millis(50);

struct Waiter {
    ticket: u64,
    notify: Arc<Notify>,
    alive: Arc<AtomicBool>,
}

/// Clears the alive flag when a waiting future is dropped; the queue
/// prunes dead waiters lazily.
struct WaiterGuard {
    alive: Arc<AtomicBool>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct DomainState {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
    day: VecDeque<Instant>,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
}

impl DomainState {
    fn prune(&mut self, now: Instant) {
        prune_window(&mut self.minute, now, MINUTE);
        prune_window(&mut self.hour, now, HOUR);
        prune_window(&mut self.day, now, DAY);
    }

    fn drop_dead_waiters(&mut self) {
        while let Some(front) = self.waiters.front() {
            if front.alive.load(Ordering::Acquire) {
                break;
            }
            self.waiters.pop_front();
        }
    }

    fn under_limits(&self, limits: &RateLimitConfig) -> bool {
        (self.minute.len() as u32) < limits.per_minute
            && (self.hour.len() as u32) < limits.per_hour
            && (self.day.len() as u32) < limits.per_day
    }

    fn admit(&mut self, now: Instant) {
        self.minute.push_back(now);
        self.hour.push_back(now);
        self.day.push_back(now);
    }

    /// Earliest instant at which every saturated window has released a
    /// slot, or `None` when nothing is saturated.
    fn earliest_release(&self, limits: &RateLimitConfig) -> Option<Instant> {
        let mut release: Option<Instant> = None;
        let windows = [
            (&self.minute, limits.per_minute, MINUTE),
            (&self.hour, limits.per_hour, HOUR),
            (&self.day, limits.per_day, DAY),
        ];
        for (window, limit, span) in windows {
            if window.len() as u32 >= limit {
                if let Some(oldest) = window.front() {
                    let at = *oldest + span;
                    release = Some(release.map_or(at, |r| r.max(at)));
                }
            }
        }
        release
    }
}

fn prune_window(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) < span {
            break;
        }
        window.pop_front();
    }
}

pub struct RateLimiter {
    defaults: RateLimitConfig,
    overrides: parking_lot::RwLock<HashMap<String, RateLimitConfig>>,
    domains: Mutex<HashMap<String, DomainState>>,
}

impl RateLimiter {
    pub fn new(defaults: RateLimitConfig) -> Self {
        Self {
            defaults,
            overrides: parking_lot::RwLock::new(HashMap::new()),
            domains: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_override(&self, domain: impl Into<String>, limits: RateLimitConfig) {
        self.overrides.write().insert(domain.into(), limits);
    }

    fn limits_for(&self, domain: &str) -> RateLimitConfig {
        self.overrides.read().get(domain).copied().unwrap_or(self.defaults)
    }

    /// Block until the domain may start another request.
    pub async fn wait_for_permission(&self, domain: &str) -> Result<()> {
        self.wait_with_deadline(domain, None).await
    }

    /// As `wait_for_permission`, giving up with `ProxyTimeout` once the
    /// deadline passes. The abandoned waiter consumes no slot.
    pub async fn wait_with_deadline(&self, domain: &str, deadline: Option<Duration>) -> Result<()> {
        let overall = deadline.map(|d| Instant::now() + d);
        let limits = self.limits_for(domain);

        let (notify, alive, ticket) = {
            let mut domains = self.domains.lock().await;
            let state = domains.entry(domain.to_string()).or_default();
            let now = Instant::now();
            state.prune(now);
            state.drop_dead_waiters();
            if state.waiters.is_empty() && state.under_limits(&limits) {
                state.admit(now);
                return Ok(());
            }

            let notify = Arc::new(Notify::new());
            let alive = Arc::new(AtomicBool::new(true));
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            state.waiters.push_back(Waiter {
                ticket,
                notify: Arc::clone(&notify),
                alive: Arc::clone(&alive),
            });
            trace!(domain, ticket, "rate limiter queueing waiter");
            (notify, alive, ticket)
        };
        let _guard = WaiterGuard { alive };

        loop {
            let wake_at = {
                let mut domains = self.domains.lock().await;
                let state = domains.get_mut(domain).expect("domain state exists while waiting");
                let now = Instant::now();
                state.prune(now);
                state.drop_dead_waiters();

                if state.waiters.front().map(|w| w.ticket) == Some(ticket) {
                    if state.under_limits(&limits) {
                        state.waiters.pop_front();
                        state.admit(now);
                        if let Some(next) = state.waiters.front() {
                            next.notify.notify_one();
                        }
                        return Ok(());
                    }
                } else if let Some(front) = state.waiters.front() {
                    // Not our turn; make sure the head of the queue checks.
                    front.notify.notify_one();
                }
                state.earliest_release(&limits)
            };

            if let Some(end) = overall {
                if Instant::now() >= end {
                    return Err(PivoxError::ProxyTimeout);
                }
            }

            let mut target = wake_at.unwrap_or_else(|| Instant::now() + IDLE_POLL);
            if let Some(end) = overall {
                target = target.min(end);
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(target) => {}
            }
        }
    }

    /// Whether a request for this domain would be admitted right now,
    /// without consuming a slot. Used by the scheduler's eligibility
    /// check; the request itself consumes the slot when it starts.
    pub async fn would_allow(&self, domain: &str) -> bool {
        let limits = self.limits_for(domain);
        let mut domains = self.domains.lock().await;
        let state = domains.entry(domain.to_string()).or_default();
        let now = Instant::now();
        state.prune(now);
        state.drop_dead_waiters();
        state.waiters.is_empty() && state.under_limits(&limits)
    }

    /// Non-blocking admission: grants and consumes a slot only when no
    /// waiter is already queued ahead.
    pub async fn try_acquire(&self, domain: &str) -> bool {
        let limits = self.limits_for(domain);
        let mut domains = self.domains.lock().await;
        let state = domains.entry(domain.to_string()).or_default();
        let now = Instant::now();
        state.prune(now);
        state.drop_dead_waiters();
        if state.waiters.is_empty() && state.under_limits(&limits) {
            state.admit(now);
            true
        } else {
            false
        }
    }

    /// Current (minute, hour, day) request counts for a domain.
    pub async fn current_counts(&self, domain: &str) -> (usize, usize, usize) {
        let mut domains = self.domains.lock().await;
        match domains.get_mut(domain) {
            Some(state) => {
                state.prune(Instant::now());
                (state.minute.len(), state.hour.len(), state.day.len())
            }
            None => (0, 0, 0),
        }
    }
}
