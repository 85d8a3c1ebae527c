//! Process resource sampling.
//!
//! A background task samples CPU and memory on a fixed interval and
//! publishes the latest values through atomics, so readers never block.
//! CPU is per-process time delta over wall-clock delta across all
//! processors; memory is resident set over physical total. Accounting is
//! Linux `/proc`; other targets report zero.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(5000);

pub struct ResourceMonitor {
    cpu_bits: Arc<AtomicU64>,
    memory_bits: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    check_interval: Duration,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(check_interval: Duration) -> Self {
        Self {
            cpu_bits: Arc::new(AtomicU64::new(0)),
            memory_bits: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            check_interval,
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// A monitor pinned to fixed readings that never samples. Useful for
    /// callers that want a static concurrency level, and for tests.
    pub fn fixed(cpu: f64, memory: f64) -> Self {
        let monitor = Self::new(DEFAULT_CHECK_INTERVAL);
        monitor.publish(cpu, memory);
        monitor
    }

    /// Latest CPU usage in `[0, 1]`.
    pub fn cpu_usage(&self) -> f64 {
        f64::from_bits(self.cpu_bits.load(Ordering::Acquire))
    }

    /// Latest memory usage in `[0, 1]`.
    pub fn memory_usage(&self) -> f64 {
        f64::from_bits(self.memory_bits.load(Ordering::Acquire))
    }

    /// Inject readings directly; also how the sampler publishes.
    pub fn publish(&self, cpu: f64, memory: f64) {
        self.cpu_bits
            .store(cpu.clamp(0.0, 1.0).to_bits(), Ordering::Release);
        self.memory_bits
            .store(memory.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.running.store(true, Ordering::Release);

        let cpu_bits = Arc::clone(&self.cpu_bits);
        let memory_bits = Arc::clone(&self.memory_bits);
        let running = Arc::clone(&self.running);
        let interval = self.check_interval;

        *handle = Some(tokio::spawn(async move {
            let mut last_cpu = read_process_cpu_seconds();
            let mut last_wall = std::time::Instant::now();
            let cpus = num_cpus::get().max(1) as f64;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::Acquire) {
                    break;
                }

                let now_cpu = read_process_cpu_seconds();
                let now_wall = std::time::Instant::now();
                let wall_delta = now_wall.duration_since(last_wall).as_secs_f64();
                let cpu = match (last_cpu, now_cpu) {
                    (Some(prev), Some(curr)) if wall_delta > 0.0 => {
                        ((curr - prev) / (wall_delta * cpus)).clamp(0.0, 1.0)
                    }
                    _ => 0.0,
                };
                last_cpu = now_cpu;
                last_wall = now_wall;

                let memory = read_memory_fraction().unwrap_or(0.0);
                cpu_bits.store(cpu.to_bits(), Ordering::Release);
                memory_bits.store(memory.clamp(0.0, 1.0).to_bits(), Ordering::Release);
                debug!(cpu, memory, "resource sample");
            }
        }));
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cumulative user+system CPU seconds for this process.
#[cfg(target_os = "linux")]
fn read_process_cpu_seconds() -> Option<f64> {
    // /proc/<pid>/stat reports utime and stime in USER_HZ ticks, which the
    // kernel ABI fixes at 100 on Linux.
    const TICKS_PER_SECOND: f64 = 100.0;

    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Field 2 (comm) may contain spaces; skip past its closing paren.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After comm: field index 11 is utime, 12 is stime.
    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) / TICKS_PER_SECOND)
}

#[cfg(target_os = "linux")]
fn read_memory_fraction() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = 4096.0;

    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let total_kb: f64 = meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;
    if total_kb <= 0.0 {
        return None;
    }
    Some((resident_pages * page_size) / (total_kb * 1024.0))
}

#[cfg(not(target_os = "linux"))]
fn read_process_cpu_seconds() -> Option<f64> {
    None
}

#[cfg(not(target_os = "linux"))]
fn read_memory_fraction() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_readings() {
        let monitor = ResourceMonitor::fixed(0.9, 0.4);
        assert!((monitor.cpu_usage() - 0.9).abs() < f64::EPSILON);
        assert!((monitor.memory_usage() - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_publish_clamps() {
        let monitor = ResourceMonitor::fixed(0.0, 0.0);
        monitor.publish(3.0, -1.0);
        assert!((monitor.cpu_usage() - 1.0).abs() < f64::EPSILON);
        assert!((monitor.memory_usage() - 0.0).abs() < f64::EPSILON);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_proc_sampling_reads() {
        assert!(read_process_cpu_seconds().is_some());
        let memory = read_memory_fraction().unwrap();
        assert!(memory > 0.0 && memory < 1.0);
    }
}
