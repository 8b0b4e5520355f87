//! Throughput accounting and the periodic `stats` log line.

use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct MigrationStats {
    bytes_since_last: AtomicU64,
    total_bytes: AtomicU64,
    last_calculated: Mutex<Instant>,
}

impl Default for MigrationStats {
    fn default() -> Self {
        MigrationStats {
            bytes_since_last: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            last_calculated: Mutex::new(Instant::now()),
        }
    }
}

impl MigrationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_bytes_migrated(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.bytes_since_last.fetch_add(bytes, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// KB/s over the bytes reported since the previous call, then resets the window.
    pub fn aggregate_speed_since_last(&self) -> f64 {
        let mut last = self
            .last_calculated
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(*last).as_secs_f64();
        *last = now;
        let bytes = self.bytes_since_last.swap(0, Ordering::Relaxed);
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        bytes as f64 / elapsed / 1024.0
    }
}

/// Connection pool figures for the stats line.
pub trait PoolGauge: Send + Sync + 'static {
    fn pool_size(&self) -> u32;
    fn idle_connections(&self) -> usize;
}

impl PoolGauge for crate::target::MySqlTarget {
    fn pool_size(&self) -> u32 {
        crate::target::MySqlTarget::pool_size(self)
    }

    fn idle_connections(&self) -> usize {
        crate::target::MySqlTarget::idle_connections(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSample {
    pub idle: u64,
    pub total: u64,
}

impl CpuSample {
    /// Busy percentage between two samples, `None` when no ticks elapsed.
    pub fn usage_since(&self, earlier: &CpuSample) -> Option<f64> {
        let total = self.total.checked_sub(earlier.total)?;
        let idle = self.idle.checked_sub(earlier.idle)?;
        if total == 0 {
            return None;
        }
        Some((1.0 - idle as f64 / total as f64) * 100.0)
    }
}

/// Parses the aggregate `cpu` line of `/proc/stat`; idle is the fourth counter.
pub fn parse_cpu_sample(proc_stat: &str) -> Option<CpuSample> {
    let line = proc_stat
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))?;
    let mut sample = CpuSample { idle: 0, total: 0 };
    for (i, field) in line.split_whitespace().skip(1).enumerate() {
        let value = field.parse::<u64>().ok()?;
        sample.total += value;
        if i == 3 {
            sample.idle = value;
        }
    }
    Some(sample)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemorySample {
    pub free_mb: u64,
    pub available_mb: u64,
    pub swap_free_mb: u64,
}

pub fn parse_memory_sample(meminfo: &str) -> Option<MemorySample> {
    let mut sample = MemorySample::default();
    let mut seen = 0;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        let (Some(label), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<u64>() else {
            continue;
        };
        let slot = match label {
            "MemFree:" => &mut sample.free_mb,
            "MemAvailable:" => &mut sample.available_mb,
            "SwapFree:" => &mut sample.swap_free_mb,
            _ => continue,
        };
        *slot = kb / 1024;
        seen += 1;
    }
    (seen > 0).then_some(sample)
}

async fn read_cpu_sample() -> Option<CpuSample> {
    let content = tokio::fs::read_to_string("/proc/stat").await.ok()?;
    parse_cpu_sample(&content)
}

async fn read_memory_sample() -> Option<MemorySample> {
    let content = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
    parse_memory_sample(&content)
}

/// Background task logging one stats line per interval until stopped.
#[derive(Debug)]
pub struct StatsReporter {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl StatsReporter {
    pub fn start<G: PoolGauge>(stats: Arc<MigrationStats>, gauge: Option<Arc<G>>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last_cpu = read_cpu_sample().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }

                let cpu = read_cpu_sample().await;
                let usage = match (&cpu, &last_cpu) {
                    (Some(now), Some(before)) => now.usage_since(before),
                    _ => None,
                };
                last_cpu = cpu;
                let memory = read_memory_sample().await.unwrap_or_default();
                let (size, idle) = gauge
                    .as_ref()
                    .map(|g| (g.pool_size(), g.idle_connections()))
                    .unwrap_or((0, 0));

                info!(
                    "stats: open: {}, idle: {}, aggSpeed(KB/s): {:.2}, total(MB): {:.1}, cpu(%): {}, memFree(MB): {}, memAvail(MB): {}, swapFree(MB): {}",
                    size,
                    idle,
                    stats.aggregate_speed_since_last(),
                    stats.total_bytes() as f64 / 1024.0 / 1024.0,
                    usage.map(|u| format!("{:.2}", u)).unwrap_or_else(|| "n/a".to_string()),
                    memory.free_mb,
                    memory.available_mb,
                    memory.swap_free_mb
                );
            }
        });
        StatsReporter {
            stop: Some(stop_tx),
            handle,
        }
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
