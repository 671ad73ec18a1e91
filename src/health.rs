//! # HealthSampler: host resource snapshots
//!
//! ## Responsibility
//! Read memory, short-window CPU and disk utilisation plus the admission slot
//! gauge into a point-in-time [`HealthSnapshot`], and publish a fresh snapshot
//! on a fixed period from a background task.
//!
//! ## Guarantees
//! - Never fails: a metric that cannot be read is reported as `0.0` and a
//!   warning is logged
//! - Whole snapshots: readers receive complete values through a
//!   `tokio::sync::watch` channel, never a partially updated one
//! - Independent of traffic: sampling runs on its own timer and stops on the
//!   shutdown signal
//!
//! ## NOT Responsible For
//! - Acting on the snapshot (see: `admission`)
//! - Precise telemetry; CPU is whatever the provider saw since its last refresh

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shortest period [`HealthSampler::spawn`] will tick at.
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

/// Failure reading a single host metric.
#[derive(Debug, Error)]
pub enum MetricError {
    /// The provider has no data for this metric.
    #[error("{0} metric unavailable")]
    Unavailable(&'static str),
    /// The provider's internal lock was poisoned.
    #[error("metrics provider lock poisoned")]
    LockPoisoned,
}

/// Source of host utilisation percentages.
///
/// Implementations must be cheap enough to call from the sampling task.
pub trait MetricsProvider: Send + Sync {
    /// Used memory as a percentage of total.
    fn memory_pct(&self) -> Result<f64, MetricError>;
    /// Global CPU utilisation since the previous read.
    fn cpu_pct(&self) -> Result<f64, MetricError>;
    /// Used space on the monitored disk as a percentage of its capacity.
    fn disk_pct(&self) -> Result<f64, MetricError>;
}

/// Current and maximum admission slots, reported alongside host metrics.
pub trait SlotGauge: Send + Sync {
    /// `(available, max)` slots right now.
    fn slots(&self) -> (usize, usize);
}

/// Point-in-time view of host resources and admission capacity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    /// Used memory percentage.
    pub memory_pct: f64,
    /// CPU utilisation percentage.
    pub cpu_pct: f64,
    /// Used disk percentage.
    pub disk_pct: f64,
    /// Admission slots free at sampling time.
    pub available_slots: usize,
    /// Configured admission slot ceiling.
    pub max_slots: usize,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Snapshot with zeroed metrics, used before the first sample.
    pub fn empty(max_slots: usize) -> Self {
        Self {
            memory_pct: 0.0,
            cpu_pct: 0.0,
            disk_pct: 0.0,
            available_slots: max_slots,
            max_slots,
            timestamp: Utc::now(),
        }
    }
}

/// Reads host metrics into [`HealthSnapshot`]s.
pub struct HealthSampler {
    provider: Arc<dyn MetricsProvider>,
    slots: Arc<dyn SlotGauge>,
}

impl HealthSampler {
    /// Create a sampler over the given provider and slot gauge.
    pub fn new(provider: Arc<dyn MetricsProvider>, slots: Arc<dyn SlotGauge>) -> Self {
        Self { provider, slots }
    }

    /// Take one snapshot.
    ///
    /// A metric that fails to read is reported as `0.0`; the failure is
    /// logged and never propagated.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn sample(&self) -> HealthSnapshot {
        let memory_pct = read_or_zero("memory", self.provider.memory_pct());
        let cpu_pct = read_or_zero("cpu", self.provider.cpu_pct());
        let disk_pct = read_or_zero("disk", self.provider.disk_pct());
        let (available_slots, max_slots) = self.slots.slots();

        HealthSnapshot {
            memory_pct,
            cpu_pct,
            disk_pct,
            available_slots,
            max_slots,
            timestamp: Utc::now(),
        }
    }

    /// Spawn the periodic sampling task.
    ///
    /// The first snapshot is taken synchronously so the returned receiver
    /// never holds a placeholder. The task publishes a new snapshot every
    /// `interval` (at least 1ms) until `shutdown` flips to `true` or its
    /// sender is dropped.
    ///
    /// # Panics
    ///
    /// This function never panics. It must be called inside a Tokio runtime.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> (watch::Receiver<HealthSnapshot>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(self.sample());

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_SAMPLE_INTERVAL));
            // The initial snapshot already covers the immediate first tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = self.sample();
                        debug!(
                            memory_pct = snapshot.memory_pct,
                            cpu_pct = snapshot.cpu_pct,
                            disk_pct = snapshot.disk_pct,
                            available_slots = snapshot.available_slots,
                            "health sample"
                        );
                        crate::metrics::set_slots_available(snapshot.available_slots);
                        tx.send_replace(snapshot);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("health sampler shutting down");
                            break;
                        }
                    }
                }
            }
        });

        (rx, handle)
    }
}

fn read_or_zero(metric: &'static str, value: Result<f64, MetricError>) -> f64 {
    match value {
        Ok(v) if v.is_finite() => v.clamp(0.0, 100.0),
        Ok(v) => {
            warn!(metric = metric, value = v, "non-finite health metric, using 0");
            0.0
        }
        Err(e) => {
            warn!(metric = metric, error = %e, "health metric read failed, using 0");
            0.0
        }
    }
}

// ============================================================================
// sysinfo provider
// ============================================================================

/// Host metrics read through `sysinfo`.
///
/// Disk usage is taken from the disk whose mount point is the longest prefix
/// of `disk_path` (the filesystem root by default).
pub struct SysinfoMetrics {
    system: Mutex<sysinfo::System>,
    disk_path: PathBuf,
}

impl SysinfoMetrics {
    /// Create a provider monitoring the root filesystem.
    pub fn new() -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            disk_path: PathBuf::from("/"),
        }
    }

    /// Monitor the disk holding `path` instead of the root filesystem.
    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = path.into();
        self
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProvider for SysinfoMetrics {
    fn memory_pct(&self) -> Result<f64, MetricError> {
        let mut system = self.system.lock().map_err(|_| MetricError::LockPoisoned)?;
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(MetricError::Unavailable("memory"));
        }
        Ok(system.used_memory() as f64 / total as f64 * 100.0)
    }

    fn cpu_pct(&self) -> Result<f64, MetricError> {
        let mut system = self.system.lock().map_err(|_| MetricError::LockPoisoned)?;
        system.refresh_cpu();
        Ok(f64::from(system.global_cpu_info().cpu_usage()))
    }

    fn disk_pct(&self) -> Result<f64, MetricError> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| self.disk_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or(MetricError::Unavailable("disk"))?;
        let total = disk.total_space();
        if total == 0 {
            return Err(MetricError::Unavailable("disk"));
        }
        let used = total.saturating_sub(disk.available_space());
        Ok(used as f64 / total as f64 * 100.0)
    }
}

// ============================================================================
// Fixed provider (tests / demos)
// ============================================================================

/// Provider returning operator-set values.
///
/// Useful for tests and offline demos. A value of `None` simulates a failed
/// read.
#[derive(Default)]
pub struct FixedMetrics {
    values: Mutex<[Option<f64>; 3]>,
}

impl FixedMetrics {
    /// Provider reporting the given memory, CPU and disk percentages.
    pub fn new(memory_pct: f64, cpu_pct: f64, disk_pct: f64) -> Self {
        Self {
            values: Mutex::new([Some(memory_pct), Some(cpu_pct), Some(disk_pct)]),
        }
    }

    /// Replace all three readings; `None` makes that metric fail.
    pub fn set(&self, memory_pct: Option<f64>, cpu_pct: Option<f64>, disk_pct: Option<f64>) {
        if let Ok(mut values) = self.values.lock() {
            *values = [memory_pct, cpu_pct, disk_pct];
        }
    }

    fn read(&self, slot: usize, name: &'static str) -> Result<f64, MetricError> {
        let values = self.values.lock().map_err(|_| MetricError::LockPoisoned)?;
        values
            .get(slot)
            .copied()
            .flatten()
            .ok_or(MetricError::Unavailable(name))
    }
}

impl MetricsProvider for FixedMetrics {
    fn memory_pct(&self) -> Result<f64, MetricError> {
        self.read(0, "memory")
    }

    fn cpu_pct(&self) -> Result<f64, MetricError> {
        self.read(1, "cpu")
    }

    fn disk_pct(&self) -> Result<f64, MetricError> {
        self.read(2, "disk")
    }
}
