//! # AdmissionController: health-driven bounded concurrency
//!
//! ## Responsibility
//! Gate every pipeline run behind a counting semaphore of `max_slots`
//! permits, and refuse new work outright while the host is `Degraded`.
//!
//! ## States
//! - **Healthy**: `acquire` waits up to `acquire_timeout` for a free slot
//! - **Degraded**: `acquire` fails immediately with `ResourceExhausted`
//!
//! A periodic health check moves Healthy → Degraded when memory, CPU or disk
//! is over its ceiling or every slot is taken. On that transition a
//! background task halves the effective ceiling by reserving permits, issues
//! a reclamation hint and waits out a cooldown. The same periodic check (or an
//! explicit [`AdmissionController::recover`]) moves back to Healthy once every
//! metric is under its ceiling, releasing the reserved permits.
//!
//! ## Guarantees
//! - A slot is released exactly once: [`AdmissionTicket`] returns its permit
//!   on drop, and [`AdmissionController::release`] consumes the ticket
//! - `acquired_total == released_total` whenever no ticket is alive
//!
//! ## NOT Responsible For
//! - Sampling host metrics (see: `health`)
//! - Queueing; callers fail fast instead of waiting past `acquire_timeout`

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::health::{HealthSnapshot, SlotGauge};
use crate::{metrics, OrchestratorError};

/// Admission state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionState {
    /// Accepting work up to the slot ceiling.
    Healthy,
    /// Rejecting all new work until a recovery check passes.
    Degraded,
}

/// Resource ceilings, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceCeilings {
    /// Memory ceiling.
    pub memory_pct: f64,
    /// CPU ceiling.
    pub cpu_pct: f64,
    /// Disk ceiling.
    pub disk_pct: f64,
}

impl ResourceCeilings {
    /// Names of the metrics in `snapshot` that exceed their ceiling.
    pub fn breaches(&self, snapshot: &HealthSnapshot) -> Vec<&'static str> {
        let mut over = Vec::new();
        if snapshot.memory_pct > self.memory_pct {
            over.push("memory");
        }
        if snapshot.cpu_pct > self.cpu_pct {
            over.push("cpu");
        }
        if snapshot.disk_pct > self.disk_pct {
            over.push("disk");
        }
        over
    }
}

impl Default for ResourceCeilings {
    fn default() -> Self {
        Self {
            memory_pct: 80.0,
            cpu_pct: 80.0,
            disk_pct: 90.0,
        }
    }
}

/// Counters for leak checks and dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    /// Current state.
    pub state: AdmissionState,
    /// Tickets handed out since start.
    pub acquired_total: u64,
    /// Tickets returned since start.
    pub released_total: u64,
    /// Tickets currently alive.
    pub in_flight: u64,
    /// Slots usable in the current state.
    pub effective_ceiling: usize,
    /// Configured slot ceiling.
    pub max_slots: usize,
}

/// Opaque handle for one held concurrency slot.
///
/// The slot is returned when the ticket is dropped, so every exit path of the
/// holder (success, error, cancellation) releases it exactly once.
#[must_use = "dropping the ticket releases the slot immediately"]
pub struct AdmissionTicket {
    _permit: OwnedSemaphorePermit,
    released: Arc<AtomicU64>,
    acquired_at: Instant,
}

impl AdmissionTicket {
    /// How long this ticket has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("held_for", &self.held_for())
            .finish()
    }
}

/// Permits parked while degraded, plus the task that parks them.
#[derive(Default)]
struct Degradation {
    /// Bumped on every state transition; stale degrade tasks check it.
    epoch: u64,
    reserved: Option<OwnedSemaphorePermit>,
    task: Option<JoinHandle<()>>,
}

/// Bounded-concurrency gate driven by health state.
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    max_slots: usize,
    acquire_timeout: Duration,
    cooldown: Duration,
    ceilings: ResourceCeilings,
    degraded: AtomicBool,
    degradation: Arc<Mutex<Degradation>>,
    acquired: AtomicU64,
    released: Arc<AtomicU64>,
}

impl AdmissionController {
    /// Create a controller with `max_slots` permits.
    ///
    /// # Arguments
    ///
    /// * `max_slots`: Slot ceiling while healthy (must be ≥ 1)
    /// * `acquire_timeout`: Longest `acquire` waits for a free slot
    /// * `cooldown`: Advisory pause after entering `Degraded`
    /// * `ceilings`: Resource ceilings checked on every health tick
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn new(
        max_slots: usize,
        acquire_timeout: Duration,
        cooldown: Duration,
        ceilings: ResourceCeilings,
    ) -> Self {
        let max_slots = max_slots.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(max_slots)),
            max_slots,
            acquire_timeout,
            cooldown,
            ceilings,
            degraded: AtomicBool::new(false),
            degradation: Arc::new(Mutex::new(Degradation::default())),
            acquired: AtomicU64::new(0),
            released: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current state.
    pub fn state(&self) -> AdmissionState {
        if self.degraded.load(Ordering::SeqCst) {
            AdmissionState::Degraded
        } else {
            AdmissionState::Healthy
        }
    }

    /// Acquire one slot.
    ///
    /// Cancel-safe: dropping the returned future before it resolves leaves the
    /// slot count untouched.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::ResourceExhausted`] if the controller is
    ///   degraded or no slot frees up within `acquire_timeout`
    /// - [`OrchestratorError::UnexpectedFailure`] if the semaphore was closed
    pub async fn acquire(&self) -> Result<AdmissionTicket, OrchestratorError> {
        if self.degraded.load(Ordering::SeqCst) {
            metrics::inc_admission_rejection("degraded");
            debug!("admission rejected: degraded");
            return Err(OrchestratorError::ResourceExhausted {
                message: "system is degraded and not accepting new work".to_string(),
                retry_after: self.cooldown,
            });
        }

        let permit =
            tokio::time::timeout(self.acquire_timeout, self.semaphore.clone().acquire_owned())
                .await;

        match permit {
            Ok(Ok(permit)) => {
                self.acquired.fetch_add(1, Ordering::SeqCst);
                metrics::set_slots_available(self.semaphore.available_permits());
                Ok(AdmissionTicket {
                    _permit: permit,
                    released: Arc::clone(&self.released),
                    acquired_at: Instant::now(),
                })
            }
            Ok(Err(_closed)) => Err(OrchestratorError::UnexpectedFailure(
                "admission semaphore closed".to_string(),
            )),
            Err(_elapsed) => {
                metrics::inc_admission_rejection("timeout");
                debug!(
                    timeout_ms = self.acquire_timeout.as_millis() as u64,
                    "admission rejected: no free slot"
                );
                Err(OrchestratorError::ResourceExhausted {
                    message: format!("all {} slots are busy", self.max_slots),
                    retry_after: self.acquire_timeout.saturating_mul(2),
                })
            }
        }
    }

    /// Return a slot. Consumes the ticket, so a second release cannot compile.
    pub fn release(&self, ticket: AdmissionTicket) {
        debug!(
            held_ms = ticket.held_for().as_millis() as u64,
            "admission slot released"
        );
        drop(ticket);
        metrics::set_slots_available(self.semaphore.available_permits());
    }

    /// Apply one periodic health check.
    ///
    /// While healthy, any metric over its ceiling or zero free slots trips
    /// the controller into `Degraded`. While degraded, the check doubles as a
    /// recovery check.
    ///
    /// # Returns
    ///
    /// The state after the check.
    pub async fn check_health(&self, snapshot: &HealthSnapshot) -> AdmissionState {
        match self.state() {
            AdmissionState::Healthy => {
                let breaches = self.ceilings.breaches(snapshot);
                if !breaches.is_empty() {
                    self.degrade(&breaches.join(",")).await;
                } else if snapshot.available_slots == 0 {
                    self.degrade("slots").await;
                }
            }
            AdmissionState::Degraded => {
                self.try_recover(snapshot).await;
            }
        }
        self.state()
    }

    /// Operator-triggered recovery check against a freshly sampled snapshot.
    ///
    /// # Returns
    ///
    /// `true` if the controller is healthy after the check.
    pub async fn recover(&self, snapshot: &HealthSnapshot) -> bool {
        if self.state() == AdmissionState::Healthy {
            return true;
        }
        self.try_recover(snapshot).await
    }

    async fn try_recover(&self, snapshot: &HealthSnapshot) -> bool {
        let breaches = self.ceilings.breaches(snapshot);
        if !breaches.is_empty() {
            debug!(over = ?breaches, "recovery check failed");
            return false;
        }

        let mut degradation = self.degradation.lock().await;
        if !self.degraded.load(Ordering::SeqCst) {
            return true;
        }
        degradation.epoch += 1;
        if let Some(task) = degradation.task.take() {
            task.abort();
        }
        degradation.reserved = None;
        self.degraded.store(false, Ordering::SeqCst);
        drop(degradation);

        metrics::set_slots_available(self.semaphore.available_permits());
        info!(max_slots = self.max_slots, "admission recovered, full ceiling restored");
        true
    }

    async fn degrade(&self, reason: &str) {
        let mut degradation = self.degradation.lock().await;
        if self.degraded.swap(true, Ordering::SeqCst) {
            return;
        }
        degradation.epoch += 1;
        let epoch = degradation.epoch;

        warn!(reason = reason, "admission degraded, rejecting new work");

        let reserve = self.max_slots / 2;
        let semaphore = Arc::clone(&self.semaphore);
        let shared = Arc::clone(&self.degradation);
        let cooldown = self.cooldown;

        degradation.task = Some(tokio::spawn(async move {
            info!("issuing memory reclamation hint");
            if let Ok(permit) = semaphore.acquire_many_owned(reserve as u32).await {
                let mut degradation = shared.lock().await;
                if degradation.epoch == epoch {
                    degradation.reserved = Some(permit);
                    debug!(reserved = reserve, "effective ceiling halved");
                }
            }
            tokio::time::sleep(cooldown).await;
            debug!("degradation cooldown elapsed");
        }));
    }

    /// Spawn the periodic health check driven by published snapshots.
    ///
    /// Runs until `shutdown` flips to `true` or the snapshot channel closes.
    ///
    /// # Panics
    ///
    /// This function never panics. It must be called inside a Tokio runtime.
    pub fn spawn_monitor(
        self: Arc<Self>,
        mut snapshots: watch::Receiver<HealthSnapshot>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = snapshots.borrow_and_update().clone();
                        self.check_health(&snapshot).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("admission monitor shutting down");
        })
    }

    /// Snapshot of counters and state.
    pub async fn stats(&self) -> AdmissionStats {
        let reserved = self
            .degradation
            .lock()
            .await
            .reserved
            .as_ref()
            .map_or(0, OwnedSemaphorePermit::num_permits);
        let acquired_total = self.acquired.load(Ordering::SeqCst);
        let released_total = self.released.load(Ordering::SeqCst);

        AdmissionStats {
            state: self.state(),
            acquired_total,
            released_total,
            in_flight: acquired_total.saturating_sub(released_total),
            effective_ceiling: self.max_slots - reserved,
            max_slots: self.max_slots,
        }
    }
}

impl SlotGauge for AdmissionController {
    fn slots(&self) -> (usize, usize) {
        (self.semaphore.available_permits(), self.max_slots)
    }
}
