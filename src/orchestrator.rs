//! # Orchestrator
//!
//! ## Responsibility
//! Wire configuration, the health sampler, the admission controller, the
//! gateway and the artifact store into one handle exposing `submit`, `health`
//! and `recover`.
//!
//! ## Guarantees
//! - The health sampler and admission monitor run as background tasks that
//!   stop when [`Orchestrator::shutdown`] is called
//! - `health()` always returns a whole snapshot (watch-channel swap)
//! - A store failure never fails a finished request
//!
//! ## NOT Responsible For
//! - Receiving end-user requests (HTTP routing lives outside the crate)
//! - Rendering comics or drawing images

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::admission::{AdmissionController, AdmissionState, AdmissionStats};
use crate::config::OrchestratorConfig;
use crate::gateway::{ChatCompletionsClient, ContentGenerator, RetryingGateway};
use crate::health::{HealthSampler, HealthSnapshot, MetricsProvider, SysinfoMetrics};
use crate::pipeline::GenerationPipeline;
use crate::retry::RetryPolicy;
use crate::safety::SafetyFilter;
use crate::store::{ArtifactStore, InMemoryArtifactStore};
use crate::{metrics, Artifact, GenerationOptions, GenerationRequest, OrchestratorError};

/// Builder for [`Orchestrator`].
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use comic_orchestrator::config::OrchestratorConfig;
/// use comic_orchestrator::{GenerationOptions, OrchestratorBuilder, TemplateGenerator};
///
/// # async fn demo() -> Result<(), comic_orchestrator::OrchestratorError> {
/// let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
///     .generator(Arc::new(TemplateGenerator::new()))
///     .start()?;
/// let artifact = orchestrator.submit("加法运算", GenerationOptions::default()).await?;
/// println!("{} panels", artifact.panels.len());
/// orchestrator.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    generator: Option<Arc<dyn ContentGenerator>>,
    metrics_provider: Option<Arc<dyn MetricsProvider>>,
    store: Option<Arc<dyn ArtifactStore>>,
    safety: Option<SafetyFilter>,
}

impl OrchestratorBuilder {
    /// Start from `config`.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            generator: None,
            metrics_provider: None,
            store: None,
            safety: None,
        }
    }

    /// Use `generator` instead of the chat-completions client.
    pub fn generator(mut self, generator: Arc<dyn ContentGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Use `provider` instead of host metrics from `sysinfo`.
    pub fn metrics_provider(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.metrics_provider = Some(provider);
        self
    }

    /// Persist artifacts to `store` instead of the bounded in-memory map
    /// (test and demo use only; oldest artifacts are evicted past capacity).
    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom safety filter.
    pub fn safety_filter(mut self, safety: SafetyFilter) -> Self {
        self.safety = Some(safety);
        self
    }

    /// Validate the config, build every component and spawn the background
    /// health sampler and admission monitor.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ConfigError`] if the config is invalid or,
    /// when no generator was supplied, the API key variable is unset.
    ///
    /// # Panics
    ///
    /// This function never panics. It must be called inside a Tokio runtime.
    pub fn start(self) -> Result<Orchestrator, OrchestratorError> {
        let config = self.config;
        crate::config::validation::validate(&config).map_err(|errors| {
            OrchestratorError::ConfigError(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        let generator: Arc<dyn ContentGenerator> = match self.generator {
            Some(generator) => generator,
            None => Arc::new(ChatCompletionsClient::from_config(&config.upstream)?),
        };
        let provider: Arc<dyn MetricsProvider> = match self.metrics_provider {
            Some(provider) => provider,
            None => {
                let sysinfo = SysinfoMetrics::new();
                Arc::new(match &config.health.disk_path {
                    Some(path) => sysinfo.with_disk_path(path),
                    None => sysinfo,
                })
            }
        };
        let store: Arc<dyn ArtifactStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryArtifactStore::new()),
        };

        let admission = Arc::new(AdmissionController::new(
            config.admission.max_concurrent_requests,
            config.admission.acquire_timeout(),
            config.health.cooldown(),
            config.health.ceilings(),
        ));

        let gateway = RetryingGateway::new(
            generator,
            RetryPolicy::exponential(config.upstream.max_retries, config.upstream.backoff_base()),
            config.upstream.attempt_timeout(),
            config.generation.fallback_chars,
        )
        .with_request_timeout(config.upstream.request_timeout());
        let mut pipeline =
            GenerationPipeline::new(Arc::clone(&admission), gateway, &config.generation);
        if let Some(safety) = self.safety {
            pipeline = pipeline.with_safety_filter(safety);
        }

        let sampler = Arc::new(HealthSampler::new(provider, admission.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (snapshots, sampler_task) =
            Arc::clone(&sampler).spawn(config.health.interval(), shutdown_rx.clone());
        let monitor_task = Arc::clone(&admission).spawn_monitor(snapshots.clone(), shutdown_rx);

        info!(
            max_slots = config.admission.max_concurrent_requests,
            interval_s = config.health.monitoring_interval_sec,
            max_retries = config.upstream.max_retries,
            "orchestrator started"
        );

        Ok(Orchestrator {
            admission,
            sampler,
            pipeline,
            store,
            snapshots,
            shutdown_tx,
            tasks: Mutex::new(vec![sampler_task, monitor_task]),
        })
    }
}

/// Running orchestrator.
pub struct Orchestrator {
    admission: Arc<AdmissionController>,
    sampler: Arc<HealthSampler>,
    pipeline: GenerationPipeline,
    store: Arc<dyn ArtifactStore>,
    snapshots: watch::Receiver<HealthSnapshot>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Generate a comic for `topic` and persist it.
    ///
    /// # Errors
    ///
    /// `InvalidInput`, `ResourceExhausted`, `UpstreamTimeout`, `UpstreamError`
    /// or `UnexpectedFailure`; see [`GenerationPipeline::run`].
    pub async fn submit(
        &self,
        topic: impl Into<String>,
        options: GenerationOptions,
    ) -> Result<Artifact, OrchestratorError> {
        let request = GenerationRequest::new(topic, options);
        let artifact = self.pipeline.run(&request).await?;
        self.persist(&artifact).await;
        Ok(artifact)
    }

    /// Like [`submit`](Self::submit), but aborts promptly with
    /// [`OrchestratorError::Cancelled`] once `cancel` flips to `true`.
    ///
    /// Aborting drops the in-flight work, which returns its admission slot.
    pub async fn submit_with_cancel(
        &self,
        topic: impl Into<String>,
        options: GenerationOptions,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Artifact, OrchestratorError> {
        let request = GenerationRequest::new(topic, options);
        let artifact = tokio::select! {
            result = self.pipeline.run(&request) => result?,
            () = cancelled(&mut cancel) => {
                info!(request_id = %request.request_id, "request cancelled by caller");
                metrics::inc_request("CANCELLED");
                return Err(OrchestratorError::Cancelled);
            }
        };
        self.persist(&artifact).await;
        Ok(artifact)
    }

    async fn persist(&self, artifact: &Artifact) {
        if let Err(e) = self.store.save(artifact).await {
            warn!(artifact_id = %artifact.id, error = %e, "artifact store rejected artifact");
            metrics::inc_error("store", "save_failed");
        }
    }

    /// Latest published health snapshot.
    pub fn health(&self) -> HealthSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Re-sample health now and try to return to `Healthy`.
    ///
    /// # Returns
    ///
    /// `true` if the system is healthy after the check.
    pub async fn recover(&self) -> bool {
        let snapshot = self.sampler.sample();
        let recovered = self.admission.recover(&snapshot).await;
        info!(recovered = recovered, "manual recovery check");
        recovered
    }

    /// Current admission state.
    pub fn state(&self) -> AdmissionState {
        self.admission.state()
    }

    /// Admission counters.
    pub async fn stats(&self) -> AdmissionStats {
        self.admission.stats().await
    }

    /// Store finished artifacts are handed to.
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Stop the background tasks and wait for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("orchestrator stopped");
    }
}

/// Resolves once `cancel` reads `true`; never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::TemplateGenerator;
    use crate::health::FixedMetrics;
    use std::time::Duration;

    fn orchestrator(metrics: Arc<FixedMetrics>) -> Orchestrator {
        let mut config = OrchestratorConfig::default();
        config.health.monitoring_interval_sec = 1;
        OrchestratorBuilder::new(config)
            .generator(Arc::new(TemplateGenerator::with_delay(0)))
            .metrics_provider(metrics)
            .start()
            .expect("test: orchestrator starts")
    }

    #[tokio::test]
    async fn test_submit_persists_artifact() {
        let orchestrator = orchestrator(Arc::new(FixedMetrics::new(10.0, 10.0, 10.0)));
        let artifact = orchestrator
            .submit("加法运算", GenerationOptions::default())
            .await
            .expect("test: submit succeeds");

        let stored = orchestrator
            .store()
            .load(artifact.id)
            .await
            .expect("test: load");
        assert_eq!(stored, Some(artifact));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_reports_sampled_values() {
        let orchestrator = orchestrator(Arc::new(FixedMetrics::new(12.0, 34.0, 56.0)));
        let snapshot = orchestrator.health();
        assert_eq!(snapshot.memory_pct, 12.0);
        assert_eq!(snapshot.cpu_pct, 34.0);
        assert_eq!(snapshot.disk_pct, 56.0);
        assert_eq!(snapshot.max_slots, 10);
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_degrade_then_recover_cycle() {
        let metrics = Arc::new(FixedMetrics::new(95.0, 10.0, 10.0));
        let orchestrator = orchestrator(Arc::clone(&metrics));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(orchestrator.state(), AdmissionState::Degraded);
        let err = orchestrator
            .submit("加法运算", GenerationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RESOURCE_EXHAUSTED");

        assert!(!orchestrator.recover().await);
        metrics.set(Some(40.0), Some(10.0), Some(10.0));
        assert!(orchestrator.recover().await);
        assert_eq!(orchestrator.state(), AdmissionState::Healthy);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_returns_cancelled_and_frees_slot() {
        let mut config = OrchestratorConfig::default();
        config.admission.max_concurrent_requests = 1;
        let orchestrator = OrchestratorBuilder::new(config)
            .generator(Arc::new(TemplateGenerator::with_delay(60_000)))
            .metrics_provider(Arc::new(FixedMetrics::new(1.0, 1.0, 1.0)))
            .start()
            .expect("test: orchestrator starts");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = cancel_tx.send(true);
        });
        let err = orchestrator
            .submit_with_cancel("加法运算", GenerationOptions::default(), cancel_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        cancel.await.expect("test: cancel task");

        let stats = orchestrator.stats().await;
        assert_eq!(stats.acquired_total, stats.released_total);
        assert_eq!(stats.in_flight, 0);
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_slot_returns_promptly() {
        let mut config = OrchestratorConfig::default();
        config.admission.max_concurrent_requests = 1;
        config.admission.admission_timeout_ms = 60_000;
        config.health.monitoring_interval_sec = 3600;
        let orchestrator = Arc::new(
            OrchestratorBuilder::new(config)
                .generator(Arc::new(TemplateGenerator::with_delay(3_600_000)))
                .metrics_provider(Arc::new(FixedMetrics::new(1.0, 1.0, 1.0)))
                .start()
                .expect("test: orchestrator starts"),
        );

        let (holder_cancel_tx, holder_cancel_rx) = watch::channel(false);
        let holder = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .submit_with_cancel("加法运算", GenerationOptions::default(), holder_cancel_rx)
                    .await
            })
        };
        while orchestrator.stats().await.in_flight == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = cancel_tx.send(true);
        });
        let started = tokio::time::Instant::now();
        let err = orchestrator
            .submit_with_cancel("减法运算", GenerationOptions::default(), cancel_rx)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        cancel.await.expect("test: cancel task");

        assert!(matches!(err, OrchestratorError::Cancelled));
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
        assert_eq!(orchestrator.stats().await.in_flight, 1);

        let _ = holder_cancel_tx.send(true);
        let held = holder.await.expect("test: holder task");
        assert!(matches!(held, Err(OrchestratorError::Cancelled)));

        let stats = orchestrator.stats().await;
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.acquired_total, stats.released_total);
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_upstream_fails_within_request_timeout() {
        let mut config = OrchestratorConfig::default();
        config.health.monitoring_interval_sec = 3600;
        let deadline = config.upstream.request_timeout();
        let orchestrator = OrchestratorBuilder::new(config)
            .generator(Arc::new(TemplateGenerator::with_delay(3_600_000)))
            .metrics_provider(Arc::new(FixedMetrics::new(1.0, 1.0, 1.0)))
            .start()
            .expect("test: orchestrator starts");

        let started = tokio::time::Instant::now();
        let err = orchestrator
            .submit("加法运算", GenerationOptions::default())
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.code(), "UPSTREAM_TIMEOUT");
        assert!(elapsed <= deadline, "took {elapsed:?}, deadline {deadline:?}");
        assert_eq!(orchestrator.stats().await.in_flight, 0);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = OrchestratorConfig::default();
        config.admission.max_concurrent_requests = 0;
        let result = OrchestratorBuilder::new(config)
            .generator(Arc::new(TemplateGenerator::new()))
            .metrics_provider(Arc::new(FixedMetrics::new(1.0, 1.0, 1.0)))
            .start();
        assert!(matches!(result, Err(OrchestratorError::ConfigError(_))));
    }
}
