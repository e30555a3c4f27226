//! Worker loop.
//!
//! One worker drives one job at a time from pop to disposition. Run several
//! workers, each with its own adapter, for parallelism.

use crate::adapter::{self, Adapter};
use crate::config::JobConfig;
use crate::executor::{ExecutionReport, Executor};
use crate::handle::JobHandle;
use crate::logger::JobLogger;
use crate::metrics::WorkerMetrics;
use crate::registry::HandlerRegistry;
use crate::resolver::Resolver;
use quay_config::{QuaySettings, WorkerSettings};
use quay_core::{QueueError, QueueResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue to pop from.
    pub queue: String,

    /// How long one pop may wait.
    pub pop_timeout: Duration,

    /// Sleep after an empty pop or a pop error.
    pub sleep: Duration,

    /// Resident memory ceiling in megabytes; 0 disables the check.
    pub memory_limit_mb: u64,

    /// Stop after this many jobs.
    pub max_jobs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&WorkerSettings::default())
    }
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            queue: settings.queue.clone(),
            pop_timeout: settings.pop_timeout(),
            sleep: settings.sleep(),
            memory_limit_mb: settings.memory_limit_mb,
            max_jobs: settings.max_jobs,
        }
    }
}

/// Reads resident memory in megabytes.
pub type MemoryProbe = fn() -> Option<u64>;

/// Resident set size of this process, from `/proc/self/status`.
#[cfg(target_os = "linux")]
pub fn resident_memory_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss_kb(&status).map(|kb| kb / 1024)
}

/// Resident memory is only probed on Linux.
#[cfg(not(target_os = "linux"))]
pub fn resident_memory_mb() -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// Why [`Worker::listen`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenExit {
    /// [`Worker::stop`] or a [`StopHandle`] was used.
    Stopped,
    /// Resident memory went above the limit.
    MemoryLimit { resident_mb: u64, limit_mb: u64 },
    /// `max_jobs` jobs were processed.
    MaxJobs,
}

/// Counters of a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub empty_polls: u64,
    pub pop_errors: u64,
}

/// Result of a listen run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenSummary {
    pub exit: ListenExit,
    pub stats: WorkerStats,
}

/// Stops a listening worker from another task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stopping: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl StopHandle {
    /// Asks the worker to exit after the current iteration. A stop sent
    /// while no listen run is active ends the next one.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

/// Pops and executes jobs from one queue.
pub struct Worker {
    id: String,
    adapter: Arc<dyn Adapter>,
    executor: Executor,
    config: WorkerConfig,
    memory_probe: MemoryProbe,
    stop: StopHandle,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
    empty_polls: AtomicU64,
    pop_errors: AtomicU64,
}

impl Worker {
    /// Creates a worker.
    ///
    /// Fails with `Capability` when a registered handler (or the defaults)
    /// asks for bury on an adapter that cannot bury.
    pub fn new(
        adapter: Arc<dyn Adapter>,
        registry: Arc<HandlerRegistry>,
        defaults: JobConfig,
        config: WorkerConfig,
    ) -> QueueResult<Self> {
        validate_capabilities(adapter.as_ref(), &registry, defaults)?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            adapter,
            executor: Executor::new(Resolver::new(registry, defaults)),
            config,
            memory_probe: resident_memory_mb,
            stop: StopHandle {
                stopping: Arc::new(AtomicBool::new(false)),
                shutdown_tx,
            },
            jobs_processed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            empty_polls: AtomicU64::new(0),
            pop_errors: AtomicU64::new(0),
        })
    }

    /// Builds the adapter from settings and creates a worker on it.
    pub async fn from_settings(
        settings: &QuaySettings,
        registry: Arc<HandlerRegistry>,
    ) -> QueueResult<Self> {
        let adapter = adapter::from_settings(&settings.adapter).await?;
        Self::new(
            adapter,
            registry,
            JobConfig::from(&settings.jobs),
            WorkerConfig::from(&settings.worker),
        )
    }

    /// Replaces the lifecycle logger.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn JobLogger>) -> Self {
        self.executor = self.executor.with_logger(logger);
        self
    }

    /// Replaces the resident memory probe.
    #[must_use]
    pub fn with_memory_probe(mut self, probe: MemoryProbe) -> Self {
        self.memory_probe = probe;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handle that stops [`Worker::listen`] from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Asks [`Worker::listen`] to exit after the current iteration.
    pub fn stop(&self) {
        info!(worker_id = %self.id, "Stopping worker");
        self.stop.stop();
    }

    /// Current counters.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            pop_errors: self.pop_errors.load(Ordering::Relaxed),
        }
    }

    /// Pops once and executes what was popped.
    ///
    /// Returns `None` when no job became available. Pop errors other than
    /// an empty queue are returned.
    pub async fn work_once(&self) -> QueueResult<Option<ExecutionReport>> {
        let mut job = match JobHandle::pop(
            Arc::clone(&self.adapter),
            &self.config.queue,
            self.config.pop_timeout,
        )
        .await
        {
            Ok(job) => job,
            Err(QueueError::QueueEmpty(_)) => {
                self.empty_polls.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => {
                self.pop_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let report = self.executor.execute(&mut job).await;

        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        if !report.is_success() {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            worker_id = %self.id,
            queue = %self.config.queue,
            message_id = %job.id(),
            state = %report.state,
            "Job processed"
        );

        Ok(Some(report))
    }

    /// Runs [`Worker::work_once`] until stopped, over the memory limit, or
    /// past `max_jobs`. May be called again after it returns.
    pub async fn listen(&self) -> ListenSummary {
        let mut shutdown_rx = self.stop.shutdown_tx.subscribe();
        let mut handled = 0u64;

        info!(
            worker_id = %self.id,
            queue = %self.config.queue,
            adapter = self.adapter.name(),
            memory_limit_mb = self.config.memory_limit_mb,
            "Worker listening"
        );

        let exit = loop {
            if self.stop.stopping.load(Ordering::SeqCst) {
                break ListenExit::Stopped;
            }

            let idle = match self.work_once().await {
                Ok(Some(_)) => {
                    handled += 1;
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        queue = %self.config.queue,
                        error = %e,
                        "Failed to pop job"
                    );
                    true
                }
            };

            if self.config.max_jobs.is_some_and(|max| handled >= max) {
                break ListenExit::MaxJobs;
            }

            if let Some(exit) = self.check_memory() {
                break exit;
            }

            if idle && !self.config.sleep.is_zero() {
                tokio::select! {
                    _ = shutdown_rx.recv() => break ListenExit::Stopped,
                    () = tokio::time::sleep(self.config.sleep) => {}
                }
            }
        };

        // Each stop ends one run; the worker can listen again afterwards.
        self.stop.stopping.store(false, Ordering::SeqCst);

        let stats = self.stats();
        info!(
            worker_id = %self.id,
            queue = %self.config.queue,
            exit = ?exit,
            jobs_processed = stats.jobs_processed,
            jobs_failed = stats.jobs_failed,
            "Worker stopped listening"
        );

        ListenSummary { exit, stats }
    }

    fn check_memory(&self) -> Option<ListenExit> {
        if self.config.memory_limit_mb == 0 {
            return None;
        }

        let resident_mb = (self.memory_probe)()?;
        WorkerMetrics::memory(&self.config.queue, resident_mb);

        if resident_mb > self.config.memory_limit_mb {
            warn!(
                worker_id = %self.id,
                resident_mb,
                limit_mb = self.config.memory_limit_mb,
                "Memory limit exceeded, exiting"
            );
            Some(ListenExit::MemoryLimit {
                resident_mb,
                limit_mb: self.config.memory_limit_mb,
            })
        } else {
            None
        }
    }
}

fn validate_capabilities(
    adapter: &dyn Adapter,
    registry: &HandlerRegistry,
    defaults: JobConfig,
) -> QueueResult<()> {
    let capabilities = adapter.capabilities();

    let declared = registry
        .declared_configs()
        .map(|(name, over)| (name, defaults.merge(over)))
        .chain(std::iter::once(("defaults", defaults)));

    for (name, config) in declared {
        if config.bury && !capabilities.bury {
            error!(
                handler = %name,
                adapter = adapter.name(),
                "Handler requires bury, which the adapter does not support"
            );
            return Err(QueueError::Capability {
                adapter: adapter.name(),
                capability: "bury",
            });
        }

        if config.delay > 0 && !capabilities.delay {
            warn!(
                handler = %name,
                adapter = adapter.name(),
                delay_secs = config.delay,
                "Adapter has no delay support, releases will be immediate"
            );
        }
    }

    Ok(())
}
