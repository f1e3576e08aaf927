//! Collector registry for managing collector lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::collector::{Collector, CollectorError, CycleReport, Schedule};

/// Default timeout for graceful shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata about a registered job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    /// Job UUID.
    pub id: uuid::Uuid,
    /// Collector name.
    pub name: String,
    /// Schedule description.
    pub schedule: String,
}

/// A registered collector plus the guard that keeps its cycles from overlapping.
struct Slot {
    collector: Arc<dyn Collector>,
    running: Mutex<()>,
}

impl Slot {
    /// Run one cycle unless the previous one is still in flight.
    async fn run_guarded(&self) -> Option<CycleReport> {
        let name = self.collector.name();
        let Ok(_guard) = self.running.try_lock() else {
            tracing::warn!(collector = %name, "Previous cycle still running; skipping this one");
            return None;
        };
        tracing::debug!(collector = %name, "Running collection cycle");
        Some(self.collector.run_cycle().await)
    }
}

struct Entry {
    info: JobInfo,
    slot: Arc<Slot>,
}

/// Registry for managing multiple collector tasks.
///
/// Uses `tokio-cron-scheduler` for robust job scheduling.
/// Supports both fixed-interval and cron-based scheduling. Each collector
/// runs on its own job, so a slow or failing collector never delays another.
pub struct CollectorRegistry {
    scheduler: JobScheduler,
    jobs: Arc<RwLock<HashMap<uuid::Uuid, Entry>>>,
}

impl CollectorRegistry {
    /// Create a new collector registry.
    pub async fn new() -> Result<Self, CollectorError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| CollectorError::Scheduler(e.to_string()))?;

        Ok(Self {
            scheduler,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field(
                "job_count",
                &self.jobs.try_read().map(|j| j.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl CollectorRegistry {
    /// Register and schedule a collector.
    pub async fn spawn(&self, collector: Arc<dyn Collector>) -> Result<uuid::Uuid, CollectorError> {
        let name = collector.name().to_string();
        let schedule_desc = collector.schedule().to_string();

        let slot = Arc::new(Slot {
            collector,
            running: Mutex::new(()),
        });

        let job = Self::create_job(Arc::clone(&slot)).inspect_err(|e| {
            tracing::error!(collector = %name, schedule = %schedule_desc, error = %e, "Job create failed");
        })?;

        let job_id = self
            .scheduler
            .add(job)
            .await
            .map_err(|e| CollectorError::Scheduler(e.to_string()))
            .inspect_err(|e| {
                tracing::error!(collector = %name, error = %e, "Job register failed");
            })?;

        self.jobs.write().await.insert(
            job_id,
            Entry {
                info: JobInfo {
                    id: job_id,
                    name: name.clone(),
                    schedule: schedule_desc.clone(),
                },
                slot,
            },
        );

        tracing::info!(collector = %name, job_id = %job_id, schedule = %schedule_desc, "Collector registered");
        Ok(job_id)
    }

    /// Start the scheduler.
    pub async fn start(&self) -> Result<(), CollectorError> {
        self.scheduler
            .start()
            .await
            .map_err(|e| CollectorError::Scheduler(e.to_string()))?;
        tracing::info!("Collector scheduler started");
        Ok(())
    }

    /// Run one cycle of every registered collector concurrently.
    ///
    /// Reports come back sorted by collector name. A collector whose
    /// scheduled cycle is still running is skipped.
    pub async fn run_once(&self) -> Vec<CycleReport> {
        let slots: Vec<Arc<Slot>> = self
            .jobs
            .read()
            .await
            .values()
            .map(|e| Arc::clone(&e.slot))
            .collect();

        let mut set = JoinSet::new();
        for slot in slots {
            set.spawn(async move { slot.run_guarded().await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "Collection task panicked"),
            }
        }
        reports.sort_by(|a, b| a.collector.cmp(&b.collector));
        reports
    }

    /// List all registered jobs.
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        self.jobs
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Get the number of registered jobs.
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Gracefully shutdown the scheduler with default timeout.
    pub async fn shutdown(self) -> Result<(), CollectorError> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown with custom timeout.
    pub async fn shutdown_with_timeout(mut self, timeout: Duration) -> Result<(), CollectorError> {
        let job_count = self.jobs.read().await.len();
        let shutdown_result = tokio::time::timeout(timeout, async {
            self.scheduler
                .shutdown()
                .await
                .map_err(|e| CollectorError::Scheduler(e.to_string()))
        })
        .await;

        match shutdown_result {
            Ok(Ok(())) => {
                tracing::info!(job_count, "Collector scheduler shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(job_count, error = %e, "Collector scheduler shutdown failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(job_count, timeout = ?timeout, "Collector scheduler shutdown timed out");
                Ok(())
            }
        }
    }

    /// Remove a specific collector job by ID.
    pub async fn remove(&self, job_id: &uuid::Uuid) -> Result<(), CollectorError> {
        self.scheduler
            .remove(job_id)
            .await
            .map_err(|e| CollectorError::Scheduler(e.to_string()))
            .inspect_err(|e| tracing::error!(job_id = %job_id, error = %e, "Job remove failed"))?;

        let removed = self.jobs.write().await.remove(job_id);
        tracing::info!(
            job_id = %job_id,
            collector = removed.as_ref().map(|e| e.info.name.as_str()),
            "Collector removed"
        );
        Ok(())
    }

    fn create_job(slot: Arc<Slot>) -> Result<Job, CollectorError> {
        let schedule = slot.collector.schedule().clone();

        let make_callback = move || {
            let slot = Arc::clone(&slot);
            move |_: uuid::Uuid, _: JobScheduler| {
                let slot = Arc::clone(&slot);
                Box::pin(async move {
                    slot.run_guarded().await;
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            }
        };

        match &schedule {
            Schedule::Interval(d) => Job::new_repeated_async(*d, make_callback()),
            Schedule::Cron(expr) => Job::new_cron_job_async(expr, make_callback()),
        }
        .map_err(|e| CollectorError::Scheduler(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Device;
    use crate::storage::{Reading, ReadingStore, SensorType, StorageBuilder};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A mock collector for testing.
    struct MockCollector {
        name: String,
        schedule: Schedule,
        store: ReadingStore,
        delay: Duration,
        cycles: AtomicUsize,
    }

    impl MockCollector {
        fn new(name: &str, store: ReadingStore) -> Self {
            Self {
                name: name.to_string(),
                schedule: Schedule::interval(Duration::from_secs(60)),
                store,
                delay: Duration::ZERO,
                cycles: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Collector for MockCollector {
        fn name(&self) -> &str {
            &self.name
        }

        fn source_type(&self) -> &str {
            "mock"
        }

        fn schedule(&self) -> &Schedule {
            &self.schedule
        }

        fn store(&self) -> &ReadingStore {
            &self.store
        }

        async fn discover_devices(&self) -> Result<Vec<Device>, CollectorError> {
            let cycle = self.cycles.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(vec![Device::new(format!("{}-{cycle}", self.name), "Mock", "mock")])
        }

        async fn collect_reading(
            &self,
            device: &Device,
        ) -> Result<Option<Reading>, CollectorError> {
            let reading = Reading::new(device.device_id(self.source_type()), chrono::Utc::now().into())
                .with_measurement(SensorType::Temperature, 21.0);
            Ok(Some(reading))
        }
    }

    async fn store(dir: &tempfile::TempDir) -> ReadingStore {
        StorageBuilder::new(dir.path().join("test.db"))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let registry = CollectorRegistry::new().await.unwrap();

        let job_id = registry
            .spawn(Arc::new(MockCollector::new("test-collector", store.clone())))
            .await
            .unwrap();
        assert_eq!(registry.job_count().await, 1);

        let jobs = registry.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "test-collector");
        assert!(jobs[0].schedule.contains("1m"));

        registry.remove(&job_id).await.unwrap();
        assert_eq!(registry.job_count().await, 0);

        registry.shutdown().await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_run_once_runs_every_collector() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let registry = CollectorRegistry::new().await.unwrap();
        registry
            .spawn(Arc::new(MockCollector::new("beta", store.clone())))
            .await
            .unwrap();
        registry
            .spawn(Arc::new(MockCollector::new("alpha", store.clone())))
            .await
            .unwrap();

        let reports = registry.run_once().await;
        let names: Vec<_> = reports.iter().map(|r| r.collector.as_str()).collect();
        assert_eq!(names, ["alpha", "beta"]);
        assert!(reports.iter().all(|r| r.stored == 1 && r.is_clean()));
        assert_eq!(store.count_readings().await.unwrap(), 2);

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let mut collector = MockCollector::new("slow", store);
        collector.delay = Duration::from_millis(200);
        let slot = Arc::new(Slot {
            collector: Arc::new(collector),
            running: Mutex::new(()),
        });

        let (first, second) = tokio::join!(slot.run_guarded(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            slot.run_guarded().await
        });
        assert!(first.is_some());
        assert!(second.is_none());
        assert!(slot.run_guarded().await.is_some());
    }

    #[tokio::test]
    async fn test_schedule_cron_validation() {
        let result = Schedule::cron("invalid cron expression");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid cron"));
    }
}
