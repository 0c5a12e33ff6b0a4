//! Scheduler ownership.
//!
//! Every worker process builds a [`SchedulerManager`] and calls
//! [`SchedulerManager::start`]. Exactly one of them wins the singleton
//! lease and brings up the live scheduler, either in-process
//! ([`LocalSchedulerManager`]) or as a separate RPC server process
//! ([`RpcSchedulerManager`]). The others reach it through
//! [`SchedulerManager::get_scheduler`].

mod guard;
mod local;
mod rpc;

pub use guard::{LeaseState, SCHEDULER_LEASE, SingletonGuard, lease_lost};
pub use local::LocalSchedulerManager;
pub use rpc::{RpcSchedulerManager, SpawnCommand};

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{SchedulerMode, ServiceConfig};
use crate::core::types::JobId;
use crate::registry::Registry;
use crate::scheduler::{SchedulerApi, SchedulerError};
use crate::storage::Storage;

/// Lifecycle of the live scheduler as seen from one worker process.
#[async_trait]
pub trait SchedulerManager: Send + Sync {
    /// The lease deciding which process owns the scheduler.
    fn guard(&self) -> &SingletonGuard;

    /// Bring up the scheduler. Called only while the guard is held.
    async fn start_scheduler(&self) -> Result<(), SchedulerError>;

    /// Stop the scheduler this process owns.
    async fn shutdown_scheduler(&self) -> Result<(), SchedulerError>;

    /// A handle on the live scheduler, wherever it runs.
    async fn get_scheduler(&self) -> Option<Arc<dyn SchedulerApi>>;

    /// Whether this process owns a running scheduler.
    async fn is_running(&self) -> bool;

    /// Try to become the scheduler owner.
    ///
    /// Returns `Ok(false)` without side effects when another process holds
    /// the lease.
    async fn start(&self) -> Result<bool, SchedulerError> {
        if !self.guard().try_acquire().await? {
            return Ok(false);
        }

        if let Err(e) = self.start_scheduler().await {
            tracing::error!(error = %e, "failed to start scheduler, releasing lease");
            if let Err(release_err) = self.guard().release().await {
                tracing::warn!(error = %release_err, "failed to release lease");
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Stop the scheduler if this process owns it and release the lease.
    async fn shutdown(&self) -> Result<(), SchedulerError> {
        if self.is_running().await {
            self.shutdown_scheduler().await?;
        }
        self.guard().release().await?;
        Ok(())
    }
}

/// Bring a live scheduler in line with the registry.
///
/// Enabled jobs are added, replacing entries with the same id. Disabled jobs
/// are removed if the scheduler has them.
pub async fn add_registered_jobs(
    api: &dyn SchedulerApi,
    registry: &Registry,
) -> Result<(), SchedulerError> {
    let live: HashSet<JobId> = api.get_jobs().await?.into_iter().map(|j| j.id).collect();

    let mut jobs: Vec<_> = registry.get_scheduled_jobs().into_values().collect();
    jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));

    for job in jobs {
        if job.enabled {
            api.add_job(job.to_spec()).await?;
        } else if live.contains(&job.job_id) {
            api.remove_job(&job.job_id).await?;
            tracing::info!(job_id = %job.job_id, "removed disabled job");
        }
    }
    Ok(())
}

/// Startup work of a new scheduler owner: optionally wipe persisted jobs,
/// then reconcile with the registry.
pub async fn prepare_scheduler(
    api: &dyn SchedulerApi,
    registry: &Registry,
    clear_jobs: bool,
) -> Result<(), SchedulerError> {
    if clear_jobs {
        tracing::info!("clearing persisted jobs");
        api.remove_all_jobs().await?;
    }
    add_registered_jobs(api, registry).await
}

/// Build the manager for the configured scheduler mode.
pub fn build_manager(
    config: &ServiceConfig,
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
) -> Box<dyn SchedulerManager> {
    match config.scheduler_mode {
        SchedulerMode::Local => Box::new(LocalSchedulerManager::new(
            config.clone(),
            registry,
            storage,
        )),
        SchedulerMode::Rpc => Box::new(RpcSchedulerManager::new(config.clone(), storage)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::core::handler::Handler;
    use crate::core::types::JobTarget;
    use crate::registry::declare;
    use crate::storage::InMemoryStorage;
    use crate::testing::CallRecorder;
    use std::time::Duration;

    fn registry_with_jobs() -> Arc<Registry> {
        let registry = Arc::new(Registry::new(Environment::Test));
        let calls = CallRecorder::new();
        declare::interval()
            .minutes(5.0)
            .register(&registry, "stats:update_site_stats", calls.handler())
            .unwrap();
        declare::cron()
            .hour("3")
            .enabled(false)
            .register(&registry, "trackers:scrape", calls.handler())
            .unwrap();
        registry
    }

    fn local_config() -> ServiceConfig {
        ServiceConfig {
            env: Environment::Test,
            scheduler_mode: SchedulerMode::Local,
            tick_interval_ms: 50,
            shutdown_timeout_secs: 2,
            ..ServiceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_add_registered_jobs_adds_enabled_and_removes_disabled() {
        let registry = registry_with_jobs();
        let manager = LocalSchedulerManager::new(
            local_config(),
            Arc::clone(&registry),
            Arc::new(InMemoryStorage::new()),
        );
        assert!(manager.start().await.unwrap());
        let api = manager.get_scheduler().await.unwrap();

        // A stale copy of the disabled job, e.g. from an earlier deployment.
        api.add_job(
            crate::core::job::JobSpec::new(JobTarget::parse("trackers:scrape").unwrap())
                .with_trigger(registry.get_scheduled_jobs()[&JobId::new("scrape")].trigger.clone())
                .replace_existing(true),
        )
        .await
        .unwrap();

        add_registered_jobs(api.as_ref(), &registry).await.unwrap();
        let ids: Vec<String> = api
            .get_jobs()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id.to_string())
            .collect();
        assert_eq!(ids, vec!["update_site_stats"]);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_manager_does_not_start() {
        let registry = registry_with_jobs();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let first = build_manager(&local_config(), Arc::clone(&registry), Arc::clone(&storage));
        let second = build_manager(&local_config(), Arc::clone(&registry), Arc::clone(&storage));

        assert!(first.start().await.unwrap());
        assert!(!second.start().await.unwrap());
        assert!(first.is_running().await);
        assert!(!second.is_running().await);

        first.shutdown().await.unwrap();
        assert!(second.start().await.unwrap());
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_twice_then_reacquire() {
        let registry = registry_with_jobs();
        let manager =
            LocalSchedulerManager::new(local_config(), registry, Arc::new(InMemoryStorage::new()));

        assert!(manager.start().await.unwrap());
        manager.shutdown().await.unwrap();
        manager.shutdown().await.unwrap();
        assert!(!manager.is_running().await);
        assert!(!manager.guard().is_held());

        assert!(manager.start().await.unwrap());
        assert!(manager.is_running().await);
        manager.shutdown().await.unwrap();
    }

    fn ticking_registry(calls: &Arc<CallRecorder>) -> Arc<Registry> {
        let registry = Arc::new(Registry::new(Environment::Test));
        declare::interval()
            .seconds(0.1)
            .register(&registry, "stats:tick", calls.handler())
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_lost_lease_stops_local_scheduler() {
        let calls = CallRecorder::new();
        let storage = Arc::new(InMemoryStorage::new());
        let config = ServiceConfig {
            lease_ttl_secs: 1,
            ..local_config()
        };
        let manager = LocalSchedulerManager::new(
            config,
            ticking_registry(&calls),
            Arc::clone(&storage) as Arc<dyn Storage>,
        );
        assert!(manager.start().await.unwrap());
        assert!(calls.wait_for_calls(1, Duration::from_secs(1)).await);

        // Another process takes the lease, e.g. after this one stalled.
        storage
            .release_lease(SCHEDULER_LEASE, manager.guard().holder())
            .await
            .unwrap();
        assert!(
            storage
                .try_acquire_lease(SCHEDULER_LEASE, "other-worker", Duration::from_secs(30))
                .await
                .unwrap()
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while manager.is_running().await {
            assert!(tokio::time::Instant::now() < deadline, "scheduler kept running");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!manager.guard().is_held());
        assert!(manager.get_scheduler().await.is_none());

        let fired = calls.call_count();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.call_count(), fired);

        // Shutting down after stepping down leaves the other holder alone.
        manager.shutdown().await.unwrap();
        let lease = storage.get_lease(SCHEDULER_LEASE).await.unwrap().unwrap();
        assert_eq!(lease.holder, "other-worker");
    }

    #[tokio::test]
    async fn test_restart_after_shutdown_through_api() {
        let calls = CallRecorder::new();
        let manager = LocalSchedulerManager::new(
            local_config(),
            ticking_registry(&calls),
            Arc::new(InMemoryStorage::new()),
        );
        assert!(manager.start().await.unwrap());

        let api = manager.get_scheduler().await.unwrap();
        api.shutdown().await.unwrap();
        assert!(!manager.is_running().await);
        manager.shutdown().await.unwrap();

        assert!(manager.start().await.unwrap());
        assert!(manager.is_running().await);
        let before = calls.call_count();
        assert!(calls.wait_for_calls(before + 2, Duration::from_secs(2)).await);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_jobs_wipes_persisted_jobs() {
        let registry = Arc::new(Registry::new(Environment::Test));
        registry.register_handler(
            JobTarget::parse("m:noop").unwrap(),
            Handler::blocking(|_| Ok(())),
        );
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .upsert_job(crate::storage::test_support::stored_job("leftover"))
            .await
            .unwrap();

        let config = ServiceConfig {
            clear_jobs: true,
            ..local_config()
        };
        let manager = LocalSchedulerManager::new(config, registry, storage.clone());
        assert!(manager.start().await.unwrap());

        let api = manager.get_scheduler().await.unwrap();
        assert!(api.get_jobs().await.unwrap().is_empty());
        manager.shutdown().await.unwrap();
    }
}
