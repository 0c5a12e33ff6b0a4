//! In-process scheduler ownership.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::guard::{SingletonGuard, lease_lost};
use super::{SchedulerManager, prepare_scheduler};
use crate::config::ServiceConfig;
use crate::events::EventBus;
use crate::registry::Registry;
use crate::scheduler::{Scheduler, SchedulerApi, SchedulerError, SchedulerHandle, SchedulerState};
use crate::storage::Storage;

/// Runs the live scheduler inside the owning process.
pub struct LocalSchedulerManager {
    config: ServiceConfig,
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
    event_bus: Arc<EventBus>,
    guard: SingletonGuard,
    running: Arc<Mutex<Option<Running>>>,
}

type Running = (SchedulerHandle, JoinHandle<()>);

/// Stop the scheduler in `slot`, waiting for its loop to finish.
async fn stop(slot: &Mutex<Option<Running>>) -> Result<(), SchedulerError> {
    let Some((handle, task)) = slot.lock().await.take() else {
        return Ok(());
    };

    handle.shutdown().await?;
    if let Err(e) = task.await {
        tracing::warn!(error = %e, "scheduler task ended abnormally");
    }
    Ok(())
}

impl LocalSchedulerManager {
    pub fn new(config: ServiceConfig, registry: Arc<Registry>, storage: Arc<dyn Storage>) -> Self {
        let guard = SingletonGuard::new(Arc::clone(&storage), config.lease_ttl());
        Self {
            config,
            registry,
            storage,
            event_bus: Arc::new(EventBus::new()),
            guard,
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Emit scheduler events on `event_bus` instead of a private bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// The in-process handle, while running.
    pub async fn handle(&self) -> Option<SchedulerHandle> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|(handle, _)| handle.clone())
    }
}

#[async_trait]
impl SchedulerManager for LocalSchedulerManager {
    fn guard(&self) -> &SingletonGuard {
        &self.guard
    }

    async fn start_scheduler(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock().await;
        let current = match running.as_ref() {
            Some((handle, _)) => Some(handle.state().await),
            None => None,
        };
        if current.is_some_and(|state| state != SchedulerState::Stopped) {
            tracing::info!("scheduler already running");
            return Ok(());
        }
        // Stopped through its API; replace it.
        if let Some((_, task)) = running.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "scheduler task ended abnormally");
            }
        }

        let (handle, task) = Scheduler::new(Arc::clone(&self.registry), Arc::clone(&self.storage))
            .with_event_bus(Arc::clone(&self.event_bus))
            .with_tick_interval(self.config.tick_interval())
            .with_shutdown_timeout(self.config.shutdown_timeout())
            .start()
            .await?;

        if let Err(e) = prepare_scheduler(&handle, &self.registry, self.config.clear_jobs).await {
            let _ = handle.shutdown().await;
            let _ = task.await;
            return Err(e);
        }

        tracing::info!(mode = "local", "scheduler owner started");
        *running = Some((handle, task));

        let slot = Arc::clone(&self.running);
        let lease = self.guard.subscribe();
        tokio::spawn(async move {
            if lease_lost(lease).await {
                tracing::error!(mode = "local", "lease lost, stopping scheduler");
                if let Err(e) = stop(&slot).await {
                    tracing::warn!(error = %e, "failed to stop scheduler after losing the lease");
                }
            }
        });
        Ok(())
    }

    async fn shutdown_scheduler(&self) -> Result<(), SchedulerError> {
        stop(&self.running).await
    }

    async fn get_scheduler(&self) -> Option<Arc<dyn SchedulerApi>> {
        self.handle()
            .await
            .map(|handle| Arc::new(handle) as Arc<dyn SchedulerApi>)
    }

    async fn is_running(&self) -> bool {
        match self.handle().await {
            Some(handle) => handle.state().await != SchedulerState::Stopped,
            None => false,
        }
    }
}
