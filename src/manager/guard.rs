//! Cross-process singleton guard.
//!
//! The guard is a lease row in the job store. Whoever holds an unexpired
//! lease owns the live scheduler. The holder renews it every third of its
//! lifetime; a holder that dies stops renewing and the lease lapses.
//!
//! A holder whose renewal is refused has lost the lease to another process.
//! The guard publishes that as [`LeaseState::Lost`] so the owner can stop
//! its scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::storage::{Storage, StorageError};

/// Lease name claimed by the scheduler owner.
pub const SCHEDULER_LEASE: &str = "scheduler";

/// What a guard knows about its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Not held, or given up through [`SingletonGuard::release`].
    Released,
    Held,
    /// Renewal was refused: another holder owns the lease now.
    Lost,
}

/// Lease-backed guard ensuring a single scheduler owner.
pub struct SingletonGuard {
    storage: Arc<dyn Storage>,
    name: String,
    holder: String,
    ttl: Duration,
    held: Arc<AtomicBool>,
    state: Arc<watch::Sender<LeaseState>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl SingletonGuard {
    /// Guard the scheduler lease with a fresh holder identity.
    pub fn new(storage: Arc<dyn Storage>, ttl: Duration) -> Self {
        Self::named(storage, SCHEDULER_LEASE, ttl)
    }

    pub fn named(storage: Arc<dyn Storage>, name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            storage,
            name: name.into(),
            holder: format!("{}-{}", std::process::id(), Uuid::new_v4()),
            ttl,
            held: Arc::new(AtomicBool::new(false)),
            state: Arc::new(watch::channel(LeaseState::Released).0),
            heartbeat: Mutex::new(None),
        }
    }

    /// Identity written into the lease row.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this guard believes it holds the lease.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Follow the lease state.
    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.state.subscribe()
    }

    /// Try once to take the lease. Never waits for a current holder.
    pub async fn try_acquire(&self) -> Result<bool, StorageError> {
        if self.is_held() {
            return Ok(true);
        }

        let acquired = self
            .storage
            .try_acquire_lease(&self.name, &self.holder, self.ttl)
            .await?;
        if !acquired {
            tracing::debug!(lease = %self.name, holder = %self.holder, "lease held elsewhere");
            return Ok(false);
        }

        self.held.store(true, Ordering::SeqCst);
        self.state.send_replace(LeaseState::Held);
        self.start_heartbeat();
        tracing::info!(lease = %self.name, holder = %self.holder, ttl = ?self.ttl, "acquired lease");
        Ok(true)
    }

    /// Give the lease up. Does nothing if it is not held.
    pub async fn release(&self) -> Result<(), StorageError> {
        if let Some(heartbeat) = self.take_heartbeat() {
            heartbeat.abort();
        }
        if !self.held.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.send_replace(LeaseState::Released);

        self.storage
            .release_lease(&self.name, &self.holder)
            .await?;
        tracing::info!(lease = %self.name, holder = %self.holder, "released lease");
        Ok(())
    }

    fn start_heartbeat(&self) {
        let storage = Arc::clone(&self.storage);
        let held = Arc::clone(&self.held);
        let state = Arc::clone(&self.state);
        let name = self.name.clone();
        let holder = self.holder.clone();
        let ttl = self.ttl;
        let period = (ttl / 3).max(Duration::from_millis(10));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match storage.renew_lease(&name, &holder, ttl).await {
                    Ok(true) => tracing::trace!(lease = %name, "renewed lease"),
                    Ok(false) => {
                        held.store(false, Ordering::SeqCst);
                        state.send_replace(LeaseState::Lost);
                        tracing::error!(lease = %name, holder = %holder, "lease lost to another holder");
                        return;
                    }
                    // Keep trying until the lease would have expired anyway.
                    Err(e) => tracing::warn!(lease = %name, error = %e, "failed to renew lease"),
                }
            }
        });

        if let Some(previous) = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
    }

    fn take_heartbeat(&self) -> Option<JoinHandle<()>> {
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Wait until the lease stops being held.
///
/// Returns `true` if it was lost to another holder and `false` if it was
/// released or the guard is gone.
pub async fn lease_lost(mut state: watch::Receiver<LeaseState>) -> bool {
    match state.wait_for(|s| *s != LeaseState::Held).await {
        Ok(s) => *s == LeaseState::Lost,
        Err(_) => false,
    }
}

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.take_heartbeat() {
            heartbeat.abort();
        }
    }
}

impl std::fmt::Debug for SingletonGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonGuard")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .field("ttl", &self.ttl)
            .field("held", &self.is_held())
            .finish()
    }
}
