//! cadence - a singleton job scheduler with bounded job queues.
//!
//! Jobs are declared in a process-local [`Registry`] (see
//! [`registry::declare`]), installed into exactly one live [`Scheduler`]
//! elected through a [`SingletonGuard`] lease, and controlled through the
//! [`SchedulerApi`] either in-process or over the authenticated RPC channel.
//!
//! ```ignore
//! use cadence::{Environment, Handler, JobCall, JobError, Registry, declare};
//!
//! let registry = Registry::new(Environment::Dev);
//! declare::interval()
//!     .minutes(30.0)
//!     .register(&registry, "services.stats:update_site_stats", Handler::from_fn(
//!         |_call: JobCall| async { Ok::<(), JobError>(()) },
//!     ))?;
//! ```

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod rpc;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, ConfigLoader, Environment, SchedulerMode, ServiceConfig};
pub use core::handler::{Handler, JobCall, JobError, JobHandler};
pub use core::job::{JobArgs, JobKwargs, JobSpec, QueuedJobType, ScheduledJob};
pub use core::snapshot::{DEFAULT_EXECUTOR, JobSnapshot};
pub use core::trigger::{CronTrigger, DateTrigger, IntervalTrigger, Trigger, TriggerError};
pub use core::types::{JobId, JobTarget, QueueName, RunId};
pub use events::{Event, EventBus, EventHandler, EventKind};
pub use execution::register_builtins;
pub use manager::{
    LocalSchedulerManager, RpcSchedulerManager, SchedulerManager, SingletonGuard, build_manager,
};
pub use queue::{BoundedQueue, QueueError, QueueSet, SubmitOutcome};
pub use registry::{DeclareError, Registry, declare};
pub use rpc::{RpcClient, RpcToken};
pub use scheduler::{QueueResult, Scheduler, SchedulerApi, SchedulerError, SchedulerHandle, SchedulerState};
pub use storage::{InMemoryStorage, Storage, StorageError, open_storage};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
