//! Built-in job handlers.
//!
//! The binary can only schedule callables it knows about. These are
//! registered under the `builtin` module so that a configuration file can
//! schedule useful work without any embedding code.

mod builtins;
mod command;

use std::sync::Arc;

pub use builtins::{LogJob, SleepJob};
pub use command::{CommandJob, CommandSpec};

use crate::core::handler::Handler;
use crate::core::types::JobTarget;
use crate::registry::Registry;

/// Module name shared by all built-in targets.
pub const BUILTIN_MODULE: &str = "builtin";

fn target(callable: &str) -> Option<JobTarget> {
    JobTarget::parse(&format!("{BUILTIN_MODULE}:{callable}")).ok()
}

/// Register `builtin:log`, `builtin:sleep` and `builtin:command`.
pub fn register_builtins(registry: &Registry) {
    let handlers: [(&str, Handler); 3] = [
        ("log", Handler::from(Arc::new(LogJob))),
        ("sleep", Handler::from(Arc::new(SleepJob))),
        ("command", Handler::from(Arc::new(CommandJob))),
    ];
    for (callable, handler) in handlers {
        if let Some(target) = target(callable) {
            registry.register_handler(target, handler);
        }
    }
}
