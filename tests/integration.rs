//! Integration tests for the cadence scheduler.
//!
//! These tests verify end-to-end scenarios including:
//! - Jobs declared before start firing under the live scheduler
//! - Bounded queues running one submission at a time in order
//! - A single scheduler owner across managers and worker processes
//! - The authenticated RPC surface, in-process and against a real server process
//! - Graceful shutdown behavior

mod common;

mod integration {
    pub mod queues;
    pub mod rpc_api;
    pub mod rpc_process;
    pub mod scheduling;
    pub mod shutdown;
    pub mod singleton;
}
