//! transfer-audit - audit trail for file-transfer workers
//!
//! Completed uploads, removals and renames are handed over a local IPC
//! queue to a forked listener, which publishes one JSON record per
//! operation to an AMQP broker. Delivery is best-effort and at-most-once.

pub mod broker;
pub mod config;
pub mod event;
pub mod ipc;
pub mod listener;
pub mod message;
pub mod utils;

pub use event::{Event, EventKind};
