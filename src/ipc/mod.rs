//! Event forwarding between the file-transfer worker and its listener.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  fixed frames   ┌──────────────┐  AMQP   ┌────────┐
//! │    worker    │───────────────▶│   listener   │────────▶│ broker │
//! │ (IpcSender)  │  FIFO per pid   │ (forked,     │         └────────┘
//! └──────────────┘                 │  IpcReceiver)│
//!                                  └──────────────┘
//! ```
//!
//! Usage:
//! 1. The worker calls [`spawn`] once, before starting any threads
//! 2. The worker reports operations through the returned [`ListenerHandle`]
//! 3. [`ListenerHandle::shutdown`] stops the listener, which removes the queue
//!
//! Delivery is best-effort and at-most-once: a send that cannot be
//! enqueued is reported to the caller and the event is lost.

pub mod frame;
mod queue;
mod spawn;

use std::path::PathBuf;

pub use frame::{FRAME_LEN, PATH_FIELD_LEN};
pub use queue::{IpcQueue, IpcReceiver, IpcSender};
pub use spawn::{spawn, spawn_with, ListenerHandle};

/// File name prefix of the per-worker queue.
pub const QUEUE_FILE_PREFIX: &str = "audit-";

/// Errors that can occur on the IPC channel.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("Failed to create IPC queue {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open IPC queue {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IPC queue is full, event dropped")]
    QueueFull,

    #[error("IPC send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("IPC receive failed: {0}")]
    Receive(#[source] std::io::Error),

    #[error("Unknown IPC frame tag {0}")]
    UnknownTag(u32),

    #[error("Malformed IPC frame: {0}")]
    Malformed(String),

    #[error("Failed to fork listener: {0}")]
    Spawn(#[source] nix::errno::Errno),

    #[error("Failed to wait for listener: {0}")]
    Wait(#[source] nix::errno::Errno),

    #[error("Failed to release IPC queue {path}: {source}")]
    Release {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;
