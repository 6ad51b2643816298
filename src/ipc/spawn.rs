//! Forking the listener process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use super::queue::{IpcQueue, IpcReceiver, IpcSender};
use super::{IpcError, Result};
use crate::broker::{AmqpConnector, BrokerClient, Connector};
use crate::config::{ConnectionParams, Settings};
use crate::event::Event;
use crate::listener::Listener;
use crate::message::MessageBuilder;

/// Exit status of a listener whose queue was released cleanly.
pub const EXIT_RELEASED: i32 = 0;
/// Exit status of a listener that could not release its queue.
pub const EXIT_RELEASE_FAILED: i32 = 1;
/// Exit status of a listener that could not start its runtime.
pub const EXIT_NO_RUNTIME: i32 = 2;

/// Spawn a listener that publishes to the AMQP broker in `settings`.
///
/// See [`spawn_with`] for the fork-safety requirements.
pub fn spawn(settings: &Settings, user: &str) -> Result<ListenerHandle> {
    spawn_with(
        &settings.ipc_key_prefix,
        user,
        Arc::new(settings.connection.clone()),
        AmqpConnector::new(),
    )
}

/// Create the IPC queue, then fork a listener that exclusively owns the
/// broker connection built from `params` and `connector`.
///
/// The calling process keeps the sending end and continues. The child
/// runs the listener loop and exits with the outcome of releasing the
/// queue; it never returns from this function.
///
/// Must be called while the process is still single-threaded (before any
/// async runtime or worker threads exist). Only the calling thread
/// survives in the child.
pub fn spawn_with<C>(
    prefix: &Path,
    user: &str,
    params: Arc<ConnectionParams>,
    connector: C,
) -> Result<ListenerHandle>
where
    C: Connector + 'static,
{
    let pid = std::process::id();
    debug!(pid, "Creating queue for a new listener");
    let queue = IpcQueue::create(prefix, pid)?;

    // Both ends are opened before forking so the non-blocking sender open
    // always finds a reader.
    let (receiver, sender) = match queue
        .open_receiver()
        .and_then(|rx| queue.open_sender().map(|tx| (rx, tx)))
    {
        Ok(ends) => ends,
        Err(e) => {
            let _ = queue.remove();
            return Err(e);
        }
    };

    // SAFETY: the caller guarantees no other threads exist, so the child
    // does not inherit locks held by threads that vanish at fork.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(sender);
            info!(user = %user, "Listener forked");
            let code = run_listener(receiver, user, params, connector);
            std::process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => {
            drop(receiver);
            info!(listener = %child, queue = %queue.path().display(), "Listener created, worker moving on");
            Ok(ListenerHandle {
                sender,
                pid: child,
                key: queue.path().to_path_buf(),
            })
        }
        Err(errno) => {
            error!(error = %errno, "Listener fork failed");
            drop(receiver);
            drop(sender);
            let _ = queue.remove();
            Err(IpcError::Spawn(errno))
        }
    }
}

/// Body of the forked child. Returns its exit status.
fn run_listener<C: Connector>(
    receiver: IpcReceiver,
    user: &str,
    params: Arc<ConnectionParams>,
    connector: C,
) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Listener cannot start its runtime");
            let _ = receiver.release();
            return EXIT_NO_RUNTIME;
        }
    };

    let listener = Listener::new(
        receiver,
        MessageBuilder::new(user),
        BrokerClient::new(params, connector),
        runtime,
    );

    match listener.run() {
        Ok(()) => EXIT_RELEASED,
        Err(e) => {
            error!(error = %e, "Listener terminated without releasing its queue");
            EXIT_RELEASE_FAILED
        }
    }
}

/// The worker's view of a running listener.
#[derive(Debug)]
pub struct ListenerHandle {
    sender: IpcSender,
    pid: Pid,
    key: PathBuf,
}

impl ListenerHandle {
    /// Process id of the listener.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Path of the IPC queue.
    pub fn key(&self) -> &Path {
        &self.key
    }

    /// Forward an event. Failures are logged and returned, never fatal.
    pub fn send(&self, event: &Event) -> Result<()> {
        self.sender.send(event).inspect_err(|e| {
            warn!(kind = %event.kind(), error = %e, "Could not notify listener");
        })
    }

    pub fn send_upload(&self, path: &str) -> Result<()> {
        debug!(path = %path, "uploaded");
        self.send(&Event::upload(path))
    }

    pub fn send_remove(&self, path: &str) -> Result<()> {
        debug!(path = %path, "removed");
        self.send(&Event::remove(path))
    }

    pub fn send_rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        debug!(old_path = %old_path, path = %new_path, "renamed");
        self.send(&Event::rename(old_path, new_path))
    }

    /// Ask the listener to stop once it has drained earlier events.
    ///
    /// Unlike other events, Shutdown is never dropped: when the queue is
    /// full this waits until the listener makes room.
    pub fn shutdown(&self) -> Result<()> {
        debug!("Sending shutdown to listener");
        self.sender.send_blocking(&Event::Shutdown).inspect_err(|e| {
            error!(error = %e, "Could not ask listener to shut down");
        })
    }

    /// Wait for the listener to exit and return its exit status.
    ///
    /// A listener killed by a signal reports `128 + signal`.
    pub fn wait(self) -> Result<i32> {
        loop {
            match waitpid(self.pid, None).map_err(IpcError::Wait)? {
                WaitStatus::Exited(_, code) => return Ok(code),
                WaitStatus::Signaled(_, signal, _) => return Ok(128 + signal as i32),
                other => debug!(status = ?other, "Listener still running"),
            }
        }
    }
}
