//! FIFO-backed queue between the worker and its listener.
//!
//! The queue is a named pipe keyed by the configured prefix and the
//! producer's pid. Each frame is written with a single `write(2)` no larger
//! than `PIPE_BUF`, so frames never interleave or split.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, info};

use super::frame::{self, FRAME_LEN};
use super::{IpcError, Result, QUEUE_FILE_PREFIX};
use crate::event::Event;

/// A created (but not yet opened) IPC queue.
#[derive(Debug)]
pub struct IpcQueue {
    path: PathBuf,
}

impl IpcQueue {
    /// Queue path for a producer pid under `prefix`.
    pub fn key_for(prefix: &Path, pid: u32) -> PathBuf {
        prefix.join(format!("{}{}.pipe", QUEUE_FILE_PREFIX, pid))
    }

    /// Create the queue for `pid`, replacing any stale one.
    pub fn create(prefix: &Path, pid: u32) -> Result<Self> {
        let path = Self::key_for(prefix, pid);
        let create_err = |source| IpcError::Create {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(prefix).map_err(create_err)?;
        if path.exists() {
            debug!(queue = %path.display(), "Removing stale IPC queue");
            fs::remove_file(&path).map_err(create_err)?;
        }
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|errno| create_err(std::io::Error::from(errno)))?;

        info!(queue = %path.display(), "Created IPC queue");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the consuming end.
    ///
    /// Opened read-write so the listener never observes end-of-file when
    /// the producer closes or has not opened its end yet.
    pub fn open_receiver(&self) -> Result<IpcReceiver> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| IpcError::Open {
                path: self.path.clone(),
                source,
            })?;
        Ok(IpcReceiver {
            file,
            path: self.path.clone(),
        })
    }

    /// Open the producing end. Requires the consuming end to be open.
    pub fn open_sender(&self) -> Result<IpcSender> {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|source| IpcError::Open {
                path: self.path.clone(),
                source,
            })?;
        Ok(IpcSender {
            file,
            path: self.path.clone(),
        })
    }

    /// Remove the queue without it ever having been consumed.
    pub fn remove(self) -> Result<()> {
        fs::remove_file(&self.path).map_err(|source| IpcError::Release {
            path: self.path,
            source,
        })
    }
}

/// Producing end of the queue. Never blocks.
#[derive(Debug)]
pub struct IpcSender {
    file: File,
    path: PathBuf,
}

impl IpcSender {
    /// Enqueue one event.
    ///
    /// A full pipe drops the event and reports [`IpcError::QueueFull`].
    pub fn send(&self, event: &Event) -> Result<()> {
        let frame = frame::encode(event);
        match (&self.file).write(&frame) {
            Ok(n) if n == FRAME_LEN => {
                debug!(kind = %event.kind(), "Event sent to listener");
                Ok(())
            }
            Ok(n) => Err(IpcError::Send(std::io::Error::new(
                ErrorKind::WriteZero,
                format!("short write of {} bytes", n),
            ))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(IpcError::QueueFull),
            Err(e) => Err(IpcError::Send(e)),
        }
    }

    /// Enqueue one event, waiting for room if the pipe is full.
    ///
    /// Blocks until the listener drains enough of the queue, which may take
    /// as long as its current publish retries.
    pub fn send_blocking(&self, event: &Event) -> Result<()> {
        let fd = self.file.as_raw_fd();
        let flags = fcntl(fd, FcntlArg::F_GETFL)
            .map(OFlag::from_bits_truncate)
            .map_err(|errno| IpcError::Send(errno.into()))?;
        fcntl(fd, FcntlArg::F_SETFL(flags & !OFlag::O_NONBLOCK))
            .map_err(|errno| IpcError::Send(errno.into()))?;

        let frame = frame::encode(event);
        let written = (&self.file).write_all(&frame).map_err(IpcError::Send);

        fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|errno| IpcError::Send(errno.into()))?;
        written?;
        debug!(kind = %event.kind(), "Event sent to listener after waiting");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Consuming end of the queue. There is exactly one.
#[derive(Debug)]
pub struct IpcReceiver {
    file: File,
    path: PathBuf,
}

impl IpcReceiver {
    /// Block until one frame arrives and decode it.
    pub fn receive(&mut self) -> Result<Event> {
        let mut buf = [0u8; FRAME_LEN];
        self.file.read_exact(&mut buf).map_err(IpcError::Receive)?;
        frame::decode(&buf)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the queue and remove it from the filesystem.
    pub fn release(self) -> Result<()> {
        let Self { file, path } = self;
        drop(file);
        fs::remove_file(&path).map_err(|source| IpcError::Release {
            path: path.clone(),
            source,
        })?;
        info!(queue = %path.display(), "Released IPC queue");
        Ok(())
    }
}
