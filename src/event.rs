//! File-transfer events carried from the worker to the listener.

use std::fmt;

/// Operation tag as it appears on the IPC wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventKind {
    Upload = 1,
    Remove = 2,
    Rename = 3,
    Shutdown = 4,
}

impl EventKind {
    /// Wire value of the tag.
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Map a wire value back to a kind, `None` for anything unknown.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::Upload),
            2 => Some(Self::Remove),
            3 => Some(Self::Rename),
            4 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Upload => "upload",
            Self::Remove => "remove",
            Self::Rename => "rename",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// A completed file operation reported by the worker.
///
/// Events are built once by the sender and consumed once by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Upload { path: String },
    Remove { path: String },
    Rename { old_path: String, path: String },
    /// Ends the listener loop.
    Shutdown,
}

impl Event {
    pub fn upload(path: impl Into<String>) -> Self {
        Self::Upload { path: path.into() }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::Remove { path: path.into() }
    }

    pub fn rename(old_path: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Rename {
            old_path: old_path.into(),
            path: path.into(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Upload { .. } => EventKind::Upload,
            Self::Remove { .. } => EventKind::Remove,
            Self::Rename { .. } => EventKind::Rename,
            Self::Shutdown => EventKind::Shutdown,
        }
    }

    /// Target path of the operation (the new path for a rename).
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Upload { path } | Self::Remove { path } | Self::Rename { path, .. } => {
                Some(path)
            }
            Self::Shutdown => None,
        }
    }

    /// Previous path, only present for renames.
    pub fn old_path(&self) -> Option<&str> {
        match self {
            Self::Rename { old_path, .. } => Some(old_path),
            _ => None,
        }
    }
}
