//! Audit records published to the broker.
//!
//! A record is built from one [`Event`] plus the uploading user and, for
//! uploads, what the filesystem says about the file. Field sets differ by
//! operation and absent fields are omitted from the JSON, never `null`.

mod checksum;

pub use checksum::{ChecksumProvider, Sha256Checksum, SHA256};

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event::Event;

/// Errors raised while building a record.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Cannot inspect {path}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upload,
    Remove,
    Rename,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    #[serde(rename = "type")]
    pub algorithm: String,
    pub value: String,
}

/// What an upload record says about the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContext {
    pub size: u64,
    /// Unix seconds.
    pub last_modified: i64,
    pub checksums: Vec<Checksum>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub user: String,
    pub filepath: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_last_modified: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_checksums: Option<Vec<Checksum>>,
}

impl AuditRecord {
    pub fn upload(user: &str, filepath: &str, context: FileContext) -> Self {
        Self {
            user: user.to_string(),
            filepath: filepath.to_string(),
            operation: Operation::Upload,
            oldpath: None,
            filesize: Some(context.size),
            file_last_modified: Some(context.last_modified),
            encrypted_checksums: Some(context.checksums),
        }
    }

    pub fn remove(user: &str, filepath: &str) -> Self {
        Self {
            user: user.to_string(),
            filepath: filepath.to_string(),
            operation: Operation::Remove,
            oldpath: None,
            filesize: None,
            file_last_modified: None,
            encrypted_checksums: None,
        }
    }

    pub fn rename(user: &str, old_path: &str, filepath: &str) -> Self {
        Self {
            oldpath: Some(old_path.to_string()),
            operation: Operation::Rename,
            ..Self::remove(user, filepath)
        }
    }

    /// Serialize to the JSON body sent to the broker.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Turns events into records for one user.
pub struct MessageBuilder {
    user: String,
    checksum: Box<dyn ChecksumProvider>,
}

impl MessageBuilder {
    /// Builder using SHA-256 checksums.
    pub fn new(user: impl Into<String>) -> Self {
        Self::with_checksum(user, Box::new(Sha256Checksum))
    }

    pub fn with_checksum(user: impl Into<String>, checksum: Box<dyn ChecksumProvider>) -> Self {
        Self {
            user: user.into(),
            checksum,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Gather size, modification time and digest of an uploaded file.
    pub fn inspect(&self, path: &Path) -> Result<FileContext> {
        let inspect_err = |source| BuildError::Inspect {
            path: path.to_path_buf(),
            source,
        };

        let mut file = File::open(path).map_err(inspect_err)?;
        let metadata = file.metadata().map_err(inspect_err)?;
        let modified: DateTime<Utc> = metadata.modified().map_err(inspect_err)?.into();
        let value = self.checksum.digest(&mut file).map_err(inspect_err)?;

        debug!(path = %path.display(), size = metadata.len(), "Inspected uploaded file");
        Ok(FileContext {
            size: metadata.len(),
            last_modified: modified.timestamp(),
            checksums: vec![Checksum {
                algorithm: self.checksum.algorithm().to_string(),
                value,
            }],
        })
    }

    /// Record for `event`, or `None` for events that are not published.
    pub fn record_for(&self, event: &Event) -> Result<Option<AuditRecord>> {
        let record = match event {
            Event::Upload { path } => {
                let context = self.inspect(Path::new(path))?;
                AuditRecord::upload(&self.user, path, context)
            }
            Event::Remove { path } => AuditRecord::remove(&self.user, path),
            Event::Rename { old_path, path } => AuditRecord::rename(&self.user, old_path, path),
            Event::Shutdown => return Ok(None),
        };
        Ok(Some(record))
    }
}
