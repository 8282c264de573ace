//! Mapper checkpoint.
//!
//! Records how far each service feed has been consumed, which base ids have
//! already been resolved, and which hinted edges were rejected. A pass never
//! edits the checkpoint it loaded; it builds a successor with
//! [`Checkpoint::successor`] and commits that alongside the mapping.

use crate::graph::EdgeKey;
use crate::source::Cursor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{MediaKind, Service};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Immutable snapshot of mapper progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub kind: MediaKind,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cursors: BTreeMap<Service, Cursor>,
    #[serde(default)]
    pub resolved_base_ids: BTreeSet<String>,
    /// Hinted edges rejected so far. Update passes carry the set forward; a
    /// full pass starts it empty again.
    #[serde(default)]
    pub rejected_edges: BTreeSet<EdgeKey>,
}

/// Why a checkpoint on disk cannot be used
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint {0} is unreadable: {1}")]
    Unreadable(PathBuf, #[source] std::io::Error),

    #[error("checkpoint {0} is corrupt: {1}")]
    Corrupt(PathBuf, #[source] serde_json::Error),

    #[error("checkpoint {path} has version {found}, expected {expected}")]
    Version {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("checkpoint {path} was written for {found}, expected {expected}")]
    Kind {
        path: PathBuf,
        found: MediaKind,
        expected: MediaKind,
    },
}

/// Result of looking for a checkpoint on disk
#[derive(Debug)]
pub enum CheckpointLoad {
    Loaded(Checkpoint),
    Missing,
    Corrupt(CheckpointError),
}

impl Checkpoint {
    pub fn empty(kind: MediaKind) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            kind,
            updated_at: None,
            cursors: BTreeMap::new(),
            resolved_base_ids: BTreeSet::new(),
            rejected_edges: BTreeSet::new(),
        }
    }

    /// Load the checkpoint for `kind`. Never fails; problems show up as
    /// [`CheckpointLoad::Corrupt`].
    pub fn load(path: &Path, kind: MediaKind) -> CheckpointLoad {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No checkpoint");
                return CheckpointLoad::Missing;
            }
            Err(e) => {
                return CheckpointLoad::Corrupt(CheckpointError::Unreadable(path.to_path_buf(), e))
            }
        };

        let checkpoint: Checkpoint = match serde_json::from_str(&content) {
            Ok(checkpoint) => checkpoint,
            Err(e) => return CheckpointLoad::Corrupt(CheckpointError::Corrupt(path.to_path_buf(), e)),
        };

        if checkpoint.version != CHECKPOINT_VERSION {
            return CheckpointLoad::Corrupt(CheckpointError::Version {
                path: path.to_path_buf(),
                found: checkpoint.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        if checkpoint.kind != kind {
            return CheckpointLoad::Corrupt(CheckpointError::Kind {
                path: path.to_path_buf(),
                found: checkpoint.kind,
                expected: kind,
            });
        }

        CheckpointLoad::Loaded(checkpoint)
    }

    pub fn cursor(&self, service: Service) -> Option<&Cursor> {
        self.cursors.get(&service)
    }

    pub fn is_resolved(&self, base_id: &str) -> bool {
        self.resolved_base_ids.contains(base_id)
    }

    pub fn is_rejected(&self, edge: &EdgeKey) -> bool {
        self.rejected_edges.contains(edge)
    }

    /// Start a successor that inherits this checkpoint's cursors
    pub fn successor(&self) -> CheckpointDraft {
        CheckpointDraft {
            kind: self.kind,
            cursors: self.cursors.clone(),
            resolved_base_ids: BTreeSet::new(),
            rejected_edges: BTreeSet::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        Ok(content)
    }
}

/// Checkpoint under construction during a pass
#[derive(Debug, Clone)]
pub struct CheckpointDraft {
    kind: MediaKind,
    cursors: BTreeMap<Service, Cursor>,
    resolved_base_ids: BTreeSet<String>,
    rejected_edges: BTreeSet<EdgeKey>,
}

impl CheckpointDraft {
    pub fn new(kind: MediaKind) -> Self {
        Checkpoint::empty(kind).successor()
    }

    pub fn advance(&mut self, service: Service, cursor: Cursor) {
        self.cursors.insert(service, cursor);
    }

    /// Drop a service's cursor so it is read from the start
    pub fn forget(&mut self, service: Service) {
        self.cursors.remove(&service);
    }

    pub fn mark_resolved(&mut self, base_id: impl Into<String>) {
        self.resolved_base_ids.insert(base_id.into());
    }

    pub fn reject(&mut self, edge: EdgeKey) {
        self.rejected_edges.insert(edge);
    }

    pub fn cursor(&self, service: Service) -> Option<&Cursor> {
        self.cursors.get(&service)
    }

    pub fn finish(self, now: DateTime<Utc>) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            kind: self.kind,
            updated_at: Some(now),
            cursors: self.cursors,
            resolved_base_ids: self.resolved_base_ids,
            rejected_edges: self.rejected_edges,
        }
    }
}
