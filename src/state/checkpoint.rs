//! Resumable run checkpoint
//!
//! The checkpoint is a small state machine persisted to `checkpoint.json`:
//!
//! ```text
//! NotStarted ──begin_stage──▶ InStage{stage, cursor} ──complete──▶ Completed
//!                                 │  ▲                                  │
//!                                 └──┘ advance / begin_stage(next)      │
//! NotStarted ◀────────────────────────── reset ─────────────────────────┘
//! ```
//!
//! The cursor is the index of the first item of the stage whose side effects
//! are not yet committed. Workers finish out of order, so [`StageCursor`]
//! tracks a low-watermark over completed indices.

use crate::storage::{read_json, write_json_atomic, StorageResult};
use crate::HarvestError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// File name of the checkpoint inside the data directory
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Where the pipeline stands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckpointState {
    NotStarted,
    InStage { stage: String, cursor: usize },
    Completed,
}

impl fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not started"),
            Self::InStage { stage, cursor } => write!(f, "in stage '{}' at item {}", stage, cursor),
            Self::Completed => f.write_str("completed"),
        }
    }
}

/// The run settings a checkpoint was taken under
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    #[serde(default)]
    pub config_hash: String,
    #[serde(default)]
    pub rate_limit_seconds: f64,
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub item_limit: Option<usize>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub retry_failed: bool,
    #[serde(default)]
    pub skip: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    state: CheckpointState,
    #[serde(default)]
    config: RunSnapshot,
    #[serde(default)]
    saved_at: Option<String>,
}

/// Durable marker of the current stage and position within it
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    state: CheckpointState,
    snapshot: RunSnapshot,
    saved_at: Option<String>,
}

impl Checkpoint {
    /// Path of the checkpoint inside `data_dir`
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(CHECKPOINT_FILE)
    }

    /// Loads the checkpoint at `path`
    ///
    /// A missing file, or one that cannot be parsed (logged at WARN), yields
    /// `NotStarted` so the run starts fresh.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match read_json::<CheckpointFile>(&path) {
            Ok(Some(file)) => Self {
                path,
                state: file.state,
                snapshot: file.config,
                saved_at: file.saved_at,
            },
            Ok(None) => Self::fresh(path, RunSnapshot::default()),
            Err(e) => {
                tracing::warn!("Ignoring unreadable checkpoint {}: {}", path.display(), e);
                Self::fresh(path, RunSnapshot::default())
            }
        }
    }

    /// A `NotStarted` checkpoint that will be written to `path`
    pub fn fresh(path: impl Into<PathBuf>, snapshot: RunSnapshot) -> Self {
        Self {
            path: path.into(),
            state: CheckpointState::NotStarted,
            snapshot,
            saved_at: None,
        }
    }

    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    pub fn snapshot(&self) -> &RunSnapshot {
        &self.snapshot
    }

    pub fn saved_at(&self) -> Option<&str> {
        self.saved_at.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the recorded run settings (written on the next save)
    pub fn set_snapshot(&mut self, snapshot: RunSnapshot) {
        self.snapshot = snapshot;
    }

    /// Enters `stage` at `cursor`
    ///
    /// Allowed from `NotStarted` and `InStage`; a `Completed` checkpoint must
    /// be reset first.
    pub fn begin_stage(&mut self, stage: &str, cursor: usize) -> Result<(), HarvestError> {
        if self.state == CheckpointState::Completed {
            return Err(self.invalid(&format!("in stage '{}'", stage)));
        }
        self.state = CheckpointState::InStage {
            stage: stage.to_string(),
            cursor,
        };
        Ok(())
    }

    /// Moves the cursor of the current stage forward
    ///
    /// The cursor never moves backwards; a lower value is ignored.
    pub fn advance(&mut self, new_cursor: usize) -> Result<(), HarvestError> {
        match &mut self.state {
            CheckpointState::InStage { cursor, .. } => {
                if new_cursor > *cursor {
                    *cursor = new_cursor;
                }
                Ok(())
            }
            _ => Err(self.invalid(&format!("cursor {}", new_cursor))),
        }
    }

    /// Marks the whole pipeline as done
    pub fn complete(&mut self) -> Result<(), HarvestError> {
        if self.state == CheckpointState::Completed {
            return Err(self.invalid("completed"));
        }
        self.state = CheckpointState::Completed;
        Ok(())
    }

    /// Back to `NotStarted`, for a fresh run
    pub fn reset(&mut self) {
        self.state = CheckpointState::NotStarted;
    }

    /// Atomically writes the checkpoint
    pub fn save(&mut self) -> StorageResult<()> {
        let saved_at = Utc::now().to_rfc3339();
        let file = CheckpointFile {
            state: self.state.clone(),
            config: self.snapshot.clone(),
            saved_at: Some(saved_at.clone()),
        };
        write_json_atomic(&self.path, &file)?;
        self.saved_at = Some(saved_at);
        Ok(())
    }

    fn invalid(&self, to: &str) -> HarvestError {
        HarvestError::InvalidTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }
}

/// Low-watermark over the completed item indices of one stage
///
/// `position()` is the smallest index not yet completed, given that every
/// index below the starting point is already done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageCursor {
    next: usize,
    done_ahead: BTreeSet<usize>,
}

impl StageCursor {
    pub fn starting_at(position: usize) -> Self {
        Self {
            next: position,
            done_ahead: BTreeSet::new(),
        }
    }

    pub fn position(&self) -> usize {
        self.next
    }

    /// Records `index` as committed; returns true if the watermark moved
    pub fn complete(&mut self, index: usize) -> bool {
        if index < self.next {
            return false;
        }
        self.done_ahead.insert(index);

        let before = self.next;
        while self.done_ahead.remove(&self.next) {
            self.next += 1;
        }
        self.next != before
    }

    /// Indices completed past a gap
    pub fn pending(&self) -> usize {
        self.done_ahead.len()
    }
}
