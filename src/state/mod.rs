//! Persistent run state
//!
//! # Components
//!
//! - `Checkpoint`: the stage/cursor marker a resumed run starts from
//! - `VisitedLedger`: per-URL-class record of processed URLs and their outcome

mod checkpoint;
mod ledger;

pub use checkpoint::{Checkpoint, CheckpointState, RunSnapshot, StageCursor, CHECKPOINT_FILE};
pub use ledger::{FlushPolicy, VisitedEntry, VisitedLedger, VisitedOutcome};
