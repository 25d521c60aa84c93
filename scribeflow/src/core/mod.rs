//! Core domain model types for scribeflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Run state machine and stage dispositions
//! - Stage result type
//! - Progress events

mod event;
mod output;
mod status;

pub use event::{progress_channel, ProgressEvent, ProgressEventKind, ProgressReceiver, ProgressSender};
pub use output::StageResult;
pub use status::{RunState, StageDisposition};
