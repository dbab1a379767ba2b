use std::sync::Arc;
use tracing::debug;
use crate::error::{WireError, WireResult};
use crate::util::merge_cell::{Absorb, MergeCell};

/// Only the first few errors are kept - later ones are typically consequences of the first
const MAX_RECORDED_ERRORS: usize = 16;

#[derive(Debug, Default)]
struct RecordedErrors {
    errors: Vec<WireError>,
}

impl Absorb for RecordedErrors {
    fn absorb(&mut self, other: Self) {
        for e in other.errors {
            if self.errors.len() >= MAX_RECORDED_ERRORS {
                break;
            }
            self.errors.push(e);
        }
    }
}

/// The errors recorded for a pipe (and for all pipes it was merged with). The first recorded
///  error is the 'diagnosis' that all later disconnect checks report.
#[derive(Clone, Debug)]
pub struct ExceptionQueue {
    cell: Arc<MergeCell<RecordedErrors>>,
}

impl Default for ExceptionQueue {
    fn default() -> Self {
        ExceptionQueue::new()
    }
}

impl ExceptionQueue {
    pub fn new() -> ExceptionQueue {
        ExceptionQueue {
            cell: MergeCell::new(RecordedErrors::default()),
        }
    }

    /// Record an error. `Disconnected` itself carries no information and is not recorded.
    pub fn raise(&self, error: WireError) {
        if error.is_disconnected() {
            return;
        }
        debug!(?error, "recording error");
        self.cell.with(|r| {
            if r.errors.len() < MAX_RECORDED_ERRORS {
                r.errors.push(error);
            }
        });
    }

    pub fn first(&self) -> Option<WireError> {
        self.cell.with(|r| r.errors.first().cloned())
    }

    pub fn all(&self) -> Vec<WireError> {
        self.cell.with(|r| r.errors.clone())
    }

    /// The error to report for an operation that failed because of a disconnect
    pub fn disconnect_error(&self) -> WireError {
        self.first().unwrap_or(WireError::Disconnected)
    }

    /// `Ok` while `disconnected` is false, otherwise the first recorded error (or a plain
    ///  `Disconnected` if there is none)
    pub fn check(&self, disconnected: bool) -> WireResult<()> {
        if disconnected {
            Err(self.disconnect_error())
        }
        else {
            Ok(())
        }
    }

    /// Merge `other` into this queue; afterwards both handles refer to the same errors
    pub fn encounter(&self, other: &ExceptionQueue) {
        self.cell.merge(&other.cell);
    }

    pub fn is_same(&self, other: &ExceptionQueue) -> bool {
        self.cell.is_same(&other.cell)
    }
}
