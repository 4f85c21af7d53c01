use serde::Serialize;

use crate::CoreError;

/// Lifecycle of one extraction job.
///
/// ```text
/// Submitted -> Partitioning -> Executing -> Assembling -> Complete
///                                                      -> PartiallyComplete
///                                                      -> Failed
/// ```
///
/// Any non-terminal state may also go straight to `Failed` (for example when
/// the payload is rejected before partitioning).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Partitioning,
    Executing,
    Assembling,
    Complete,
    PartiallyComplete,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Complete | JobState::PartiallyComplete | JobState::Failed
        )
    }

    pub fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Submitted, Partitioning)
                | (Partitioning, Executing)
                | (Executing, Assembling)
                | (Assembling, Complete | PartiallyComplete | Failed)
                | (Submitted | Partitioning | Executing, Failed)
        )
    }

    /// Move to `next`, or report why that isn't allowed.
    pub fn advance(&mut self, next: JobState) -> Result<(), CoreError> {
        if !self.can_advance_to(next) {
            return Err(CoreError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}
