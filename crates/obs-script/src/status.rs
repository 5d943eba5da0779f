//! Step results of the interpreter

use obs_core::Command;
use serde::{Deserialize, Serialize};

/// What the caller should do after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Element produced nothing; advance to the next one. Never leaves a script.
    Next,
    /// The script is exhausted
    EndScript,
    /// The target must be stopped and not retried
    StopTarget,
    /// A command was issued and the element is done with it
    Complete,
    /// Stay on the current element
    Keep,
    /// Wait for the telescope before polling again
    Waiting,
    /// The telescope must be re-pointed at the target
    Resync,
    /// Wait until every connection reached the same point
    CheckWait,
    PrecisionFailed,
    PrecisionOk,
    /// Wait until another connection finished acquiring
    WaitAcquisition,
    /// An acquisition exposure was issued
    AcquisitionImage,
    WaitSignal,
    WaitMirror,
    WaitSearch,
}

impl Status {
    /// Statuses that move the cursor past the element that returned them
    pub fn advances(self) -> bool {
        matches!(
            self,
            Status::Complete
                | Status::CheckWait
                | Status::PrecisionFailed
                | Status::PrecisionOk
                | Status::WaitAcquisition
        )
    }

    /// End of the script, normal or not
    pub fn is_end(self) -> bool {
        matches!(self, Status::EndScript | Status::StopTarget)
    }

    /// Numeric code as reported to devices and logs
    pub fn code(self) -> i32 {
        match self {
            Status::StopTarget => -3,
            Status::Next => -2,
            Status::EndScript => -1,
            Status::Complete => 0,
            Status::Keep => 1,
            Status::Waiting => 2,
            Status::Resync => 3,
            Status::CheckWait => 4,
            Status::PrecisionFailed => 5,
            Status::PrecisionOk => 6,
            Status::WaitAcquisition => 7,
            Status::AcquisitionImage => 8,
            Status::WaitSignal => 9,
            Status::WaitMirror => 10,
            Status::WaitSearch => 11,
        }
    }
}

/// Result of one interpreter step
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub status: Status,
    pub command: Option<Command>,
}

/// Result of one element step
///
/// A held reply comes from inside a block that has not finished; its
/// parent must not advance past the block.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: Status,
    pub command: Option<Command>,
    pub held: bool,
}

impl Reply {
    pub fn next() -> Self {
        Self::status(Status::Next)
    }

    pub fn status(status: Status) -> Self {
        Self {
            status,
            command: None,
            held: false,
        }
    }

    pub fn command(status: Status, command: Command) -> Self {
        Self {
            status,
            command: Some(command),
            held: false,
        }
    }

    pub fn hold(mut self) -> Self {
        self.held = true;
        self
    }

    pub fn is_next(&self) -> bool {
        self.status == Status::Next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advancing_statuses() {
        assert!(Status::Complete.advances());
        assert!(Status::WaitAcquisition.advances());
        assert!(!Status::Keep.advances());
        assert!(!Status::Resync.advances());
        assert!(!Status::Next.advances());
    }

    #[test]
    fn test_codes() {
        assert_eq!(Status::EndScript.code(), -1);
        assert_eq!(Status::Complete.code(), 0);
        assert_eq!(Status::WaitSearch.code(), 11);
    }
}
