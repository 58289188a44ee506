use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of applying a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Current state is terminal or already equal to the target
    Ignored,
}

/// Lifecycle of a single task attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Submitted,
    Dispatch,
    Running,
    Success,
    Failure,
    Kill,
    Pause,
    NeedFaultTolerance,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Kill)
    }

    /// Waiting on a host or on its own execution.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Dispatch | Self::Running | Self::NeedFaultTolerance
        )
    }

    /// Handed to a worker (or the master) and possibly executing there.
    pub fn is_on_host(self) -> bool {
        matches!(self, Self::Dispatch | Self::Running)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Submitted => matches!(next, Dispatch | Failure | Kill | Pause | NeedFaultTolerance),
            Dispatch => matches!(
                next,
                Running | Success | Failure | Kill | Pause | NeedFaultTolerance
            ),
            Running => matches!(next, Success | Failure | Kill | Pause | NeedFaultTolerance),
            Pause => matches!(next, Submitted | Kill),
            NeedFaultTolerance => matches!(next, Submitted | Kill),
            Success | Failure | Kill => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submitted => "SUBMITTED",
            Self::Dispatch => "DISPATCH",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Kill => "KILL",
            Self::Pause => "PAUSE",
            Self::NeedFaultTolerance => "NEED_FAULT_TOLERANCE",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Submitted,
    Running,
    ReadyPause,
    Pause,
    ReadyStop,
    Stop,
    ReadyBlock,
    Block,
    Success,
    Failure,
    /// Owner master died; the instance is being rebuilt elsewhere
    NeedFaultTolerance,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Stop)
    }

    /// Statuses in which no runnable needs to stay alive. Paused and blocked
    /// instances are parked and brought back by a resume command.
    pub fn is_finished(self) -> bool {
        self.is_terminal() || matches!(self, Self::Pause | Self::Block)
    }

    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match self {
            Submitted => matches!(next, Running | ReadyStop | Stop | Failure | NeedFaultTolerance),
            Running => matches!(
                next,
                ReadyPause | ReadyStop | ReadyBlock | Stop | Success | Failure | NeedFaultTolerance
            ),
            ReadyPause => matches!(
                next,
                Running | Pause | ReadyStop | Stop | Success | Failure | NeedFaultTolerance
            ),
            ReadyStop => matches!(next, Stop | NeedFaultTolerance),
            ReadyBlock => matches!(
                next,
                Running | Block | ReadyPause | ReadyStop | Stop | Success | Failure | NeedFaultTolerance
            ),
            Pause | Block => matches!(next, Running | Stop),
            NeedFaultTolerance => matches!(
                next,
                Running | ReadyPause | ReadyStop | ReadyBlock | Stop | Failure
            ),
            Success | Failure | Stop => false,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::ReadyPause => "READY_PAUSE",
            Self::Pause => "PAUSE",
            Self::ReadyStop => "READY_STOP",
            Self::Stop => "STOP",
            Self::ReadyBlock => "READY_BLOCK",
            Self::Block => "BLOCK",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::NeedFaultTolerance => "NEED_FAULT_TOLERANCE",
        };
        f.write_str(name)
    }
}
