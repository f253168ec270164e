use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Processing phase every domain status is classified into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPhase {
    /// Waiting to be claimed once due
    Pending,
    /// Held by exactly one worker while work is in flight
    Processing,
    /// Finished successfully, never claimed again
    Completed,
    /// Finished unsuccessfully, never claimed again
    Failed,
}

impl ProcessingPhase {
    /// Check if this is a terminal phase (no further claims allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid processing phase: {s}")),
        }
    }
}

/// A concrete domain status: a stable code tagged with its processing phase.
///
/// Statuses are immutable and cheap to clone. Two statuses are equal when their
/// codes are equal; a [`StatusModel`](super::StatusModel) guarantees that a code
/// is only ever paired with one phase.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "StatusRepr", from = "StatusRepr")]
pub struct Status {
    code: Arc<str>,
    phase: ProcessingPhase,
}

impl Status {
    pub fn new(code: impl AsRef<str>, phase: ProcessingPhase) -> Self {
        Self {
            code: Arc::from(code.as_ref()),
            phase,
        }
    }

    pub fn pending(code: impl AsRef<str>) -> Self {
        Self::new(code, ProcessingPhase::Pending)
    }

    pub fn processing(code: impl AsRef<str>) -> Self {
        Self::new(code, ProcessingPhase::Processing)
    }

    pub fn completed(code: impl AsRef<str>) -> Self {
        Self::new(code, ProcessingPhase::Completed)
    }

    pub fn failed(code: impl AsRef<str>) -> Self {
        Self::new(code, ProcessingPhase::Failed)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn phase(&self) -> ProcessingPhase {
        self.phase
    }

    pub fn is_pending(&self) -> bool {
        self.phase == ProcessingPhase::Pending
    }

    pub fn is_processing(&self) -> bool {
        self.phase == ProcessingPhase::Processing
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for Status {}

impl Hash for Status {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.code.hash(state);
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.code, self.phase)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

#[derive(Serialize, Deserialize)]
struct StatusRepr {
    code: String,
    phase: ProcessingPhase,
}

impl From<Status> for StatusRepr {
    fn from(status: Status) -> Self {
        Self {
            code: status.code.to_string(),
            phase: status.phase,
        }
    }
}

impl From<StatusRepr> for Status {
    fn from(repr: StatusRepr) -> Self {
        Status::new(repr.code, repr.phase)
    }
}
