use serde::{Deserialize, Serialize};

/// Lifecycle state of a tunneled request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    RequestStarted,
    RequestCompleted,
    ResponseStarted,
    Completed,
    Failed,
    Timeout,
}

impl Status {
    /// Terminal states never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Timeout)
    }
}
