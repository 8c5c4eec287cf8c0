//! Canonical status enums for workflows, groups and tasks.

use serde::{Deserialize, Serialize};

/// Status shared by groups and tasks.
///
/// Groups only ever derive the group-level variants on their own; the
/// task-only variants (`Rescheduled`, `FailedImagePull`, `FailedBackendError`,
/// `FailedStartError`, `FailedStartTimeout`) reach a group solely by
/// propagation of a lead task's terminal status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskGroupStatus {
    Submitting,
    Waiting,
    Processing,
    Scheduling,
    Initializing,
    Running,
    Completed,
    Rescheduled,
    Failed,
    FailedUpstream,
    FailedServerError,
    FailedPreempted,
    FailedEvicted,
    FailedCanceled,
    FailedExecTimeout,
    FailedQueueTimeout,
    FailedImagePull,
    FailedBackendError,
    FailedStartError,
    FailedStartTimeout,
}

impl TaskGroupStatus {
    pub const ALL: [TaskGroupStatus; 20] = [
        Self::Submitting,
        Self::Waiting,
        Self::Processing,
        Self::Scheduling,
        Self::Initializing,
        Self::Running,
        Self::Completed,
        Self::Rescheduled,
        Self::Failed,
        Self::FailedUpstream,
        Self::FailedServerError,
        Self::FailedPreempted,
        Self::FailedEvicted,
        Self::FailedCanceled,
        Self::FailedExecTimeout,
        Self::FailedQueueTimeout,
        Self::FailedImagePull,
        Self::FailedBackendError,
        Self::FailedStartError,
        Self::FailedStartTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitting => "SUBMITTING",
            Self::Waiting => "WAITING",
            Self::Processing => "PROCESSING",
            Self::Scheduling => "SCHEDULING",
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Rescheduled => "RESCHEDULED",
            Self::Failed => "FAILED",
            Self::FailedUpstream => "FAILED_UPSTREAM",
            Self::FailedServerError => "FAILED_SERVER_ERROR",
            Self::FailedPreempted => "FAILED_PREEMPTED",
            Self::FailedEvicted => "FAILED_EVICTED",
            Self::FailedCanceled => "FAILED_CANCELED",
            Self::FailedExecTimeout => "FAILED_EXEC_TIMEOUT",
            Self::FailedQueueTimeout => "FAILED_QUEUE_TIMEOUT",
            Self::FailedImagePull => "FAILED_IMAGE_PULL",
            Self::FailedBackendError => "FAILED_BACKEND_ERROR",
            Self::FailedStartError => "FAILED_START_ERROR",
            Self::FailedStartTimeout => "FAILED_START_TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Rescheduled is terminal for the record but not for the task: a new
    /// record with the next retry id replaces it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rescheduled) || self.is_failed()
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::Failed
                | Self::FailedUpstream
                | Self::FailedServerError
                | Self::FailedPreempted
                | Self::FailedEvicted
                | Self::FailedCanceled
                | Self::FailedExecTimeout
                | Self::FailedQueueTimeout
                | Self::FailedImagePull
                | Self::FailedBackendError
                | Self::FailedStartError
                | Self::FailedStartTimeout
        )
    }

    /// Ordering of the pre-run phases, used when rolling up a group that has
    /// not started running yet. `None` for running/terminal statuses.
    pub(crate) fn pre_run_rank(&self) -> Option<u8> {
        match self {
            Self::Submitting => Some(0),
            Self::Waiting => Some(1),
            Self::Processing => Some(2),
            Self::Scheduling | Self::Rescheduled => Some(3),
            Self::Initializing => Some(4),
            _ => None,
        }
    }

    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            Self::Failed => Some(FailureCategory::User),
            Self::FailedCanceled | Self::FailedPreempted | Self::FailedEvicted => {
                Some(FailureCategory::Operator)
            }
            Self::FailedUpstream => Some(FailureCategory::Upstream),
            status if status.is_failed() => Some(FailureCategory::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskGroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible workflow status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    FailedExecTimeout,
    FailedQueueTimeout,
    FailedSubmission,
    FailedServerError,
    FailedCanceled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::FailedExecTimeout => "FAILED_EXEC_TIMEOUT",
            Self::FailedQueueTimeout => "FAILED_QUEUE_TIMEOUT",
            Self::FailedSubmission => "FAILED_SUBMISSION",
            Self::FailedServerError => "FAILED_SERVER_ERROR",
            Self::FailedCanceled => "FAILED_CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "WAITING" => Some(Self::Waiting),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "FAILED_EXEC_TIMEOUT" => Some(Self::FailedExecTimeout),
            "FAILED_QUEUE_TIMEOUT" => Some(Self::FailedQueueTimeout),
            "FAILED_SUBMISSION" => Some(Self::FailedSubmission),
            "FAILED_SERVER_ERROR" => Some(Self::FailedServerError),
            "FAILED_CANCELED" => Some(Self::FailedCanceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running | Self::Waiting)
    }

    pub fn is_failed(&self) -> bool {
        self.is_terminal() && *self != Self::Completed
    }

    /// Workflow failure variant for a group's root-cause failure.
    pub fn from_group_failure(status: TaskGroupStatus) -> Self {
        match status {
            TaskGroupStatus::FailedExecTimeout => Self::FailedExecTimeout,
            TaskGroupStatus::FailedQueueTimeout => Self::FailedQueueTimeout,
            TaskGroupStatus::FailedCanceled => Self::FailedCanceled,
            TaskGroupStatus::FailedServerError => Self::FailedServerError,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root-cause bucket of a task failure, so automation can branch on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The user command exited non-zero.
    User,
    /// Infrastructure: image pull, backend/node fault, start failures, timeouts.
    System,
    /// Cancel, preempt or evict.
    Operator,
    /// Never ran because an upstream group failed.
    Upstream,
}

/// Observed cause of a task attempt ending unsuccessfully.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCause {
    ExitCode(i32),
    ImagePull,
    BackendError,
    ServerError,
    StartError,
    StartTimeout,
    ExecTimeout,
    QueueTimeout,
    Canceled,
    Preempted,
    Evicted,
}

/// Map a failure cause to its distinct terminal status.
pub fn classify_failure(cause: FailureCause) -> TaskGroupStatus {
    match cause {
        FailureCause::ExitCode(_) => TaskGroupStatus::Failed,
        FailureCause::ImagePull => TaskGroupStatus::FailedImagePull,
        FailureCause::BackendError => TaskGroupStatus::FailedBackendError,
        FailureCause::ServerError => TaskGroupStatus::FailedServerError,
        FailureCause::StartError => TaskGroupStatus::FailedStartError,
        FailureCause::StartTimeout => TaskGroupStatus::FailedStartTimeout,
        FailureCause::ExecTimeout => TaskGroupStatus::FailedExecTimeout,
        FailureCause::QueueTimeout => TaskGroupStatus::FailedQueueTimeout,
        FailureCause::Canceled => TaskGroupStatus::FailedCanceled,
        FailureCause::Preempted => TaskGroupStatus::FailedPreempted,
        FailureCause::Evicted => TaskGroupStatus::FailedEvicted,
    }
}
