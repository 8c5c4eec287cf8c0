//! Reschedule vs. restart.
//!
//! A reschedule replaces the task record with a fresh attempt (`retry_id + 1`,
//! inputs fetched again, any eligible node). A restart re-runs the command in
//! the same pod and record, keeping staged inputs and intermediate files.

use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::Utc;

use super::model::{Group, LifecycleError, RetryRecord, Task};
use super::status::TaskGroupStatus;

/// Ceiling on reschedules per task. Has no `Default`; deployments set it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide how to recover a task record that just ended with `failure`.
    ///
    /// The task's `exit_code` must already be recorded; it is consulted
    /// through `actions` for plain user failures.
    pub fn decide_recovery(
        &self,
        task: &Task,
        failure: TaskGroupStatus,
        actions: &ExitActions,
    ) -> Recovery {
        let wants_reschedule = match failure {
            TaskGroupStatus::Failed => match task.exit_code.map(|code| actions.action_for(code)) {
                Some(ExitAction::Complete) => return Recovery::Complete,
                Some(ExitAction::Restart) => return Recovery::Restart,
                Some(ExitAction::Reschedule) => true,
                Some(ExitAction::Fail) | None => false,
            },
            status => is_infrastructure_failure(status),
        };

        if wants_reschedule && task.retry_id < self.max_retries {
            Recovery::Reschedule
        } else {
            Recovery::Fail(failure)
        }
    }
}

// Failures caused by the platform rather than the user command, which a
// fresh attempt on another node may not hit again.
fn is_infrastructure_failure(status: TaskGroupStatus) -> bool {
    matches!(
        status,
        TaskGroupStatus::FailedBackendError
            | TaskGroupStatus::FailedServerError
            | TaskGroupStatus::FailedEvicted
            | TaskGroupStatus::FailedPreempted
            | TaskGroupStatus::FailedStartError
            | TaskGroupStatus::FailedStartTimeout
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    Complete,
    Restart,
    Reschedule,
    Fail(TaskGroupStatus),
}

/// End the current record as `RESCHEDULED` and build its replacement.
pub fn reschedule(task: &mut Task, reason: impl Into<String>) -> (Task, RetryRecord) {
    task.set_status(TaskGroupStatus::Rescheduled);

    let now = Utc::now();
    let next = Task {
        retry_id: task.retry_id + 1,
        status: TaskGroupStatus::Scheduling,
        exit_code: None,
        restart_count: 0,
        inputs_staged: false,
        created_at: now,
        updated_at: now,
        ..task.clone()
    };
    let record = RetryRecord {
        task_name: next.name.clone(),
        retry_id: next.retry_id,
        reason: reason.into(),
        timestamp: now,
    };
    (next, record)
}

/// Re-run the command in place. Identity and staged inputs are kept.
pub fn restart(task: &mut Task) {
    task.restart_count += 1;
    task.exit_code = None;
    task.set_status(TaskGroupStatus::Running);
}

/// What a task's exit code asks the platform to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitAction {
    Complete,
    Fail,
    Reschedule,
    Restart,
}

impl ExitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::Fail => "FAIL",
            Self::Reschedule => "RESCHEDULE",
            Self::Restart => "RESTART",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COMPLETE" => Some(Self::Complete),
            "FAIL" => Some(Self::Fail),
            "RESCHEDULE" => Some(Self::Reschedule),
            "RESTART" => Some(Self::Restart),
            _ => None,
        }
    }
}

/// Exit code ranges mapped to actions, e.g. `RESCHEDULE=10-20,RESTART=3`.
///
/// The first matching entry wins. Codes without an entry complete on 0 and
/// fail otherwise.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExitActions {
    entries: Vec<(ExitAction, RangeInclusive<i32>)>,
}

impl ExitActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, action: ExitAction, codes: RangeInclusive<i32>) -> Self {
        self.entries.push((action, codes));
        self
    }

    pub fn action_for(&self, exit_code: i32) -> ExitAction {
        self.entries
            .iter()
            .find(|(_, codes)| codes.contains(&exit_code))
            .map(|(action, _)| *action)
            .unwrap_or(if exit_code == 0 {
                ExitAction::Complete
            } else {
                ExitAction::Fail
            })
    }
}

impl FromStr for ExitActions {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LifecycleError::InvalidExitActions(s.to_string());
        let mut actions = ExitActions::new();
        for entry in s.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (action, codes) = entry.split_once('=').ok_or_else(invalid)?;
            let action = ExitAction::parse(action).ok_or_else(invalid)?;
            let codes = codes.trim();
            let range = match codes.split_once('-') {
                Some((start, end)) => {
                    let start: i32 = start.trim().parse().map_err(|_| invalid())?;
                    let end: i32 = end.trim().parse().map_err(|_| invalid())?;
                    if start > end {
                        return Err(invalid());
                    }
                    start..=end
                }
                None => {
                    let code: i32 = codes.parse().map_err(|_| invalid())?;
                    code..=code
                }
            };
            actions.entries.push((action, range));
        }
        Ok(actions)
    }
}

/// Follow-up work on a group after one of its tasks changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupExitPlan {
    /// Siblings to cancel because the lead already decided the group.
    pub cancel: Vec<String>,
    /// Siblings to restart in place because `changed_task` was rescheduled.
    pub restart: Vec<String>,
}

impl GroupExitPlan {
    pub fn is_empty(&self) -> bool {
        self.cancel.is_empty() && self.restart.is_empty()
    }
}

/// Plan sibling handling after `changed_task`'s current record was updated.
pub fn group_exit_plan(group: &Group, changed_task: &str) -> GroupExitPlan {
    let mut plan = GroupExitPlan::default();
    let Some(changed) = group.latest_task(changed_task) else {
        return plan;
    };
    let active_siblings = || {
        group
            .latest_tasks()
            .into_iter()
            .filter(move |task| task.name != changed_task && !task.status.is_terminal())
            .map(|task| task.name.clone())
    };

    if group.ignore_nonlead_status {
        let lead_finished = changed.name == group.lead
            && changed.status.is_terminal()
            && changed.status != TaskGroupStatus::Rescheduled;
        if lead_finished {
            plan.cancel = active_siblings().collect();
        }
    } else if changed.retry_id > 0 && changed.status == TaskGroupStatus::Scheduling {
        plan.restart = active_siblings().collect();
    }
    plan
}
