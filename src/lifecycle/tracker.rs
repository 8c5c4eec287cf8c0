//! Applies backend task updates to a workflow.
//!
//! Updates arrive at least once and possibly out of order, so every apply is
//! idempotent: duplicate event ids are dropped, reports for superseded retry
//! ids are ignored, and a terminal record never changes again.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info};

use super::cascade::cascade_upstream_failure;
use super::model::{LifecycleError, RetryRecord, Workflow};
use super::recovery::{
    ExitActions, Recovery, RetryPolicy, group_exit_plan, reschedule, restart,
};
use super::rollup::{group_status, workflow_status};
use super::status::{TaskGroupStatus, WorkflowStatus};
use crate::messages::TaskUpdate;

/// Result of applying one update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The event id was already applied.
    Duplicate,
    /// The update refers to a retry id that is not the current record.
    Stale,
    /// The record already resolved, or the update would move it backwards.
    Ignored,
}

pub struct WorkflowTracker {
    workflow: Workflow,
    policy: RetryPolicy,
    default_actions: ExitActions,
    exit_actions: HashMap<String, ExitActions>,
    applied: HashSet<String>,
    retry_records: Vec<RetryRecord>,
}

impl WorkflowTracker {
    pub fn new(workflow: Workflow, policy: RetryPolicy) -> Self {
        Self {
            workflow,
            policy,
            default_actions: ExitActions::new(),
            exit_actions: HashMap::new(),
            applied: HashSet::new(),
            retry_records: Vec::new(),
        }
    }

    pub fn with_exit_actions(mut self, task_name: impl Into<String>, actions: ExitActions) -> Self {
        self.exit_actions.insert(task_name.into(), actions);
        self
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn status(&self) -> WorkflowStatus {
        workflow_status(&self.workflow)
    }

    pub fn group_status(&self, group: &str) -> Option<TaskGroupStatus> {
        self.workflow.group(group).map(group_status)
    }

    /// Current status of a task's latest record.
    pub fn task_status(&self, task_name: &str) -> Option<TaskGroupStatus> {
        self.workflow
            .group_of_task(task_name)
            .and_then(|group| group.latest_task(task_name))
            .map(|task| task.status)
    }

    pub fn retry_records(&self) -> &[RetryRecord] {
        &self.retry_records
    }

    /// Groups whose upstream groups all completed and that have not started.
    pub fn ready_groups(&self) -> Vec<&str> {
        self.workflow
            .groups
            .iter()
            .filter(|group| {
                matches!(
                    group_status(group),
                    TaskGroupStatus::Submitting | TaskGroupStatus::Waiting
                )
            })
            .filter(|group| {
                group.upstream.iter().all(|upstream| {
                    self.workflow
                        .group(upstream)
                        .is_some_and(|up| group_status(up) == TaskGroupStatus::Completed)
                })
            })
            .map(|group| group.name.as_str())
            .collect()
    }

    /// Apply one task update identified by `event_id`.
    pub fn apply(
        &mut self,
        event_id: &str,
        update: &TaskUpdate,
    ) -> Result<ApplyOutcome, LifecycleError> {
        if self.applied.contains(event_id) {
            return Ok(ApplyOutcome::Duplicate);
        }
        // A finished workflow never changes, so its event ids need no memory.
        if self.status().is_terminal() {
            return Ok(ApplyOutcome::Ignored);
        }
        let outcome = self.apply_update(update)?;
        if self.status().is_terminal() {
            self.applied = HashSet::new();
        } else {
            self.applied.insert(event_id.to_string());
        }
        Ok(outcome)
    }

    /// Number of event ids remembered for duplicate detection.
    pub fn remembered_events(&self) -> usize {
        self.applied.len()
    }

    fn apply_update(&mut self, update: &TaskUpdate) -> Result<ApplyOutcome, LifecycleError> {
        if self.workflow.override_status.is_some() {
            return Ok(ApplyOutcome::Ignored);
        }
        let group_name = self
            .workflow
            .group_of_task(&update.task_name)
            .map(|group| group.name.clone())
            .ok_or_else(|| LifecycleError::UnknownTask(update.task_name.clone()))?;
        let actions = self
            .exit_actions
            .get(&update.task_name)
            .unwrap_or(&self.default_actions)
            .clone();
        let policy = self.policy;

        let group = self
            .workflow
            .group_mut(&group_name)
            .ok_or_else(|| LifecycleError::UnknownGroup(group_name.clone()))?;
        let task = group
            .latest_task_mut(&update.task_name)
            .ok_or_else(|| LifecycleError::UnknownTask(update.task_name.clone()))?;

        if update.retry_id != task.retry_id {
            debug!(
                task = %update.task_name,
                reported = update.retry_id,
                current = task.retry_id,
                "ignoring update for superseded attempt"
            );
            return Ok(ApplyOutcome::Stale);
        }
        if !advances(task.status, update.status) {
            return Ok(ApplyOutcome::Ignored);
        }

        let mut rescheduled = None;
        if update.status.is_failed() {
            task.exit_code = update.exit_code;
            match policy.decide_recovery(task, update.status, &actions) {
                Recovery::Complete => task.set_status(TaskGroupStatus::Completed),
                Recovery::Restart => restart(task),
                Recovery::Reschedule => {
                    let reason = update
                        .message
                        .clone()
                        .unwrap_or_else(|| update.status.as_str().to_string());
                    rescheduled = Some(reschedule(task, reason));
                }
                Recovery::Fail(status) => task.set_status(status),
            }
        } else {
            if update.exit_code.is_some() {
                task.exit_code = update.exit_code;
            }
            task.set_status(update.status);
        }

        if let Some((next, record)) = rescheduled {
            info!(
                task = %record.task_name,
                retry_id = record.retry_id,
                reason = %record.reason,
                "task rescheduled"
            );
            group.tasks.push(next);
            self.retry_records.push(record);
        }

        self.settle_group(&group_name, &update.task_name)?;
        self.stamp_times();
        Ok(ApplyOutcome::Applied)
    }

    // Sibling cancellation/restart, then downstream cascade if the group failed.
    fn settle_group(&mut self, group_name: &str, changed_task: &str) -> Result<(), LifecycleError> {
        let group = self
            .workflow
            .group_mut(group_name)
            .ok_or_else(|| LifecycleError::UnknownGroup(group_name.to_string()))?;

        let plan = group_exit_plan(group, changed_task);
        for sibling in &plan.cancel {
            if let Some(task) = group.latest_task_mut(sibling) {
                task.set_status(TaskGroupStatus::FailedCanceled);
            }
        }
        for sibling in &plan.restart {
            if let Some(task) = group.latest_task_mut(sibling) {
                restart(task);
            }
        }
        if !plan.is_empty() {
            debug!(
                group = %group_name,
                cancel = ?plan.cancel,
                restart = ?plan.restart,
                "settled group siblings"
            );
        }

        if group_status(group).is_failed() {
            let failed = cascade_upstream_failure(&mut self.workflow, group_name)?;
            if !failed.is_empty() {
                info!(group = %group_name, downstream = ?failed, "cascaded upstream failure");
            }
        }
        Ok(())
    }

    fn stamp_times(&mut self) {
        let status = workflow_status(&self.workflow);
        let now = Utc::now();
        if self.workflow.started_at.is_none() && status != WorkflowStatus::Pending {
            self.workflow.started_at = Some(now);
        }
        if self.workflow.finished_at.is_none() && status.is_terminal() {
            self.workflow.finished_at = Some(now);
        }
    }

    /// Cancel the workflow: every unresolved task record becomes
    /// `FAILED_CANCELED` and the workflow status is pinned.
    pub fn cancel(&mut self) {
        if workflow_status(&self.workflow).is_terminal() {
            return;
        }
        for group in &mut self.workflow.groups {
            let names: Vec<String> = group.task_names().into_iter().map(str::to_string).collect();
            for name in names {
                if let Some(task) = group.latest_task_mut(&name)
                    && !task.status.is_terminal()
                {
                    task.set_status(TaskGroupStatus::FailedCanceled);
                }
            }
        }
        self.workflow.override_status = Some(WorkflowStatus::FailedCanceled);
        self.workflow.finished_at = Some(Utc::now());
        self.applied = HashSet::new();
    }
}

// Terminal records are final; pre-run phases only move forward.
fn advances(current: TaskGroupStatus, next: TaskGroupStatus) -> bool {
    if current.is_terminal() {
        return false;
    }
    if next.is_terminal() {
        return true;
    }
    match (current.pre_run_rank(), next.pre_run_rank()) {
        (Some(current), Some(next)) => next > current,
        (Some(_), None) => true,
        (None, _) => false,
    }
}
