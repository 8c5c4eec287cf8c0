//! Pure status rollups: Task -> Group -> Workflow.
//!
//! These functions never mutate; callers pass the current snapshot and
//! store nothing derived.

use super::model::{Group, Task, Workflow};
use super::status::{TaskGroupStatus, WorkflowStatus};

/// Derive a group's status from its members' current records.
pub fn group_status(group: &Group) -> TaskGroupStatus {
    let tasks = group.latest_tasks();

    if group.ignore_nonlead_status {
        if let Some(lead) = group.lead_task()
            && lead.status.is_terminal()
            && lead.status != TaskGroupStatus::Rescheduled
        {
            return lead.status;
        }
    } else {
        if let Some(failed) = tasks.iter().find(|task| task.status.is_failed()) {
            return failed.status;
        }
        if !tasks.is_empty()
            && tasks
                .iter()
                .all(|task| task.status == TaskGroupStatus::Completed)
        {
            return TaskGroupStatus::Completed;
        }
        // A member coming back from a reschedule keeps a multi-task group
        // running until its new record runs or fails.
        if tasks.len() > 1 && tasks.iter().any(|task| rejoining_after_reschedule(task)) {
            return TaskGroupStatus::Running;
        }
    }

    in_flight_status(tasks.iter().map(|task| task.status))
}

fn rejoining_after_reschedule(task: &Task) -> bool {
    task.status == TaskGroupStatus::Rescheduled
        || (task.retry_id > 0 && task.status.pre_run_rank().is_some())
}

// Non-terminal rollup: running wins, otherwise the least advanced pre-run
// phase. Members that already finished do not hold the group back.
fn in_flight_status(statuses: impl Iterator<Item = TaskGroupStatus>) -> TaskGroupStatus {
    let mut least_advanced: Option<(u8, TaskGroupStatus)> = None;
    let mut any_finished = false;
    for status in statuses {
        if status == TaskGroupStatus::Running {
            return TaskGroupStatus::Running;
        }
        match status.pre_run_rank() {
            Some(rank) => {
                let normalized = if status == TaskGroupStatus::Rescheduled {
                    TaskGroupStatus::Scheduling
                } else {
                    status
                };
                if least_advanced.is_none_or(|(current, _)| rank < current) {
                    least_advanced = Some((rank, normalized));
                }
            }
            None => any_finished = true,
        }
    }
    match least_advanced {
        Some((_, status)) => status,
        // Only reachable when every member finished but the group has not
        // resolved (e.g. non-lead completions while the lead record is being
        // replaced); it is still making progress.
        None if any_finished => TaskGroupStatus::Running,
        None => TaskGroupStatus::Submitting,
    }
}

/// True once any group has moved past scheduling or any task was retried.
pub fn workflow_started(workflow: &Workflow) -> bool {
    workflow.groups.iter().any(|group| {
        group.tasks.iter().any(|task| {
            task.retry_id > 0
                || matches!(
                    task.status,
                    TaskGroupStatus::Initializing | TaskGroupStatus::Running
                )
                || (task.status.is_terminal() && task.status != TaskGroupStatus::FailedUpstream)
        })
    })
}

/// Derive the workflow status from its groups.
pub fn workflow_status(workflow: &Workflow) -> WorkflowStatus {
    if let Some(status) = workflow.override_status {
        return status;
    }

    let statuses: Vec<TaskGroupStatus> = workflow.groups.iter().map(group_status).collect();
    let resolved = |status: &TaskGroupStatus| {
        status.is_terminal() && *status != TaskGroupStatus::Rescheduled
    };

    if !statuses.is_empty() && statuses.iter().all(resolved) {
        if statuses
            .iter()
            .all(|status| *status == TaskGroupStatus::Completed)
        {
            return WorkflowStatus::Completed;
        }
        // Upstream failures are consequences; report the first root cause.
        let root_cause = statuses
            .iter()
            .find(|status| status.is_failed() && **status != TaskGroupStatus::FailedUpstream)
            .or_else(|| statuses.iter().find(|status| status.is_failed()))
            .copied()
            .unwrap_or(TaskGroupStatus::Failed);
        return WorkflowStatus::from_group_failure(root_cause);
    }

    if statuses
        .iter()
        .any(|status| *status == TaskGroupStatus::Running)
    {
        return WorkflowStatus::Running;
    }
    if workflow_started(workflow) {
        WorkflowStatus::Waiting
    } else {
        WorkflowStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::model::Task;

    fn task(name: &str, status: TaskGroupStatus) -> Task {
        Task::new(name).with_status(status)
    }

    fn retry_record(name: &str, status: TaskGroupStatus) -> Task {
        let mut record = task(name, status);
        record.retry_id = 1;
        record
    }

    fn group_of(lead: &str, tasks: Vec<Task>) -> Group {
        Group::new("g", lead, tasks).expect("group")
    }

    #[test]
    fn lead_terminal_status_decides_group_when_ignoring_nonlead() {
        for lead_status in [
            TaskGroupStatus::Completed,
            TaskGroupStatus::Failed,
            TaskGroupStatus::FailedImagePull,
            TaskGroupStatus::FailedEvicted,
        ] {
            for sibling_status in [
                TaskGroupStatus::Running,
                TaskGroupStatus::Failed,
                TaskGroupStatus::Completed,
                TaskGroupStatus::Scheduling,
            ] {
                let group = group_of(
                    "a",
                    vec![task("a", lead_status), task("b", sibling_status)],
                );
                assert_eq!(group_status(&group), lead_status);
            }
        }
    }

    #[test]
    fn sibling_failure_does_not_fail_group_while_lead_runs() {
        let group = group_of(
            "a",
            vec![
                task("a", TaskGroupStatus::Running),
                task("b", TaskGroupStatus::Failed),
            ],
        );
        assert_eq!(group_status(&group), TaskGroupStatus::Running);
    }

    #[test]
    fn any_member_failure_fails_group_when_tracking_all() {
        let group = group_of(
            "a",
            vec![
                task("a", TaskGroupStatus::Running),
                task("b", TaskGroupStatus::Failed),
            ],
        )
        .with_ignore_nonlead_status(false);
        assert_eq!(group_status(&group), TaskGroupStatus::Failed);
    }

    #[test]
    fn group_completes_only_when_all_members_complete() {
        let partial = group_of(
            "a",
            vec![
                task("a", TaskGroupStatus::Completed),
                task("b", TaskGroupStatus::Running),
            ],
        )
        .with_ignore_nonlead_status(false);
        assert_eq!(group_status(&partial), TaskGroupStatus::Running);

        let done = group_of(
            "a",
            vec![
                task("a", TaskGroupStatus::Completed),
                task("b", TaskGroupStatus::Completed),
            ],
        )
        .with_ignore_nonlead_status(false);
        assert_eq!(group_status(&done), TaskGroupStatus::Completed);
    }

    #[test]
    fn sibling_reschedule_keeps_group_running_when_tracking_all() {
        let group = group_of(
            "a",
            vec![
                task("a", TaskGroupStatus::Running),
                task("b", TaskGroupStatus::Rescheduled),
            ],
        )
        .with_ignore_nonlead_status(false);
        assert_eq!(group_status(&group), TaskGroupStatus::Running);
    }

    #[test]
    fn reschedule_after_siblings_completed_keeps_group_running() {
        let mut group = group_of(
            "a",
            vec![
                task("a", TaskGroupStatus::Rescheduled),
                task("b", TaskGroupStatus::Completed),
            ],
        )
        .with_ignore_nonlead_status(false);
        group.tasks.push(retry_record("a", TaskGroupStatus::Scheduling));
        assert_eq!(group_status(&group), TaskGroupStatus::Running);

        group.tasks[2].status = TaskGroupStatus::Initializing;
        assert_eq!(group_status(&group), TaskGroupStatus::Running);

        group.tasks[2].status = TaskGroupStatus::Completed;
        assert_eq!(group_status(&group), TaskGroupStatus::Completed);
    }

    #[test]
    fn lone_task_reschedule_reports_scheduling() {
        let mut group = group_of("a", vec![task("a", TaskGroupStatus::Rescheduled)])
            .with_ignore_nonlead_status(false);
        group.tasks.push(retry_record("a", TaskGroupStatus::Scheduling));
        assert_eq!(group_status(&group), TaskGroupStatus::Scheduling);
    }

    #[test]
    fn pre_run_group_reports_least_advanced_member() {
        let group = group_of(
            "a",
            vec![
                task("a", TaskGroupStatus::Initializing),
                task("b", TaskGroupStatus::Scheduling),
            ],
        );
        assert_eq!(group_status(&group), TaskGroupStatus::Scheduling);
    }

    #[test]
    fn workflow_pending_before_anything_starts() {
        let workflow = Workflow::new(
            "wf",
            "wf",
            vec![group_of("a", vec![task("a", TaskGroupStatus::Submitting)])],
        )
        .expect("workflow");
        assert_eq!(workflow_status(&workflow), WorkflowStatus::Pending);
    }

    #[test]
    fn workflow_waiting_when_started_and_nothing_running() {
        let first = Group::new("first", "a", vec![task("a", TaskGroupStatus::Completed)])
            .expect("group");
        let second = Group::new("second", "b", vec![task("b", TaskGroupStatus::Waiting)])
            .expect("group")
            .with_upstream(vec!["first".to_string()]);
        let workflow = Workflow::new("wf", "wf", vec![first, second]).expect("workflow");
        assert_eq!(workflow_status(&workflow), WorkflowStatus::Waiting);
    }

    #[test]
    fn workflow_running_with_any_running_group() {
        let first = Group::new("first", "a", vec![task("a", TaskGroupStatus::Running)])
            .expect("group");
        let second = Group::new("second", "b", vec![task("b", TaskGroupStatus::Scheduling)])
            .expect("group");
        let workflow = Workflow::new("wf", "wf", vec![first, second]).expect("workflow");
        assert_eq!(workflow_status(&workflow), WorkflowStatus::Running);
    }

    #[test]
    fn workflow_failure_reports_root_cause_not_upstream() {
        let first = Group::new(
            "first",
            "a",
            vec![task("a", TaskGroupStatus::FailedExecTimeout)],
        )
        .expect("group");
        let second = Group::new("second", "b", vec![task("b", TaskGroupStatus::FailedUpstream)])
            .expect("group")
            .with_upstream(vec!["first".to_string()]);
        let workflow = Workflow::new("wf", "wf", vec![second.clone(), first]).expect("workflow");
        assert_eq!(workflow_status(&workflow), WorkflowStatus::FailedExecTimeout);
    }

    #[test]
    fn workflow_completed_only_when_all_groups_complete() {
        let first = Group::new("first", "a", vec![task("a", TaskGroupStatus::Completed)])
            .expect("group");
        let second = Group::new("second", "b", vec![task("b", TaskGroupStatus::Completed)])
            .expect("group");
        let workflow = Workflow::new("wf", "wf", vec![first, second]).expect("workflow");
        assert_eq!(workflow_status(&workflow), WorkflowStatus::Completed);
    }

    #[test]
    fn override_status_wins() {
        let mut workflow = Workflow::new(
            "wf",
            "wf",
            vec![group_of("a", vec![task("a", TaskGroupStatus::Running)])],
        )
        .expect("workflow");
        workflow.override_status = Some(WorkflowStatus::FailedCanceled);
        assert_eq!(workflow_status(&workflow), WorkflowStatus::FailedCanceled);
    }
}
