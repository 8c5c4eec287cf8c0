//! Transitive propagation of group failures to downstream dependents.

use std::collections::{HashSet, VecDeque};

use super::model::{LifecycleError, Workflow};
use super::rollup::group_status;
use super::status::TaskGroupStatus;

/// Mark every group reachable downstream of `failed_group` as
/// `FAILED_UPSTREAM`, along with all of their current task records.
///
/// Groups that already resolved keep their status. Returns the names of the
/// groups that were failed by this call, in traversal order.
pub fn cascade_upstream_failure(
    workflow: &mut Workflow,
    failed_group: &str,
) -> Result<Vec<String>, LifecycleError> {
    if workflow.group(failed_group).is_none() {
        return Err(LifecycleError::UnknownGroup(failed_group.to_string()));
    }

    let reachable: Vec<String> = {
        let edges = workflow.downstream_edges();
        let mut seen: HashSet<&str> = HashSet::from([failed_group]);
        let mut queue: VecDeque<&str> = VecDeque::from([failed_group]);
        let mut order = Vec::new();
        while let Some(current) = queue.pop_front() {
            for &child in edges.get(current).into_iter().flatten() {
                if seen.insert(child) {
                    order.push(child.to_string());
                    queue.push_back(child);
                }
            }
        }
        order
    };

    let mut failed = Vec::new();
    for name in reachable {
        let Some(group) = workflow.group_mut(&name) else {
            continue;
        };
        let current = group_status(group);
        if current.is_terminal() && current != TaskGroupStatus::Rescheduled {
            continue;
        }
        let names: Vec<String> = group.task_names().into_iter().map(str::to_string).collect();
        for task_name in names {
            if let Some(task) = group.latest_task_mut(&task_name)
                && !task.status.is_terminal()
            {
                task.set_status(TaskGroupStatus::FailedUpstream);
            }
        }
        tracing::debug!(group = %name, upstream = %failed_group, "group failed upstream");
        failed.push(name);
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::model::{Group, Task};

    fn chain(names: &[&str]) -> Workflow {
        let mut groups = Vec::new();
        let mut previous: Option<&str> = None;
        for name in names {
            let lead = format!("{name}-t");
            let mut group =
                Group::new(*name, lead.clone(), vec![Task::new(lead)]).expect("group");
            if let Some(upstream) = previous {
                group = group.with_upstream(vec![upstream.to_string()]);
            }
            groups.push(group);
            previous = Some(*name);
        }
        Workflow::new("wf", "wf", groups).expect("workflow")
    }

    #[test]
    fn cascade_reaches_transitive_dependents() {
        let mut workflow = chain(&["a", "b", "c", "d"]);
        let failed = cascade_upstream_failure(&mut workflow, "a").expect("cascade");
        assert_eq!(failed, vec!["b", "c", "d"]);
        for name in ["b", "c", "d"] {
            let group = workflow.group(name).expect("group");
            assert_eq!(group_status(group), TaskGroupStatus::FailedUpstream);
        }
    }

    #[test]
    fn cascade_leaves_unrelated_and_resolved_groups() {
        let a = Group::new("a", "a-t", vec![Task::new("a-t")]).expect("group");
        let b = Group::new(
            "b",
            "b-t",
            vec![Task::new("b-t").with_status(TaskGroupStatus::Completed)],
        )
        .expect("group")
        .with_upstream(vec!["a".to_string()]);
        let c = Group::new("c", "c-t", vec![Task::new("c-t")]).expect("group");
        let d = Group::new("d", "d-t", vec![Task::new("d-t")])
            .expect("group")
            .with_upstream(vec!["b".to_string(), "c".to_string()]);
        let mut workflow = Workflow::new("wf", "wf", vec![a, b, c, d]).expect("workflow");

        let failed = cascade_upstream_failure(&mut workflow, "a").expect("cascade");
        assert_eq!(failed, vec!["d"]);
        assert_eq!(
            group_status(workflow.group("b").expect("b")),
            TaskGroupStatus::Completed
        );
        assert_eq!(
            group_status(workflow.group("c").expect("c")),
            TaskGroupStatus::Submitting
        );
    }

    #[test]
    fn cascade_diamond_visits_each_group_once() {
        let a = Group::new("a", "a-t", vec![Task::new("a-t")]).expect("group");
        let b = Group::new("b", "b-t", vec![Task::new("b-t")])
            .expect("group")
            .with_upstream(vec!["a".to_string()]);
        let c = Group::new("c", "c-t", vec![Task::new("c-t")])
            .expect("group")
            .with_upstream(vec!["a".to_string()]);
        let d = Group::new("d", "d-t", vec![Task::new("d-t")])
            .expect("group")
            .with_upstream(vec!["b".to_string(), "c".to_string()]);
        let mut workflow = Workflow::new("wf", "wf", vec![a, b, c, d]).expect("workflow");

        let failed = cascade_upstream_failure(&mut workflow, "a").expect("cascade");
        assert_eq!(failed.len(), 3);
        assert_eq!(failed.iter().filter(|name| *name == "d").count(), 1);
    }

    #[test]
    fn cascade_rejects_unknown_group() {
        let mut workflow = chain(&["a"]);
        let err = cascade_upstream_failure(&mut workflow, "zzz").unwrap_err();
        assert_eq!(err, LifecycleError::UnknownGroup("zzz".to_string()));
    }
}
