//! Workflow, group and task records.
//!
//! Topology (groups, leads, upstream edges) is validated once at construction
//! and never changes afterwards.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::{TaskGroupStatus, WorkflowStatus};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("duplicate group name: {0}")]
    DuplicateGroup(String),
    #[error("duplicate task name: {0}")]
    DuplicateTask(String),
    #[error("group {group} has no task named {lead} to lead it")]
    MissingLead { group: String, lead: String },
    #[error("group {group} depends on unknown group {upstream}")]
    UnknownUpstream { group: String, upstream: String },
    #[error("group dependencies contain a cycle through {0}")]
    Cycle(String),
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("invalid exit actions: {0}")]
    InvalidExitActions(String),
}

/// Resource request of one task container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu: f64,
    pub memory_mib: u64,
    pub gpu: u32,
    pub storage_mib: u64,
}

/// One attempt of a task. A reschedule creates a new record with the next
/// retry id; a restart reuses the record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub group_name: String,
    pub retry_id: u32,
    pub status: TaskGroupStatus,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub resources: ResourceRequest,
    /// Index N is referenced as `{{input:N}}` in the command.
    pub inputs: Vec<String>,
    pub output: Option<String>,
    pub exit_code: Option<i32>,
    pub restart_count: u32,
    pub inputs_staged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            group_name: String::new(),
            retry_id: 0,
            status: TaskGroupStatus::Submitting,
            command: Vec::new(),
            args: Vec::new(),
            resources: ResourceRequest::default(),
            inputs: Vec::new(),
            output: None,
            exit_code: None,
            restart_count: 0,
            inputs_staged: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_command(mut self, command: Vec<String>, args: Vec<String>) -> Self {
        self.command = command;
        self.args = args;
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_status(mut self, status: TaskGroupStatus) -> Self {
        self.status = status;
        self
    }

    pub(crate) fn set_status(&mut self, status: TaskGroupStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// A set of tasks that start together, led by exactly one task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub workflow_id: String,
    /// Every task record, including superseded attempts, in creation order.
    pub tasks: Vec<Task>,
    pub lead: String,
    pub ignore_nonlead_status: bool,
    pub upstream: Vec<String>,
}

impl Group {
    pub fn new(
        name: impl Into<String>,
        lead: impl Into<String>,
        tasks: Vec<Task>,
    ) -> Result<Self, LifecycleError> {
        let name = name.into();
        let lead = lead.into();

        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.name.clone()) {
                return Err(LifecycleError::DuplicateTask(task.name.clone()));
            }
        }
        if !seen.contains(&lead) {
            return Err(LifecycleError::MissingLead { group: name, lead });
        }

        let tasks = tasks
            .into_iter()
            .map(|mut task| {
                task.group_name = name.clone();
                task
            })
            .collect();

        Ok(Self {
            name,
            workflow_id: String::new(),
            tasks,
            lead,
            ignore_nonlead_status: true,
            upstream: Vec::new(),
        })
    }

    pub fn with_upstream(mut self, upstream: Vec<String>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_ignore_nonlead_status(mut self, ignore: bool) -> Self {
        self.ignore_nonlead_status = ignore;
        self
    }

    /// Task names in declaration order.
    pub fn task_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.tasks
            .iter()
            .filter(|task| seen.insert(task.name.as_str()))
            .map(|task| task.name.as_str())
            .collect()
    }

    /// Current record of every task (highest retry id), in declaration order.
    pub fn latest_tasks(&self) -> Vec<&Task> {
        self.task_names()
            .into_iter()
            .filter_map(|name| self.latest_task(name))
            .collect()
    }

    pub fn latest_task(&self, name: &str) -> Option<&Task> {
        self.tasks
            .iter()
            .filter(|task| task.name == name)
            .max_by_key(|task| task.retry_id)
    }

    pub(crate) fn latest_task_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks
            .iter_mut()
            .filter(|task| task.name == name)
            .max_by_key(|task| task.retry_id)
    }

    pub fn lead_task(&self) -> Option<&Task> {
        self.latest_task(&self.lead)
    }
}

/// One append-only entry per reschedule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub task_name: String,
    pub retry_id: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// A submitted DAG of groups.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub groups: Vec<Group>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set only by cancellation or submission failure; otherwise status is derived.
    pub override_status: Option<WorkflowStatus>,
}

impl Workflow {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        groups: Vec<Group>,
    ) -> Result<Self, LifecycleError> {
        let id = id.into();

        let mut group_names = HashSet::new();
        let mut task_names = HashSet::new();
        for group in &groups {
            if !group_names.insert(group.name.clone()) {
                return Err(LifecycleError::DuplicateGroup(group.name.clone()));
            }
            for name in group.task_names() {
                if !task_names.insert(name.to_string()) {
                    return Err(LifecycleError::DuplicateTask(name.to_string()));
                }
            }
        }
        for group in &groups {
            for upstream in &group.upstream {
                if !group_names.contains(upstream) {
                    return Err(LifecycleError::UnknownUpstream {
                        group: group.name.clone(),
                        upstream: upstream.clone(),
                    });
                }
            }
        }
        check_acyclic(&groups)?;

        let groups = groups
            .into_iter()
            .map(|mut group| {
                group.workflow_id = id.clone();
                group
            })
            .collect();

        Ok(Self {
            id,
            name: name.into(),
            groups,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            override_status: None,
        })
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|group| group.name == name)
    }

    pub(crate) fn group_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|group| group.name == name)
    }

    /// Group that owns a task name.
    pub fn group_of_task(&self, task_name: &str) -> Option<&Group> {
        self.groups
            .iter()
            .find(|group| group.tasks.iter().any(|task| task.name == task_name))
    }

    /// Group name -> names of groups that list it as upstream.
    pub fn downstream_edges(&self) -> HashMap<&str, Vec<&str>> {
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for group in &self.groups {
            for upstream in &group.upstream {
                edges
                    .entry(upstream.as_str())
                    .or_default()
                    .push(group.name.as_str());
            }
        }
        edges
    }
}

// Kahn's algorithm; any group left with unresolved in-degree sits on a cycle.
fn check_acyclic(groups: &[Group]) -> Result<(), LifecycleError> {
    let mut in_degree: HashMap<&str, usize> = groups
        .iter()
        .map(|group| (group.name.as_str(), group.upstream.len()))
        .collect();
    let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
    for group in groups {
        for upstream in &group.upstream {
            downstream
                .entry(upstream.as_str())
                .or_default()
                .push(group.name.as_str());
        }
    }

    let mut ready: VecDeque<&str> = groups
        .iter()
        .filter(|group| group.upstream.is_empty())
        .map(|group| group.name.as_str())
        .collect();
    let mut visited = 0usize;
    while let Some(name) = ready.pop_front() {
        visited += 1;
        for child in downstream.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*child);
                }
            }
        }
    }

    if visited == groups.len() {
        return Ok(());
    }
    let on_cycle = groups
        .iter()
        .find(|group| in_degree.get(group.name.as_str()).copied().unwrap_or(0) > 0)
        .map(|group| group.name.clone())
        .unwrap_or_default();
    Err(LifecycleError::Cycle(on_cycle))
}
