//! Workflow/group/task lifecycle.
//!
//! Statuses are never stored as derived fields: task records hold their own
//! status, and group and workflow status are recomputed from them on demand.

pub mod cascade;
pub mod consumer;
pub mod model;
pub mod recovery;
pub mod rollup;
pub mod status;
pub mod tracker;

pub use cascade::cascade_upstream_failure;
pub use consumer::{EventConsumer, EventConsumerConfig, TrackerRegistry};
pub use model::{Group, LifecycleError, ResourceRequest, RetryRecord, Task, Workflow};
pub use recovery::{
    ExitAction, ExitActions, GroupExitPlan, Recovery, RetryPolicy, group_exit_plan, reschedule,
    restart,
};
pub use rollup::{group_status, workflow_started, workflow_status};
pub use status::{FailureCategory, FailureCause, TaskGroupStatus, WorkflowStatus, classify_failure};
pub use tracker::{ApplyOutcome, WorkflowTracker};
