//! Translation between the domain `TaskStep` and the generic `ExecutionNode`.
//!
//! These functions are pure. Structured step configs are serialized into
//! `NodeMetadata` as plain JSON values so the tree never depends on domain
//! types, and are parsed back on the way out.

use chrono::{DateTime, Utc};

use crate::core::node::{error_payload, ExecutionNode, NodeMetrics, NodeStatus, NodeType, ROOT_NODE_ID};
use crate::core::task::{StepStatus, TaskStep};

/// Map a step status onto the node status it is stored as.
pub fn step_status_to_execution_status(status: StepStatus) -> NodeStatus {
    match status {
        StepStatus::Pending => NodeStatus::Pending,
        StepStatus::Running => NodeStatus::Running,
        StepStatus::Done => NodeStatus::Completed,
        StepStatus::Failed => NodeStatus::Failed,
        StepStatus::Checkpoint => NodeStatus::Paused,
        StepStatus::Skipped => NodeStatus::Cancelled,
    }
}

/// Map a node status back to the step status.
///
/// WAITING, TIMEOUT and EXPANDED only exist on nodes and collapse into
/// PENDING, FAILED and DONE.
pub fn execution_status_to_step_status(status: NodeStatus) -> StepStatus {
    match status {
        NodeStatus::Pending | NodeStatus::Waiting => StepStatus::Pending,
        NodeStatus::Running => StepStatus::Running,
        NodeStatus::Completed | NodeStatus::Expanded => StepStatus::Done,
        NodeStatus::Failed | NodeStatus::Timeout => StepStatus::Failed,
        NodeStatus::Paused => StepStatus::Checkpoint,
        NodeStatus::Cancelled => StepStatus::Skipped,
    }
}

fn duration_ms(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<i64> {
    match (start, end) {
        (Some(s), Some(e)) => Some((e - s).num_milliseconds()),
        _ => None,
    }
}

/// Build the node that stores `step`.
///
/// A step without dependencies depends on the root, so every node hangs off
/// a single entry point. `outputs` are only carried for DONE steps.
pub fn task_step_to_node(step: &TaskStep, parent_id: Option<&str>) -> ExecutionNode {
    let mut node = ExecutionNode::new(&step.id, &step.name, NodeType::Agent);
    node.status = step_status_to_execution_status(step.status);
    node.parent_id = Some(parent_id.unwrap_or(ROOT_NODE_ID).to_string());

    node.dependencies = step.dependencies.iter().cloned().collect();
    if node.dependencies.is_empty() {
        node.dependencies.insert(ROOT_NODE_ID.to_string());
    }

    node.task_data = step.inputs.clone();
    if step.status == StepStatus::Done {
        node.result_data = step.outputs.clone();
    }
    node.error_data = step.error_message.as_deref().map(error_payload);

    node.metadata.agent_type = Some(step.agent_type.clone());
    node.metadata.description = Some(step.description.clone()).filter(|d| !d.is_empty());
    node.metadata.domain = step.domain.clone();
    node.metadata.parallel_group = step.parallel_group.clone();
    node.metadata.is_critical = Some(step.is_critical);
    node.metadata.checkpoint_required = step.checkpoint_required;
    node.metadata.checkpoint_config = step
        .checkpoint_config
        .as_ref()
        .and_then(|c| serde_json::to_value(c).ok());
    node.metadata.fallback_config = step
        .fallback_config
        .as_ref()
        .and_then(|c| serde_json::to_value(c).ok());

    node.retry_count = step.retry_count;
    node.max_retries = step.max_retries;
    node.metrics = NodeMetrics {
        start_time: step.started_at,
        end_time: step.completed_at,
        duration_ms: duration_ms(step.started_at, step.completed_at),
    };
    node
}

/// Rebuild the domain step stored in `node`.
///
/// The root id never appears in the returned dependencies, and a DONE step
/// always has `outputs`, empty or not.
pub fn node_to_task_step(node: &ExecutionNode) -> TaskStep {
    let status = execution_status_to_step_status(node.status);
    let outputs = if status == StepStatus::Done {
        Some(node.result_data.clone().unwrap_or_default())
    } else {
        node.result_data.clone()
    };

    let agent_type = node
        .metadata
        .agent_type
        .clone()
        .unwrap_or_else(|| node.node_type.as_str().to_string());

    let mut step = TaskStep::new(&node.id, &node.name, &agent_type);
    step.description = node.metadata.description.clone().unwrap_or_default();
    step.domain = node.metadata.domain.clone();
    step.inputs = node.task_data.clone();
    step.outputs = outputs;
    step.dependencies = node
        .dependencies
        .iter()
        .filter(|d| d.as_str() != ROOT_NODE_ID)
        .cloned()
        .collect();
    step.status = status;
    step.checkpoint_required = node.metadata.checkpoint_required;
    step.checkpoint_config = node
        .metadata
        .checkpoint_config
        .clone()
        .and_then(|v| serde_json::from_value(v).ok());
    step.fallback_config = node
        .metadata
        .fallback_config
        .clone()
        .and_then(|v| serde_json::from_value(v).ok());
    step.parallel_group = node.metadata.parallel_group.clone();
    step.is_critical = node.metadata.is_critical.unwrap_or(true);
    step.retry_count = node.retry_count;
    step.max_retries = node.max_retries;
    step.started_at = node.metrics.start_time;
    step.completed_at = node.metrics.end_time;
    step.error_message = node.error_message().map(str::to_string);
    step
}
