//! Execution node model.
//!
//! An `ExecutionNode` is one schedulable unit of a generic execution tree.
//! The node knows nothing about agents or checkpoints: domain fields travel
//! in `NodeMetadata`, with structured domain configs carried as plain JSON
//! values serialized at the mapping boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Opaque key-value payload handed to and returned from executors.
pub type Payload = serde_json::Map<String, Value>;

/// Id of the anchor node every tree starts with.
pub const ROOT_NODE_ID: &str = "root";

/// Status of an execution node. Exactly one holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
    Waiting,
    Timeout,
    Expanded,
}

impl NodeStatus {
    pub const ALL: [NodeStatus; 9] = [
        NodeStatus::Pending,
        NodeStatus::Running,
        NodeStatus::Completed,
        NodeStatus::Failed,
        NodeStatus::Paused,
        NodeStatus::Cancelled,
        NodeStatus::Waiting,
        NodeStatus::Timeout,
        NodeStatus::Expanded,
    ];

    /// Statuses that close a node's run and stamp its end time.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed
                | NodeStatus::Failed
                | NodeStatus::Cancelled
                | NodeStatus::Timeout
                | NodeStatus::Expanded
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Paused => "paused",
            NodeStatus::Cancelled => "cancelled",
            NodeStatus::Waiting => "waiting",
            NodeStatus::Timeout => "timeout",
            NodeStatus::Expanded => "expanded",
        };
        write!(f, "{}", s)
    }
}

/// Kind of node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Zero-work anchor, always COMPLETED.
    Root,
    /// Work executed by an agent.
    Agent,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Root => "root",
            NodeType::Agent => "agent",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Domain fields a node carries without the tree interpreting them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_critical: Option<bool>,
    #[serde(default)]
    pub checkpoint_required: bool,
    /// Checkpoint config as a plain map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_config: Option<Value>,
    /// Fallback config as a plain map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_config: Option<Value>,
}

/// Timing recorded on RUNNING and on the terminal transition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// A single schedulable unit within an execution tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: String,
    pub name: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Ids that must be COMPLETED before this node is ready.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub task_data: Payload,
    #[serde(default)]
    pub result_data: Option<Payload>,
    #[serde(default)]
    pub error_data: Option<Payload>,
    #[serde(default)]
    pub metadata: NodeMetadata,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub metrics: NodeMetrics,
}

impl ExecutionNode {
    /// Create a pending node with no dependencies.
    pub fn new(id: &str, name: &str, node_type: NodeType) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            node_type,
            status: NodeStatus::Pending,
            parent_id: None,
            dependencies: BTreeSet::new(),
            task_data: Payload::new(),
            result_data: None,
            error_data: None,
            metadata: NodeMetadata::default(),
            retry_count: 0,
            max_retries: 0,
            metrics: NodeMetrics::default(),
        }
    }

    /// The root anchor: already COMPLETED, no work, no dependencies.
    pub fn root(name: &str) -> Self {
        let now = Utc::now();
        let mut node = Self::new(ROOT_NODE_ID, name, NodeType::Root);
        node.status = NodeStatus::Completed;
        node.metrics = NodeMetrics {
            start_time: Some(now),
            end_time: Some(now),
            duration_ms: Some(0),
        };
        node
    }

    pub fn is_root(&self) -> bool {
        self.node_type == NodeType::Root
    }

    /// The `error` entry of `error_data`, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.error_data
            .as_ref()
            .and_then(|e| e.get("error"))
            .and_then(Value::as_str)
    }

    /// Apply a status change with optional payloads.
    ///
    /// Entering RUNNING stamps `start_time`; entering a terminal status stamps
    /// `end_time` and `duration_ms`. `result_data` and `error_data` stay
    /// mutually exclusive, and both are cleared when the node goes back to
    /// PENDING or WAITING.
    pub fn apply_status(
        &mut self,
        status: NodeStatus,
        result_data: Option<Payload>,
        error_data: Option<Payload>,
    ) {
        let now = Utc::now();
        self.status = status;

        if let Some(result) = result_data {
            self.result_data = Some(result);
        }
        if let Some(error) = error_data {
            self.error_data = Some(error);
        }

        match status {
            NodeStatus::Running => {
                self.metrics = NodeMetrics {
                    start_time: Some(now),
                    end_time: None,
                    duration_ms: None,
                };
                self.result_data = None;
                self.error_data = None;
            }
            NodeStatus::Pending | NodeStatus::Waiting => {
                self.metrics = NodeMetrics::default();
                self.result_data = None;
                self.error_data = None;
            }
            NodeStatus::Completed | NodeStatus::Expanded => {
                self.error_data = None;
            }
            NodeStatus::Failed | NodeStatus::Timeout => {
                self.result_data = None;
            }
            NodeStatus::Paused | NodeStatus::Cancelled => {}
        }

        if status.is_terminal() {
            self.metrics.end_time = Some(now);
            self.metrics.duration_ms = self
                .metrics
                .start_time
                .map(|start| (now - start).num_milliseconds());
        }
    }
}

/// Build the `{"error": message}` payload other components rely on.
pub fn error_payload(message: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("error".to_string(), Value::String(message.to_string()));
    payload
}
