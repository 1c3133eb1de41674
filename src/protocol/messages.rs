use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::models::{AgentTaskView, TaskResultReport};

/// The wire envelope: every payload travels as `{"type", "data"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug)]
pub enum FrameBody {
    Heartbeat(HeartbeatPayload),
    HeartbeatAck(HeartbeatAckPayload),
    Connected(ConnectedPayload),
    Tasks(TasksPayload),
    FetchTasks,
    TaskResult(Box<TaskResultReport>),
    Execute { task_id: i64 },
    Enabled,
    Disabled,
    Update,
    Other(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub build_time: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub auto_update: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAckPayload {
    pub agent_id: i64,
    pub name: String,
    pub need_update: bool,
    pub force_update: bool,
    pub latest_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedPayload {
    pub agent_id: i64,
    pub name: String,
    pub is_new_agent: bool,
    pub machine_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksPayload {
    #[serde(default)]
    pub tasks: Vec<AgentTaskView>,
}
