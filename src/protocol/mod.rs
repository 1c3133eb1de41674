mod messages;

pub use messages::{
    ConnectedPayload, Frame, FrameBody, HeartbeatAckPayload, HeartbeatPayload, TasksPayload,
};

use serde_json::Value;

use crate::domain::models::TaskResultReport;

pub const TYPE_HEARTBEAT: &str = "heartbeat";
pub const TYPE_HEARTBEAT_ACK: &str = "heartbeat_ack";
pub const TYPE_CONNECTED: &str = "connected";
pub const TYPE_TASKS: &str = "tasks";
pub const TYPE_FETCH_TASKS: &str = "fetch_tasks";
pub const TYPE_TASK_RESULT: &str = "task_result";
pub const TYPE_EXECUTE: &str = "execute";
pub const TYPE_ENABLED: &str = "enabled";
pub const TYPE_DISABLED: &str = "disabled";
pub const TYPE_UPDATE: &str = "update";

/// Decodes one wire frame. Unknown types come back as `FrameBody::Other` so
/// callers can ignore them (forward compatibility); malformed JSON is an
/// error.
pub fn parse_frame(text: &str) -> Result<FrameBody, String> {
    let frame = serde_json::from_str::<Frame>(text).map_err(|error| error.to_string())?;
    let data = frame.data.unwrap_or(Value::Null);

    let body = match frame.frame_type.as_str() {
        TYPE_HEARTBEAT => FrameBody::Heartbeat(decode(data)?),
        TYPE_HEARTBEAT_ACK => FrameBody::HeartbeatAck(decode(data)?),
        TYPE_CONNECTED => FrameBody::Connected(decode(data)?),
        TYPE_TASKS => FrameBody::Tasks(decode(data)?),
        TYPE_FETCH_TASKS => FrameBody::FetchTasks,
        TYPE_TASK_RESULT => FrameBody::TaskResult(Box::new(decode::<TaskResultReport>(data)?)),
        TYPE_EXECUTE => FrameBody::Execute { task_id: decode_task_id(&data)? },
        TYPE_ENABLED => FrameBody::Enabled,
        TYPE_DISABLED => FrameBody::Disabled,
        TYPE_UPDATE => FrameBody::Update,
        other => FrameBody::Other(other.to_owned()),
    };
    Ok(body)
}

/// Encodes `{"type": ..., "data": ...}`; payloads that cannot serialize are
/// programming errors and degrade to a bare type-only frame.
#[must_use]
pub fn encode_frame<T: serde::Serialize>(frame_type: &str, data: &T) -> String {
    let data = serde_json::to_value(data).unwrap_or(Value::Null);
    let frame = serde_json::json!({ "type": frame_type, "data": data });
    frame.to_string()
}

#[must_use]
pub fn encode_empty_frame(frame_type: &str) -> String {
    serde_json::json!({ "type": frame_type, "data": {} }).to_string()
}

fn decode<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, String> {
    serde_json::from_value(data).map_err(|error| error.to_string())
}

fn decode_task_id(data: &Value) -> Result<i64, String> {
    data.get("task_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| "execute frame missing task_id".to_owned())
}
