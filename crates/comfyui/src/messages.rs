//! Frames exchanged on the push channel.
//!
//! Inbound frames are JSON objects `{"type": "<kind>", "data": {...}}`
//! and decode into [`PushFrame`]. The only outbound frame is the
//! subscription handshake.

use serde::Deserialize;

/// Event kinds requested in the subscription handshake.
pub const SUBSCRIBED_EVENTS: [&str; 2] = ["progress", "executed"];

/// An inbound frame, by kind.
///
/// Frames of an unknown kind fail to decode; the processor logs and
/// skips them.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushFrame {
    Status(QueueStatus),
    ExecutionStart(PromptRef),
    ExecutionCached(CachedNodes),
    /// Node-level execution notice. An empty node means the graph is done.
    Executing(NodeExecuting),
    Progress(StepProgress),
    Executed(NodeExecuted),
    ExecutionError(ExecutionFault),
}

/// Queue broadcast. Only the remaining count is read.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    #[serde(default)]
    status: serde_json::Value,
}

impl QueueStatus {
    pub fn queue_remaining(&self) -> Option<i64> {
        self.status
            .pointer("/exec_info/queue_remaining")
            .and_then(serde_json::Value::as_i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachedNodes {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeExecuting {
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Inline output some servers attach to the notice.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

impl NodeExecuting {
    /// The node now running; `None` once the whole graph has finished.
    pub fn running_node(&self) -> Option<&str> {
        match self.node.as_deref() {
            Some("") | None => None,
            Some(node) => Some(node),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepProgress {
    pub value: f64,
    pub max: f64,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

impl StepProgress {
    /// `value / max`, passed through as is.
    pub fn ratio(&self) -> f64 {
        self.value / self.max
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeExecuted {
    pub node: String,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionFault {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_type: String,
    #[serde(default)]
    pub exception_message: String,
}

pub fn parse_frame(text: &str) -> Result<PushFrame, serde_json::Error> {
    serde_json::from_str(text)
}

/// The handshake sent as the first frame after the socket opens.
pub fn subscription_frame() -> String {
    serde_json::json!({
        "type": "subscribe",
        "data": { "events": SUBSCRIBED_EVENTS }
    })
    .to_string()
}
