//! Workflow template loading, validation, and prompt injection.
//!
//! A workflow is a JSON object where each key is a node ID and each
//! value is a node record with `class_type` and `inputs` fields:
//!
//! ```json
//! {
//!   "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "", "clip": ["4", 1] } },
//!   "9": { "class_type": "SaveImage", "inputs": { "images": ["8", 0] } }
//! }
//! ```
//!
//! Node semantics are opaque. The only structure interpreted here is
//! each node's output role, classified once when the template is
//! loaded, and the input coordinate the prompt text is written to.

use std::collections::BTreeMap;

use imagegen_core::types::NodeId;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Node ID the prompt is written to when no coordinate is configured.
pub const DEFAULT_PROMPT_NODE_ID: &str = "6";

/// Input key the prompt is written to when no coordinate is configured.
pub const DEFAULT_PROMPT_INPUT_KEY: &str = "text";

/// ComfyUI class type of the persistent image sink.
const SAVE_IMAGE_CLASS: &str = "SaveImage";

/// ComfyUI class type of the ephemeral image sink.
const PREVIEW_IMAGE_CLASS: &str = "PreviewImage";

/// Built-in text-to-image graph used when no usable template is supplied.
const DEFAULT_TEMPLATE: &str = r#"{
  "3": {
    "class_type": "KSampler",
    "inputs": {
      "seed": 156680208700286,
      "steps": 20,
      "cfg": 8,
      "sampler_name": "euler",
      "scheduler": "normal",
      "denoise": 1,
      "model": ["4", 0],
      "positive": ["6", 0],
      "negative": ["7", 0],
      "latent_image": ["5", 0]
    }
  },
  "4": {
    "class_type": "CheckpointLoaderSimple",
    "inputs": { "ckpt_name": "v1-5-pruned-emaonly.safetensors" }
  },
  "5": {
    "class_type": "EmptyLatentImage",
    "inputs": { "width": 512, "height": 512, "batch_size": 1 }
  },
  "6": {
    "class_type": "CLIPTextEncode",
    "inputs": { "text": "", "clip": ["4", 1] }
  },
  "7": {
    "class_type": "CLIPTextEncode",
    "inputs": { "text": "text, watermark", "clip": ["4", 1] }
  },
  "8": {
    "class_type": "VAEDecode",
    "inputs": { "samples": ["3", 0], "vae": ["4", 2] }
  },
  "9": {
    "class_type": "SaveImage",
    "inputs": { "filename_prefix": "ComfyUI", "images": ["8", 0] }
  }
}"#;

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// Output role of a node, derived from its `class_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Persistent output sink (`SaveImage`).
    Final,
    /// Ephemeral output sink (`PreviewImage`).
    Preview,
    /// Any node that produces no retrievable artifact.
    Other,
}

impl NodeRole {
    /// Classify a node by its class type.
    pub fn from_class_type(class_type: &str) -> Self {
        match class_type {
            SAVE_IMAGE_CLASS | "final" => Self::Final,
            PREVIEW_IMAGE_CLASS | "preview" => Self::Preview,
            _ => Self::Other,
        }
    }

    pub fn is_sink(self) -> bool {
        !matches!(self, Self::Other)
    }

    /// Server storage area artifacts of this role are fetched from.
    pub fn storage_category(self) -> Option<StorageCategory> {
        match self {
            Self::Final => Some(StorageCategory::Output),
            Self::Preview => Some(StorageCategory::Temp),
            Self::Other => None,
        }
    }
}

/// Storage area on the server, the `type` query parameter of `/view`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageCategory {
    Output,
    Temp,
}

impl StorageCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Temp => "temp",
        }
    }
}

/// Coordinate of the string input that receives the prompt text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionPoint {
    pub node_id: NodeId,
    pub input_key: String,
}

impl InjectionPoint {
    pub fn new(node_id: impl Into<NodeId>, input_key: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            input_key: input_key.into(),
        }
    }
}

impl Default for InjectionPoint {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_NODE_ID, DEFAULT_PROMPT_INPUT_KEY)
    }
}

/// A single node record as it appears on the wire.
///
/// Fields other than `class_type` and `inputs` (e.g. `_meta`) are kept
/// in `extra` and serialized back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    #[serde(alias = "kind")]
    pub class_type: String,
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A node record tagged with its output role.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedNode {
    pub role: NodeRole,
    pub node: WorkflowNode,
}

/// A connection between two nodes, encoded in ComfyUI inputs as
/// `[source_node_id, output_index]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLink {
    pub from_node: NodeId,
    pub from_output: u64,
    pub to_node: NodeId,
    pub to_input: String,
}

/// A validated workflow: at least one output-sink node is present.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    nodes: BTreeMap<NodeId, ClassifiedNode>,
}

/// Errors from template loading and preparation.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Neither the supplied nor the built-in template could be parsed.
    #[error("Invalid workflow template: {0}")]
    Template(String),

    /// The template has no `SaveImage` or `PreviewImage` node.
    #[error("No SaveImage or PreviewImage node found in workflow template")]
    NoOutputNode,

    /// Neither the configured nor the default coordinate holds a string input.
    #[error(
        "Could not insert prompt into workflow template \
         (tried node '{node_id}' input '{input_key}' and the default node '6' input 'text')"
    )]
    PromptInjection { node_id: NodeId, input_key: String },
}

// ---------------------------------------------------------------------------
// Public functions
// ---------------------------------------------------------------------------

/// Build the submission-ready workflow for one prompt.
///
/// Loads `raw_template` (falling back to the built-in template when it
/// is empty, malformed, or not an object), validates that an output
/// sink exists, then injects `prompt` into a copy of the template.
pub fn prepare(
    raw_template: &str,
    prompt: &str,
    injection: &InjectionPoint,
) -> Result<Workflow, WorkflowError> {
    let template = Workflow::load(raw_template)?;
    template.with_prompt(prompt, injection)
}

impl Workflow {
    /// Load and validate a template, substituting the built-in default
    /// when the supplied text is unusable.
    ///
    /// A template that parses but contains no output sink is an error;
    /// it does not fall back.
    pub fn load(raw_template: &str) -> Result<Self, WorkflowError> {
        let nodes = match parse_nodes(raw_template) {
            Ok(nodes) => nodes,
            Err(reason) => {
                tracing::warn!(reason = %reason, "Using built-in workflow template");
                parse_nodes(DEFAULT_TEMPLATE).map_err(WorkflowError::Template)?
            }
        };

        let workflow = Self::classify(nodes)?;
        tracing::debug!(
            nodes = workflow.nodes.len(),
            links = workflow.links().len(),
            "Workflow template validated",
        );
        Ok(workflow)
    }

    /// The built-in template, already validated.
    pub fn builtin() -> Result<Self, WorkflowError> {
        let nodes = parse_nodes(DEFAULT_TEMPLATE).map_err(WorkflowError::Template)?;
        Self::classify(nodes)
    }

    /// Return a copy of this workflow with `prompt` written to the
    /// configured coordinate, or to the default coordinate when the
    /// configured one is missing or not a string input.
    ///
    /// `self` is left untouched so the template can be reused.
    pub fn with_prompt(&self, prompt: &str, injection: &InjectionPoint) -> Result<Self, WorkflowError> {
        let mut workflow = self.clone();

        if workflow.try_inject(injection, prompt) {
            return Ok(workflow);
        }

        let fallback = InjectionPoint::default();
        tracing::warn!(
            node_id = %injection.node_id,
            input_key = %injection.input_key,
            "Configured prompt coordinate unusable, trying default",
        );
        if workflow.try_inject(&fallback, prompt) {
            return Ok(workflow);
        }

        Err(WorkflowError::PromptInjection {
            node_id: injection.node_id.clone(),
            input_key: injection.input_key.clone(),
        })
    }

    /// Look up a node by ID.
    pub fn node(&self, node_id: &str) -> Option<&ClassifiedNode> {
        self.nodes.get(node_id)
    }

    /// Output role of a node, if the node exists.
    pub fn role_of(&self, node_id: &str) -> Option<NodeRole> {
        self.nodes.get(node_id).map(|n| n.role)
    }

    /// IDs of all output-sink nodes with the given role.
    pub fn sink_ids(&self, role: NodeRole) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.role == role)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Role that determines how completion is observed: `Preview` only
    /// when every sink in the workflow is a preview sink.
    pub fn primary_output_role(&self) -> NodeRole {
        let has_final = self.nodes.values().any(|n| n.role == NodeRole::Final);
        if has_final {
            NodeRole::Final
        } else {
            NodeRole::Preview
        }
    }

    /// All node-to-node links implied by `[node_id, slot]` inputs.
    pub fn links(&self) -> Vec<NodeLink> {
        let mut links = Vec::new();
        for (to_node, classified) in &self.nodes {
            for (to_input, value) in &classified.node.inputs {
                let Some([from, slot]) = value.as_array().map(Vec::as_slice) else {
                    continue;
                };
                let from_node = match from {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    _ => continue,
                };
                let Some(from_output) = slot.as_u64() else {
                    continue;
                };
                links.push(NodeLink {
                    from_node,
                    from_output,
                    to_node: to_node.clone(),
                    to_input: to_input.clone(),
                });
            }
        }
        links
    }

    /// Serialize into the wire JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.nodes
                .iter()
                .map(|(id, n)| {
                    let node = serde_json::to_value(&n.node).unwrap_or(serde_json::Value::Null);
                    (id.clone(), node)
                })
                .collect(),
        )
    }

    // ---- private helpers ----

    fn classify(nodes: BTreeMap<NodeId, WorkflowNode>) -> Result<Self, WorkflowError> {
        let nodes: BTreeMap<NodeId, ClassifiedNode> = nodes
            .into_iter()
            .map(|(id, node)| {
                let role = NodeRole::from_class_type(&node.class_type);
                (id, ClassifiedNode { role, node })
            })
            .collect();

        if !nodes.values().any(|n| n.role.is_sink()) {
            return Err(WorkflowError::NoOutputNode);
        }

        Ok(Self { nodes })
    }

    fn try_inject(&mut self, point: &InjectionPoint, prompt: &str) -> bool {
        let Some(target) = self
            .nodes
            .get_mut(&point.node_id)
            .and_then(|n| n.node.inputs.get_mut(&point.input_key))
        else {
            return false;
        };

        if !target.is_string() {
            return false;
        }
        *target = serde_json::Value::String(prompt.to_string());
        true
    }
}

impl Serialize for Workflow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.nodes.len()))?;
        for (id, classified) in &self.nodes {
            map.serialize_entry(id, &classified.node)?;
        }
        map.end()
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// Parse template text into node records.
///
/// Only text that is empty, not JSON, or not a JSON object is rejected;
/// the caller falls back to the built-in template in that case. Entries
/// that are not node records (no `class_type`, auxiliary keys such as
/// `links`) are skipped so the rest of the template is kept.
fn parse_nodes(raw: &str) -> Result<BTreeMap<NodeId, WorkflowNode>, String> {
    if raw.trim().is_empty() {
        return Err("empty workflow template".to_string());
    }

    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| format!("template is not valid JSON: {e}"))?;

    let serde_json::Value::Object(entries) = value else {
        return Err("template must be a JSON object".to_string());
    };

    let mut nodes = BTreeMap::new();
    for (id, entry) in entries {
        match serde_json::from_value::<WorkflowNode>(entry) {
            Ok(node) => {
                nodes.insert(id, node);
            }
            Err(e) => {
                tracing::debug!(entry = %id, error = %e, "Skipping template entry that is not a node record");
            }
        }
    }
    Ok(nodes)
}
