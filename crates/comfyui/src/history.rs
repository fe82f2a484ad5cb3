//! Interpretation of `GET /history/{prompt_id}` responses.
//!
//! The history endpoint returns an object that contains an entry for
//! the prompt once the server has finished with it:
//!
//! ```json
//! { "abc": { "outputs": { "9": { "images": [{ "filename": "x.png", "subfolder": "", "type": "output" }] } } } }
//! ```
//!
//! The three-way reading is fixed: no entry means the job is still
//! running, an entry with a non-empty `outputs` object means it
//! completed, and an entry whose `outputs` is missing, `null`, or empty
//! means it failed.

use serde::Deserialize;

/// Per-node output payloads of a completed job, keyed by node ID.
pub type HistoryOutputs = serde_json::Map<String, serde_json::Value>;

/// State of a job as read from one history response.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// No history entry yet.
    Running,
    /// Entry present with at least one node output.
    Completed(HistoryOutputs),
    /// Entry present without outputs; carries a human-readable reason.
    Failed(String),
}

/// One artifact reference inside a node's `images` list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRecord {
    pub filename: String,
    /// Absent and `null` both mean the storage area's root.
    #[serde(default)]
    pub subfolder: Option<String>,
    /// Position in the node's `images` array, counting skipped entries.
    #[serde(skip)]
    pub position: usize,
}

impl ImageRecord {
    pub fn subfolder(&self) -> &str {
        self.subfolder.as_deref().unwrap_or_default()
    }
}

/// Interpret a history response for `prompt_id`.
pub fn interpret_history(history: &serde_json::Value, prompt_id: &str) -> JobOutcome {
    let Some(entry) = history.get(prompt_id) else {
        return JobOutcome::Running;
    };

    match entry.get("outputs") {
        Some(serde_json::Value::Object(outputs)) if !outputs.is_empty() => {
            JobOutcome::Completed(outputs.clone())
        }
        _ => JobOutcome::Failed(failure_reason(entry)),
    }
}

/// Artifact references in one node's output payload.
///
/// Entries that are not objects or lack a string `filename` are
/// skipped without shifting the positions of later entries; a missing
/// or non-array `images` field yields nothing.
pub fn node_images(output: &serde_json::Value) -> Vec<ImageRecord> {
    output
        .get("images")
        .and_then(|v| v.as_array())
        .map(|images| {
            images
                .iter()
                .enumerate()
                .filter_map(|(position, image)| {
                    let record = serde_json::from_value::<ImageRecord>(image.clone()).ok()?;
                    Some(ImageRecord { position, ..record })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Build a failure description, including the server's status string
/// when the entry carries one.
fn failure_reason(entry: &serde_json::Value) -> String {
    let status = entry
        .get("status")
        .and_then(|s| s.get("status_str"))
        .and_then(|s| s.as_str());

    match status {
        Some(status) => format!("Prompt execution failed on server (status: {status})"),
        None => "Prompt execution failed on server (entry without outputs)".to_string(),
    }
}
