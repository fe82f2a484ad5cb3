//! Artifact naming convention.
//!
//! Generates collision-free local filenames for downloaded artifacts
//! from the submission timestamp, the owning node, and the artifact's
//! index within that node.

/// Extension used when the server filename carries none.
const DEFAULT_EXTENSION: &str = "png";

/// Generate the local filename for one artifact.
///
/// Convention: `imagegen_{timestamp_ms}_{node_id}_{index}.{ext}`
///
/// - `timestamp_ms` = submission time in Unix milliseconds
/// - `ext` = extension of the server-side filename, `png` if absent
///
/// # Examples
///
/// ```
/// use imagegen_core::naming::artifact_filename;
///
/// assert_eq!(artifact_filename(1700000000000, "9", 0, "ComfyUI_00001_.png"), "imagegen_1700000000000_9_0.png");
/// assert_eq!(artifact_filename(1700000000000, "12", 3, "clip.webp"), "imagegen_1700000000000_12_3.webp");
/// assert_eq!(artifact_filename(1700000000000, "9", 1, "noext"), "imagegen_1700000000000_9_1.png");
/// ```
pub fn artifact_filename(
    timestamp_ms: i64,
    node_id: &str,
    index: usize,
    source_filename: &str,
) -> String {
    let ext = extension_of(source_filename).unwrap_or(DEFAULT_EXTENSION);
    format!("imagegen_{timestamp_ms}_{}_{index}.{ext}", sanitize(node_id))
}

/// Extract a plain alphanumeric extension from a server filename.
fn extension_of(filename: &str) -> Option<&str> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}

/// Node ids are server-controlled keys; keep them filename-safe.
fn sanitize(node_id: &str) -> String {
    node_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}
