/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Workflow node identifiers are the string keys of the workflow object.
pub type NodeId = String;
