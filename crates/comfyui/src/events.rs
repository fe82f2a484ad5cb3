//! Events emitted by the push channel.
//!
//! These are the only reactions the channel produces after
//! interpreting raw WebSocket frames. They are delivered on an
//! unbounded `mpsc` channel owned by the orchestrator.

use serde::Serialize;

/// A reaction produced by the push channel for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PushEvent {
    /// Step progress as `value / max`, forwarded without clamping.
    Progress(f64),

    /// A preview image decoded from an inline payload, as a data URL.
    Preview(String),

    /// The job's execution graph has finished. Sent at most once.
    Completed,
}
