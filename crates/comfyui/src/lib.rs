//! Wire protocol of a ComfyUI-compatible compute server.
//!
//! `workflow` prepares the node graph, `api` covers the REST routes
//! (submit, history, view), `history` reads job state out of history
//! responses, and `push` runs the reconnecting WebSocket channel that
//! streams progress and previews for one job.

pub mod api;
pub mod client;
pub mod events;
pub mod history;
pub mod messages;
pub mod processor;
pub mod push;
pub mod reconnect;
pub mod workflow;
