//! Job orchestration for a single prompt.
//!
//! Prepares the workflow, submits it, waits for completion on the
//! polling path (accelerated by the push channel for preview-only
//! workflows), and downloads the produced artifacts into a sink.

pub mod collector;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod poll;

pub use config::GenerationConfig;
pub use error::GenerationError;
pub use orchestrator::{generate, GenerationEvent, GenerationOutput, Job};
