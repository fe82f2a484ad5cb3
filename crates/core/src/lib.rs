//! Shared building blocks for the image generation client.
//!
//! Holds the error type used across crates, the retry/backoff
//! combinator shared by the push channel and artifact downloads,
//! artifact naming, and the durable byte sink artifacts are written to.

pub mod error;
pub mod naming;
pub mod retry;
pub mod storage;
pub mod types;
