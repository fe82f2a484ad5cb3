//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into [`PushFrame`] variants, and turns the ones relevant
//! to the observed job into [`PushEvent`]s.

use std::collections::HashSet;

use base64::Engine;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{ChannelError, WsStream};
use crate::events::PushEvent;
use crate::messages::{parse_frame, PushFrame};

/// Format assumed for inline previews that do not declare one.
const DEFAULT_PREVIEW_FORMAT: &str = "png";

/// What the processor needs to know about the observed job.
#[derive(Debug, Clone)]
pub struct FrameContext {
    /// Prompt ID of the job; frames tagged with another ID are ignored.
    pub job_id: String,
    /// Nodes whose inline output is forwarded as preview images.
    pub preview_nodes: HashSet<String>,
}

/// How a session ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The completion signal was received; the socket was closed by us.
    Completed,
    /// The server sent a close frame.
    ClosedClean,
    /// The owner cancelled the channel; the socket was closed by us.
    Cancelled,
}

/// Process WebSocket messages until the session ends.
///
/// Returns `Ok` for a clean close, completion, or cancellation, and
/// `Err` when the connection fails or drops without a close frame, which
/// is the case the caller reconnects on.
///
/// Binary frames (server-rendered previews) are ignored.
pub async fn process_messages(
    ws_stream: &mut WsStream,
    ctx: &FrameContext,
    events: &mpsc::UnboundedSender<PushEvent>,
    cancel: &CancellationToken,
) -> Result<SessionEnd, ChannelError> {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                close_quietly(ws_stream, &ctx.job_id).await;
                return Ok(SessionEnd::Cancelled);
            }
            next = ws_stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if handle_text_message(&text, ctx, events) {
                    close_quietly(ws_stream, &ctx.job_id).await;
                    return Ok(SessionEnd::Completed);
                }
            }
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!(job_id = %ctx.job_id, "Ignoring binary message (preview image)");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                // Handled automatically by tungstenite.
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(job_id = %ctx.job_id, ?frame, "ComfyUI WebSocket closed");
                return Ok(SessionEnd::ClosedClean);
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                return Err(ChannelError::Receive(e));
            }
            None => {
                return Err(ChannelError::Dropped);
            }
        }
    }
}

/// Dispatch a single text frame. Returns `true` when the frame is the
/// job's completion signal.
///
/// Frames that fail to parse are logged and ignored.
pub fn handle_text_message(
    text: &str,
    ctx: &FrameContext,
    events: &mpsc::UnboundedSender<PushEvent>,
) -> bool {
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(job_id = %ctx.job_id, error = %e, raw = %text, "Ignoring undecodable push frame");
            return false;
        }
    };

    match frame {
        PushFrame::Progress(progress) if is_for_job(progress.prompt_id.as_deref(), ctx) => {
            tracing::debug!(job_id = %ctx.job_id, value = progress.value, max = progress.max, "Step progress");
            emit(events, PushEvent::Progress(progress.ratio()));
            false
        }
        PushFrame::Executing(notice) if is_for_job(notice.prompt_id.as_deref(), ctx) => {
            let Some(node) = notice.running_node() else {
                tracing::info!(job_id = %ctx.job_id, "Execution graph finished");
                emit(events, PushEvent::Completed);
                return true;
            };
            tracing::debug!(job_id = %ctx.job_id, node, "Executing node");
            if let Some(output) = &notice.output {
                forward_previews(node, output, ctx, events);
            }
            false
        }
        PushFrame::Executed(executed) if is_for_job(executed.prompt_id.as_deref(), ctx) => {
            tracing::debug!(job_id = %ctx.job_id, node = %executed.node, "Node produced output");
            forward_previews(&executed.node, &executed.output, ctx, events);
            false
        }
        PushFrame::ExecutionError(fault) => {
            // Polling reports the failure from the history record.
            tracing::warn!(
                job_id = %ctx.job_id,
                node_id = ?fault.node_id,
                error_type = %fault.exception_type,
                error_message = %fault.exception_message,
                "Server reported an execution error",
            );
            false
        }
        PushFrame::Status(status) => {
            tracing::debug!(queue_remaining = ?status.queue_remaining(), "Queue status");
            false
        }
        other => {
            tracing::trace!(job_id = %ctx.job_id, frame = ?other, "Push frame not acted on");
            false
        }
    }
}

/// Decode inline base64 images in `output` into data URLs.
///
/// Only `images[].image` string payloads are considered; `format`
/// selects the MIME subtype. Payloads that are not valid base64 are
/// dropped.
pub fn inline_previews(output: &serde_json::Value) -> Vec<String> {
    let Some(images) = output.get("images").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    images
        .iter()
        .filter_map(|image| {
            let payload = image.get("image")?.as_str()?;
            let format = image
                .get("format")
                .and_then(|f| f.as_str())
                .unwrap_or(DEFAULT_PREVIEW_FORMAT);

            match base64::engine::general_purpose::STANDARD.decode(payload) {
                Ok(_) => Some(format!("data:image/{format};base64,{payload}")),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping preview with invalid base64 payload");
                    None
                }
            }
        })
        .collect()
}

// ---- private helpers ----

fn is_for_job(prompt_id: Option<&str>, ctx: &FrameContext) -> bool {
    prompt_id.map_or(true, |id| id == ctx.job_id)
}

fn forward_previews(
    node: &str,
    output: &serde_json::Value,
    ctx: &FrameContext,
    events: &mpsc::UnboundedSender<PushEvent>,
) {
    if !ctx.preview_nodes.contains(node) {
        return;
    }
    for data_url in inline_previews(output) {
        emit(events, PushEvent::Preview(data_url));
    }
}

/// The receiver may already be gone once the job resolved; that is fine.
fn emit(events: &mpsc::UnboundedSender<PushEvent>, event: PushEvent) {
    let _ = events.send(event);
}

async fn close_quietly(ws_stream: &mut WsStream, job_id: &str) {
    if let Err(e) = ws_stream.close(None).await {
        tracing::debug!(job_id = %job_id, error = %e, "WebSocket close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FrameContext {
        FrameContext {
            job_id: "abc".into(),
            preview_nodes: HashSet::from(["20".to_string()]),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PushEvent>) -> Vec<PushEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn progress_frame_emits_ratio() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let done = handle_text_message(r#"{"type":"progress","data":{"value":3,"max":4}}"#, &ctx(), &tx);

        assert!(!done);
        assert_eq!(drain(&mut rx), vec![PushEvent::Progress(0.75)]);
    }

    #[test]
    fn empty_node_signals_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let done = handle_text_message(
            r#"{"type":"executing","data":{"node":null,"prompt_id":"abc"}}"#,
            &ctx(),
            &tx,
        );

        assert!(done);
        assert_eq!(drain(&mut rx), vec![PushEvent::Completed]);
    }

    #[test]
    fn completion_for_other_job_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let done = handle_text_message(
            r#"{"type":"executing","data":{"node":null,"prompt_id":"other"}}"#,
            &ctx(),
            &tx,
        );

        assert!(!done);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn preview_node_with_inline_image_emits_data_url() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let frame = r#"{"type":"executed","data":{"node":"20","prompt_id":"abc","output":{"images":[{"image":"aGVsbG8=","format":"jpeg"}]}}}"#;

        handle_text_message(frame, &ctx(), &tx);

        assert_eq!(
            drain(&mut rx),
            vec![PushEvent::Preview("data:image/jpeg;base64,aGVsbG8=".into())]
        );
    }

    #[test]
    fn executing_frame_with_inline_output_emits_preview() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let frame = r#"{"type":"executing","data":{"node":"20","prompt_id":"abc","output":{"images":[{"image":"aGVsbG8="}]}}}"#;

        let done = handle_text_message(frame, &ctx(), &tx);

        assert!(!done);
        assert_eq!(
            drain(&mut rx),
            vec![PushEvent::Preview("data:image/png;base64,aGVsbG8=".into())]
        );
    }

    #[test]
    fn non_preview_node_output_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let frame = r#"{"type":"executed","data":{"node":"9","prompt_id":"abc","output":{"images":[{"image":"aGVsbG8="}]}}}"#;

        handle_text_message(frame, &ctx(), &tx);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn invalid_base64_is_dropped() {
        let output = serde_json::json!({ "images": [{ "image": "***" }, { "filename": "x.png" }] });
        assert!(inline_previews(&output).is_empty());
    }

    #[test]
    fn malformed_frames_are_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(!handle_text_message("not json", &ctx(), &tx));
        assert!(!handle_text_message(r#"{"type":"mystery","data":{}}"#, &ctx(), &tx));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn closed_receiver_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert!(handle_text_message(r#"{"type":"executing","data":{}}"#, &ctx(), &tx));
    }
}
