//! Exponential-backoff reconnection for the push channel.
//!
//! [`run_with_reconnect`] connects, sends the subscription handshake,
//! and processes frames; when the session fails or drops without a
//! close frame it reconnects after 2s, 4s, then 8s, and gives up after
//! the third reconnection attempt. The retry itself is
//! [`retry_with_backoff`], the same combinator artifact downloads use.

use std::time::Duration;

use futures::SinkExt;
use imagegen_core::retry::{retry_with_backoff, Backoff};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{ChannelError, PushClient};
use crate::events::PushEvent;
use crate::messages::subscription_frame;
use crate::processor::{process_messages, FrameContext, SessionEnd};

/// Delay before the first reconnection attempt.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Factor by which the delay grows after each failed attempt.
pub const RECONNECT_MULTIPLIER: f64 = 2.0;

/// Reconnection attempts before the channel gives up for good.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Lifecycle of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    /// Ended normally: completion, server close, or cancellation.
    ClosedClean,
    /// Ended on an error, either between reconnects or after giving up.
    ClosedError,
}

/// The reconnection policy: 2s, 4s, 8s, then give up.
pub fn reconnect_backoff() -> Backoff {
    Backoff::exponential(
        RECONNECT_INITIAL_DELAY,
        RECONNECT_MULTIPLIER,
        MAX_RECONNECT_ATTEMPTS,
    )
}

/// Keep a push-channel session alive until it ends cleanly, the retry
/// budget is spent, or `cancel` fires. Returns the final state.
///
/// The socket is closed on every exit path: explicitly on completion
/// and cancellation, by the server on a clean close, and by dropping
/// the stream on errors.
pub async fn run_with_reconnect(
    client: &PushClient,
    ctx: &FrameContext,
    events: &mpsc::UnboundedSender<PushEvent>,
    backoff: &Backoff,
    cancel: &CancellationToken,
    state: &watch::Sender<ChannelState>,
) -> ChannelState {
    let sessions = retry_with_backoff(
        backoff,
        |_: &ChannelError| !cancel.is_cancelled(),
        |attempt| run_session(client, ctx, events, cancel, state, attempt),
    );

    let outcome = tokio::select! {
        biased;
        outcome = sessions => outcome,
        _ = cancel.cancelled() => Ok(SessionEnd::Cancelled),
    };

    let final_state = match outcome {
        Ok(end) => {
            tracing::info!(job_id = %ctx.job_id, ?end, "Push channel closed");
            ChannelState::ClosedClean
        }
        Err(e) if cancel.is_cancelled() => {
            tracing::debug!(job_id = %ctx.job_id, error = %e, "Push channel cancelled mid-session");
            ChannelState::ClosedClean
        }
        Err(e) => {
            tracing::warn!(
                job_id = %ctx.job_id,
                error = %e,
                attempts = backoff.max_retries + 1,
                "Push channel gave up; completion now depends on polling",
            );
            ChannelState::ClosedError
        }
    };

    state.send_replace(final_state);
    final_state
}

/// One connect -> subscribe -> process cycle.
async fn run_session(
    client: &PushClient,
    ctx: &FrameContext,
    events: &mpsc::UnboundedSender<PushEvent>,
    cancel: &CancellationToken,
    state: &watch::Sender<ChannelState>,
    attempt: u32,
) -> Result<SessionEnd, ChannelError> {
    if cancel.is_cancelled() {
        return Ok(SessionEnd::Cancelled);
    }
    state.send_replace(ChannelState::Connecting);
    tracing::info!(job_id = %ctx.job_id, attempt, "Connecting push channel");

    let result = async {
        let mut ws = client.connect(&ctx.job_id).await?;

        ws.send(Message::Text(subscription_frame()))
            .await
            .map_err(ChannelError::Subscribe)?;
        state.send_replace(ChannelState::Open);

        process_messages(&mut ws, ctx, events, cancel).await
    }
    .await;

    if let Err(e) = &result {
        state.send_replace(ChannelState::ClosedError);
        tracing::warn!(job_id = %ctx.job_id, attempt, error = %e, "Push channel session failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_is_two_four_eight() {
        let delays: Vec<Duration> = reconnect_backoff().delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_token_stops_reconnect() {
        let cancel = CancellationToken::new();
        // Cancel immediately -- no connection should be attempted to completion.
        cancel.cancel();

        let client = PushClient::new("ws://127.0.0.1:9");
        let ctx = FrameContext {
            job_id: "abc".into(),
            preview_nodes: Default::default(),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);

        let state =
            run_with_reconnect(&client, &ctx, &tx, &reconnect_backoff(), &cancel, &state_tx).await;

        assert_eq!(state, ChannelState::ClosedClean);
        assert_eq!(*state_rx.borrow(), ChannelState::ClosedClean);
    }
}
