//! Push channel for one submitted job.
//!
//! [`PushChannel::spawn`] starts a background task that connects to
//! `{ws}/ws?clientId={job_id}`, subscribes to progress and execution
//! events, and forwards [`PushEvent`]s until the job completes, the
//! server closes the connection, the reconnection budget is spent, or
//! the channel is shut down. Dropping the handle cancels the task.

use std::collections::HashSet;

use imagegen_core::retry::Backoff;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::PushClient;
use crate::events::PushEvent;
use crate::processor::FrameContext;
use crate::reconnect::{reconnect_backoff, run_with_reconnect, ChannelState};

/// Handle to a running push-channel task.
pub struct PushChannel {
    cancel: CancellationToken,
    state: watch::Receiver<ChannelState>,
    handle: Option<JoinHandle<ChannelState>>,
}

impl PushChannel {
    /// Spawn the channel with the default 2s/4s/8s reconnection policy.
    pub fn spawn(
        client: PushClient,
        job_id: String,
        preview_nodes: HashSet<String>,
        events: mpsc::UnboundedSender<PushEvent>,
    ) -> Self {
        Self::spawn_with_backoff(client, job_id, preview_nodes, events, reconnect_backoff())
    }

    /// Spawn the channel with a custom reconnection policy.
    pub fn spawn_with_backoff(
        client: PushClient,
        job_id: String,
        preview_nodes: HashSet<String>,
        events: mpsc::UnboundedSender<PushEvent>,
        backoff: Backoff,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let ctx = FrameContext {
            job_id,
            preview_nodes,
        };

        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            tracing::debug!(job_id = %ctx.job_id, "Starting push channel task");
            run_with_reconnect(&client, &ctx, &events, &backoff, &task_cancel, &state_tx).await
        });

        Self {
            cancel,
            state: state_rx,
            handle: Some(handle),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Wait until the task ends on its own and return its final state.
    pub async fn join(mut self) -> ChannelState {
        self.await_task().await
    }

    /// Cancel the task, wait for it to close its socket, and return the
    /// final state.
    pub async fn shutdown(mut self) -> ChannelState {
        self.cancel.cancel();
        self.await_task().await
    }

    async fn await_task(&mut self) -> ChannelState {
        let Some(handle) = self.handle.take() else {
            return self.state();
        };
        match handle.await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(error = %e, "Push channel task failed");
                ChannelState::ClosedError
            }
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
