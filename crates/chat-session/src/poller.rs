//! Periodic event-log ingestion.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ChatSession, SessionInner};

/// Handle to a running poller. Cancelling `stop` ends the loop after the
/// current ingestion.
#[derive(Debug)]
pub(crate) struct RunningPoller {
    pub(crate) stop: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

impl RunningPoller {
    /// Spawn the poll loop for a session.
    ///
    /// The first ingestion runs as soon as the task is scheduled; each later
    /// one starts `interval` after the previous ingestion returned.
    ///
    /// The task only holds a weak reference, so dropping every session handle
    /// also ends the loop.
    pub(crate) fn spawn(
        inner: &Arc<SessionInner>,
        stop: CancellationToken,
        interval: Duration,
    ) -> Self {
        let weak = Arc::downgrade(inner);
        let task = tokio::spawn(run(weak, stop.clone(), interval));
        Self { stop, task }
    }

    pub(crate) fn stop(self) {
        self.stop.cancel();
        // The loop exits on its own; nothing to wait for here.
        drop(self.task);
    }
}

/// Ingest, wait `interval`, repeat. Cycles never overlap because the next
/// wait only starts once the previous ingestion has returned.
async fn run(weak: Weak<SessionInner>, stop: CancellationToken, interval: Duration) {
    debug!(interval_ms = interval.as_millis() as u64, "event poller started");

    loop {
        if stop.is_cancelled() {
            break;
        }

        let Some(inner) = weak.upgrade() else {
            break;
        };
        let session = ChatSession { inner };
        if session.is_destroyed() {
            break;
        }
        session.poll_events().await;
        drop(session);

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    debug!("event poller stopped");
}
