//! Progress reporting decoupled from the transfer loop.
//!
//! One observer may be registered per session, before the transfer is
//! invoked. Emission is best-effort: events fire only while the session is
//! in progress, observer panics are swallowed, and a failed delivery never
//! fails the transfer.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::session::SessionShared;

/// Periodic progress notification for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Whether the total size of the transfer is known in advance.
    pub length_computable: bool,
    /// Cumulative bytes transferred; non-decreasing within a session.
    pub loaded: u64,
    /// Expected total bytes; 0 and meaningless when not length-computable.
    pub total: u64,
}

impl ProgressEvent {
    pub(crate) fn new(loaded: u64, total: Option<u64>) -> Self {
        Self {
            length_computable: total.is_some(),
            loaded,
            total: total.unwrap_or(0),
        }
    }
}

/// Observer invoked at each chunk boundary while a session is in progress.
/// Keep it cheap; it runs on the transfer task.
pub type ProgressObserver = Arc<dyn Fn(ProgressEvent) + Send + Sync + 'static>;

/// Builds an observer that forwards events into an unbounded channel, so
/// consumers on another task never delay the streaming loop.
pub fn progress_channel() -> (ProgressObserver, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let observer: ProgressObserver = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (observer, rx)
}

/// Per-session emitter. Tracks cumulative bytes and suppresses delivery
/// once the session has reached a terminal state.
pub(crate) struct ProgressEmitter {
    observer: Option<ProgressObserver>,
    shared: Arc<SessionShared>,
    loaded: AtomicU64,
}

impl ProgressEmitter {
    pub(crate) fn new(observer: Option<ProgressObserver>, shared: Arc<SessionShared>) -> Self {
        Self {
            observer,
            shared,
            loaded: AtomicU64::new(0),
        }
    }

    /// Records `bytes` more transferred and notifies the observer.
    pub(crate) fn add(&self, bytes: u64, total: Option<u64>) {
        let loaded = self.loaded.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.emit(ProgressEvent::new(loaded, total));
    }

    pub(crate) fn loaded(&self) -> u64 {
        self.loaded.load(Ordering::Relaxed)
    }

    fn emit(&self, event: ProgressEvent) {
        let Some(observer) = &self.observer else {
            return;
        };
        if !self.shared.is_in_progress() {
            return;
        }
        let observer = Arc::clone(observer);
        if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
            tracing::warn!(loaded = event.loaded, "progress observer panicked; event dropped");
        }
    }
}
