// src/engine/control.rs

//! Control surface for UI/CLI layers: request a global abort, watch progress.

use std::sync::Arc;

use tokio::sync::watch;

use crate::engine::core::Progress;

/// Handle held by the outside world. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExecutionControl {
    abort_tx: Arc<watch::Sender<bool>>,
    progress_rx: watch::Receiver<Progress>,
}

/// The runtime's end of the control channel.
#[derive(Debug)]
pub struct ControlReceiver {
    abort_rx: watch::Receiver<bool>,
    progress_tx: watch::Sender<Progress>,
}

pub fn control_channel() -> (ExecutionControl, ControlReceiver) {
    let (abort_tx, abort_rx) = watch::channel(false);
    let (progress_tx, progress_rx) = watch::channel(Progress::default());
    (
        ExecutionControl {
            abort_tx: Arc::new(abort_tx),
            progress_rx,
        },
        ControlReceiver {
            abort_rx,
            progress_tx,
        },
    )
}

impl ExecutionControl {
    /// Ask the runtime to abort. Idempotent.
    pub fn request_abort(&self) {
        self.abort_tx.send_replace(true);
    }

    pub fn is_abort_requested(&self) -> bool {
        *self.abort_tx.borrow()
    }

    /// Latest published counts by status.
    pub fn progress(&self) -> Progress {
        *self.progress_rx.borrow()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.progress_rx.clone()
    }
}

impl ControlReceiver {
    pub fn is_abort_requested(&self) -> bool {
        *self.abort_rx.borrow()
    }

    /// Resolves when an abort is requested. Never resolves if every
    /// [`ExecutionControl`] has been dropped without requesting one.
    pub async fn aborted(&mut self) {
        if self.abort_rx.wait_for(|abort| *abort).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn publish(&self, progress: Progress) {
        self.progress_tx.send_if_modified(|current| {
            if *current == progress {
                false
            } else {
                *current = progress;
                true
            }
        });
    }
}
