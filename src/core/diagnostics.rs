/// Shared error sink
///
/// Background tasks report failures here instead of returning them. Every report
/// is logged; if a dashboard holds the receiving end it also gets the error to
/// raise its error indicator. Reporting never fails.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::error;

use crate::core::error::DockerError;

#[derive(Clone, Debug)]
pub struct Diagnostics {
    tx: Option<UnboundedSender<DockerError>>,
}

impl Diagnostics {
    /// Sink paired with a receiver for the presentation layer
    pub fn channel() -> (Self, UnboundedReceiver<DockerError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that only logs
    pub fn log_only() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, err: DockerError) {
        error!(error = %err, "docker error");
        if let Some(tx) = &self.tx {
            // receiver may already be gone during shutdown
            let _ = tx.send(err);
        }
    }
}
