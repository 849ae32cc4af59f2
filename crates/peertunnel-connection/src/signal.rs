//! One-shot close notification for peer connections

use std::sync::Arc;
use tokio::sync::watch;

/// Create a linked trigger and signal. The signal fires once `close` is
/// called on the trigger or every trigger clone is dropped.
pub fn close_signal() -> (CloseTrigger, CloseSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CloseTrigger {
            sender: Arc::new(tx),
        },
        CloseSignal { receiver: rx },
    )
}

/// Owner side of a close notification
#[derive(Debug, Clone)]
pub struct CloseTrigger {
    sender: Arc<watch::Sender<bool>>,
}

impl CloseTrigger {
    pub fn close(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.sender.borrow()
    }

    /// New subscriber for this notification
    pub fn signal(&self) -> CloseSignal {
        CloseSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Subscriber side of a close notification
#[derive(Debug, Clone)]
pub struct CloseSignal {
    receiver: watch::Receiver<bool>,
}

impl CloseSignal {
    pub fn is_closed(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves when the connection closes
    pub async fn closed(&mut self) {
        // A dropped trigger counts as closed
        let _ = self.receiver.wait_for(|closed| *closed).await;
    }
}
