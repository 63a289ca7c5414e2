use std::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    Initializing,
    ResetAndRecover,
    ScanningForProfile,
    Flashing,
    Succeeded,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    State(FlashState),
    Status {
        text: String,
        sub_text: Option<String>,
    },
    Progress {
        done: usize,
        total: usize,
    },
    AttemptFailed {
        attempt: usize,
        reason: String,
    },
    /// The phone did not come back after a reset. Only the operator can get
    /// out of this, the engine waits for as long as it takes.
    ManualResetRequired {
        message: String,
        sub_message: String,
    },
}

pub trait ProgressObserver: Send {
    /// Called from the flashing thread, must return quickly.
    fn publish(&self, event: FlashEvent);
}

impl ProgressObserver for mpsc::Sender<FlashEvent> {
    fn publish(&self, event: FlashEvent) {
        // Nobody listening is fine
        let _ = self.send(event);
    }
}

/// Drops every event.
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn publish(&self, _event: FlashEvent) {}
}
