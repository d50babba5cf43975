//! Message sink: where incoming chat lines and connectivity changes are delivered.

use nonet_core::SessionEvent;
use tokio::sync::mpsc;

/// Receiver of session notifications (the UI side).
///
/// `deliver` is called from the registry's critical section and from per-connection
/// tasks, so it must not block and must not call back into the registry.
pub trait EventSink: Send + Sync + 'static {
    fn deliver(&self, event: SessionEvent);
}

impl EventSink for mpsc::UnboundedSender<SessionEvent> {
    fn deliver(&self, event: SessionEvent) {
        // Receiver gone means the UI has exited; nothing left to notify.
        let _ = self.send(event);
    }
}
