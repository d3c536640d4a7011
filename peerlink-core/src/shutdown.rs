use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A struct which can be used to shut down a session.
/// You can create multiple connected shutdowns by cloning.
///
/// Unlike a bare channel, a shutdown remembers that it fired, so tasks that
/// start waiting after the fact still observe it.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// This channel tells every waiter that the session is going away.
    notify: broadcast::Sender<StopReason>,
    /// The reason given to the first shutdown request, if any.
    status: Arc<RwLock<Option<StopReason>>>,
}

impl Shutdown {
    /// Creates a new active shutdown.
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            notify,
            status: Default::default(),
        }
    }

    /// Sends `StopReason::Stopped` to all `Shutdown`s cloned from this one.
    pub fn shut_down(&self) {
        self.shut_down_with(StopReason::Stopped)
    }

    /// Sends `reason` to all `Shutdown`s cloned from this one. Only the first
    /// request has an effect.
    pub fn shut_down_with(&self, reason: StopReason) {
        {
            let mut status = self.status.write();
            if status.is_some() {
                return;
            }
            *status = Some(reason);
        }
        if self.notify.send(reason).is_err() {
            tracing::debug!("Shut down with no tasks waiting: {:?}", reason);
        }
    }

    /// Whether a shutdown has been requested.
    pub fn is_shut_down(&self) -> bool {
        self.status.read().is_some()
    }

    /// Waits to receive a shutdown reason.
    pub async fn wait_for_shutdown(&self) -> StopReason {
        use tokio::sync::broadcast::error::RecvError;

        // Subscribe before checking the status so a concurrent request is
        // never missed.
        let mut recv = self.notify.subscribe();
        if let Some(reason) = *self.status.read() {
            return reason;
        }

        loop {
            match recv.recv().await {
                Ok(reason) => return reason,
                Err(RecvError::Closed) => return StopReason::Stopped,
                Err(RecvError::Lagged(_)) => (),
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a session went away.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StopReason {
    /// The session was stopped for good.
    Stopped,
    /// The session was torn down so a fresh one could replace it.
    Restarted,
}
