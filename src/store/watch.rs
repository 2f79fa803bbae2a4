//! Live watch streams handed out by a [`StateStore`](super::StateStore)

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event::ChangeEvent;

/// Bound on events queued for a single watcher before the store gives up on it
pub const WATCH_QUEUE_CAPACITY: usize = 100;

/// Why a watch stream stopped yielding events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTermination {
    /// The holder of the stream asked for it to stop
    Cancelled,
    /// The store side went away (connection loss, outage, slow consumer)
    Disconnected,
}

/// A live sequence of change events for one key or key prefix
///
/// Yields events in store-commit order until either the cancel token fires
/// or the store drops its sending half. [`WatchStream::termination`] tells
/// the two apart once [`WatchStream::next`] has returned `None`.
pub struct WatchStream {
    events: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
}

impl WatchStream {
    /// Create a bounded stream plus the sender the store feeds it through
    pub fn channel(cancel: CancellationToken) -> (mpsc::Sender<ChangeEvent>, WatchStream) {
        let (tx, rx) = mpsc::channel(WATCH_QUEUE_CAPACITY);
        (tx, WatchStream { events: rx, cancel })
    }

    /// Wait for the next event; `None` once the watch has ended
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.events.close();
                None
            }
            event = self.events.recv() => event,
        }
    }

    /// Stop the watch. The stream yields `None` from now on.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this watch when triggered
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn termination(&self) -> WatchTermination {
        if self.cancel.is_cancelled() {
            WatchTermination::Cancelled
        } else {
            WatchTermination::Disconnected
        }
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
