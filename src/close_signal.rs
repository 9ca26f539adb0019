use tokio::sync::broadcast;

/// Listens for the connection close signal.
///
/// The signal is a `broadcast` channel carrying a single value: once it is
/// sent, the background response reader must stop. `CloseSignal` wraps the
/// receiving end and remembers whether the signal has already been seen, so
/// `recv` returns immediately on later calls.
#[derive(Debug)]
pub(crate) struct CloseSignal {
    /// `true` once the signal has been received.
    closed: bool,

    /// Receiving end of the channel used to announce the close.
    notify: broadcast::Receiver<()>,
}

impl CloseSignal {
    /// Creates a new `CloseSignal` backed by the given receiver.
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> CloseSignal {
        CloseSignal {
            closed: false,
            notify,
        }
    }

    /// Waits for the close signal, returning immediately if it was already
    /// received.
    pub(crate) async fn recv(&mut self) {
        if self.closed {
            return;
        }

        // Only one value is ever sent, so a lag error cannot be received.
        let _ = self.notify.recv().await;

        self.closed = true;
    }
}
