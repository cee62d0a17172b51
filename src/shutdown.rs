use tokio::sync::broadcast;

/// Listens for a shutdown signal from the owning handle.
#[derive(Debug)]
pub(crate) struct Shutdown {
    /// Whether the shutdown signal has been received.
    shutdown: bool,
    /// The receive half of the channel used to listen for shutdown.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Non-blocking cancellation check.
    pub(crate) fn check(&mut self) -> bool {
        use broadcast::error::TryRecvError;

        if !self.shutdown {
            match self.notify.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => self.shutdown = true,
            }
        }
        self.shutdown
    }

    pub(crate) async fn recv(&mut self) {
        // Returns immediately if the shutdown signal has already been received.
        if self.shutdown {
            return;
        }

        // Ignore "lag error" as only one value is ever sent.
        let _ = self.notify.recv().await;

        self.shutdown = true;
    }
}
