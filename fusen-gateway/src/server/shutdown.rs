use tokio::sync::broadcast;

/// Listens for the server shutdown broadcast.
#[derive(Debug)]
pub struct Shutdown {
    shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Completes once shutdown is broadcast or every sender is gone.
    pub async fn recv(&mut self) {
        if self.is_shutdown() {
            return;
        }
        let _ = self.notify.recv().await;
        self.shutdown = true;
    }
}
