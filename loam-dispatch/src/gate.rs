use std::sync::Arc;

use tokio::sync::watch;

/// Flag closed while a promotion is in progress. Transport workers only
/// dispatch while it is open.
#[derive(Debug, Clone)]
pub struct WriteGate {
    tx: Arc<watch::Sender<bool>>,
}

impl WriteGate {
    pub fn new(open: bool) -> Self {
        let (tx, _) = watch::channel(open);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        if !self.tx.send_replace(true) {
            tracing::info!("write gate opened");
        }
    }

    pub fn close(&self) {
        if self.tx.send_replace(false) {
            tracing::warn!("write gate closed");
        }
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for WriteGate {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Wait until the gate is open. Returns false once the gate was dropped.
pub async fn wait_open(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|open| *open).await.is_ok()
}
