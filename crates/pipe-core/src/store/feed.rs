//! Fan-out de notificaciones de cambio sobre `tokio::sync::broadcast`.
//!
//! Un receptor lento puede perder eventos (`RecvError::Lagged`); el
//! dispatcher lo registra y sigue. Los stores publican después de confirmar
//! cada escritura.

use tokio::sync::broadcast;

use super::ChangeEvent;

#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // Sin suscriptores no es un error: nadie está escuchando todavía.
        if self.tx.send(event).is_err() {
            log::trace!("change feed has no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_FEED_CAPACITY)
    }
}
