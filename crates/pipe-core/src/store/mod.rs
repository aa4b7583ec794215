//! Document store: contrato que el motor necesita del almacenamiento
//! (lectura, merge-write, transacciones y notificaciones de cambio) y una
//! implementación en memoria.

mod clock;
mod feed;
mod memory;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use feed::ChangeFeed;
pub use memory::InMemoryDocumentStore;
pub use types::{ChangeEvent, DocumentStore, Transaction};
