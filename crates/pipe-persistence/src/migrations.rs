//! Wrapper para correr migraciones embebidas.
//!
//! Las migraciones Diesel viven en `migrations/` dentro de este crate. Al
//! construir el pool se ejecutan una vez.

use diesel::pg::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::PersistenceError;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub fn run_pending_migrations(conn: &mut PgConnection) -> Result<(), PersistenceError> {
    conn.run_pending_migrations(MIGRATIONS)
        .map(|applied| {
            if !applied.is_empty() {
                log::info!("applied {} migrations", applied.len());
            }
        })
        .map_err(|e| PersistenceError::Unknown(format!("migration error: {e}")))
}
