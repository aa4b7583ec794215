use pipe_persistence::config::DbConfig;
use pipe_persistence::pg::{build_pool, PgPool};

/// Pool de test 1x1; `None` (y el test se salta) sin `DATABASE_URL`.
pub fn test_pool() -> Option<PgPool> {
    let Some(cfg) = DbConfig::from_env() else {
        eprintln!("skip (no DATABASE_URL)");
        return None;
    };
    match build_pool(&cfg.url, 1, 2) {
        Ok(pool) => Some(pool),
        Err(e) => {
            eprintln!("No se pudo construir pool de test: {e}");
            None
        }
    }
}

/// Colección única por test para no chocar con datos previos.
pub fn unique_collection(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}
