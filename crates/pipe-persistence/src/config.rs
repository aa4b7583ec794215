//! Carga de configuración de conexión desde variables de entorno.
//! Usa convención `DATABASE_URL` y parámetros opcionales de pool.

use std::env;

use dotenvy::dotenv;
use once_cell::sync::Lazy;

// Carga perezosa del archivo .env una sola vez.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignora error si no existe .env
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl DbConfig {
    /// `None` si `DATABASE_URL` no está definido.
    pub fn from_env() -> Option<Self> {
        Lazy::force(&DOTENV_LOADED);
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Option<Self>
        where F: Fn(&str) -> Option<String>
    {
        let url = lookup("DATABASE_URL").filter(|u| !u.trim().is_empty())?;
        let min_connections = lookup("DATABASE_MIN_CONNECTIONS").and_then(|v| v.parse().ok()).unwrap_or(2);
        let max_connections = lookup("DATABASE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()).unwrap_or(16);
        Some(Self { url,
                    min_connections,
                    max_connections })
    }
}

/// Forzar carga temprana de .env desde aplicaciones externas si se desea.
pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}
