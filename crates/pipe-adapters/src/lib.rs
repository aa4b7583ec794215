//! pipe-adapters: handlers de task genéricos.
//!
//! Los handlers reales (geocoding, verificación de email, CRM, billing) son
//! colaboradores externos. Aquí sólo hay transformaciones locales sobre los
//! campos del documento, suficientes para ejercitar el motor de punta a punta
//! y como plantilla para handlers de verdad.

pub mod handlers;

pub use handlers::{default_registry, DeriveFullName, FingerprintFields, NormalizeEmail, StaticFields};
