//! Handlers incluidos y registro por defecto.

mod derive;
mod fingerprint;
mod normalize;
mod static_fields;

pub use derive::DeriveFullName;
pub use fingerprint::FingerprintFields;
pub use normalize::NormalizeEmail;
pub use static_fields::StaticFields;

use pipe_core::{Fields, HandlerError, TaskRegistry};

/// Registry con los handlers incluidos bajo sus nombres habituales.
pub fn default_registry() -> TaskRegistry {
    TaskRegistry::new().with("normalize_email", NormalizeEmail::new("email"))
                       .with("full_name", DeriveFullName::new("first_name", "last_name", "full_name"))
                       .with("dedupe_key", FingerprintFields::new(["email"], "dedupe_key"))
}

/// Lee un campo string obligatorio.
pub(crate) fn required_str<'a>(document: &'a Fields, field: &str) -> Result<&'a str, HandlerError> {
    document.get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::msg(format!("missing string field '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_names() {
        assert_eq!(default_registry().names(), ["dedupe_key", "full_name", "normalize_email"]);
    }
}
