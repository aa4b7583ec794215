//! Merge de campos de documento.
//!
//! Semántica "shallow": las claves del patch reemplazan a las del documento;
//! los objetos anidados se sustituyen completos. Es el contrato de
//! `merge_write` en todos los stores.

use crate::constants::RESERVED_FIELDS;
use crate::model::Fields;

/// Aplica `patch` sobre `base` en sitio.
pub fn merge_fields(base: &mut Fields, patch: Fields) {
    for (k, v) in patch {
        base.insert(k, v);
    }
}

/// Elimina del output de un handler los campos que sólo escribe el motor.
/// Devuelve las claves descartadas.
pub fn strip_reserved(fields: &mut Fields) -> Vec<String> {
    RESERVED_FIELDS.iter()
                   .filter_map(|k| fields.remove(*k).map(|_| k.to_string()))
                   .collect()
}
