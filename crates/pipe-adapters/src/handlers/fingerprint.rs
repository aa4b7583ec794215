//! Clave de deduplicación: SHA-256 sobre un subconjunto de campos.

use async_trait::async_trait;
use pipe_core::{Fields, HandlerError, TaskHandler};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct FingerprintFields {
    fields: Vec<String>,
    target: String,
}

impl FingerprintFields {
    pub fn new<I, S>(fields: I, target: impl Into<String>) -> Self
        where I: IntoIterator<Item = S>,
              S: Into<String>
    {
        Self { fields: fields.into_iter().map(Into::into).collect(),
               target: target.into() }
    }

    /// Hash hex estable: cada campo se serializa como `nombre=json\n` en el
    /// orden configurado; los ausentes cuentan como `null`.
    pub fn fingerprint(&self, document: &Fields) -> String {
        let mut hasher = Sha256::new();
        for field in &self.fields {
            let value = document.get(field).unwrap_or(&Value::Null);
            hasher.update(field.as_bytes());
            hasher.update(b"=");
            hasher.update(value.to_string().as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[async_trait]
impl TaskHandler for FingerprintFields {
    async fn execute(&self, document: &Fields, _document_id: &str, _parent_id: Option<&str>) -> Result<Fields, HandlerError> {
        if self.fields.iter().all(|f| document.get(f).map_or(true, Value::is_null)) {
            return Err(HandlerError::msg(format!("none of {:?} present", self.fields)));
        }
        let mut out = Fields::new();
        out.insert(self.target.clone(), Value::String(self.fingerprint(document)));
        Ok(out)
    }
}
