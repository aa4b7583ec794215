use async_trait::async_trait;
use pipe_core::{Fields, HandlerError, TaskHandler};
use serde_json::Value;

use super::required_str;

/// Normaliza un email (trim + minúsculas) y rechaza valores sin `@`.
#[derive(Debug, Clone)]
pub struct NormalizeEmail {
    field: String,
}

impl NormalizeEmail {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }

    pub fn normalize(raw: &str) -> Result<String, HandlerError> {
        let email = raw.trim().to_lowercase();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
            _ => Err(HandlerError::msg(format!("invalid email '{raw}'"))),
        }
    }
}

#[async_trait]
impl TaskHandler for NormalizeEmail {
    async fn execute(&self, document: &Fields, document_id: &str, _parent_id: Option<&str>) -> Result<Fields, HandlerError> {
        let email = Self::normalize(required_str(document, &self.field)?)?;
        log::debug!("{document_id}: normalized {}", self.field);
        let mut out = Fields::new();
        out.insert(self.field.clone(), Value::String(email));
        Ok(out)
    }
}
