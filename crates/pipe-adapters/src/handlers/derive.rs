use async_trait::async_trait;
use pipe_core::{Fields, HandlerError, TaskHandler};
use serde_json::Value;

/// Concatena nombre y apellido en un campo derivado. Las partes ausentes se
/// omiten; si no hay ninguna no escribe nada.
#[derive(Debug, Clone)]
pub struct DeriveFullName {
    first: String,
    last: String,
    target: String,
}

impl DeriveFullName {
    pub fn new(first: impl Into<String>, last: impl Into<String>, target: impl Into<String>) -> Self {
        Self { first: first.into(),
               last: last.into(),
               target: target.into() }
    }
}

#[async_trait]
impl TaskHandler for DeriveFullName {
    async fn execute(&self, document: &Fields, _document_id: &str, _parent_id: Option<&str>) -> Result<Fields, HandlerError> {
        let parts: Vec<&str> = [&self.first, &self.last].iter()
                                                        .filter_map(|f| document.get(f.as_str()).and_then(Value::as_str))
                                                        .map(str::trim)
                                                        .filter(|s| !s.is_empty())
                                                        .collect();
        let mut out = Fields::new();
        if !parts.is_empty() {
            out.insert(self.target.clone(), Value::String(parts.join(" ")));
        }
        Ok(out)
    }
}
