use async_trait::async_trait;
use pipe_core::{Fields, HandlerError, TaskHandler};

/// Escribe siempre los mismos campos (marcas tipo `"crm_synced": true`).
#[derive(Debug, Clone, Default)]
pub struct StaticFields(pub Fields);

#[async_trait]
impl TaskHandler for StaticFields {
    async fn execute(&self, _document: &Fields, _document_id: &str, _parent_id: Option<&str>) -> Result<Fields, HandlerError> {
        Ok(self.0.clone())
    }
}
