//! Registro de handlers de task.
//!
//! La aplicación que embebe el motor registra un `TaskHandler` por nombre de
//! task. El coordinator sólo hace `lookup`; una task sin handler se trata como
//! pass-through (se marca completada sin ejecutar nada).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::HandlerError;
use crate::model::Fields;

/// Trabajo real de una task: efectos externos y/o campos derivados.
///
/// Devuelve los campos a mergear en el documento. Puede ejecutarse más de
/// una vez para la misma task (redelivery tras expirar el lease), así que
/// conviene que sea idempotente.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, document: &Fields, document_id: &str, parent_id: Option<&str>) -> Result<Fields, HandlerError>;
}

/// Adaptador para registrar closures async como handlers.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
    where F: Fn(Fields, String, Option<String>) -> Fut + Send + Sync + 'static,
          Fut: Future<Output = Result<Fields, HandlerError>> + Send
{
    async fn execute(&self, document: &Fields, document_id: &str, parent_id: Option<&str>) -> Result<Fields, HandlerError> {
        (self.f)(document.clone(), document_id.to_string(), parent_id.map(str::to_string)).await
    }
}

#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra `handler` bajo `name`; devuelve el handler reemplazado si lo
    /// había.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> Option<Arc<dyn TaskHandler>>
        where H: TaskHandler + 'static
    {
        let name = name.into();
        let previous = self.handlers.insert(name.clone(), Arc::new(handler));
        if previous.is_some() {
            log::warn!("task handler '{name}' replaced");
        }
        previous
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Option<Arc<dyn TaskHandler>>
        where F: Fn(Fields, String, Option<String>) -> Fut + Send + Sync + 'static,
              Fut: Future<Output = Result<Fields, HandlerError>> + Send + 'static
    {
        self.register(name, FnHandler::new(f))
    }

    /// Builder-style: `TaskRegistry::new().with("a", A).with("b", B)`.
    pub fn with<H>(mut self, name: impl Into<String>, handler: H) -> Self
        where H: TaskHandler + 'static
    {
        self.register(name, handler);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry").field("handlers", &self.names()).finish()
    }
}
