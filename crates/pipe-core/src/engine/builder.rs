//! Builder para `PipelineCoordinator`.
//!
//! Todas las dependencias (store, registry, catálogo, settings) se inyectan
//! explícitamente al arrancar. Lo único obligatorio es el store; el resto
//! tiene defaults vacíos (sin handlers todas las tasks son pass-through).
//!
//! ```ignore
//! let coordinator = PipelineCoordinator::builder(Arc::new(store))
//!     .settings(EngineSettings::from_env())
//!     .catalog(PipelineCatalog::from_path("pipelines.json")?)
//!     .handler("normalize_email", NormalizeEmail::new("email"))
//!     .build();
//! ```

use std::sync::Arc;

use crate::config::{EngineSettings, PipelineCatalog};
use crate::engine::PipelineCoordinator;
use crate::registry::{TaskHandler, TaskRegistry};
use crate::store::DocumentStore;
use crate::template::StageConfig;

#[derive(Debug)]
pub struct CoordinatorBuilder<S: DocumentStore> {
    store: Arc<S>,
    registry: TaskRegistry,
    catalog: PipelineCatalog,
    settings: EngineSettings,
}

impl<S: DocumentStore> CoordinatorBuilder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store,
               registry: TaskRegistry::new(),
               catalog: PipelineCatalog::new(),
               settings: EngineSettings::default() }
    }

    /// Reemplaza el registry completo.
    pub fn registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Registra un handler adicional.
    pub fn handler<H>(mut self, name: impl Into<String>, handler: H) -> Self
        where H: TaskHandler + 'static
    {
        self.registry.register(name, handler);
        self
    }

    /// Reemplaza el catálogo completo.
    pub fn catalog(mut self, catalog: PipelineCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Añade la configuración de stages de una colección.
    pub fn pipeline(mut self, collection: impl Into<String>, stages: StageConfig) -> Self {
        self.catalog.insert(collection, stages);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    #[inline]
    pub fn build(self) -> PipelineCoordinator<S> {
        if self.catalog.collections().next().is_none() {
            log::warn!("coordinator built with an empty pipeline catalog");
        }
        let unhandled = unhandled_tasks(&self.catalog, &self.registry);
        if !unhandled.is_empty() {
            log::info!("tasks without handler pass through: {unhandled:?}");
        }
        PipelineCoordinator::from_parts(self.store, self.registry, self.catalog, self.settings)
    }
}

/// Tasks del catálogo sin handler registrado, en orden de configuración.
pub(crate) fn unhandled_tasks(catalog: &PipelineCatalog, registry: &TaskRegistry) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for collection in catalog.collections() {
        let Some(stages) = catalog.stages_for(collection) else { continue };
        for task in stages.values().flatten() {
            if !registry.contains(task) && !out.contains(task) {
                out.push(task.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::stage_config;
    use crate::errors::HandlerError;
    use crate::model::Fields;
    use crate::registry::FnHandler;
    use crate::store::InMemoryDocumentStore;

    #[test]
    fn builder_wires_settings_and_catalog() {
        let settings = EngineSettings { lease_duration: chrono::Duration::seconds(5),
                                        ..EngineSettings::default() };
        let coord = PipelineCoordinator::builder(Arc::new(InMemoryDocumentStore::new()))
            .settings(settings.clone())
            .pipeline("signups", stage_config([("validate", &["a"][..])]))
            .build();
        assert_eq!(coord.settings(), &settings);
        assert!(coord.catalog().stages_for("signups").is_some());
        assert!(coord.registry().is_empty());
    }

    #[test]
    fn handlers_added_one_by_one_are_registered() {
        let coord = PipelineCoordinator::builder(Arc::new(InMemoryDocumentStore::new()))
            .handler("a",
                     FnHandler::new(|_: Fields, _: String, _: Option<String>| async {
                         Ok::<_, HandlerError>(Fields::new())
                     }))
            .pipeline("signups", stage_config([("validate", &["a", "b"][..]), ("load", &["c", "b"][..])]))
            .build();
        assert!(coord.registry().contains("a"));
        assert!(!coord.registry().contains("b"));
        assert_eq!(unhandled_tasks(coord.catalog(), coord.registry()), ["b", "c"]);
    }
}
