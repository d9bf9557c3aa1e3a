//! Registry of pipeline definitions.

use super::definition::{Connections, NodeInfo, PipelineDefinition};
use super::status::DefinitionStateCode;
use super::Pipeline;
use crate::errors::{PipelineError, ValidationError};
use crate::io::InferenceRequest;
use crate::models::ModelRegistry;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Owns named pipeline definitions and fans model-change notifications out
/// to the ones they affect.
///
/// Explicitly passed wherever needed; the engine keeps no process-global
/// registries.
#[derive(Debug, Default)]
pub struct PipelineFactory {
    definitions: RwLock<HashMap<String, Arc<Mutex<PipelineDefinition>>>>,
}

impl PipelineFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines and validates a new pipeline.
    ///
    /// A definition that fails validation is still registered, in its
    /// unavailable state, so a later reload can correct it.
    pub fn create_definition(
        &self,
        name: impl Into<String>,
        nodes: Vec<NodeInfo>,
        connections: Connections,
        registry: &ModelRegistry,
    ) -> Result<(), ValidationError> {
        let name = name.into();
        info!(definition = %name, "creating pipeline definition");
        let mut definition = PipelineDefinition::new(&name, nodes, connections);
        let result = definition.validate(registry);
        self.definitions
            .write()
            .insert(name, Arc::new(Mutex::new(definition)));
        result
    }

    /// Replaces an existing definition's graph and revalidates it.
    pub fn reload_definition(
        &self,
        name: &str,
        nodes: Vec<NodeInfo>,
        connections: Connections,
        registry: &ModelRegistry,
    ) -> Result<(), PipelineError> {
        let definition = self.definition(name)?;
        let mut definition = definition.lock();
        definition
            .reload(nodes, connections, registry)
            .map_err(PipelineError::from)
    }

    /// Removes a definition from service.
    pub fn retire_definition(&self, name: &str) -> Result<(), PipelineError> {
        let definition = self.definition(name)?;
        definition.lock().retire();
        Ok(())
    }

    /// The lifecycle state of a definition, if it exists.
    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<DefinitionStateCode> {
        self.definitions
            .read()
            .get(name)
            .map(|definition| definition.lock().state_code())
    }

    /// Instantiates a pipeline for one request.
    pub fn create_pipeline(
        &self,
        name: &str,
        registry: &Arc<ModelRegistry>,
        request: InferenceRequest,
    ) -> Result<Pipeline, PipelineError> {
        let definition = self.definition(name)?;
        let definition = definition.lock();
        definition.create_pipeline(registry, request)
    }

    /// Marks every definition referencing `model` as requiring
    /// revalidation.
    ///
    /// Called by the owner when a model is reloaded or retired; in-flight
    /// pipelines are unaffected, new instantiations are blocked until
    /// [`revalidate_affected`](Self::revalidate_affected) runs.
    pub fn on_model_changed(&self, model: &str) {
        for definition in self.definitions.read().values() {
            let mut definition = definition.lock();
            if definition.references_model(model) {
                debug!(
                    definition = %definition.name(),
                    model,
                    "used model changed"
                );
                definition.notify_used_model_changed();
            }
        }
    }

    /// Revalidates every definition flagged by a model change.
    pub fn revalidate_affected(&self, registry: &ModelRegistry) {
        for definition in self.definitions.read().values() {
            let mut definition = definition.lock();
            if definition.requires_revalidation() {
                // Result lands in the definition's state; callers observe it
                // through state_of.
                let _ = definition.validate(registry);
            }
        }
    }

    fn definition(&self, name: &str) -> Result<Arc<Mutex<PipelineDefinition>>, PipelineError> {
        self.definitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::DefinitionMissing {
                name: name.to_string(),
            })
    }
}
