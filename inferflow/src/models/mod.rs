//! Model collaborators: the inference backend trait, per-model instances,
//! and the registry pipelines resolve models through.
//!
//! Model loading and compilation are outside this crate; the engine treats
//! "run inference on this stream" as an opaque call behind
//! [`InferenceBackend`]. The registry is an explicitly passed object, never
//! process-global state, so pipeline execution stays a pure function of
//! (definition, registry, request).

use crate::errors::PipelineError;
use crate::streams::{StreamId, StreamPool};
use crate::tensor::{TensorInfoMap, TensorMap};
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::info;

/// Opaque inference executor for one compiled model.
///
/// `stream_id` selects which of the model's pre-created execution contexts
/// the call runs on; the engine guarantees at most one concurrent call per
/// stream id.
#[async_trait]
pub trait InferenceBackend: Send + Sync + Debug {
    /// Declared inputs of the compiled model.
    fn inputs_info(&self) -> &TensorInfoMap;

    /// Declared outputs of the compiled model.
    fn outputs_info(&self) -> &TensorInfoMap;

    /// Runs inference on the given stream and returns the output tensors by
    /// their real model names.
    async fn infer(
        &self,
        stream_id: StreamId,
        inputs: &TensorMap,
    ) -> Result<TensorMap, PipelineError>;
}

/// One servable model: a compiled backend plus its bounded stream pool.
#[derive(Debug)]
pub struct ModelInstance {
    name: String,
    version: u64,
    backend: Box<dyn InferenceBackend>,
    streams: Arc<StreamPool>,
}

impl ModelInstance {
    /// Creates a model instance with `stream_count` parallel streams.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        version: u64,
        backend: Box<dyn InferenceBackend>,
        stream_count: usize,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            backend,
            streams: Arc::new(StreamPool::new(stream_count)),
        }
    }

    /// Model name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Model version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The model's stream pool.
    #[must_use]
    pub fn streams(&self) -> Arc<StreamPool> {
        Arc::clone(&self.streams)
    }

    /// Declared inputs of the model.
    #[must_use]
    pub fn inputs_info(&self) -> &TensorInfoMap {
        self.backend.inputs_info()
    }

    /// Declared outputs of the model.
    #[must_use]
    pub fn outputs_info(&self) -> &TensorInfoMap {
        self.backend.outputs_info()
    }

    /// Runs inference on the given stream.
    pub async fn infer(
        &self,
        stream_id: StreamId,
        inputs: &TensorMap,
    ) -> Result<TensorMap, PipelineError> {
        self.backend.infer(stream_id, inputs).await
    }
}

/// Registry of live model instances, shared by concurrent pipelines.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: DashMap<String, Arc<ModelInstance>>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model under its name, replacing any previous instance.
    pub fn register(&self, model: ModelInstance) -> Option<Arc<ModelInstance>> {
        let name = model.name().to_string();
        info!(model = %name, version = model.version(), "registering model");
        self.models.insert(name, Arc::new(model))
    }

    /// Looks up a model by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ModelInstance>> {
        self.models.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a model, returning the retired instance.
    pub fn remove(&self, name: &str) -> Option<Arc<ModelInstance>> {
        info!(model = name, "retiring model");
        self.models.remove(name).map(|(_, model)| model)
    }

    /// Whether a model with that name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Precision, TensorInfo};

    #[derive(Debug)]
    struct NullBackend {
        inputs: TensorInfoMap,
        outputs: TensorInfoMap,
    }

    #[async_trait]
    impl InferenceBackend for NullBackend {
        fn inputs_info(&self) -> &TensorInfoMap {
            &self.inputs
        }

        fn outputs_info(&self) -> &TensorInfoMap {
            &self.outputs
        }

        async fn infer(
            &self,
            _stream_id: StreamId,
            inputs: &TensorMap,
        ) -> Result<TensorMap, PipelineError> {
            Ok(inputs.clone())
        }
    }

    fn model(name: &str) -> ModelInstance {
        let mut inputs = TensorInfoMap::new();
        inputs.insert(
            "in".to_string(),
            TensorInfo::new("in", Precision::Fp32, &[1, 4]),
        );
        ModelInstance::new(
            name,
            1,
            Box::new(NullBackend {
                inputs,
                outputs: TensorInfoMap::new(),
            }),
            2,
        )
    }

    #[test]
    fn test_registry_lookup_and_retire() {
        let registry = ModelRegistry::new();
        registry.register(model("resnet"));
        assert!(registry.contains("resnet"));
        assert_eq!(registry.get("resnet").unwrap().version(), 1);

        registry.remove("resnet");
        assert!(registry.get("resnet").is_none());
    }

    #[test]
    fn test_reregistering_replaces_instance() {
        let registry = ModelRegistry::new();
        registry.register(model("resnet"));
        let mut replacement = model("resnet");
        replacement.version = 2;
        let previous = registry.register(replacement);
        assert_eq!(previous.unwrap().version(), 1);
        assert_eq!(registry.get("resnet").unwrap().version(), 2);
    }

    #[test]
    fn test_model_exposes_stream_pool() {
        let instance = model("resnet");
        assert_eq!(instance.streams().size(), 2);
        assert_eq!(instance.inputs_info().len(), 1);
    }
}
