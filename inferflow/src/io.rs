//! Request and response handoff structures.
//!
//! Conversion from wire formats into tensors (and back) belongs to the
//! serving frontends; the engine only ever sees these two shapes.

use crate::tensor::{Tensor, TensorMap};

/// External inputs of one pipeline run, keyed by the entry node's declared
/// input names.
#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    /// Request tensors by name.
    pub inputs: TensorMap,
}

impl InferenceRequest {
    /// Creates an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an input tensor.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.inputs.insert(name.into(), tensor);
        self
    }
}

/// Final outputs of one pipeline run, populated by the exit node.
#[derive(Debug, Clone, Default)]
pub struct InferenceResponse {
    /// Response tensors by name.
    pub outputs: TensorMap,
}
