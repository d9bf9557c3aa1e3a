//! Reusable test doubles: scripted inference backends and plugin libraries
//! with allocation ledgers.
//!
//! These are plain implementations of the collaborator traits, useful both
//! for the crate's own tests and for downstream integration testing.

use crate::errors::PipelineError;
use crate::models::{InferenceBackend, ModelInstance};
use crate::plugin::{
    BufferId, CustomNodeExecuteResult, CustomNodeInfoResult, CustomNodeLibrary, CustomNodeParam,
    CustomNodePrecision, CustomNodeTensor, CustomNodeTensorInfo, CustomNodeTensorView,
    PluginBuffer, PluginState,
};
use crate::streams::StreamId;
use crate::tensor::{Dim, Precision, Tensor, TensorInfo, TensorInfoMap, TensorMap};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Builds an fp32 tensor from values.
///
/// # Panics
///
/// Panics when the value count does not match the shape.
#[must_use]
pub fn f32_tensor(shape: &[usize], values: &[f32]) -> Tensor {
    let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    match Tensor::new(Precision::Fp32, shape.to_vec(), data) {
        Ok(tensor) => tensor,
        Err(err) => panic!("bad test tensor: {err}"),
    }
}

/// Reads an fp32 tensor back into values.
#[must_use]
pub fn tensor_values(tensor: &Tensor) -> Vec<f32> {
    tensor
        .data()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn any_shape(rank: usize) -> Vec<Dim> {
    vec![Dim::Any; rank]
}

/// Records plugin allocations and releases so tests can assert the
/// release-exactly-once contract.
#[derive(Debug, Default)]
pub struct AllocationLedger {
    next_id: AtomicU64,
    allocated: Mutex<HashSet<BufferId>>,
    released: Mutex<HashMap<BufferId, usize>>,
}

impl AllocationLedger {
    /// Hands out a fresh allocation id.
    pub fn allocate(&self) -> BufferId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.allocated.lock().insert(id);
        id
    }

    /// Records a release.
    pub fn release(&self, id: BufferId) {
        *self.released.lock().entry(id).or_insert(0) += 1;
    }

    /// Allocations never released.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let released = self.released.lock();
        self.allocated
            .lock()
            .iter()
            .filter(|id| !released.contains_key(id))
            .count()
    }

    /// Whether any allocation was released more than once.
    #[must_use]
    pub fn double_released(&self) -> bool {
        self.released.lock().values().any(|&count| count > 1)
    }
}

/// Backend that adds a constant to one fp32 input.
///
/// Supports a per-call stagger (larger input values finish sooner) to
/// scramble branch completion order, and a scripted failure for exercising
/// error propagation.
#[derive(Debug)]
pub struct AddConstantBackend {
    constant: f32,
    input_name: String,
    output_name: String,
    inputs: TensorInfoMap,
    outputs: TensorInfoMap,
    stagger: Option<(f32, Duration)>,
    fail_on_first_value: Option<f32>,
}

impl AddConstantBackend {
    /// Creates a backend mapping `input_name` to `output_name` with
    /// `rank`-dimensional dynamic shapes.
    #[must_use]
    pub fn new(
        input_name: impl Into<String>,
        output_name: impl Into<String>,
        rank: usize,
        constant: f32,
    ) -> Self {
        let input_name = input_name.into();
        let output_name = output_name.into();
        let mut inputs = TensorInfoMap::new();
        inputs.insert(
            input_name.clone(),
            TensorInfo::with_dims(&input_name, Precision::Fp32, any_shape(rank)),
        );
        let mut outputs = TensorInfoMap::new();
        outputs.insert(
            output_name.clone(),
            TensorInfo::with_dims(&output_name, Precision::Fp32, any_shape(rank)),
        );
        Self {
            constant,
            input_name,
            output_name,
            inputs,
            outputs,
            stagger: None,
            fail_on_first_value: None,
        }
    }

    /// Delays each call by `step * (ceiling - first input value)`, so lower
    /// values finish later.
    #[must_use]
    pub fn with_stagger(mut self, ceiling: f32, step: Duration) -> Self {
        self.stagger = Some((ceiling, step));
        self
    }

    /// Fails any call whose first input value equals `value`.
    #[must_use]
    pub fn with_failure_on(mut self, value: f32) -> Self {
        self.fail_on_first_value = Some(value);
        self
    }

    /// Wraps this backend in a model instance.
    #[must_use]
    pub fn into_model(self, name: impl Into<String>, streams: usize) -> ModelInstance {
        ModelInstance::new(name, 1, Box::new(self), streams)
    }

    /// Shorthand for the common `x -> sum`, rank-2 case.
    #[must_use]
    pub fn model(name: impl Into<String>, constant: f32, streams: usize) -> ModelInstance {
        Self::new("x", "sum", 2, constant).into_model(name, streams)
    }
}

#[async_trait]
impl InferenceBackend for AddConstantBackend {
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
        let Some(input) = inputs.get(&self.input_name) else {
            return Err(PipelineError::MissingInput {
                node: "backend".to_string(),
                input: self.input_name.clone(),
            });
        };
        let values = tensor_values(input);
        let first = values.first().copied().unwrap_or_default();
        if let Some((ceiling, step)) = self.stagger {
            let factor = (ceiling - first).max(0.0) as u32;
            tokio::time::sleep(step * factor).await;
        }
        if self.fail_on_first_value == Some(first) {
            return Err(PipelineError::internal(format!(
                "scripted failure on value {first}"
            )));
        }
        let added: Vec<f32> = values.iter().map(|v| v + self.constant).collect();
        let tensor = f32_tensor(input.shape(), &added);
        let mut outputs = TensorMap::new();
        outputs.insert(self.output_name.clone(), tensor);
        Ok(outputs)
    }
}

/// Backend with fixed declared metadata; inference echoes an input under
/// every declared output name. Used by validation tests that never infer.
#[derive(Debug)]
pub struct StaticBackend {
    inputs: TensorInfoMap,
    outputs: TensorInfoMap,
}

impl StaticBackend {
    /// Creates a backend declaring the given inputs and outputs.
    #[must_use]
    pub fn new(inputs: Vec<TensorInfo>, outputs: Vec<TensorInfo>) -> Self {
        Self {
            inputs: inputs.into_iter().map(|i| (i.name.clone(), i)).collect(),
            outputs: outputs.into_iter().map(|i| (i.name.clone(), i)).collect(),
        }
    }

    /// Wraps this backend in a model instance.
    #[must_use]
    pub fn into_model(self, name: impl Into<String>, streams: usize) -> ModelInstance {
        ModelInstance::new(name, 1, Box::new(self), streams)
    }
}

#[async_trait]
impl InferenceBackend for StaticBackend {
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
        let mut names: Vec<&String> = inputs.keys().collect();
        names.sort();
        let Some(first) = names.first().and_then(|name| inputs.get(*name)) else {
            return Ok(TensorMap::new());
        };
        Ok(self
            .outputs
            .keys()
            .map(|name| (name.clone(), first.clone()))
            .collect())
    }
}

fn info_entries(ledger: &AllocationLedger, io: &[(String, usize)]) -> CustomNodeInfoResult {
    let entries: Vec<CustomNodeTensorInfo> = io
        .iter()
        .map(|(name, rank)| CustomNodeTensorInfo {
            name: Some(name.clone()),
            dims: Some(PluginBuffer::new(ledger.allocate(), vec![0; *rank])),
            precision: CustomNodePrecision::Fp32,
        })
        .collect();
    CustomNodeInfoResult {
        status: 0,
        info: Some(PluginBuffer::new(ledger.allocate(), entries)),
    }
}

/// Plugin that adds one to every fp32 input and echoes it under the same
/// name, tracking every allocation in a ledger.
#[derive(Debug)]
pub struct AddOneLibrary {
    ledger: AllocationLedger,
    io: Vec<(String, usize)>,
}

impl Default for AddOneLibrary {
    fn default() -> Self {
        Self::new(&[("x", 2)])
    }
}

impl AddOneLibrary {
    /// Creates a plugin declaring the given tensor names and ranks as both
    /// inputs and outputs.
    #[must_use]
    pub fn new(io: &[(&str, usize)]) -> Self {
        Self {
            ledger: AllocationLedger::default(),
            io: io
                .iter()
                .map(|(name, rank)| ((*name).to_string(), *rank))
                .collect(),
        }
    }

    /// Allocations the framework has not released yet.
    #[must_use]
    pub fn outstanding_allocations(&self) -> usize {
        self.ledger.outstanding()
    }

    /// Whether any buffer was released twice.
    #[must_use]
    pub fn double_released(&self) -> bool {
        self.ledger.double_released()
    }
}

impl CustomNodeLibrary for AddOneLibrary {
    fn initialize(&self, _params: &[CustomNodeParam]) -> Result<Option<PluginState>, i32> {
        Ok(None)
    }

    fn deinitialize(&self, _state: Option<&PluginState>) -> i32 {
        0
    }

    fn execute(
        &self,
        inputs: &[CustomNodeTensorView<'_>],
        _params: &[CustomNodeParam],
        _state: Option<&PluginState>,
    ) -> CustomNodeExecuteResult {
        let tensors: Vec<CustomNodeTensor> = inputs
            .iter()
            .map(|view| {
                let added: Vec<u8> = view
                    .data
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) + 1.0)
                    .flat_map(f32::to_le_bytes)
                    .collect();
                CustomNodeTensor {
                    name: Some(view.name.to_string()),
                    data_bytes: added.len() as u64,
                    data: Some(PluginBuffer::new(self.ledger.allocate(), added)),
                    dims: Some(PluginBuffer::new(self.ledger.allocate(), view.dims.to_vec())),
                    precision: view.precision,
                }
            })
            .collect();
        CustomNodeExecuteResult {
            status: 0,
            outputs: Some(PluginBuffer::new(self.ledger.allocate(), tensors)),
        }
    }

    fn inputs_info(
        &self,
        _params: &[CustomNodeParam],
        _state: Option<&PluginState>,
    ) -> CustomNodeInfoResult {
        info_entries(&self.ledger, &self.io)
    }

    fn outputs_info(
        &self,
        _params: &[CustomNodeParam],
        _state: Option<&PluginState>,
    ) -> CustomNodeInfoResult {
        info_entries(&self.ledger, &self.io)
    }

    fn release(&self, buffer: BufferId, _state: Option<&PluginState>) {
        self.ledger.release(buffer);
    }
}

/// Plugin whose execute always fails with a configured status code.
#[derive(Debug)]
pub struct FailingLibrary {
    ledger: AllocationLedger,
    status: i32,
    io: Vec<(String, usize)>,
}

impl FailingLibrary {
    /// Creates a plugin failing with `status`.
    #[must_use]
    pub fn with_status(status: i32) -> Self {
        Self {
            ledger: AllocationLedger::default(),
            status,
            io: vec![("x".to_string(), 2)],
        }
    }
}

impl CustomNodeLibrary for FailingLibrary {
    fn initialize(&self, _params: &[CustomNodeParam]) -> Result<Option<PluginState>, i32> {
        Ok(None)
    }

    fn deinitialize(&self, _state: Option<&PluginState>) -> i32 {
        0
    }

    fn execute(
        &self,
        _inputs: &[CustomNodeTensorView<'_>],
        _params: &[CustomNodeParam],
        _state: Option<&PluginState>,
    ) -> CustomNodeExecuteResult {
        // A failing plugin frees its own allocations before returning.
        CustomNodeExecuteResult {
            status: self.status,
            outputs: None,
        }
    }

    fn inputs_info(
        &self,
        _params: &[CustomNodeParam],
        _state: Option<&PluginState>,
    ) -> CustomNodeInfoResult {
        info_entries(&self.ledger, &self.io)
    }

    fn outputs_info(
        &self,
        _params: &[CustomNodeParam],
        _state: Option<&PluginState>,
    ) -> CustomNodeInfoResult {
        info_entries(&self.ledger, &self.io)
    }

    fn release(&self, buffer: BufferId, _state: Option<&PluginState>) {
        self.ledger.release(buffer);
    }
}

/// Plugin returning one valid and one malformed output tensor, for
/// exercising the visit-and-release-all contract end to end.
#[derive(Debug, Default)]
pub struct MalformedOutputLibrary {
    ledger: AllocationLedger,
}

impl MalformedOutputLibrary {
    /// Allocations the framework has not released yet.
    #[must_use]
    pub fn outstanding_allocations(&self) -> usize {
        self.ledger.outstanding()
    }

    /// Whether any buffer was released twice.
    #[must_use]
    pub fn double_released(&self) -> bool {
        self.ledger.double_released()
    }
}

impl CustomNodeLibrary for MalformedOutputLibrary {
    fn initialize(&self, _params: &[CustomNodeParam]) -> Result<Option<PluginState>, i32> {
        Ok(None)
    }

    fn deinitialize(&self, _state: Option<&PluginState>) -> i32 {
        0
    }

    fn execute(
        &self,
        _inputs: &[CustomNodeTensorView<'_>],
        _params: &[CustomNodeParam],
        _state: Option<&PluginState>,
    ) -> CustomNodeExecuteResult {
        let good = CustomNodeTensor {
            name: Some("good".to_string()),
            data: Some(PluginBuffer::new(self.ledger.allocate(), vec![0u8; 4])),
            data_bytes: 4,
            dims: Some(PluginBuffer::new(self.ledger.allocate(), vec![1, 1])),
            precision: CustomNodePrecision::Fp32,
        };
        let bad = CustomNodeTensor {
            name: Some("bad".to_string()),
            data: Some(PluginBuffer::new(self.ledger.allocate(), vec![0u8; 4])),
            data_bytes: 4,
            dims: Some(PluginBuffer::new(self.ledger.allocate(), vec![1, 1])),
            precision: CustomNodePrecision::Unspecified,
        };
        CustomNodeExecuteResult {
            status: 0,
            outputs: Some(PluginBuffer::new(self.ledger.allocate(), vec![good, bad])),
        }
    }

    fn inputs_info(
        &self,
        _params: &[CustomNodeParam],
        _state: Option<&PluginState>,
    ) -> CustomNodeInfoResult {
        info_entries(&self.ledger, &[("x".to_string(), 2)])
    }

    fn outputs_info(
        &self,
        _params: &[CustomNodeParam],
        _state: Option<&PluginState>,
    ) -> CustomNodeInfoResult {
        info_entries(
            &self.ledger,
            &[("good".to_string(), 2), ("bad".to_string(), 2)],
        )
    }

    fn release(&self, buffer: BufferId, _state: Option<&PluginState>) {
        self.ledger.release(buffer);
    }
}
