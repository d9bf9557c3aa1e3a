//! Custom node plugin contract.
//!
//! A plugin is a natively loaded compute stage exposing five operations:
//! initialize, deinitialize, execute, inputs-info, and outputs-info queries,
//! plus a buffer release function. The contract is expressed here as a
//! capability trait; how a host process loads the implementation (typically
//! through its platform's dynamic-library API) is outside this crate, but
//! the in-process ownership rules are binding regardless:
//!
//! - input tensors are borrowed views into framework buffers; a plugin must
//!   not retain them past the call (enforced by lifetimes),
//! - on a non-zero execute status the plugin frees everything it allocated
//!   and the framework performs no cleanup,
//! - on a zero status, ownership of the output array and each tensor's data
//!   and dims buffers transfers to the framework, which must return every
//!   buffer through [`CustomNodeLibrary::release`] exactly once — never
//!   through a generic allocator, because the plugin may use its own.

mod convert;

pub use convert::{
    build_owned_dims, build_parameters, build_tensor_views, convert_outputs,
    convert_tensor_infos,
};

use crate::tensor::Precision;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// Identifier of one plugin-owned allocation.
///
/// Stands in for the raw pointer of the native ABI; the plugin maps ids to
/// its own allocations and frees them when they are released.
pub type BufferId = u64;

/// Opaque per-node plugin state returned by `initialize`.
pub type PluginState = Arc<dyn Any + Send + Sync>;

/// A plugin-owned buffer whose ownership has transferred to the framework.
///
/// The contained data may be consumed freely, but `id` must still be handed
/// back through the owning plugin's release function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginBuffer<T> {
    /// Allocation id to release through the plugin.
    pub id: BufferId,
    /// Buffer contents.
    pub data: Vec<T>,
}

impl<T> PluginBuffer<T> {
    /// Creates a buffer with an allocation id.
    #[must_use]
    pub fn new(id: BufferId, data: Vec<T>) -> Self {
        Self { id, data }
    }
}

/// Precision tag of the plugin ABI.
///
/// `Unspecified` models a tag value the framework does not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CustomNodePrecision {
    /// 32-bit IEEE float.
    Fp32,
    /// 64-bit IEEE float.
    Fp64,
    /// 16-bit IEEE float.
    Fp16,
    /// Signed 64-bit integer.
    I64,
    /// Signed 32-bit integer.
    I32,
    /// Signed 16-bit integer.
    I16,
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 8-bit integer.
    U8,
    /// Unrecognized precision tag.
    Unspecified,
}

impl From<Precision> for CustomNodePrecision {
    fn from(precision: Precision) -> Self {
        match precision {
            Precision::Fp32 => Self::Fp32,
            Precision::Fp64 => Self::Fp64,
            Precision::Fp16 => Self::Fp16,
            Precision::I64 => Self::I64,
            Precision::I32 => Self::I32,
            Precision::I16 => Self::I16,
            Precision::I8 => Self::I8,
            Precision::U16 => Self::U16,
            Precision::U8 => Self::U8,
        }
    }
}

impl CustomNodePrecision {
    /// Converts to the engine precision, or `None` for unrecognized tags.
    #[must_use]
    pub fn to_precision(self) -> Option<Precision> {
        match self {
            Self::Fp32 => Some(Precision::Fp32),
            Self::Fp64 => Some(Precision::Fp64),
            Self::Fp16 => Some(Precision::Fp16),
            Self::I64 => Some(Precision::I64),
            Self::I32 => Some(Precision::I32),
            Self::I16 => Some(Precision::I16),
            Self::I8 => Some(Precision::I8),
            Self::U16 => Some(Precision::U16),
            Self::U8 => Some(Precision::U8),
            Self::Unspecified => None,
        }
    }
}

/// One free-form configuration parameter passed to every plugin call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomNodeParam {
    /// Parameter key.
    pub key: String,
    /// Parameter value.
    pub value: String,
}

/// Borrowed view of one framework tensor handed to the plugin as input.
///
/// The framework retains ownership; the lifetime forbids the plugin from
/// keeping the view past the call.
#[derive(Debug, Clone, Copy)]
pub struct CustomNodeTensorView<'a> {
    /// Tensor name.
    pub name: &'a str,
    /// Raw tensor bytes.
    pub data: &'a [u8],
    /// Tensor dimensions.
    pub dims: &'a [u64],
    /// Element precision.
    pub precision: CustomNodePrecision,
}

/// One output tensor produced by a plugin's execute call.
///
/// Every field mirrors the native ABI, including the ways a misbehaving
/// plugin can corrupt it: a missing name, a null data or dims handle, a
/// declared byte length that disagrees with the shape, or an unknown
/// precision tag.
#[derive(Debug, Clone)]
pub struct CustomNodeTensor {
    /// Tensor name; `None` models a null name pointer.
    pub name: Option<String>,
    /// Data buffer; `None` models a null data handle.
    pub data: Option<PluginBuffer<u8>>,
    /// Declared byte length of the data buffer.
    pub data_bytes: u64,
    /// Dimensions buffer; `None` models a null dims handle.
    pub dims: Option<PluginBuffer<u64>>,
    /// Element precision tag.
    pub precision: CustomNodePrecision,
}

/// Result of a plugin execute call: a status code and, on success, the
/// transferred output tensor array.
#[derive(Debug)]
pub struct CustomNodeExecuteResult {
    /// Plugin status code; zero means success.
    pub status: i32,
    /// The output array; `None` models a corrupted (null) handle.
    pub outputs: Option<PluginBuffer<CustomNodeTensor>>,
}

/// Declared metadata of one plugin input or output.
#[derive(Debug, Clone)]
pub struct CustomNodeTensorInfo {
    /// Tensor name; `None` models a null name pointer.
    pub name: Option<String>,
    /// Dimensions buffer; a zero dimension means "any size".
    pub dims: Option<PluginBuffer<u64>>,
    /// Element precision tag.
    pub precision: CustomNodePrecision,
}

/// Result of a plugin metadata query.
#[derive(Debug)]
pub struct CustomNodeInfoResult {
    /// Plugin status code; zero means success.
    pub status: i32,
    /// The info array; `None` models a corrupted (null) handle.
    pub info: Option<PluginBuffer<CustomNodeTensorInfo>>,
}

/// The five-operation capability interface of a custom node plugin.
pub trait CustomNodeLibrary: Send + Sync + Debug {
    /// Prepares per-node plugin state from the node's parameters.
    ///
    /// Returns the plugin status code on failure.
    fn initialize(&self, params: &[CustomNodeParam]) -> Result<Option<PluginState>, i32>;

    /// Tears down state previously produced by `initialize`.
    fn deinitialize(&self, state: Option<&PluginState>) -> i32;

    /// Runs the plugin's compute over borrowed input views.
    fn execute(
        &self,
        inputs: &[CustomNodeTensorView<'_>],
        params: &[CustomNodeParam],
        state: Option<&PluginState>,
    ) -> CustomNodeExecuteResult;

    /// Declares the inputs the plugin expects.
    fn inputs_info(
        &self,
        params: &[CustomNodeParam],
        state: Option<&PluginState>,
    ) -> CustomNodeInfoResult;

    /// Declares the outputs the plugin produces.
    fn outputs_info(
        &self,
        params: &[CustomNodeParam],
        state: Option<&PluginState>,
    ) -> CustomNodeInfoResult;

    /// Returns one plugin-owned allocation.
    ///
    /// Called exactly once per transferred buffer, whether or not the
    /// surrounding call succeeded.
    fn release(&self, buffer: BufferId, state: Option<&PluginState>);
}
