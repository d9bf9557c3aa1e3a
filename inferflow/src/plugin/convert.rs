//! Marshaling between engine tensors and the plugin ABI.
//!
//! Output conversion deliberately visits every returned tensor even after a
//! validation failure: each plugin-owned buffer must be released exactly
//! once, so the loop never short-circuits. The first failure is remembered
//! and reported once, after the whole array has been walked.

use super::{
    BufferId, CustomNodeExecuteResult, CustomNodeInfoResult, CustomNodeLibrary, CustomNodeParam,
    CustomNodePrecision, CustomNodeTensor, CustomNodeTensorView, PluginBuffer, PluginState,
};
use crate::errors::PipelineError;
use crate::tensor::{Dim, Tensor, TensorInfo, TensorInfoMap, TensorMap};
use std::collections::HashMap;
use tracing::{debug, error};

/// Builds the parameter array handed to every plugin call.
///
/// Sorted by key so plugin calls see a deterministic order.
#[must_use]
pub fn build_parameters(params: &HashMap<String, String>) -> Vec<CustomNodeParam> {
    let mut out: Vec<CustomNodeParam> = params
        .iter()
        .map(|(key, value)| CustomNodeParam {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

/// Builds borrowed input views over the session's tensors.
///
/// `dims` must hold a widened copy of every tensor's shape; the caller keeps
/// it alive for the duration of the plugin call.
#[must_use]
pub fn build_tensor_views<'a>(
    inputs: &'a TensorMap,
    dims: &'a HashMap<String, Vec<u64>>,
) -> Vec<CustomNodeTensorView<'a>> {
    let mut views: Vec<CustomNodeTensorView<'a>> = inputs
        .iter()
        .filter_map(|(name, tensor)| {
            dims.get(name).map(|dims| CustomNodeTensorView {
                name,
                data: tensor.data(),
                dims,
                precision: tensor.precision().into(),
            })
        })
        .collect();
    views.sort_by(|a, b| a.name.cmp(b.name));
    views
}

/// Widens every input tensor's shape to the ABI's `u64` dimensions.
#[must_use]
pub fn build_owned_dims(inputs: &TensorMap) -> HashMap<String, Vec<u64>> {
    inputs
        .iter()
        .map(|(name, tensor)| {
            let dims = tensor.shape().iter().map(|&d| d as u64).collect();
            (name.clone(), dims)
        })
        .collect()
}

/// Validates and converts a plugin execute result into engine tensors.
///
/// Implements the full ladder: non-zero status, corrupted handle, corrupted
/// count, and per-tensor precision/shape/content-size checks. All
/// transferred buffers are released through `library` exactly once, on
/// success and on failure alike.
pub fn convert_outputs(
    node: &str,
    result: CustomNodeExecuteResult,
    library: &dyn CustomNodeLibrary,
    state: Option<&PluginState>,
) -> Result<TensorMap, PipelineError> {
    if result.status != 0 {
        // The plugin frees its own allocations on failure; nothing to do.
        error!(node, code = result.status, "custom node execution failed");
        return Err(PipelineError::PluginExecutionFailed {
            node: node.to_string(),
            code: result.status,
        });
    }
    let Some(outputs) = result.outputs else {
        error!(node, "custom node returned a corrupted outputs handle");
        return Err(PipelineError::OutputsCorrupted {
            node: node.to_string(),
        });
    };
    if outputs.data.is_empty() {
        error!(node, "custom node returned a corrupted number of outputs");
        library.release(outputs.id, state);
        return Err(PipelineError::OutputsCorruptedCount {
            node: node.to_string(),
        });
    }

    let mut converted = TensorMap::new();
    let mut failure: Option<PipelineError> = None;
    for tensor in outputs.data {
        let had_name = tensor.name.is_some();
        match convert_tensor(node, tensor, library, state) {
            Ok((name, tensor)) => {
                if had_name {
                    converted.insert(name, tensor);
                }
            }
            Err(err) => {
                error!(node, error = %err, "failed to convert custom node output");
                if failure.is_none() {
                    failure = Some(err);
                }
            }
        }
        if !had_name {
            // A nameless output invalidates the call even when its payload
            // converted; mirrors the native contract.
            failure = Some(PipelineError::OutputMissingName {
                node: node.to_string(),
            });
        }
    }
    library.release(outputs.id, state);

    match failure {
        Some(err) => Err(err),
        None => Ok(converted),
    }
}

/// Converts one transferred output tensor, releasing its buffers through the
/// plugin no matter the outcome.
fn convert_tensor(
    node: &str,
    tensor: CustomNodeTensor,
    library: &dyn CustomNodeLibrary,
    state: Option<&PluginState>,
) -> Result<(String, Tensor), PipelineError> {
    let CustomNodeTensor {
        name,
        data,
        data_bytes,
        dims,
        precision,
    } = tensor;

    let mut release_ids: Vec<BufferId> = Vec::with_capacity(2);
    if let Some(buffer) = &data {
        release_ids.push(buffer.id);
    }
    if let Some(buffer) = &dims {
        release_ids.push(buffer.id);
    }
    let result = convert_tensor_inner(node, name, data, data_bytes, dims, precision);
    for id in release_ids {
        library.release(id, state);
    }
    result
}

fn convert_tensor_inner(
    node: &str,
    name: Option<String>,
    data: Option<PluginBuffer<u8>>,
    data_bytes: u64,
    dims: Option<PluginBuffer<u64>>,
    precision: CustomNodePrecision,
) -> Result<(String, Tensor), PipelineError> {
    let display_name = name.clone().unwrap_or_default();
    let Some(precision) = precision.to_precision() else {
        return Err(PipelineError::InvalidPrecision {
            node: node.to_string(),
            tensor: display_name,
        });
    };
    let Some(dims) = dims else {
        return Err(PipelineError::InvalidShape {
            node: node.to_string(),
            tensor: display_name,
            reason: "shape handle is null".to_string(),
        });
    };
    if dims.data.is_empty() {
        return Err(PipelineError::InvalidShape {
            node: node.to_string(),
            tensor: display_name,
            reason: "shape has zero dimensions".to_string(),
        });
    }
    let shape: Vec<usize> = dims.data.iter().map(|&d| d as usize).collect();
    let expected = (shape.iter().product::<usize>() * precision.element_size()) as u64;
    let Some(data) = data else {
        return Err(PipelineError::InvalidContentSize {
            node: node.to_string(),
            tensor: display_name,
            expected,
            actual: 0,
        });
    };
    if data_bytes != expected || data.data.len() as u64 != expected {
        return Err(PipelineError::InvalidContentSize {
            node: node.to_string(),
            tensor: display_name,
            expected,
            actual: data_bytes,
        });
    }
    let name = name.unwrap_or_default();
    let tensor = Tensor::new(precision, shape, data.data)
        .map_err(|err| PipelineError::internal(err.to_string()))?;
    Ok((name, tensor))
}

/// Converts a plugin metadata query result into tensor infos.
///
/// Malformed entries are skipped rather than fatal, but every transferred
/// buffer is still visited and released exactly once.
pub fn convert_tensor_infos(
    node: &str,
    result: CustomNodeInfoResult,
    library: &dyn CustomNodeLibrary,
    state: Option<&PluginState>,
) -> Result<TensorInfoMap, PipelineError> {
    if result.status != 0 {
        return Err(PipelineError::PluginExecutionFailed {
            node: node.to_string(),
            code: result.status,
        });
    }
    let Some(info) = result.info else {
        return Err(PipelineError::OutputsCorrupted {
            node: node.to_string(),
        });
    };
    if info.data.is_empty() {
        library.release(info.id, state);
        return Err(PipelineError::OutputsCorruptedCount {
            node: node.to_string(),
        });
    }

    let mut out = TensorInfoMap::new();
    for entry in info.data {
        let Some(dims) = entry.dims else {
            continue;
        };
        let dims_id = dims.id;
        if dims.data.is_empty() {
            library.release(dims_id, state);
            continue;
        }
        let (Some(name), Some(precision)) = (entry.name, entry.precision.to_precision()) else {
            library.release(dims_id, state);
            continue;
        };
        let shape: Vec<Dim> = dims
            .data
            .iter()
            .map(|&d| if d == 0 { Dim::Any } else { Dim::Fixed(d as usize) })
            .collect();
        library.release(dims_id, state);
        debug!(node, tensor = %name, "registered plugin tensor info");
        out.insert(name.clone(), TensorInfo::with_dims(name, precision, shape));
    }
    library.release(info.id, state);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::CustomNodeTensorInfo;
    use crate::tensor::Precision;
    use parking_lot::Mutex;

    /// Library fake that hands out numbered allocations and records every
    /// release so tests can assert the exactly-once contract.
    #[derive(Debug, Default)]
    struct LedgerLibrary {
        released: Mutex<Vec<BufferId>>,
    }

    impl LedgerLibrary {
        fn released(&self) -> Vec<BufferId> {
            self.released.lock().clone()
        }
    }

    impl CustomNodeLibrary for LedgerLibrary {
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
            CustomNodeExecuteResult {
                status: 0,
                outputs: None,
            }
        }

        fn inputs_info(
            &self,
            _params: &[CustomNodeParam],
            _state: Option<&PluginState>,
        ) -> CustomNodeInfoResult {
            CustomNodeInfoResult {
                status: 0,
                info: None,
            }
        }

        fn outputs_info(
            &self,
            _params: &[CustomNodeParam],
            _state: Option<&PluginState>,
        ) -> CustomNodeInfoResult {
            CustomNodeInfoResult {
                status: 0,
                info: None,
            }
        }

        fn release(&self, buffer: BufferId, _state: Option<&PluginState>) {
            self.released.lock().push(buffer);
        }
    }

    fn valid_tensor(name: &str, data_id: BufferId, dims_id: BufferId) -> CustomNodeTensor {
        CustomNodeTensor {
            name: Some(name.to_string()),
            data: Some(PluginBuffer::new(data_id, vec![0u8; 8])),
            data_bytes: 8,
            dims: Some(PluginBuffer::new(dims_id, vec![2, 1])),
            precision: CustomNodePrecision::Fp32,
        }
    }

    #[test]
    fn test_nonzero_status_releases_nothing() {
        let library = LedgerLibrary::default();
        let result = CustomNodeExecuteResult {
            status: 3,
            outputs: Some(PluginBuffer::new(1, vec![valid_tensor("a", 2, 3)])),
        };
        let err = convert_outputs("node", result, &library, None).unwrap_err();
        assert_eq!(
            err,
            PipelineError::PluginExecutionFailed {
                node: "node".to_string(),
                code: 3
            }
        );
        assert!(library.released().is_empty());
    }

    #[test]
    fn test_null_outputs_handle_is_corrupted() {
        let library = LedgerLibrary::default();
        let result = CustomNodeExecuteResult {
            status: 0,
            outputs: None,
        };
        let err = convert_outputs("node", result, &library, None).unwrap_err();
        assert!(matches!(err, PipelineError::OutputsCorrupted { .. }));
    }

    #[test]
    fn test_empty_outputs_released_best_effort() {
        let library = LedgerLibrary::default();
        let result = CustomNodeExecuteResult {
            status: 0,
            outputs: Some(PluginBuffer::new(9, Vec::new())),
        };
        let err = convert_outputs("node", result, &library, None).unwrap_err();
        assert!(matches!(err, PipelineError::OutputsCorruptedCount { .. }));
        assert_eq!(library.released(), vec![9]);
    }

    #[test]
    fn test_valid_outputs_convert_and_release_every_buffer() {
        let library = LedgerLibrary::default();
        let result = CustomNodeExecuteResult {
            status: 0,
            outputs: Some(PluginBuffer::new(
                1,
                vec![valid_tensor("a", 2, 3), valid_tensor("b", 4, 5)],
            )),
        };
        let converted = convert_outputs("node", result, &library, None).unwrap();
        assert_eq!(converted.len(), 2);
        assert_eq!(converted["a"].shape(), &[2, 1]);
        assert_eq!(converted["a"].precision(), Precision::Fp32);

        let mut released = library.released();
        released.sort_unstable();
        assert_eq!(released, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_mixed_validity_still_releases_all_and_fails_once() {
        let library = LedgerLibrary::default();
        let bad_precision = CustomNodeTensor {
            precision: CustomNodePrecision::Unspecified,
            ..valid_tensor("bad", 6, 7)
        };
        let result = CustomNodeExecuteResult {
            status: 0,
            outputs: Some(PluginBuffer::new(
                1,
                vec![valid_tensor("a", 2, 3), bad_precision, valid_tensor("b", 4, 5)],
            )),
        };
        let err = convert_outputs("node", result, &library, None).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPrecision { .. }));

        // Every buffer of every tensor, valid or not, plus the array itself.
        let mut released = library.released();
        released.sort_unstable();
        assert_eq!(released, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_content_size_mismatch_detected() {
        let library = LedgerLibrary::default();
        let mut tensor = valid_tensor("a", 2, 3);
        tensor.data_bytes = 12;
        let result = CustomNodeExecuteResult {
            status: 0,
            outputs: Some(PluginBuffer::new(1, vec![tensor])),
        };
        let err = convert_outputs("node", result, &library, None).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidContentSize {
                expected: 8,
                actual: 12,
                ..
            }
        ));
        let mut released = library.released();
        released.sort_unstable();
        assert_eq!(released, vec![1, 2, 3]);
    }

    #[test]
    fn test_null_shape_detected() {
        let library = LedgerLibrary::default();
        let mut tensor = valid_tensor("a", 2, 3);
        tensor.dims = None;
        let result = CustomNodeExecuteResult {
            status: 0,
            outputs: Some(PluginBuffer::new(1, vec![tensor])),
        };
        let err = convert_outputs("node", result, &library, None).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidShape { .. }));
        let mut released = library.released();
        released.sort_unstable();
        assert_eq!(released, vec![1, 2]);
    }

    #[test]
    fn test_missing_name_invalidates_call() {
        let library = LedgerLibrary::default();
        let mut tensor = valid_tensor("a", 2, 3);
        tensor.name = None;
        let result = CustomNodeExecuteResult {
            status: 0,
            outputs: Some(PluginBuffer::new(1, vec![tensor])),
        };
        let err = convert_outputs("node", result, &library, None).unwrap_err();
        assert!(matches!(err, PipelineError::OutputMissingName { .. }));
    }

    #[test]
    fn test_info_conversion_skips_malformed_entries() {
        let library = LedgerLibrary::default();
        let good = CustomNodeTensorInfo {
            name: Some("scores".to_string()),
            dims: Some(PluginBuffer::new(2, vec![0, 10])),
            precision: CustomNodePrecision::Fp32,
        };
        let nameless = CustomNodeTensorInfo {
            name: None,
            dims: Some(PluginBuffer::new(3, vec![1])),
            precision: CustomNodePrecision::Fp32,
        };
        let result = CustomNodeInfoResult {
            status: 0,
            info: Some(PluginBuffer::new(1, vec![good, nameless])),
        };
        let infos = convert_tensor_infos("node", result, &library, None).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos["scores"].shape, vec![Dim::Any, Dim::Fixed(10)]);

        let mut released = library.released();
        released.sort_unstable();
        assert_eq!(released, vec![1, 2, 3]);
    }

    #[test]
    fn test_build_parameters_is_sorted() {
        let mut params = HashMap::new();
        params.insert("z".to_string(), "1".to_string());
        params.insert("a".to_string(), "2".to_string());
        let built = build_parameters(&params);
        assert_eq!(built[0].key, "a");
        assert_eq!(built[1].key, "z");
    }
}
