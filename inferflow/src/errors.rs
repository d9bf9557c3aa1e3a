//! Error types for the inferflow engine.
//!
//! Two layers make up the taxonomy: [`ValidationError`] covers configuration
//! problems detected once, when a pipeline definition is validated, and
//! [`PipelineError`] covers everything that can go wrong while a single
//! request flows through an instantiated pipeline.

use thiserror::Error;

/// The main error type for pipeline execution.
///
/// Node-level failures are recorded on the owning session and propagated to
/// the pipeline result; they are never retried inside the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// A configuration error surfaced by definition validation.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A required input was absent from an upstream node's outputs.
    #[error("node '{node}' is missing required input '{input}' from its dependency")]
    MissingInput {
        /// The consumer node.
        node: String,
        /// The missing input name.
        input: String,
    },

    /// A node finished but did not produce an expected output.
    #[error("node '{node}' did not produce expected output '{output}'")]
    MissingOutput {
        /// The producer node.
        node: String,
        /// The missing output name.
        output: String,
    },

    /// Control-flow status: the node's stream guard has not resolved yet.
    ///
    /// The orchestrator parks the session in its deferred list and retries;
    /// this variant never reaches a pipeline result.
    #[error("stream id not ready yet")]
    StreamIdNotReadyYet,

    /// The plugin returned a non-zero status from its execute entry point.
    #[error("custom node '{node}' execution failed with plugin code {code}")]
    PluginExecutionFailed {
        /// The custom node.
        node: String,
        /// The plugin status code.
        code: i32,
    },

    /// The plugin returned a corrupted outputs handle.
    #[error("custom node '{node}' returned a corrupted outputs handle")]
    OutputsCorrupted {
        /// The custom node.
        node: String,
    },

    /// The plugin returned a non-positive output count.
    #[error("custom node '{node}' returned a corrupted number of outputs")]
    OutputsCorruptedCount {
        /// The custom node.
        node: String,
    },

    /// A plugin output tensor carried an unrecognized precision tag.
    #[error("custom node '{node}' returned tensor '{tensor}' with invalid precision")]
    InvalidPrecision {
        /// The custom node.
        node: String,
        /// The offending tensor (empty when the name itself was missing).
        tensor: String,
    },

    /// A plugin output tensor carried a null or empty shape.
    #[error("custom node '{node}' returned tensor '{tensor}' with invalid shape: {reason}")]
    InvalidShape {
        /// The custom node.
        node: String,
        /// The offending tensor.
        tensor: String,
        /// What was wrong with the shape.
        reason: String,
    },

    /// A plugin output tensor's byte length disagrees with its shape.
    #[error("custom node '{node}' returned tensor '{tensor}' with invalid content size: expected {expected} bytes, got {actual}")]
    InvalidContentSize {
        /// The custom node.
        node: String,
        /// The offending tensor.
        tensor: String,
        /// Shape-implied byte length.
        expected: u64,
        /// Declared byte length.
        actual: u64,
    },

    /// A plugin output tensor had no name.
    #[error("custom node '{node}' returned an output tensor with a missing name")]
    OutputMissingName {
        /// The custom node.
        node: String,
    },

    /// A demultiplexer tried to fan out beyond the hard branch limit.
    #[error("node '{node}' tried to demultiply into {count} branches, limit is {limit}")]
    TooManyBranchesToDemultiply {
        /// The demultiplexing node.
        node: String,
        /// The requested branch count.
        count: usize,
        /// The hard limit.
        limit: usize,
    },

    /// A demultiplexed tensor had too few dimensions to shard.
    #[error("node '{node}' cannot demultiply tensor with {dims} dimensions, at least 3 required")]
    WrongNumberOfDimensionsToDemultiply {
        /// The demultiplexing node.
        node: String,
        /// Actual dimension count.
        dims: usize,
    },

    /// A static demultiplexer's declared count disagrees with dim\[0\].
    #[error("node '{node}' declared demultiply count {expected} but produced dim[0] of {actual}")]
    WrongDimensionSizeToDemultiply {
        /// The demultiplexing node.
        node: String,
        /// Declared branch count.
        expected: usize,
        /// Leading dimension actually produced.
        actual: usize,
    },

    /// A dynamic demultiplexer produced zero branches.
    #[error("node '{node}' produced no results to demultiply")]
    DemultiplexerNoResults {
        /// The demultiplexing node.
        node: String,
    },

    /// Sibling branch tensors could not be recombined into one batch.
    #[error("node '{node}' cannot gather tensor '{tensor}': branch shapes or precisions differ")]
    GatherShapeMismatch {
        /// The gathering node.
        node: String,
        /// The offending input name.
        tensor: String,
    },

    /// A tensor's byte buffer disagrees with its shape-implied length.
    #[error("tensor byte length {actual} does not match shape-implied length {expected}")]
    TensorSizeMismatch {
        /// Shape-implied byte length.
        expected: usize,
        /// Actual buffer length.
        actual: usize,
    },

    /// A referenced model is not present in the registry.
    #[error("model '{model}' is missing from the registry")]
    ModelMissing {
        /// The model name.
        model: String,
    },

    /// The definition is not in a state that allows instantiation.
    #[error("pipeline definition '{name}' is not available: {state}")]
    DefinitionNotAvailable {
        /// The definition name.
        name: String,
        /// Human-readable state.
        state: String,
    },

    /// No definition with that name exists.
    #[error("pipeline definition '{name}' does not exist")]
    DefinitionMissing {
        /// The definition name.
        name: String,
    },

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Creates an internal error from any displayable reason.
    #[must_use]
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }
}

/// Error raised when pipeline definition validation fails.
///
/// Validation runs once per definition (re)load; a failed validation leaves
/// the definition unavailable until it is corrected and reloaded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The connection map contains a dependency cycle.
    #[error("cycle detected in pipeline graph: {}", path.join(" -> "))]
    CycleDetected {
        /// The nodes forming the cycle, in order.
        path: Vec<String>,
    },

    /// No entry node was declared.
    #[error("pipeline has no entry node")]
    MissingEntryNode,

    /// No exit node was declared.
    #[error("pipeline has no exit node")]
    MissingExitNode,

    /// More than one entry node was declared.
    #[error("pipeline declares more than one entry node")]
    MultipleEntryNodes,

    /// More than one exit node was declared.
    #[error("pipeline declares more than one exit node")]
    MultipleExitNodes,

    /// Two nodes share the same name.
    #[error("duplicate node name '{node}'")]
    DuplicateNodeName {
        /// The duplicated name.
        node: String,
    },

    /// A connection references a node that does not exist.
    #[error("connection between '{from}' and '{to}' references an unknown node")]
    DanglingConnection {
        /// Producer side of the connection.
        from: String,
        /// Consumer side of the connection.
        to: String,
    },

    /// The entry node was wired as a consumer.
    #[error("entry node '{node}' cannot accept upstream dependencies")]
    EntryNodeWithInputs {
        /// The entry node.
        node: String,
    },

    /// The exit node was wired as a producer.
    #[error("exit node '{node}' cannot produce outputs for other nodes")]
    ExitNodeWithOutputs {
        /// The exit node.
        node: String,
    },

    /// A node has no upstream or downstream connections at all.
    #[error("node '{node}' is not connected to the rest of the graph")]
    UnconnectedNode {
        /// The orphaned node.
        node: String,
    },

    /// A node's required inputs are not all covered by connections.
    #[error("node '{node}' has unconnected required inputs: {}", missing.join(", "))]
    NotAllInputsConnected {
        /// The consumer node.
        node: String,
        /// Required input names without a producer.
        missing: Vec<String>,
    },

    /// The same consumer input is fed by more than one producer output.
    #[error("node '{node}' input '{input}' is connected more than once")]
    DuplicateInputConnection {
        /// The consumer node.
        node: String,
        /// The doubly-connected input.
        input: String,
    },

    /// A connection references an output the producer does not expose.
    #[error("node '{producer}' does not expose output '{output}' referenced by '{consumer}'")]
    MissingConnectionOutput {
        /// The producer node.
        producer: String,
        /// The consumer node.
        consumer: String,
        /// The unknown output alias.
        output: String,
    },

    /// Producer output and consumer input disagree on precision.
    #[error("precision mismatch on '{producer}.{output}' -> '{consumer}.{input}': {expected} vs {actual}")]
    PrecisionMismatch {
        /// The producer node.
        producer: String,
        /// The producer output alias.
        output: String,
        /// The consumer node.
        consumer: String,
        /// The consumer input name.
        input: String,
        /// Consumer-declared precision.
        expected: String,
        /// Producer-declared precision.
        actual: String,
    },

    /// Producer output and consumer input disagree on shape.
    #[error("shape mismatch on '{producer}.{output}' -> '{consumer}.{input}': {expected} vs {actual}")]
    ShapeMismatch {
        /// The producer node.
        producer: String,
        /// The producer output alias.
        output: String,
        /// The consumer node.
        consumer: String,
        /// The consumer input name.
        input: String,
        /// Consumer-declared shape.
        expected: String,
        /// Producer-provided shape.
        actual: String,
    },

    /// A model node references a model absent from the registry.
    #[error("node '{node}' references missing model '{model}'")]
    MissingModel {
        /// The model node.
        node: String,
        /// The missing model name.
        model: String,
    },

    /// A gather target does not exist or is not an ancestor demultiplexer.
    #[error("node '{node}' gathers from '{target}' which is not an upstream demultiplexer")]
    GatherFromUnknownNode {
        /// The gathering node.
        node: String,
        /// The invalid gather target.
        target: String,
    },

    /// Gather targets must unwind demultiplexers in LIFO order.
    #[error("node '{node}' gathers demultiplexers out of order, '{expected}' must be gathered first")]
    GatherNotInLifoOrder {
        /// The gathering node.
        node: String,
        /// The demultiplexer that must be collapsed first.
        expected: String,
    },

    /// Converging paths deliver different open demultiplexer stacks.
    #[error("node '{node}' is reached with inconsistent demultiplexed branch levels")]
    InconsistentDemultiplexPaths {
        /// The node with ambiguous branch context.
        node: String,
    },

    /// A custom node's library failed to initialize.
    #[error("custom node '{node}' library initialization failed with code {code}")]
    LibraryInitializationFailed {
        /// The custom node.
        node: String,
        /// The plugin status code.
        code: i32,
    },

    /// A custom node's library failed a metadata query.
    #[error("custom node '{node}' library metadata call failed with code {code}")]
    LibraryMetadataFailed {
        /// The custom node.
        node: String,
        /// The plugin status code.
        code: i32,
    },

    /// A custom node was declared without a library.
    #[error("custom node '{node}' has no library attached")]
    LibraryMissing {
        /// The custom node.
        node: String,
    },

    /// A model node was declared without a model name.
    #[error("model node '{node}' has no model name")]
    ModelNameMissing {
        /// The model node.
        node: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_message_joins_path() {
        let err = ValidationError::CycleDetected {
            path: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_validation_error_converts_to_pipeline_error() {
        let err: PipelineError = ValidationError::MissingEntryNode.into();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_content_size_message() {
        let err = PipelineError::InvalidContentSize {
            node: "ocr".to_string(),
            tensor: "boxes".to_string(),
            expected: 64,
            actual: 60,
        };
        let text = err.to_string();
        assert!(text.contains("expected 64 bytes"));
        assert!(text.contains("got 60"));
    }
}
