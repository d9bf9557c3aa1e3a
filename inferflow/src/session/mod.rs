//! Node sessions: the per-branch runtime state of a node.
//!
//! A session collects inputs from upstream edges, becomes ready exactly once
//! when every required dependency has delivered, records the outcome of the
//! node's execution, and is released when its results are consumed.

mod metadata;

pub use metadata::{CollapseDetails, NodeSessionMetadata, SessionKey, ShardId};

use crate::errors::PipelineError;
use crate::tensor::{Tensor, TensorMap};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// One node's output for one session: the branch metadata plus the produced
/// tensors keyed by output alias.
#[derive(Debug, Clone)]
pub struct SessionResult {
    /// Branch metadata the results belong to.
    pub metadata: NodeSessionMetadata,
    /// Produced tensors keyed by the node's output aliases.
    pub tensors: TensorMap,
}

/// Results of one `fetch_results` call, keyed by session key.
///
/// A demultiplexing node returns one entry per spawned branch; every other
/// node returns exactly one.
pub type SessionResults = HashMap<SessionKey, SessionResult>;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for upstream edges to deliver inputs.
    Collecting,
    /// All required inputs arrived; execution has not been scheduled yet.
    Ready,
    /// The node is running (or its stream acquisition is pending).
    Executing,
    /// Execution finished and the outcome is recorded.
    ResultsAvailable,
}

/// Accumulates the inputs of one session.
///
/// The gathering variant collects one tensor set per branch of the gathered
/// demultiplexer(s) and recombines them, ordered by ascending branch index,
/// when the inputs are taken for execution.
#[derive(Debug)]
enum InputCollector {
    Single {
        inputs: TensorMap,
    },
    Gather {
        shards: HashMap<String, BTreeMap<ShardId, Tensor>>,
        expected_shards: usize,
    },
}

/// Mutable record of one branch of one request at one node.
#[derive(Debug)]
pub struct NodeSession {
    node_name: String,
    metadata: NodeSessionMetadata,
    session_key: SessionKey,
    collector: InputCollector,
    remaining_dependencies: usize,
    state: SessionState,
    scheduled: bool,
    results: TensorMap,
    failure: Option<PipelineError>,
}

impl NodeSession {
    /// Creates a session collecting one delivery per upstream edge.
    #[must_use]
    pub fn new(
        metadata: NodeSessionMetadata,
        node_name: impl Into<String>,
        dependencies: usize,
    ) -> Self {
        let session_key = metadata.session_key();
        let state = if dependencies == 0 {
            SessionState::Ready
        } else {
            SessionState::Collecting
        };
        Self {
            node_name: node_name.into(),
            metadata,
            session_key,
            collector: InputCollector::Single {
                inputs: TensorMap::new(),
            },
            remaining_dependencies: dependencies,
            state,
            scheduled: false,
            results: TensorMap::new(),
            failure: None,
        }
    }

    /// Creates a gathering session that recombines `collapse` branches from
    /// each upstream edge before becoming ready.
    #[must_use]
    pub fn new_gathering(
        metadata: NodeSessionMetadata,
        node_name: impl Into<String>,
        dependencies: usize,
        collapse: &CollapseDetails,
    ) -> Self {
        let session_key = metadata.session_key();
        let expected_shards = collapse.total_branches();
        let remaining = dependencies * expected_shards;
        let state = if remaining == 0 {
            SessionState::Ready
        } else {
            SessionState::Collecting
        };
        Self {
            node_name: node_name.into(),
            metadata,
            session_key,
            collector: InputCollector::Gather {
                shards: HashMap::new(),
                expected_shards,
            },
            remaining_dependencies: remaining,
            state,
            scheduled: false,
            results: TensorMap::new(),
            failure: None,
        }
    }

    /// The session key of this branch.
    #[must_use]
    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// The branch metadata (collapsed, for gathering sessions).
    #[must_use]
    pub fn metadata(&self) -> &NodeSessionMetadata {
        &self.metadata
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether all required inputs have arrived and execution has not been
    /// scheduled yet.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready && !self.scheduled
    }

    /// Stores one input tensor under the node's local `name`.
    ///
    /// `shard` identifies the contributing branch for gathering sessions and
    /// is `0` everywhere else.
    pub fn set_input(
        &mut self,
        name: &str,
        tensor: Tensor,
        shard: ShardId,
    ) -> Result<(), PipelineError> {
        match &mut self.collector {
            InputCollector::Single { inputs } => {
                inputs.insert(name.to_string(), tensor);
            }
            InputCollector::Gather {
                shards,
                expected_shards,
            } => {
                if shard >= *expected_shards {
                    return Err(PipelineError::internal(format!(
                        "node '{}' received shard {shard} beyond expected {}",
                        self.node_name, expected_shards
                    )));
                }
                let per_shard = shards.entry(name.to_string()).or_default();
                if per_shard.insert(shard, tensor).is_some() {
                    return Err(PipelineError::internal(format!(
                        "node '{}' received shard {shard} of input '{name}' twice",
                        self.node_name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Marks one upstream delivery as complete; flips the session to ready on
    /// the final one.
    pub fn notify_finished_dependency(&mut self) -> Result<(), PipelineError> {
        if self.remaining_dependencies == 0 {
            return Err(PipelineError::internal(format!(
                "node '{}' session '{}' notified beyond its dependency count",
                self.node_name, self.session_key
            )));
        }
        self.remaining_dependencies -= 1;
        if self.remaining_dependencies == 0 {
            debug!(
                node = %self.node_name,
                session = %self.session_key,
                "session ready"
            );
            self.state = SessionState::Ready;
        }
        Ok(())
    }

    /// Marks the session as handed to the scheduler; a scheduled session is
    /// no longer reported by ready-session scans even while deferred.
    pub fn mark_scheduled(&mut self) {
        self.scheduled = true;
    }

    /// Marks the session as executing.
    pub fn mark_executing(&mut self) {
        self.scheduled = true;
        self.state = SessionState::Executing;
    }

    /// Consumes the collected inputs for execution.
    ///
    /// Gathering sessions recombine each input's shards here, ordered by
    /// ascending branch index, concatenating along a new leading dimension.
    pub fn take_inputs(&mut self) -> Result<TensorMap, PipelineError> {
        match &mut self.collector {
            InputCollector::Single { inputs } => Ok(std::mem::take(inputs)),
            InputCollector::Gather {
                shards,
                expected_shards,
            } => {
                let mut gathered = TensorMap::new();
                for (name, per_shard) in std::mem::take(shards) {
                    if per_shard.len() != *expected_shards {
                        return Err(PipelineError::internal(format!(
                            "node '{}' input '{name}' gathered {} of {} branches",
                            self.node_name,
                            per_shard.len(),
                            expected_shards
                        )));
                    }
                    // BTreeMap iteration yields ascending shard ids.
                    let parts: Vec<Tensor> = per_shard.into_values().collect();
                    let stacked = Tensor::stack_outer(&parts).map_err(|_| {
                        PipelineError::GatherShapeMismatch {
                            node: self.node_name.clone(),
                            tensor: name.clone(),
                        }
                    })?;
                    gathered.insert(name, stacked);
                }
                Ok(gathered)
            }
        }
    }

    /// Records a successful execution outcome.
    pub fn store_results(&mut self, results: TensorMap) {
        self.results = results;
        self.state = SessionState::ResultsAvailable;
    }

    /// Records the terminal failure of this session; never retried.
    pub fn store_failure(&mut self, error: PipelineError) {
        self.failure = Some(error);
        self.state = SessionState::ResultsAvailable;
    }

    /// The recorded terminal failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&PipelineError> {
        self.failure.as_ref()
    }

    /// Consumes the recorded results.
    pub fn take_results(&mut self) -> TensorMap {
        std::mem::take(&mut self.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Precision;

    fn tensor(shape: &[usize], values: &[f32]) -> Tensor {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Tensor::new(Precision::Fp32, shape.to_vec(), data).unwrap()
    }

    fn to_f32(tensor: &Tensor) -> Vec<f32> {
        tensor
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_session_with_no_dependencies_is_born_ready() {
        let session = NodeSession::new(NodeSessionMetadata::new(), "entry", 0);
        assert!(session.is_ready());
    }

    #[test]
    fn test_readiness_requires_every_dependency() {
        let mut session = NodeSession::new(NodeSessionMetadata::new(), "sum", 2);
        assert!(!session.is_ready());

        session.set_input("a", tensor(&[1], &[1.0]), 0).unwrap();
        session.notify_finished_dependency().unwrap();
        assert!(!session.is_ready());

        session.set_input("b", tensor(&[1], &[2.0]), 0).unwrap();
        session.notify_finished_dependency().unwrap();
        assert!(session.is_ready());
    }

    #[test]
    fn test_readiness_is_arrival_order_independent() {
        let mut session = NodeSession::new(NodeSessionMetadata::new(), "sum", 2);
        session.set_input("b", tensor(&[1], &[2.0]), 0).unwrap();
        session.notify_finished_dependency().unwrap();
        assert!(!session.is_ready());
        session.set_input("a", tensor(&[1], &[1.0]), 0).unwrap();
        session.notify_finished_dependency().unwrap();
        assert!(session.is_ready());
    }

    #[test]
    fn test_scheduled_session_leaves_ready_scan() {
        let mut session = NodeSession::new(NodeSessionMetadata::new(), "entry", 0);
        assert!(session.is_ready());
        session.mark_scheduled();
        assert!(!session.is_ready());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_excess_notification_is_an_error() {
        let mut session = NodeSession::new(NodeSessionMetadata::new(), "sum", 1);
        session.notify_finished_dependency().unwrap();
        assert!(session.notify_finished_dependency().is_err());
    }

    #[test]
    fn test_gather_recombines_in_branch_order() {
        let root = NodeSessionMetadata::new();
        let branches = root.generate_subsessions("split", 3).unwrap();
        let gathered: std::collections::HashSet<String> =
            ["split".to_string()].into_iter().collect();
        let (collapsed, details) = branches[0].collapse(&gathered).unwrap();
        let mut session = NodeSession::new_gathering(collapsed, "gather", 1, &details);

        // Deliver branches out of order; recombination must sort by index.
        for index in [2usize, 0, 1] {
            let value = index as f32;
            session
                .set_input("x", tensor(&[1, 1], &[value]), index)
                .unwrap();
            session.notify_finished_dependency().unwrap();
        }
        assert!(session.is_ready());

        let inputs = session.take_inputs().unwrap();
        let gathered = &inputs["x"];
        assert_eq!(gathered.shape(), &[3, 1, 1]);
        assert_eq!(to_f32(gathered), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_gather_rejects_duplicate_shard() {
        let root = NodeSessionMetadata::new();
        let branches = root.generate_subsessions("split", 2).unwrap();
        let gathered: std::collections::HashSet<String> =
            ["split".to_string()].into_iter().collect();
        let (collapsed, details) = branches[0].collapse(&gathered).unwrap();
        let mut session = NodeSession::new_gathering(collapsed, "gather", 1, &details);

        session.set_input("x", tensor(&[1], &[0.0]), 0).unwrap();
        let err = session.set_input("x", tensor(&[1], &[0.0]), 0).unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
    }

    #[test]
    fn test_gather_shape_mismatch_is_reported() {
        let root = NodeSessionMetadata::new();
        let branches = root.generate_subsessions("split", 2).unwrap();
        let gathered: std::collections::HashSet<String> =
            ["split".to_string()].into_iter().collect();
        let (collapsed, details) = branches[0].collapse(&gathered).unwrap();
        let mut session = NodeSession::new_gathering(collapsed, "gather", 1, &details);

        session.set_input("x", tensor(&[1, 2], &[0.0, 0.0]), 0).unwrap();
        session.notify_finished_dependency().unwrap();
        session.set_input("x", tensor(&[2, 1], &[0.0, 0.0]), 1).unwrap();
        session.notify_finished_dependency().unwrap();

        let err = session.take_inputs().unwrap_err();
        assert!(matches!(err, PipelineError::GatherShapeMismatch { .. }));
    }

    #[test]
    fn test_failure_is_terminal_and_preserved() {
        let mut session = NodeSession::new(NodeSessionMetadata::new(), "n", 0);
        session.mark_executing();
        session.store_failure(PipelineError::ModelMissing {
            model: "resnet".to_string(),
        });
        assert_eq!(session.state(), SessionState::ResultsAvailable);
        assert!(matches!(
            session.failure(),
            Some(PipelineError::ModelMissing { .. })
        ));
    }
}
