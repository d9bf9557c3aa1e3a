//! Execution units of a pipeline.
//!
//! A node owns a table of per-branch sessions, collects inputs delivered by
//! the orchestrator, and executes each session once it is ready. The shared
//! mechanics (wiring, session bookkeeping, demultiplexing) live in
//! [`NodeState`]; the four variants layer their behavior on top of it.

mod custom;
mod entry;
mod exit;
mod model;

pub use custom::CustomNode;
pub use entry::EntryNode;
pub use exit::ExitNode;
pub use model::ModelNode;

use crate::errors::PipelineError;
use crate::pipeline::event::EventSender;
use crate::session::{
    NodeSession, NodeSessionMetadata, SessionKey, SessionResult, SessionResults,
};
use crate::tensor::TensorMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

/// Index of a node within its owning pipeline.
pub type NodeId = crate::pipeline::event::NodeId;

/// Edge mapping: pairs of (producer output alias, consumer input name).
pub type Aliases = Vec<(String, String)>;

/// Hard cap on the number of branches one demultiplexer may spawn.
pub const DEMULTIPLY_LIMIT: usize = 10_000;

/// Demultiply configuration of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Demultiply {
    /// Fan out into a fixed number of branches.
    Count(usize),
    /// Branch count is discovered from the produced output's leading
    /// dimension.
    Dynamic,
}

/// Shared per-node runtime state: identity, wiring, and live sessions.
#[derive(Debug)]
pub struct NodeState {
    id: NodeId,
    name: String,
    demultiply: Option<Demultiply>,
    gather_from: HashSet<String>,
    mapping_by_dependency: HashMap<String, Aliases>,
    dependants: Vec<NodeId>,
    requested_outputs: HashSet<String>,
    sessions: HashMap<SessionKey, NodeSession>,
}

impl NodeState {
    /// Creates node state with no wiring yet.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        demultiply: Option<Demultiply>,
        gather_from: HashSet<String>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            demultiply,
            gather_from,
            mapping_by_dependency: HashMap::new(),
            dependants: Vec::new(),
            requested_outputs: HashSet::new(),
            sessions: HashMap::new(),
        }
    }

    /// The node's index within its pipeline.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: NodeId) {
        self.id = id;
    }

    /// The node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node's demultiply configuration.
    #[must_use]
    pub fn demultiply(&self) -> Option<Demultiply> {
        self.demultiply
    }

    /// The demultiplexers this node gathers branches from.
    #[must_use]
    pub fn gather_from(&self) -> &HashSet<String> {
        &self.gather_from
    }

    /// Downstream node ids, in connection order.
    #[must_use]
    pub fn dependants(&self) -> &[NodeId] {
        &self.dependants
    }

    /// Output aliases some downstream node actually consumes.
    #[must_use]
    pub fn requested_outputs(&self) -> &HashSet<String> {
        &self.requested_outputs
    }

    /// Number of upstream edges feeding this node.
    #[must_use]
    pub fn dependency_count(&self) -> usize {
        self.mapping_by_dependency.len()
    }

    pub(crate) fn add_dependency(&mut self, producer: impl Into<String>, aliases: Aliases) {
        self.mapping_by_dependency.insert(producer.into(), aliases);
    }

    pub(crate) fn add_dependant(&mut self, id: NodeId) {
        self.dependants.push(id);
    }

    pub(crate) fn add_requested_outputs<I>(&mut self, outputs: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.requested_outputs.extend(outputs);
    }

    /// Finds the session for `key`.
    pub fn session_mut(&mut self, key: &SessionKey) -> Result<&mut NodeSession, PipelineError> {
        let name = self.name.clone();
        self.sessions.get_mut(key).ok_or_else(|| {
            PipelineError::internal(format!("node '{name}' has no session '{key}'"))
        })
    }

    /// Finds the session matching `metadata`, creating it lazily on first
    /// input delivery.
    ///
    /// Gathering nodes collapse the gathered demultiplex levels first, so
    /// all sibling branches land in one shared session.
    pub fn get_or_create_session(
        &mut self,
        metadata: &NodeSessionMetadata,
    ) -> Result<&mut NodeSession, PipelineError> {
        let key = if self.gather_from.is_empty() {
            metadata.session_key()
        } else {
            metadata.session_key_ignoring(&self.gather_from)?
        };
        if !self.sessions.contains_key(&key) {
            debug!(node = %self.name, session = %key, "creating session");
            let session = if self.gather_from.is_empty() {
                NodeSession::new(metadata.clone(), &self.name, self.dependency_count())
            } else {
                let (collapsed, details) = metadata.collapse(&self.gather_from)?;
                NodeSession::new_gathering(
                    collapsed,
                    &self.name,
                    self.dependency_count(),
                    &details,
                )
            };
            self.sessions.insert(key.clone(), session);
        }
        self.session_mut(&key)
    }

    /// Delivers one finished dependency's results into the matching
    /// sessions.
    ///
    /// Copies the subset of `results` this node's mapping declares it needs
    /// from `dependency`; fails with [`PipelineError::MissingInput`] when a
    /// required output name is absent, which indicates a misconfigured graph
    /// and is never retried.
    pub fn set_inputs(
        &mut self,
        dependency: &str,
        results: &SessionResults,
    ) -> Result<(), PipelineError> {
        let Some(mapping) = self.mapping_by_dependency.get(dependency).cloned() else {
            return Err(PipelineError::internal(format!(
                "node '{}' has no edge from '{dependency}'",
                self.name
            )));
        };
        for SessionResult { metadata, tensors } in results.values() {
            let shard = metadata.shard_id(&self.gather_from)?;
            let node_name = self.name.clone();
            let session = self.get_or_create_session(metadata)?;
            for (producer_output, input_name) in &mapping {
                let Some(tensor) = tensors.get(producer_output) else {
                    warn!(
                        node = %node_name,
                        dependency,
                        output = %producer_output,
                        "dependency is missing a required output"
                    );
                    return Err(PipelineError::MissingInput {
                        node: node_name,
                        input: producer_output.clone(),
                    });
                };
                debug!(
                    node = %node_name,
                    dependency,
                    input = %input_name,
                    output = %producer_output,
                    shard,
                    "setting required input"
                );
                session.set_input(input_name, tensor.clone(), shard)?;
            }
            session.notify_finished_dependency()?;
        }
        Ok(())
    }

    /// Keys of sessions whose inputs are complete and which have not been
    /// handed to the scheduler yet.
    #[must_use]
    pub fn ready_sessions(&self) -> Vec<SessionKey> {
        self.sessions
            .iter()
            .filter(|(_, session)| session.is_ready())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Records the outcome of a finished execution on its session.
    pub fn record_outcome(
        &mut self,
        key: &SessionKey,
        outcome: Result<TensorMap, PipelineError>,
    ) -> Result<(), PipelineError> {
        let Some(session) = self.sessions.get_mut(key) else {
            return Err(PipelineError::internal(format!(
                "failed to record results of node '{}' session '{key}'",
                self.name
            )));
        };
        match outcome {
            Ok(results) => session.store_results(results),
            Err(error) => session.store_failure(error),
        }
        Ok(())
    }

    /// Consumes a finished session's results, demultiplexing them into one
    /// result set per branch when configured. The session is destroyed.
    pub fn fetch_results(&mut self, key: &SessionKey) -> Result<SessionResults, PipelineError> {
        let Some(mut session) = self.sessions.remove(key) else {
            return Err(PipelineError::internal(format!(
                "node '{}' has no session '{key}' to fetch",
                self.name
            )));
        };
        if let Some(failure) = session.failure() {
            return Err(failure.clone());
        }
        let metadata = session.metadata().clone();
        let tensors = session.take_results();
        let mut results = SessionResults::new();
        results.insert(metadata.session_key(), SessionResult { metadata, tensors });
        if self.demultiply.is_some() {
            self.demultiply_outputs(&mut results)?;
        }
        debug!(node = %self.name, session = %key, "session released");
        Ok(results)
    }

    /// Drops a session without consuming its results.
    pub fn release_session(&mut self, key: &SessionKey) {
        debug!(node = %self.name, session = %key, "releasing session");
        self.sessions.remove(key);
    }

    /// Splits the single fetched result set into one per branch, stamping
    /// each with a derived metadata that appends the new branch index.
    fn demultiply_outputs(&self, results: &mut SessionResults) -> Result<(), PipelineError> {
        let Some(demultiply) = self.demultiply else {
            return Err(PipelineError::internal(format!(
                "node '{}' has no demultiply configuration",
                self.name
            )));
        };
        let Some((_, result)) = results.drain().next() else {
            return Err(PipelineError::internal(format!(
                "node '{}' demultiplexed an empty result set",
                self.name
            )));
        };
        let SessionResult { metadata, tensors } = result;
        let Some(first) = tensors.values().next() else {
            return Err(PipelineError::DemultiplexerNoResults {
                node: self.name.clone(),
            });
        };
        let branch_count = first.shape().first().copied().unwrap_or(0);
        if branch_count > DEMULTIPLY_LIMIT {
            return Err(PipelineError::TooManyBranchesToDemultiply {
                node: self.name.clone(),
                count: branch_count,
                limit: DEMULTIPLY_LIMIT,
            });
        }
        if let Demultiply::Count(expected) = demultiply {
            if expected != branch_count {
                return Err(PipelineError::WrongDimensionSizeToDemultiply {
                    node: self.name.clone(),
                    expected,
                    actual: branch_count,
                });
            }
        }
        if branch_count == 0 {
            return Err(PipelineError::DemultiplexerNoResults {
                node: self.name.clone(),
            });
        }
        debug!(node = %self.name, branches = branch_count, "demultiplexing outputs");
        let metadatas = metadata.generate_subsessions(&self.name, branch_count)?;

        let mut demultiplexed = SessionResults::with_capacity(branch_count);
        for (tensor_name, tensor) in tensors {
            if tensor.shape().len() < 3 {
                return Err(PipelineError::WrongNumberOfDimensionsToDemultiply {
                    node: self.name.clone(),
                    dims: tensor.shape().len(),
                });
            }
            let actual = tensor.shape()[0];
            if actual != branch_count {
                return Err(PipelineError::WrongDimensionSizeToDemultiply {
                    node: self.name.clone(),
                    expected: branch_count,
                    actual,
                });
            }
            for (index, branch_metadata) in metadatas.iter().enumerate() {
                let shard = tensor.slice_outer(index)?;
                let branch_key = branch_metadata.session_key();
                demultiplexed
                    .entry(branch_key)
                    .or_insert_with(|| SessionResult {
                        metadata: branch_metadata.clone(),
                        tensors: TensorMap::new(),
                    })
                    .tensors
                    .insert(tensor_name.clone(), shard);
            }
        }
        *results = demultiplexed;
        Ok(())
    }
}

/// An execution unit of the pipeline graph.
///
/// The provided methods implement the shared session protocol; variants
/// override only what differs. `execute` must push exactly one completion
/// event per started session, on success and on every error path alike —
/// the single exception is returning
/// [`PipelineError::StreamIdNotReadyYet`], which tells the orchestrator the
/// session was deferred, not started.
#[async_trait]
pub trait Node: Send + Sync {
    /// Shared node state.
    fn state(&self) -> &NodeState;

    /// Shared node state, mutably.
    fn state_mut(&mut self) -> &mut NodeState;

    /// The node name.
    fn name(&self) -> &str {
        self.state().name()
    }

    /// Executes one ready session, reporting completion on `events`.
    async fn execute(
        &mut self,
        session_key: &SessionKey,
        events: &EventSender,
    ) -> Result<(), PipelineError>;

    /// Delivers a finished dependency's results; see
    /// [`NodeState::set_inputs`].
    fn set_inputs(
        &mut self,
        dependency: &str,
        results: &SessionResults,
    ) -> Result<(), PipelineError> {
        self.state_mut().set_inputs(dependency, results)
    }

    /// Keys of sessions ready for execution.
    fn ready_sessions(&self) -> Vec<SessionKey> {
        self.state().ready_sessions()
    }

    /// Records a finished execution's outcome on its session.
    fn record_outcome(
        &mut self,
        session_key: &SessionKey,
        outcome: Result<TensorMap, PipelineError>,
    ) -> Result<(), PipelineError> {
        self.state_mut().record_outcome(session_key, outcome)
    }

    /// Consumes a finished session's results; see
    /// [`NodeState::fetch_results`].
    fn fetch_results(&mut self, session_key: &SessionKey) -> Result<SessionResults, PipelineError> {
        self.state_mut().fetch_results(session_key)
    }

    /// Attempts to cancel a deferred session's pending stream acquisition.
    ///
    /// Nodes without stream guards have nothing to cancel and report
    /// success.
    fn try_disarm(&mut self, session_key: &SessionKey, _timeout: Duration) -> bool {
        self.state_mut().release_session(session_key);
        true
    }

    /// Drops a session without consuming its results.
    fn release(&mut self, session_key: &SessionKey) {
        self.state_mut().release_session(session_key);
    }
}
