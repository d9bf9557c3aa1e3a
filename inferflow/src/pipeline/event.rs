//! The shared completion queue between node execution and the orchestrator.

use crate::errors::PipelineError;
use crate::session::SessionKey;
use crate::tensor::TensorMap;
use tokio::sync::mpsc;
use tracing::error;

/// Index of a node within its owning pipeline.
pub type NodeId = usize;

/// Completion notice for one node session, successful or not.
///
/// Every execute path must produce exactly one of these per started session;
/// the orchestrator's liveness depends on it.
#[derive(Debug)]
pub struct NodeFinishedEvent {
    /// The finished node.
    pub node: NodeId,
    /// The finished session.
    pub session_key: SessionKey,
    /// Produced outputs, or the session's terminal failure.
    pub outcome: Result<TensorMap, PipelineError>,
}

/// Sending half of the completion queue.
pub type EventSender = mpsc::UnboundedSender<NodeFinishedEvent>;

/// Receiving half of the completion queue.
pub type EventReceiver = mpsc::UnboundedReceiver<NodeFinishedEvent>;

/// Creates the completion queue for one pipeline run.
///
/// FIFO per sender, which is all the ordering the orchestrator relies on.
#[must_use]
pub fn completion_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Pushes a completion event, logging if the orchestrator is already gone.
pub fn send_completion(
    events: &EventSender,
    node: NodeId,
    session_key: SessionKey,
    outcome: Result<TensorMap, PipelineError>,
) {
    let event = NodeFinishedEvent {
        node,
        session_key,
        outcome,
    };
    if events.send(event).is_err() {
        error!(node, "completion queue closed before node finished");
    }
}
