//! Entry node: materializes the request as already-available outputs.

use super::{Demultiply, Node, NodeState};
use crate::errors::PipelineError;
use crate::io::InferenceRequest;
use crate::pipeline::event::{send_completion, EventSender};
use crate::session::{SessionKey, SessionResults};
use crate::tensor::TensorMap;
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

/// The graph's source node.
///
/// Performs no computation: it converts the external request's tensors into
/// the engine representation, one per output some downstream node consumes.
/// An entry node has no upstream edges; `set_inputs` always fails.
#[derive(Debug)]
pub struct EntryNode {
    state: NodeState,
    request: InferenceRequest,
}

impl EntryNode {
    /// Creates the entry node over the request of one pipeline run.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        request: InferenceRequest,
        demultiply: Option<Demultiply>,
    ) -> Self {
        Self {
            state: NodeState::new(name, demultiply, HashSet::new()),
            request,
        }
    }

    fn materialize_request(&self) -> Result<TensorMap, PipelineError> {
        let mut outputs = TensorMap::new();
        for name in self.state.requested_outputs() {
            let Some(tensor) = self.request.inputs.get(name) else {
                return Err(PipelineError::MissingInput {
                    node: self.state.name().to_string(),
                    input: name.clone(),
                });
            };
            outputs.insert(name.clone(), tensor.clone());
        }
        debug!(
            node = %self.state.name(),
            inputs = outputs.len(),
            "materialized request tensors"
        );
        Ok(outputs)
    }
}

#[async_trait]
impl Node for EntryNode {
    fn state(&self) -> &NodeState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut NodeState {
        &mut self.state
    }

    async fn execute(
        &mut self,
        session_key: &SessionKey,
        events: &EventSender,
    ) -> Result<(), PipelineError> {
        let outcome = self.materialize_request();
        let node_id = self.state.id();
        self.state.session_mut(session_key)?.mark_executing();
        send_completion(events, node_id, session_key.clone(), outcome);
        Ok(())
    }

    fn set_inputs(
        &mut self,
        dependency: &str,
        _results: &SessionResults,
    ) -> Result<(), PipelineError> {
        Err(PipelineError::internal(format!(
            "entry node '{}' cannot accept inputs from '{dependency}'",
            self.state.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::completion_channel;
    use crate::session::NodeSessionMetadata;
    use crate::tensor::{Precision, Tensor};

    fn tensor() -> Tensor {
        Tensor::new(Precision::Fp32, vec![1, 1], vec![0u8; 4]).unwrap()
    }

    #[tokio::test]
    async fn test_entry_emits_requested_request_tensors() {
        let request = InferenceRequest::new().with_input("image", tensor());
        let mut entry = EntryNode::new("request", request, None);
        entry.state_mut().add_requested_outputs(["image".to_string()]);

        let key = {
            let session = entry
                .state_mut()
                .get_or_create_session(&NodeSessionMetadata::new())
                .unwrap();
            session.session_key().clone()
        };
        let (events, mut receiver) = completion_channel();
        entry.execute(&key, &events).await.unwrap();

        let event = receiver.recv().await.unwrap();
        let outputs = event.outcome.unwrap();
        assert!(outputs.contains_key("image"));
    }

    #[tokio::test]
    async fn test_entry_reports_missing_request_tensor() {
        let mut entry = EntryNode::new("request", InferenceRequest::new(), None);
        entry.state_mut().add_requested_outputs(["image".to_string()]);

        let key = {
            let session = entry
                .state_mut()
                .get_or_create_session(&NodeSessionMetadata::new())
                .unwrap();
            session.session_key().clone()
        };
        let (events, mut receiver) = completion_channel();
        entry.execute(&key, &events).await.unwrap();

        let event = receiver.recv().await.unwrap();
        assert!(matches!(
            event.outcome,
            Err(PipelineError::MissingInput { .. })
        ));
    }

    #[test]
    fn test_entry_rejects_upstream_inputs() {
        let mut entry = EntryNode::new("request", InferenceRequest::new(), None);
        let err = entry
            .set_inputs("someone", &SessionResults::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
    }
}
