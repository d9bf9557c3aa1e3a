//! Exit node: gathers all contributing sessions into the response.

use super::{Node, NodeState};
use crate::errors::PipelineError;
use crate::pipeline::event::{send_completion, EventSender};
use crate::session::SessionKey;
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

/// The graph's sink node.
///
/// Its edge mappings rename producer outputs to response output names; its
/// gather set covers every demultiplexer still open on the entry-to-exit
/// paths, so the final session holds exactly one recombined value per
/// response output.
#[derive(Debug)]
pub struct ExitNode {
    state: NodeState,
}

impl ExitNode {
    /// Creates the exit node; `gather_from` is computed by definition
    /// validation.
    #[must_use]
    pub fn new(name: impl Into<String>, gather_from: HashSet<String>) -> Self {
        Self {
            state: NodeState::new(name, None, gather_from),
        }
    }
}

#[async_trait]
impl Node for ExitNode {
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
        let node_id = self.state.id();
        let node_name = self.state.name().to_string();
        let session = self.state.session_mut(session_key)?;
        session.mark_executing();
        let outcome = session.take_inputs();
        debug!(node = %node_name, session = %session_key, "response assembled");
        send_completion(events, node_id, session_key.clone(), outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::completion_channel;
    use crate::session::NodeSessionMetadata;
    use crate::tensor::{Precision, Tensor};

    #[tokio::test]
    async fn test_exit_emits_collected_inputs() {
        let mut exit = ExitNode::new("response", HashSet::new());
        exit.state_mut()
            .add_dependency("infer", vec![("scores".to_string(), "out".to_string())]);

        let key = {
            let session = exit
                .state_mut()
                .get_or_create_session(&NodeSessionMetadata::new())
                .unwrap();
            session.session_key().clone()
        };
        let tensor = Tensor::new(Precision::Fp32, vec![1, 1], vec![0u8; 4]).unwrap();
        {
            let session = exit.state_mut().session_mut(&key).unwrap();
            session.set_input("out", tensor, 0).unwrap();
            session.notify_finished_dependency().unwrap();
        }

        let (events, mut receiver) = completion_channel();
        exit.execute(&key, &events).await.unwrap();
        let event = receiver.recv().await.unwrap();
        let outputs = event.outcome.unwrap();
        assert!(outputs.contains_key("out"));
    }
}
