//! Custom-plugin node.

use super::{Demultiply, Node, NodeState};
use crate::errors::PipelineError;
use crate::pipeline::event::{send_completion, EventSender};
use crate::plugin::{
    build_owned_dims, build_parameters, build_tensor_views, convert_outputs, CustomNodeLibrary,
    CustomNodeParam, PluginState,
};
use crate::session::SessionKey;
use crate::tensor::TensorMap;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// A node that runs a natively loaded compute plugin.
///
/// Marshals session inputs into borrowed ABI views, invokes the plugin's
/// execute entry point, validates the transferred outputs, and releases
/// every plugin-owned buffer through the plugin itself.
pub struct CustomNode {
    state: NodeState,
    library: Arc<dyn CustomNodeLibrary>,
    parameters: Vec<CustomNodeParam>,
    plugin_state: Option<PluginState>,
    output_aliases: HashMap<String, String>,
}

impl CustomNode {
    /// Creates a custom node over an initialized plugin.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        library: Arc<dyn CustomNodeLibrary>,
        parameters: &HashMap<String, String>,
        plugin_state: Option<PluginState>,
        output_aliases: HashMap<String, String>,
        demultiply: Option<Demultiply>,
        gather_from: HashSet<String>,
    ) -> Self {
        Self {
            state: NodeState::new(name, demultiply, gather_from),
            library,
            parameters: build_parameters(parameters),
            plugin_state,
            output_aliases,
        }
    }

    fn run_plugin(&self, inputs: &TensorMap) -> Result<TensorMap, PipelineError> {
        let node_name = self.state.name();
        let dims = build_owned_dims(inputs);
        let views = build_tensor_views(inputs, &dims);
        debug!(node = %node_name, inputs = views.len(), "invoking plugin execute");
        let result = self
            .library
            .execute(&views, &self.parameters, self.plugin_state.as_ref());
        let converted = convert_outputs(
            node_name,
            result,
            self.library.as_ref(),
            self.plugin_state.as_ref(),
        )?;

        let mut outputs = TensorMap::new();
        for alias in self.state.requested_outputs() {
            let real_name = self
                .output_aliases
                .get(alias)
                .map_or(alias.as_str(), String::as_str);
            let Some(tensor) = converted.get(real_name) else {
                return Err(PipelineError::MissingOutput {
                    node: node_name.to_string(),
                    output: alias.clone(),
                });
            };
            outputs.insert(alias.clone(), tensor.clone());
        }
        Ok(outputs)
    }
}

impl std::fmt::Debug for CustomNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomNode")
            .field("state", &self.state)
            .field("library", &self.library)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Node for CustomNode {
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
        let session = self.state.session_mut(session_key)?;
        session.mark_executing();
        let outcome = match session.take_inputs() {
            Ok(inputs) => self.run_plugin(&inputs),
            Err(err) => Err(err),
        };
        send_completion(events, node_id, session_key.clone(), outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::completion_channel;
    use crate::session::NodeSessionMetadata;
    use crate::testing::{AddOneLibrary, FailingLibrary};
    use crate::tensor::{Precision, Tensor};

    fn input_tensor() -> Tensor {
        let data: Vec<u8> = [1.0f32, 2.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        Tensor::new(Precision::Fp32, vec![1, 2], data).unwrap()
    }

    fn node_with_library(library: Arc<dyn CustomNodeLibrary>) -> (CustomNode, SessionKey) {
        let mut node = CustomNode::new(
            "plugin",
            library,
            &HashMap::new(),
            None,
            HashMap::new(),
            None,
            HashSet::new(),
        );
        node.state_mut().add_requested_outputs(["x".to_string()]);
        let key = {
            let session = node
                .state_mut()
                .get_or_create_session(&NodeSessionMetadata::new())
                .unwrap();
            session.session_key().clone()
        };
        (node, key)
    }

    #[tokio::test]
    async fn test_plugin_outputs_flow_into_completion_event() {
        let library = Arc::new(AddOneLibrary::default());
        let dyn_library: Arc<dyn CustomNodeLibrary> = library.clone();
        let (mut node, key) = node_with_library(dyn_library);
        node.state_mut()
            .session_mut(&key)
            .unwrap()
            .set_input("x", input_tensor(), 0)
            .unwrap();

        let (events, mut receiver) = completion_channel();
        node.execute(&key, &events).await.unwrap();

        let event = receiver.recv().await.unwrap();
        let outputs = event.outcome.unwrap();
        assert!(outputs.contains_key("x"));
        assert_eq!(library.outstanding_allocations(), 0);
    }

    #[tokio::test]
    async fn test_plugin_failure_becomes_session_failure() {
        let library: Arc<dyn CustomNodeLibrary> = Arc::new(FailingLibrary::with_status(11));
        let (mut node, key) = node_with_library(library);
        node.state_mut()
            .session_mut(&key)
            .unwrap()
            .set_input("x", input_tensor(), 0)
            .unwrap();

        let (events, mut receiver) = completion_channel();
        node.execute(&key, &events).await.unwrap();

        let event = receiver.recv().await.unwrap();
        assert!(matches!(
            event.outcome,
            Err(PipelineError::PluginExecutionFailed { code: 11, .. })
        ));
    }
}
