//! Model-inference node.

use super::{Demultiply, Node, NodeState};
use crate::errors::PipelineError;
use crate::models::{ModelInstance, ModelRegistry};
use crate::pipeline::event::{send_completion, EventSender};
use crate::session::SessionKey;
use crate::streams::{StreamGuard, StreamId};
use crate::tensor::TensorMap;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const STREAM_ID_PROBE_TIMEOUT: Duration = Duration::from_micros(1);

/// A node that runs one compiled model over the session's inputs.
///
/// Each execution draws a stream guard from the target model's pool. When
/// the pool is exhausted the session is deferred: `execute` returns
/// [`PipelineError::StreamIdNotReadyYet`] and the orchestrator retries
/// later, keeping the guard (and its queued acquisition) alive in between.
#[derive(Debug)]
pub struct ModelNode {
    state: NodeState,
    model_name: String,
    output_aliases: HashMap<String, String>,
    registry: Arc<ModelRegistry>,
    guards: HashMap<SessionKey, StreamGuard>,
}

impl ModelNode {
    /// Creates a model node targeting `model_name` in `registry`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        model_name: impl Into<String>,
        output_aliases: HashMap<String, String>,
        demultiply: Option<Demultiply>,
        gather_from: HashSet<String>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            state: NodeState::new(name, demultiply, gather_from),
            model_name: model_name.into(),
            output_aliases,
            registry,
            guards: HashMap::new(),
        }
    }

    /// The model this node runs.
    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[async_trait]
impl Node for ModelNode {
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

        let Some(model) = self.registry.get(&self.model_name) else {
            self.state.session_mut(session_key)?.mark_executing();
            self.guards.remove(session_key);
            send_completion(
                events,
                node_id,
                session_key.clone(),
                Err(PipelineError::ModelMissing {
                    model: self.model_name.clone(),
                }),
            );
            return Ok(());
        };

        let guard = self
            .guards
            .entry(session_key.clone())
            .or_insert_with(|| StreamGuard::new(model.streams()));
        let Some(stream_id) = guard.try_get_id(STREAM_ID_PROBE_TIMEOUT) else {
            debug!(
                node = %node_name,
                session = %session_key,
                "stream id not ready, deferring session"
            );
            self.state.session_mut(session_key)?.mark_scheduled();
            return Err(PipelineError::StreamIdNotReadyYet);
        };

        let Some(guard) = self.guards.remove(session_key) else {
            return Err(PipelineError::internal(format!(
                "node '{node_name}' lost its stream guard for session '{session_key}'"
            )));
        };
        let session = self.state.session_mut(session_key)?;
        session.mark_executing();
        let inputs = match session.take_inputs() {
            Ok(inputs) => inputs,
            Err(err) => {
                drop(guard);
                send_completion(events, node_id, session_key.clone(), Err(err));
                return Ok(());
            }
        };

        debug!(
            node = %node_name,
            session = %session_key,
            stream = stream_id,
            model = %self.model_name,
            "submitting inference"
        );
        let aliases = self.output_aliases.clone();
        let requested: Vec<String> = self.state.requested_outputs().iter().cloned().collect();
        let events = events.clone();
        let session_key = session_key.clone();
        tokio::spawn(async move {
            let outcome = run_inference(
                &model, guard, stream_id, &inputs, &aliases, &requested, &node_name,
            )
            .await;
            send_completion(&events, node_id, session_key, outcome);
        });
        Ok(())
    }

    fn try_disarm(&mut self, session_key: &SessionKey, timeout: Duration) -> bool {
        let Some(guard) = self.guards.get_mut(session_key) else {
            self.state.release_session(session_key);
            return true;
        };
        if guard.try_disarm(timeout) {
            self.guards.remove(session_key);
            self.state.release_session(session_key);
            true
        } else {
            false
        }
    }

    fn release(&mut self, session_key: &SessionKey) {
        self.guards.remove(session_key);
        self.state.release_session(session_key);
    }
}

/// Runs one inference call and converts the outputs to the node's aliases.
///
/// The guard travels into this call and is dropped once the stream is no
/// longer needed, returning the slot to the pool on every path.
async fn run_inference(
    model: &Arc<ModelInstance>,
    guard: StreamGuard,
    stream_id: StreamId,
    inputs: &TensorMap,
    aliases: &HashMap<String, String>,
    requested: &[String],
    node_name: &str,
) -> Result<TensorMap, PipelineError> {
    for input_name in model.inputs_info().keys() {
        if !inputs.contains_key(input_name) {
            return Err(PipelineError::MissingInput {
                node: node_name.to_string(),
                input: input_name.clone(),
            });
        }
    }
    let produced = model.infer(stream_id, inputs).await?;
    drop(guard);

    let mut outputs = TensorMap::new();
    for alias in requested {
        let real_name = aliases.get(alias).map_or(alias.as_str(), String::as_str);
        let Some(tensor) = produced.get(real_name) else {
            return Err(PipelineError::MissingOutput {
                node: node_name.to_string(),
                output: alias.clone(),
            });
        };
        outputs.insert(alias.clone(), tensor.clone());
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::completion_channel;
    use crate::session::NodeSessionMetadata;
    use crate::testing::AddConstantBackend;
    use crate::tensor::{Precision, Tensor};

    fn registry_with(model: ModelInstance) -> Arc<ModelRegistry> {
        let registry = ModelRegistry::new();
        registry.register(model);
        Arc::new(registry)
    }

    fn ready_node(registry: Arc<ModelRegistry>) -> (ModelNode, SessionKey) {
        let mut node = ModelNode::new(
            "infer",
            "adder",
            HashMap::new(),
            None,
            HashSet::new(),
            registry,
        );
        node.state_mut().add_requested_outputs(["sum".to_string()]);
        let key = {
            let session = node
                .state_mut()
                .get_or_create_session(&NodeSessionMetadata::new())
                .unwrap();
            session.session_key().clone()
        };
        (node, key)
    }

    fn input_tensor() -> Tensor {
        let data: Vec<u8> = [1.0f32, 2.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        Tensor::new(Precision::Fp32, vec![1, 2], data).unwrap()
    }

    #[tokio::test]
    async fn test_executes_and_reports_aliased_outputs() {
        let registry = registry_with(AddConstantBackend::model("adder", 1.0, 2));
        let (mut node, key) = ready_node(registry);
        node.state_mut()
            .session_mut(&key)
            .unwrap()
            .set_input("x", input_tensor(), 0)
            .unwrap();

        let (events, mut receiver) = completion_channel();
        node.execute(&key, &events).await.unwrap();

        let event = receiver.recv().await.unwrap();
        let outputs = event.outcome.unwrap();
        assert!(outputs.contains_key("sum"));
    }

    #[tokio::test]
    async fn test_missing_model_reports_failure_event() {
        let (mut node, key) = ready_node(Arc::new(ModelRegistry::new()));
        let (events, mut receiver) = completion_channel();
        node.execute(&key, &events).await.unwrap();

        let event = receiver.recv().await.unwrap();
        assert!(matches!(
            event.outcome,
            Err(PipelineError::ModelMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_exhausted_pool_defers_session() {
        let registry = registry_with(AddConstantBackend::model("adder", 1.0, 1));
        let model = registry.get("adder").unwrap();
        let slot = model.streams().acquire();

        let (mut node, key) = ready_node(registry);
        node.state_mut()
            .session_mut(&key)
            .unwrap()
            .set_input("x", input_tensor(), 0)
            .unwrap();

        let (events, mut receiver) = completion_channel();
        let err = node.execute(&key, &events).await.unwrap_err();
        assert!(matches!(err, PipelineError::StreamIdNotReadyYet));

        // Releasing the stream lets the retry succeed.
        model.streams().release(slot);
        node.execute(&key, &events).await.unwrap();
        let event = receiver.recv().await.unwrap();
        assert!(event.outcome.is_ok());
        assert_eq!(model.streams().idle_count(), 1);
    }

    #[tokio::test]
    async fn test_disarm_of_deferred_session_frees_nothing_extra() {
        let registry = registry_with(AddConstantBackend::model("adder", 1.0, 1));
        let model = registry.get("adder").unwrap();
        let slot = model.streams().acquire();

        let (mut node, key) = ready_node(registry);
        let (events, _receiver) = completion_channel();
        let err = node.execute(&key, &events).await.unwrap_err();
        assert!(matches!(err, PipelineError::StreamIdNotReadyYet));

        // Guard cannot resolve while the pool is empty.
        assert!(!node.try_disarm(&key, Duration::from_millis(1)));
        model.streams().release(slot);
        assert!(node.try_disarm(&key, Duration::from_millis(20)));
        assert_eq!(model.streams().idle_count(), 1);
    }
}
