//! Reusable, versioned pipeline blueprints.

use super::status::{DefinitionEvent, DefinitionStateCode, DefinitionStatus};
use super::Pipeline;
use crate::errors::{PipelineError, ValidationError};
use crate::io::InferenceRequest;
use crate::models::ModelRegistry;
use crate::nodes::{Aliases, CustomNode, Demultiply, EntryNode, ExitNode, ModelNode, Node, NodeId};
use crate::plugin::{
    build_parameters, convert_tensor_infos, CustomNodeLibrary, PluginState,
};
use crate::tensor::{Dim, TensorInfoMap};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// The four node kinds a graph definition may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// The graph's source; materializes the request.
    Entry,
    /// Runs a compiled model.
    Model,
    /// Runs a native compute plugin.
    Custom,
    /// The graph's sink; assembles the response.
    Exit,
}

/// Declaration of one node: kind, name, and wiring parameters.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node kind.
    pub kind: NodeKind,
    /// Unique node name.
    pub name: String,
    /// Target model, for model nodes.
    pub model_name: Option<String>,
    /// Plugin implementation, for custom nodes.
    pub library: Option<Arc<dyn CustomNodeLibrary>>,
    /// Free-form per-plugin configuration.
    pub parameters: HashMap<String, String>,
    /// Output alias to real tensor name mapping.
    pub output_aliases: HashMap<String, String>,
    /// How many parallel branches this node spawns per session.
    pub demultiply: Option<Demultiply>,
    /// Upstream demultiplexers whose branches are recombined before this
    /// node runs.
    pub gather_from: HashSet<String>,
}

impl NodeInfo {
    fn new(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            model_name: None,
            library: None,
            parameters: HashMap::new(),
            output_aliases: HashMap::new(),
            demultiply: None,
            gather_from: HashSet::new(),
        }
    }

    /// Declares the entry node.
    #[must_use]
    pub fn entry(name: impl Into<String>) -> Self {
        Self::new(NodeKind::Entry, name)
    }

    /// Declares a model-inference node.
    #[must_use]
    pub fn model(name: impl Into<String>, model_name: impl Into<String>) -> Self {
        let mut info = Self::new(NodeKind::Model, name);
        info.model_name = Some(model_name.into());
        info
    }

    /// Declares a custom-plugin node.
    #[must_use]
    pub fn custom(name: impl Into<String>, library: Arc<dyn CustomNodeLibrary>) -> Self {
        let mut info = Self::new(NodeKind::Custom, name);
        info.library = Some(library);
        info
    }

    /// Declares the exit node.
    #[must_use]
    pub fn exit(name: impl Into<String>) -> Self {
        Self::new(NodeKind::Exit, name)
    }

    /// Sets the demultiply configuration.
    #[must_use]
    pub fn with_demultiply(mut self, demultiply: Demultiply) -> Self {
        self.demultiply = Some(demultiply);
        self
    }

    /// Adds a gather target.
    #[must_use]
    pub fn with_gather_from(mut self, target: impl Into<String>) -> Self {
        self.gather_from.insert(target.into());
        self
    }

    /// Maps an output alias to the real tensor name.
    #[must_use]
    pub fn with_output_alias(mut self, alias: impl Into<String>, real: impl Into<String>) -> Self {
        self.output_aliases.insert(alias.into(), real.into());
        self
    }

    /// Adds one plugin configuration parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Connection map: consumer node to its producers' alias mappings.
pub type Connections = HashMap<String, HashMap<String, Aliases>>;

/// A validated, reusable graph blueprint and factory for [`Pipeline`]
/// instances.
///
/// Configuration errors are detected here, once per (re)load, never at
/// per-request time. The definition's lifecycle (see [`DefinitionStatus`])
/// gates instantiation.
pub struct PipelineDefinition {
    name: String,
    nodes: Vec<NodeInfo>,
    connections: Connections,
    status: DefinitionStatus,
    exit_gather: HashSet<String>,
    plugin_states: HashMap<String, Option<PluginState>>,
}

impl PipelineDefinition {
    /// Creates an unvalidated definition.
    #[must_use]
    pub fn new(name: impl Into<String>, nodes: Vec<NodeInfo>, connections: Connections) -> Self {
        let name = name.into();
        Self {
            status: DefinitionStatus::new(&name),
            name,
            nodes,
            connections,
            exit_gather: HashSet::new(),
            plugin_states: HashMap::new(),
        }
    }

    /// The definition name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state_code(&self) -> DefinitionStateCode {
        self.status.state_code()
    }

    /// Whether a referenced model changed since the last validation.
    #[must_use]
    pub fn requires_revalidation(&self) -> bool {
        self.status.requires_revalidation()
    }

    /// Whether the definition references `model`.
    #[must_use]
    pub fn references_model(&self, model: &str) -> bool {
        self.nodes
            .iter()
            .any(|node| node.model_name.as_deref() == Some(model))
    }

    /// Notes that a referenced model was reloaded or removed; new
    /// instantiations are blocked until [`validate`](Self::validate) runs
    /// again.
    pub fn notify_used_model_changed(&mut self) {
        self.status.handle(DefinitionEvent::UsedModelChanged);
    }

    /// Removes the definition from service and tears down plugin state.
    pub fn retire(&mut self) {
        self.deinitialize_plugins();
        self.status.handle(DefinitionEvent::Retire);
    }

    /// Replaces the graph and revalidates.
    pub fn reload(
        &mut self,
        nodes: Vec<NodeInfo>,
        connections: Connections,
        registry: &ModelRegistry,
    ) -> Result<(), ValidationError> {
        self.status.handle(DefinitionEvent::Reload);
        self.deinitialize_plugins();
        self.nodes = nodes;
        self.connections = connections;
        self.exit_gather.clear();
        self.validate(registry)
    }

    /// Runs the full validation pass and updates the lifecycle state.
    pub fn validate(&mut self, registry: &ModelRegistry) -> Result<(), ValidationError> {
        debug!(definition = %self.name, "validating pipeline definition");
        let result = self.run_validation(registry);
        match &result {
            Ok(()) => self.status.handle(DefinitionEvent::ValidationPassed),
            Err(err) => {
                warn!(definition = %self.name, error = %err, "validation failed");
                self.status.handle(DefinitionEvent::ValidationFailed);
            }
        }
        result
    }

    fn run_validation(&mut self, registry: &ModelRegistry) -> Result<(), ValidationError> {
        self.validate_node_declarations()?;
        self.initialize_plugins()?;
        self.validate_connections(registry)?;
        self.validate_for_cycles()?;
        self.validate_demultiplex_gather_order()?;
        Ok(())
    }

    /// Instantiates a fresh pipeline for one request.
    pub fn create_pipeline(
        &self,
        registry: &Arc<ModelRegistry>,
        request: InferenceRequest,
    ) -> Result<Pipeline, PipelineError> {
        if !self.status.is_available() {
            return Err(PipelineError::DefinitionNotAvailable {
                name: self.name.clone(),
                state: self.state_code().to_string(),
            });
        }
        let mut pipeline = Pipeline::new(&self.name);
        let mut ids: HashMap<String, NodeId> = HashMap::new();
        let mut entry_id = 0;
        let mut exit_id = 0;
        for info in &self.nodes {
            let node: Box<dyn Node> = match info.kind {
                NodeKind::Entry => {
                    Box::new(EntryNode::new(&info.name, request.clone(), info.demultiply))
                }
                NodeKind::Model => {
                    let Some(model_name) = info.model_name.clone() else {
                        return Err(PipelineError::internal(format!(
                            "model node '{}' lost its model name",
                            info.name
                        )));
                    };
                    Box::new(ModelNode::new(
                        &info.name,
                        model_name,
                        info.output_aliases.clone(),
                        info.demultiply,
                        info.gather_from.clone(),
                        Arc::clone(registry),
                    ))
                }
                NodeKind::Custom => {
                    let Some(library) = info.library.clone() else {
                        return Err(PipelineError::internal(format!(
                            "custom node '{}' lost its library",
                            info.name
                        )));
                    };
                    Box::new(CustomNode::new(
                        &info.name,
                        library,
                        &info.parameters,
                        self.plugin_states.get(&info.name).cloned().flatten(),
                        info.output_aliases.clone(),
                        info.demultiply,
                        info.gather_from.clone(),
                    ))
                }
                NodeKind::Exit => Box::new(ExitNode::new(&info.name, self.exit_gather.clone())),
            };
            let id = pipeline.push(node);
            match info.kind {
                NodeKind::Entry => entry_id = id,
                NodeKind::Exit => exit_id = id,
                _ => {}
            }
            ids.insert(info.name.clone(), id);
        }
        pipeline.set_terminals(entry_id, exit_id);

        for (consumer, producers) in &self.connections {
            for (producer, aliases) in producers {
                let (Some(&from), Some(&to)) = (ids.get(producer), ids.get(consumer)) else {
                    return Err(PipelineError::internal(format!(
                        "connection references unknown node '{producer}' or '{consumer}'"
                    )));
                };
                pipeline.connect(from, to, aliases.clone());
            }
        }
        Ok(pipeline)
    }

    fn node(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|node| node.name == name)
    }

    fn validate_node_declarations(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        let mut entries = 0usize;
        let mut exits = 0usize;
        for info in &self.nodes {
            if !seen.insert(info.name.clone()) {
                return Err(ValidationError::DuplicateNodeName {
                    node: info.name.clone(),
                });
            }
            match info.kind {
                NodeKind::Entry => entries += 1,
                NodeKind::Exit => exits += 1,
                NodeKind::Model => {
                    if info.model_name.is_none() {
                        return Err(ValidationError::ModelNameMissing {
                            node: info.name.clone(),
                        });
                    }
                }
                NodeKind::Custom => {
                    if info.library.is_none() {
                        return Err(ValidationError::LibraryMissing {
                            node: info.name.clone(),
                        });
                    }
                }
            }
        }
        match entries {
            0 => return Err(ValidationError::MissingEntryNode),
            1 => {}
            _ => return Err(ValidationError::MultipleEntryNodes),
        }
        match exits {
            0 => return Err(ValidationError::MissingExitNode),
            1 => {}
            _ => return Err(ValidationError::MultipleExitNodes),
        }
        Ok(())
    }

    fn initialize_plugins(&mut self) -> Result<(), ValidationError> {
        self.deinitialize_plugins();
        for info in &self.nodes {
            let (NodeKind::Custom, Some(library)) = (info.kind, info.library.as_ref()) else {
                continue;
            };
            let params = build_parameters(&info.parameters);
            match library.initialize(&params) {
                Ok(state) => {
                    self.plugin_states.insert(info.name.clone(), state);
                }
                Err(code) => {
                    return Err(ValidationError::LibraryInitializationFailed {
                        node: info.name.clone(),
                        code,
                    });
                }
            }
        }
        Ok(())
    }

    fn deinitialize_plugins(&mut self) {
        for (name, state) in self.plugin_states.drain() {
            if let Some(info) = self.nodes.iter().find(|node| node.name == name) {
                if let Some(library) = info.library.as_ref() {
                    library.deinitialize(state.as_ref());
                }
            }
        }
    }

    /// Queries a custom node's declared inputs or outputs.
    fn custom_node_infos(
        &self,
        info: &NodeInfo,
        outputs: bool,
    ) -> Result<TensorInfoMap, ValidationError> {
        let Some(library) = info.library.as_ref() else {
            return Err(ValidationError::LibraryMissing {
                node: info.name.clone(),
            });
        };
        let params = build_parameters(&info.parameters);
        let state = self.plugin_states.get(&info.name).cloned().flatten();
        let result = if outputs {
            library.outputs_info(&params, state.as_ref())
        } else {
            library.inputs_info(&params, state.as_ref())
        };
        convert_tensor_infos(&info.name, result, library.as_ref(), state.as_ref()).map_err(
            |err| {
                let code = match err {
                    PipelineError::PluginExecutionFailed { code, .. } => code,
                    _ => -1,
                };
                ValidationError::LibraryMetadataFailed {
                    node: info.name.clone(),
                    code,
                }
            },
        )
    }

    /// Declared inputs a consumer requires; `None` when unconstrained.
    fn consumer_inputs_info(
        &self,
        info: &NodeInfo,
        registry: &ModelRegistry,
    ) -> Result<Option<TensorInfoMap>, ValidationError> {
        match info.kind {
            NodeKind::Model => {
                let Some(model_name) = info.model_name.as_deref() else {
                    return Err(ValidationError::ModelNameMissing {
                        node: info.name.clone(),
                    });
                };
                let Some(model) = registry.get(model_name) else {
                    return Err(ValidationError::MissingModel {
                        node: info.name.clone(),
                        model: model_name.to_string(),
                    });
                };
                Ok(Some(model.inputs_info().clone()))
            }
            NodeKind::Custom => Ok(Some(self.custom_node_infos(info, false)?)),
            NodeKind::Entry | NodeKind::Exit => Ok(None),
        }
    }

    /// Declared outputs a producer exposes; `None` when unconstrained
    /// (entry outputs mirror whatever the request carries).
    fn producer_outputs_info(
        &self,
        info: &NodeInfo,
        registry: &ModelRegistry,
    ) -> Result<Option<TensorInfoMap>, ValidationError> {
        match info.kind {
            NodeKind::Model => {
                let Some(model_name) = info.model_name.as_deref() else {
                    return Err(ValidationError::ModelNameMissing {
                        node: info.name.clone(),
                    });
                };
                let Some(model) = registry.get(model_name) else {
                    return Err(ValidationError::MissingModel {
                        node: info.name.clone(),
                        model: model_name.to_string(),
                    });
                };
                Ok(Some(model.outputs_info().clone()))
            }
            NodeKind::Custom => Ok(Some(self.custom_node_infos(info, true)?)),
            NodeKind::Entry | NodeKind::Exit => Ok(None),
        }
    }

    /// Leading dimension a gathering consumer prepends to incoming shapes.
    fn gather_dim(&self, consumer: &NodeInfo) -> Option<Dim> {
        if consumer.gather_from.is_empty() {
            return None;
        }
        let mut total = 1usize;
        for target in &consumer.gather_from {
            match self.node(target).and_then(|node| node.demultiply) {
                Some(Demultiply::Count(count)) => total *= count,
                _ => return Some(Dim::Any),
            }
        }
        Some(Dim::Fixed(total))
    }

    fn validate_connections(&self, registry: &ModelRegistry) -> Result<(), ValidationError> {
        let names: HashSet<&str> = self.nodes.iter().map(|node| node.name.as_str()).collect();

        // Every consumer, producer, and gather target must exist; entry
        // cannot consume and exit cannot produce.
        for (consumer, producers) in &self.connections {
            if !names.contains(consumer.as_str()) {
                let from = producers.keys().next().cloned().unwrap_or_default();
                return Err(ValidationError::DanglingConnection {
                    from,
                    to: consumer.clone(),
                });
            }
            for producer in producers.keys() {
                if !names.contains(producer.as_str()) {
                    return Err(ValidationError::DanglingConnection {
                        from: producer.clone(),
                        to: consumer.clone(),
                    });
                }
            }
        }
        for info in &self.nodes {
            if let Some(producers) = self.connections.get(&info.name) {
                if info.kind == NodeKind::Entry {
                    return Err(ValidationError::EntryNodeWithInputs {
                        node: info.name.clone(),
                    });
                }
                for producer in producers.keys() {
                    if self.node(producer).map(|node| node.kind) == Some(NodeKind::Exit) {
                        return Err(ValidationError::ExitNodeWithOutputs {
                            node: producer.clone(),
                        });
                    }
                }
            }
            for target in &info.gather_from {
                let demultiplexes = self
                    .node(target)
                    .is_some_and(|node| node.demultiply.is_some());
                if !demultiplexes {
                    return Err(ValidationError::GatherFromUnknownNode {
                        node: info.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        // Connectivity: every non-entry node consumes, every non-exit node
        // produces.
        let producing: HashSet<&str> = self
            .connections
            .values()
            .flat_map(|producers| producers.keys().map(String::as_str))
            .collect();
        for info in &self.nodes {
            if info.kind != NodeKind::Entry && !self.connections.contains_key(&info.name) {
                return Err(ValidationError::UnconnectedNode {
                    node: info.name.clone(),
                });
            }
            if info.kind != NodeKind::Exit && !producing.contains(info.name.as_str()) {
                return Err(ValidationError::UnconnectedNode {
                    node: info.name.clone(),
                });
            }
        }

        // Per-consumer checks: input coverage, single producer per input,
        // referenced outputs exist, shapes and precisions line up.
        for (consumer_name, producers) in &self.connections {
            let Some(consumer) = self.node(consumer_name) else {
                continue;
            };
            let consumer_inputs = self.consumer_inputs_info(consumer, registry)?;
            let gather_dim = self.gather_dim(consumer);

            let mut connected: HashMap<&str, usize> = HashMap::new();
            for (producer_name, aliases) in producers {
                let Some(producer) = self.node(producer_name) else {
                    continue;
                };
                let producer_outputs = self.producer_outputs_info(producer, registry)?;
                for (output_alias, input_name) in aliases {
                    *connected.entry(input_name.as_str()).or_insert(0) += 1;

                    let Some(producer_outputs) = producer_outputs.as_ref() else {
                        continue;
                    };
                    let real_name = producer
                        .output_aliases
                        .get(output_alias)
                        .map_or(output_alias.as_str(), String::as_str);
                    let Some(output_info) = producer_outputs.get(real_name) else {
                        return Err(ValidationError::MissingConnectionOutput {
                            producer: producer_name.clone(),
                            consumer: consumer_name.clone(),
                            output: output_alias.clone(),
                        });
                    };
                    let Some(input_info) = consumer_inputs
                        .as_ref()
                        .and_then(|inputs| inputs.get(input_name))
                    else {
                        continue;
                    };

                    if input_info.precision != output_info.precision {
                        return Err(ValidationError::PrecisionMismatch {
                            producer: producer_name.clone(),
                            output: output_alias.clone(),
                            consumer: consumer_name.clone(),
                            input: input_name.clone(),
                            expected: input_info.precision.to_string(),
                            actual: output_info.precision.to_string(),
                        });
                    }
                    let mut produced_shape = output_info.shape.clone();
                    if producer.demultiply.is_some() && !produced_shape.is_empty() {
                        produced_shape.remove(0);
                    }
                    if let Some(dim) = gather_dim {
                        produced_shape.insert(0, dim);
                    }
                    let compatible = produced_shape.len() == input_info.shape.len()
                        && produced_shape
                            .iter()
                            .zip(&input_info.shape)
                            .all(|(a, b)| a.compatible(b));
                    if !compatible {
                        let actual = produced_shape
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(",");
                        return Err(ValidationError::ShapeMismatch {
                            producer: producer_name.clone(),
                            output: output_alias.clone(),
                            consumer: consumer_name.clone(),
                            input: input_name.clone(),
                            expected: input_info.shape_string(),
                            actual: format!("[{actual}]"),
                        });
                    }
                }
            }

            for (input, count) in &connected {
                if *count > 1 {
                    return Err(ValidationError::DuplicateInputConnection {
                        node: consumer_name.clone(),
                        input: (*input).to_string(),
                    });
                }
            }
            if let Some(required) = consumer_inputs {
                let mut missing: Vec<String> = required
                    .keys()
                    .filter(|name| !connected.contains_key(name.as_str()))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    missing.sort();
                    return Err(ValidationError::NotAllInputsConnected {
                        node: consumer_name.clone(),
                        missing,
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_for_cycles(&self) -> Result<(), ValidationError> {
        // Edges run producer -> consumer.
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for (consumer, producers) in &self.connections {
            for producer in producers.keys() {
                edges
                    .entry(producer.as_str())
                    .or_default()
                    .push(consumer.as_str());
            }
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();

        fn visit<'a>(
            node: &'a str,
            edges: &HashMap<&'a str, Vec<&'a str>>,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Result<(), ValidationError> {
            match marks.get(node) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    let start = path.iter().position(|name| *name == node).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(ToString::to_string).collect();
                    cycle.push(node.to_string());
                    return Err(ValidationError::CycleDetected { path: cycle });
                }
                None => {}
            }
            marks.insert(node, Mark::InProgress);
            path.push(node);
            if let Some(consumers) = edges.get(node) {
                for consumer in consumers {
                    visit(consumer, edges, marks, path)?;
                }
            }
            path.pop();
            marks.insert(node, Mark::Done);
            Ok(())
        }

        for info in &self.nodes {
            visit(&info.name, &edges, &mut marks, &mut path)?;
        }
        Ok(())
    }

    /// Walks entry-to-exit paths carrying the stack of open demultiplexers,
    /// verifying gathers unwind it in LIFO order and that converging paths
    /// agree. The exit node implicitly gathers whatever remains open; that
    /// set is recorded for instantiation.
    fn validate_demultiplex_gather_order(&mut self) -> Result<(), ValidationError> {
        let mut consumers_of: HashMap<&str, Vec<&str>> = HashMap::new();
        for (consumer, producers) in &self.connections {
            for producer in producers.keys() {
                consumers_of
                    .entry(producer.as_str())
                    .or_default()
                    .push(consumer.as_str());
            }
        }
        let Some(entry) = self.nodes.iter().find(|node| node.kind == NodeKind::Entry) else {
            return Err(ValidationError::MissingEntryNode);
        };

        let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
        let mut worklist: Vec<(String, Vec<String>)> = vec![(entry.name.clone(), Vec::new())];
        let mut exit_gather = HashSet::new();

        while let Some((name, stack)) = worklist.pop() {
            if let Some(recorded) = incoming.get(&name) {
                if *recorded != stack {
                    return Err(ValidationError::InconsistentDemultiplexPaths { node: name });
                }
                continue;
            }
            incoming.insert(name.clone(), stack.clone());

            let Some(info) = self.node(&name) else {
                continue;
            };
            let mut stack = stack;
            if info.kind == NodeKind::Exit {
                for target in &info.gather_from {
                    if !stack.contains(target) {
                        return Err(ValidationError::GatherFromUnknownNode {
                            node: name.clone(),
                            target: target.clone(),
                        });
                    }
                }
                exit_gather = stack.iter().cloned().collect();
                continue;
            }
            if !info.gather_from.is_empty() {
                let depth = info.gather_from.len();
                for target in &info.gather_from {
                    if !stack.contains(target) {
                        return Err(ValidationError::GatherFromUnknownNode {
                            node: name.clone(),
                            target: target.clone(),
                        });
                    }
                }
                if depth > stack.len() {
                    return Err(ValidationError::InconsistentDemultiplexPaths { node: name });
                }
                let top: HashSet<&String> = stack[stack.len() - depth..].iter().collect();
                let wanted: HashSet<&String> = info.gather_from.iter().collect();
                if top != wanted {
                    let expected = stack.last().cloned().unwrap_or_default();
                    return Err(ValidationError::GatherNotInLifoOrder {
                        node: name.clone(),
                        expected,
                    });
                }
                stack.truncate(stack.len() - depth);
            }
            if info.demultiply.is_some() {
                stack.push(name.clone());
            }
            if let Some(consumers) = consumers_of.get(name.as_str()) {
                for consumer in consumers {
                    worklist.push(((*consumer).to_string(), stack.clone()));
                }
            }
        }
        self.exit_gather = exit_gather;
        Ok(())
    }
}

impl std::fmt::Debug for PipelineDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDefinition")
            .field("name", &self.name)
            .field("nodes", &self.nodes)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Drop for PipelineDefinition {
    fn drop(&mut self) {
        self.deinitialize_plugins();
    }
}
