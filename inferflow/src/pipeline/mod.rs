//! Pipeline instantiation and execution.
//!
//! A [`Pipeline`] is the one-shot executable instance of a validated graph:
//! it exclusively owns its nodes, drives them through the shared completion
//! queue until the exit node is satisfied, and is discarded afterwards.
//! [`PipelineDefinition`] is the reusable blueprint that validates a graph
//! once and instantiates a fresh pipeline per request.

pub mod event;

mod definition;
mod factory;
mod status;


pub use definition::{Connections, NodeInfo, NodeKind, PipelineDefinition};
pub use factory::PipelineFactory;
pub use status::{DefinitionEvent, DefinitionStateCode, DefinitionStatus};

use crate::errors::PipelineError;
use crate::io::InferenceResponse;
use crate::nodes::{Aliases, Node, NodeId};
use crate::pipeline::event::{completion_channel, EventReceiver, EventSender, NodeFinishedEvent};
use crate::session::{NodeSessionMetadata, SessionKey};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

const WAIT_FOR_FINISHED_NODE_TIMEOUT: Duration = Duration::from_millis(5);
const WAIT_FOR_DEFERRED_NODE_DISARM_TIMEOUT: Duration = Duration::from_micros(500);

/// One executable instance of a validated pipeline graph.
///
/// Nodes are pushed in definition order and wired with [`connect`]; the
/// instance then runs exactly one request to completion.
///
/// [`connect`]: Pipeline::connect
pub struct Pipeline {
    name: String,
    run_id: Uuid,
    nodes: Vec<Box<dyn Node>>,
    entry: NodeId,
    exit: NodeId,
}

impl Pipeline {
    /// Creates an empty pipeline instance.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run_id: Uuid::new_v4(),
            nodes: Vec::new(),
            entry: 0,
            exit: 0,
        }
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The identity of this run, included in log events.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Takes exclusive ownership of a node, returning its id.
    pub fn push(&mut self, mut node: Box<dyn Node>) -> NodeId {
        let id = self.nodes.len();
        node.state_mut().set_id(id);
        self.nodes.push(node);
        id
    }

    /// Marks which pushed nodes are the graph's entry and exit.
    pub fn set_terminals(&mut self, entry: NodeId, exit: NodeId) {
        self.entry = entry;
        self.exit = exit;
    }

    /// Wires an edge: `aliases` maps the producer's output aliases to the
    /// consumer's input names.
    pub fn connect(&mut self, from: NodeId, to: NodeId, aliases: Aliases) {
        let producer_name = self.nodes[from].name().to_string();
        let consumer_name = self.nodes[to].name().to_string();
        for (output, input) in &aliases {
            debug!(
                from = %producer_name,
                to = %consumer_name,
                "link {consumer_name}[{input}] = {producer_name}[{output}]"
            );
        }
        let outputs: Vec<String> = aliases.iter().map(|(output, _)| output.clone()).collect();
        self.nodes[from].state_mut().add_dependant(to);
        self.nodes[from].state_mut().add_requested_outputs(outputs);
        self.nodes[to].state_mut().add_dependency(producer_name, aliases);
    }

    /// Runs the pipeline to completion and returns the exit node's response.
    ///
    /// The orchestrator drains the completion queue, propagating each
    /// finished session's outputs to its dependants and scheduling sessions
    /// as they become ready. Sessions whose stream guard cannot resolve are
    /// parked and retried whenever the queue is idle. The first error
    /// becomes the pipeline result; sibling branches already executing are
    /// drained (or their guards disarmed) before the error is returned.
    pub async fn execute(&mut self) -> Result<InferenceResponse, PipelineError> {
        debug!(pipeline = %self.name, run = %self.run_id, "started pipeline execution");
        let (events, mut receiver) = completion_channel();
        let mut first_error: Option<PipelineError> = None;
        let mut started: HashSet<(NodeId, SessionKey)> = HashSet::new();
        let mut finished: HashSet<(NodeId, SessionKey)> = HashSet::new();
        let mut deferred: Vec<(NodeId, SessionKey)> = Vec::new();
        let mut response = InferenceResponse::default();

        let entry_key = {
            let session = self.nodes[self.entry]
                .state_mut()
                .get_or_create_session(&NodeSessionMetadata::new())?;
            session.session_key().clone()
        };
        started.insert((self.entry, entry_key.clone()));
        self.nodes[self.entry].execute(&entry_key, &events).await?;

        loop {
            let event = tokio::time::timeout(WAIT_FOR_FINISHED_NODE_TIMEOUT, receiver.recv()).await;
            match event {
                Ok(Some(event)) => {
                    let NodeFinishedEvent {
                        node: node_id,
                        session_key,
                        outcome,
                    } = event;
                    debug!(
                        pipeline = %self.name,
                        node = %self.nodes[node_id].name(),
                        session = %session_key,
                        "node session finished"
                    );
                    finished.insert((node_id, session_key.clone()));
                    if let Err(err) = self.nodes[node_id].record_outcome(&session_key, outcome) {
                        error!(
                            pipeline = %self.name,
                            node = %self.nodes[node_id].name(),
                            session = %session_key,
                            "failed to record session results"
                        );
                        set_fail_if_not_failed_earlier(&mut first_error, err);
                    }
                    if first_error.is_some() {
                        self.nodes[node_id].release(&session_key);
                        if finished.len() == started.len() && deferred.is_empty() {
                            break;
                        }
                        continue;
                    }

                    let results = match self.nodes[node_id].fetch_results(&session_key) {
                        Ok(results) => results,
                        Err(err) => {
                            warn!(
                                pipeline = %self.name,
                                node = %self.nodes[node_id].name(),
                                session = %session_key,
                                error = %err,
                                "node session failed"
                            );
                            set_fail_if_not_failed_earlier(&mut first_error, err);
                            if finished.len() == started.len() && deferred.is_empty() {
                                break;
                            }
                            continue;
                        }
                    };

                    if node_id == self.exit {
                        for result in results.into_values() {
                            response.outputs.extend(result.tensors);
                        }
                        if finished.len() == started.len() {
                            break;
                        }
                        continue;
                    }

                    // Feed dependants, then schedule any session that became
                    // ready; sessions whose stream is busy get deferred.
                    let dependants = self.nodes[node_id].state().dependants().to_vec();
                    let producer_name = self.nodes[node_id].name().to_string();
                    for &dependant in &dependants {
                        if let Err(err) =
                            self.nodes[dependant].set_inputs(&producer_name, &results)
                        {
                            warn!(
                                pipeline = %self.name,
                                node = %self.nodes[dependant].name(),
                                error = %err,
                                "failed to set inputs"
                            );
                            set_fail_if_not_failed_earlier(&mut first_error, err);
                            break;
                        }
                    }
                    if first_error.is_none() {
                        'schedule: for &dependant in &dependants {
                            for ready_key in self.nodes[dependant].ready_sessions() {
                                debug!(
                                    pipeline = %self.name,
                                    node = %self.nodes[dependant].name(),
                                    session = %ready_key,
                                    "starting node session"
                                );
                                started.insert((dependant, ready_key.clone()));
                                match self.nodes[dependant].execute(&ready_key, &events).await {
                                    Ok(()) => {}
                                    Err(PipelineError::StreamIdNotReadyYet) => {
                                        deferred.push((dependant, ready_key));
                                    }
                                    Err(err) => {
                                        finished.insert((dependant, ready_key.clone()));
                                        self.nodes[dependant].release(&ready_key);
                                        set_fail_if_not_failed_earlier(&mut first_error, err);
                                        break 'schedule;
                                    }
                                }
                            }
                        }
                    }
                    if first_error.is_none() {
                        self.try_deferred_sessions(
                            &mut deferred,
                            &mut finished,
                            &mut first_error,
                            &events,
                            Some(&receiver),
                        )
                        .await;
                    }
                    if finished.len() == started.len() && deferred.is_empty() {
                        break;
                    }
                }
                Ok(None) => {
                    set_fail_if_not_failed_earlier(
                        &mut first_error,
                        PipelineError::internal("completion queue closed unexpectedly"),
                    );
                    break;
                }
                Err(_elapsed) => {
                    if first_error.is_some() {
                        // Disarm the stream guards of deferred sessions so the
                        // pipeline can shut down without leaking slots.
                        let mut index = 0;
                        while index < deferred.len() {
                            let (node_id, key) = deferred[index].clone();
                            if self.nodes[node_id]
                                .try_disarm(&key, WAIT_FOR_DEFERRED_NODE_DISARM_TIMEOUT)
                            {
                                debug!(
                                    pipeline = %self.name,
                                    node = %self.nodes[node_id].name(),
                                    session = %key,
                                    "deferred session disarmed"
                                );
                                finished.insert((node_id, key));
                                deferred.remove(index);
                            } else {
                                index += 1;
                            }
                        }
                    } else {
                        self.try_deferred_sessions(
                            &mut deferred,
                            &mut finished,
                            &mut first_error,
                            &events,
                            None,
                        )
                        .await;
                    }
                    if finished.len() == started.len() && deferred.is_empty() && receiver.is_empty()
                    {
                        break;
                    }
                }
            }
        }

        match first_error {
            Some(err) => {
                warn!(
                    pipeline = %self.name,
                    run = %self.run_id,
                    error = %err,
                    "pipeline execution failed"
                );
                Err(err)
            }
            None => {
                debug!(pipeline = %self.name, run = %self.run_id, "pipeline execution finished");
                Ok(response)
            }
        }
    }

    /// Retries deferred sessions; stops early when new completion events are
    /// waiting, since a finished node may unlock a stream or further work.
    async fn try_deferred_sessions(
        &mut self,
        deferred: &mut Vec<(NodeId, SessionKey)>,
        finished: &mut HashSet<(NodeId, SessionKey)>,
        first_error: &mut Option<PipelineError>,
        events: &EventSender,
        receiver: Option<&EventReceiver>,
    ) {
        let mut index = 0;
        while index < deferred.len() {
            if receiver.is_some_and(|r| !r.is_empty()) {
                break;
            }
            let (node_id, key) = deferred[index].clone();
            match self.nodes[node_id].execute(&key, events).await {
                Ok(()) => {
                    debug!(
                        pipeline = %self.name,
                        node = %self.nodes[node_id].name(),
                        session = %key,
                        "deferred session started"
                    );
                    deferred.remove(index);
                }
                Err(PipelineError::StreamIdNotReadyYet) => {
                    index += 1;
                }
                Err(err) => {
                    finished.insert((node_id, key.clone()));
                    self.nodes[node_id].release(&key);
                    set_fail_if_not_failed_earlier(first_error, err);
                    deferred.remove(index);
                }
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("run_id", &self.run_id)
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

fn set_fail_if_not_failed_earlier(first_error: &mut Option<PipelineError>, err: PipelineError) {
    if first_error.is_none() {
        *first_error = Some(err);
    }
}
