//! # Inferflow
//!
//! An event-driven execution engine for model inference pipelines.
//!
//! Inferflow drives user-defined computation graphs composed of
//! model-inference stages and native plugin stages:
//!
//! - **Typed data-flow scheduling**: nodes execute as soon as every upstream
//!   edge has delivered, reported through a shared completion queue
//! - **Demultiplex / gather branching**: one session fans out into parallel
//!   per-item branches and is recombined deterministically
//! - **Bounded stream pools**: concurrent inference per model is capped by a
//!   fixed pool of execution streams with RAII guards
//! - **Custom node plugins**: a five-operation capability contract with
//!   strict cross-boundary buffer ownership
//! - **Validated definitions**: graphs are checked once, at definition
//!   time, and instantiated fresh per request
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use inferflow::prelude::*;
//!
//! let factory = PipelineFactory::new();
//! factory.create_definition("ocr", nodes, connections, &registry)?;
//! let mut pipeline = factory.create_pipeline("ocr", &registry, request)?;
//! let response = pipeline.execute().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

pub mod errors;
pub mod io;
pub mod models;
pub mod nodes;
pub mod observability;
pub mod pipeline;
pub mod plugin;
pub mod session;
pub mod streams;
pub mod tensor;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::errors::{PipelineError, ValidationError};
    pub use crate::io::{InferenceRequest, InferenceResponse};
    pub use crate::models::{InferenceBackend, ModelInstance, ModelRegistry};
    pub use crate::nodes::{
        Aliases, CustomNode, Demultiply, EntryNode, ExitNode, ModelNode, Node, NodeId,
    };
    pub use crate::pipeline::{
        Connections, DefinitionStateCode, NodeInfo, NodeKind, Pipeline, PipelineDefinition,
        PipelineFactory,
    };
    pub use crate::plugin::{
        CustomNodeLibrary, CustomNodeParam, CustomNodeTensor, CustomNodeTensorView,
    };
    pub use crate::session::{NodeSession, NodeSessionMetadata, SessionKey};
    pub use crate::streams::{StreamGuard, StreamId, StreamPool};
    pub use crate::tensor::{Precision, Tensor, TensorInfo, TensorMap};
}
