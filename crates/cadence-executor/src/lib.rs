//! `cadence-executor`: the pipeline execution engine (§4.G-§4.K, §9).
//!
//! Pure, deterministic pieces (template resolution, conditional evaluation,
//! schema validation, DAG validation) are separated from the one stateful,
//! nondeterministic piece (tool invocation) so that everything but the tool
//! catalog is unit-testable without an event loop.

mod conditional;
mod pipeline;
mod schema;
mod step;
mod template;
mod tool;
mod validate;

pub use conditional::evaluate as evaluate_conditional;
pub use pipeline::{CancelFlag, PipelineExecutor, PipelineRunResult, StepRecord};
pub use schema::SchemaValidator;
pub use step::{Pipeline, Step};
pub use template::render as render_template;
pub use tool::{EchoTool, NoopTool, Tool, ToolCatalog};
pub use validate::validate_pipeline;
