//! Tool-catalog client (§4.K): the single channel between the pipeline
//! executor and the external world. A tool is addressed as
//! `<namespace>.<name>` and resolves to a callable plus its declared I/O
//! schemas — "no inheritance; a flat registry suffices" (§9).
//!
//! This generalizes the single fixed action channel of a classic
//! action-executor design (one `invoke` entry point, fully governable) to a
//! named registry of many such channels, one per tool address.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cadence_kernel::{KernelError, Value};

#[async_trait]
pub trait Tool: Send + Sync {
    fn input_schema(&self) -> Value;
    fn output_schema(&self) -> Value;

    /// Invokes the tool. Implementations classify failures by returning
    /// `KernelError::ToolError { retryable, .. }` — transport/5xx/timeout
    /// errors are retryable, validation/4xx/explicit errors are not (§4.J).
    async fn invoke(&self, args: Value) -> Result<Value, KernelError>;
}

/// A flat address -> tool registry.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, address: impl Into<String>, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(address.into(), tool);
        self
    }

    pub fn resolve(&self, address: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(address).cloned()
    }
}

/// Echoes its input back as output. Used by the test suite and as a
/// reference implementation for new tool adapters.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn input_schema(&self) -> Value {
        serde_json::json!({})
    }

    fn output_schema(&self) -> Value {
        serde_json::json!({})
    }

    async fn invoke(&self, args: Value) -> Result<Value, KernelError> {
        Ok(args)
    }
}

/// Ignores its input, returns `null`. Used as a no-op pipeline step in
/// scheduler-only tests (§8 scenario S1).
pub struct NoopTool;

#[async_trait]
impl Tool for NoopTool {
    fn input_schema(&self) -> Value {
        serde_json::json!({})
    }

    fn output_schema(&self) -> Value {
        serde_json::json!({})
    }

    async fn invoke(&self, _args: Value) -> Result<Value, KernelError> {
        Ok(Value::Null)
    }
}
