//! Pipeline spec data types (§3 "Pipeline spec", "Step").

use cadence_kernel::{RetryPolicy, StepId, Value};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the pipeline; the stable substitution key
    /// (`steps.<id>...`).
    pub id: StepId,
    /// Tool address, `<namespace>.<name>`.
    pub uses: String,
    /// Literal or templated arguments, rendered by the template resolver
    /// before validation against the tool's input schema.
    #[serde(default)]
    pub with: Value,
    /// Where this step's output lands in the variable map. Omit to discard
    /// the output.
    #[serde(default)]
    pub save_as: Option<String>,
    /// Predicate gating whether this step runs at all.
    #[serde(default, rename = "if")]
    pub if_predicate: Option<String>,
    /// Overrides the pipeline-wide default retry policy for this step.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Per-step timeout, in seconds. Defaults to `default_step_timeout`
    /// (§6 configuration) when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Pipeline {
    pub steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }
}
