//! Pipeline executor (§4.J): walks a pipeline's steps in order, rendering
//! templates, evaluating `if` predicates, validating schemas, invoking tools
//! through the catalog, and applying per-step retry with backoff + jitter.
//!
//! Determinism contract (§4.J): given identical variable-map seeds and
//! identical tool outputs, this produces identical bindings and identical
//! control-flow decisions. All nondeterminism is confined to `Tool::invoke`
//! and the clock reads used for retry sleeps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use cadence_kernel::{
    decide, JitterSource, KernelError, RetryDecision, RetryPolicy, RunOutcome, StepId,
    StepOutcome, Value,
};
use chrono::{DateTime, Utc};

use crate::conditional;
use crate::schema::SchemaValidator;
use crate::step::{Pipeline, Step};
use crate::template;
use crate::tool::ToolCatalog;

/// Shared, clonable flag a caller can flip to request cancellation (§5: "a
/// cancel run admin action sets a cancel flag on the due-work row; the
/// worker checks the flag at step boundaries and on timeout").
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct StepRecord {
    pub step_id: StepId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StepOutcome,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Clone, Debug)]
pub struct PipelineRunResult {
    pub outcome: RunOutcome,
    pub steps: Vec<StepRecord>,
    pub variables: Value,
}

pub struct PipelineExecutor {
    pub catalog: ToolCatalog,
    pub default_retry: RetryPolicy,
    pub default_step_timeout: StdDuration,
    pub jitter: Arc<dyn JitterSource>,
}

impl PipelineExecutor {
    /// `seed_vars` must be a JSON object containing at least `now` and
    /// `params` (§4.J). `steps` is seeded empty and filled as the pipeline
    /// progresses.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        mut vars: Value,
        cancel: &CancelFlag,
        now_fn: impl Fn() -> DateTime<Utc>,
    ) -> PipelineRunResult {
        ensure_steps_object(&mut vars);
        let mut records = Vec::with_capacity(pipeline.steps.len());
        let mut failed = false;
        let mut failure_outcome: Option<StepOutcome> = None;

        for step in &pipeline.steps {
            if cancel.is_cancelled() {
                records.push(terminal_record(step, now_fn(), StepOutcome::Canceled, None, None, 0));
                failure_outcome = Some(StepOutcome::Canceled);
                failed = true;
                break;
            }

            match self.run_if_predicate(step, &vars) {
                Ok(false) => {
                    records.push(terminal_record(
                        step,
                        now_fn(),
                        StepOutcome::Skipped,
                        None,
                        None,
                        0,
                    ));
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    records.push(terminal_record(
                        step,
                        now_fn(),
                        StepOutcome::PermanentError,
                        None,
                        Some(e.to_string()),
                        0,
                    ));
                    failure_outcome = Some(StepOutcome::PermanentError);
                    failed = true;
                    break;
                }
            }

            let started_at = now_fn();
            let record = self.run_step(step, &vars, cancel, &now_fn, started_at).await;
            match record.outcome {
                StepOutcome::Success => {
                    if let Some(save_as) = &step.save_as {
                        bind_output(&mut vars, save_as, record.output.clone().unwrap_or(Value::Null));
                    }
                    records.push(record);
                }
                StepOutcome::Canceled | StepOutcome::RetryableError | StepOutcome::PermanentError => {
                    failure_outcome = Some(record.outcome);
                    records.push(record);
                    failed = true;
                    break;
                }
                StepOutcome::Skipped => unreachable!("run_step never returns Skipped"),
            }
        }

        let outcome = match failure_outcome {
            Some(StepOutcome::Canceled) => RunOutcome::Canceled,
            Some(StepOutcome::RetryableError) => RunOutcome::RetryableError,
            Some(StepOutcome::PermanentError) => RunOutcome::PermanentError,
            Some(_) => unreachable!(),
            None => {
                debug_assert!(!failed);
                RunOutcome::Success
            }
        };

        PipelineRunResult {
            outcome,
            steps: records,
            variables: vars,
        }
    }

    fn run_if_predicate(&self, step: &Step, vars: &Value) -> Result<bool, KernelError> {
        match &step.if_predicate {
            None => Ok(true),
            Some(predicate) => conditional::evaluate(predicate, vars),
        }
    }

    async fn run_step(
        &self,
        step: &Step,
        vars: &Value,
        cancel: &CancelFlag,
        now_fn: &impl Fn() -> DateTime<Utc>,
        started_at: DateTime<Utc>,
    ) -> StepRecord {
        let rendered = match template::render(&step.with, vars) {
            Ok(v) => v,
            Err(e) => {
                return terminal_record(step, now_fn(), StepOutcome::PermanentError, None, Some(e.to_string()), 0);
            }
        };

        let Some(tool) = self.catalog.resolve(&step.uses) else {
            return terminal_record(
                step,
                now_fn(),
                StepOutcome::PermanentError,
                None,
                Some(format!("unknown tool `{}`", step.uses)),
                0,
            );
        };

        if let Err(e) = validate_against(&tool.input_schema(), &rendered) {
            return terminal_record(step, now_fn(), StepOutcome::PermanentError, None, Some(e.to_string()), 0);
        }

        let policy = step.retry.clone().unwrap_or_else(|| self.default_retry.clone());
        let timeout = step
            .timeout_secs
            .map(StdDuration::from_secs)
            .unwrap_or(self.default_step_timeout);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return terminal_record(step, now_fn(), StepOutcome::Canceled, None, None, attempt);
            }

            let call = tokio::time::timeout(timeout, tool.invoke(rendered.clone()));
            let outcome = match call.await {
                Ok(Ok(output)) => {
                    if let Err(e) = validate_against(&tool.output_schema(), &output) {
                        Err(KernelError::ToolError {
                            message: e.to_string(),
                            retryable: false,
                        })
                    } else {
                        Ok(output)
                    }
                }
                Ok(Err(e)) => Err(e),
                Err(_elapsed) => Err(KernelError::ToolError {
                    message: format!("step `{}` timed out after {:?}", step.id, timeout),
                    retryable: true,
                }),
            };

            match outcome {
                Ok(output) => {
                    return terminal_record(step, now_fn(), StepOutcome::Success, Some(output), None, attempt);
                }
                Err(e) if e.is_retryable() => {
                    if cancel.is_cancelled() {
                        return terminal_record(step, now_fn(), StepOutcome::Canceled, None, None, attempt);
                    }
                    match decide(attempt, &policy, self.jitter.as_ref()) {
                        RetryDecision::Retry { delay } => {
                            tokio::time::sleep(cadence_kernel::policy::to_std(delay)).await;
                            continue;
                        }
                        RetryDecision::GiveUp => {
                            // The underlying failure is retryable in kind, but this
                            // step's own retry budget is exhausted; this is distinct
                            // from a permanent error and lets the due-work-level
                            // retry machinery (cadence-runtime) decide whether a
                            // fresh run, started later with a longer backoff, is
                            // worth attempting.
                            return terminal_record(
                                step,
                                now_fn(),
                                StepOutcome::RetryableError,
                                None,
                                Some(e.to_string()),
                                attempt,
                            );
                        }
                    }
                }
                Err(e) => {
                    return terminal_record(step, now_fn(), StepOutcome::PermanentError, None, Some(e.to_string()), attempt);
                }
            }
        }
    }
}

fn validate_against(schema: &Value, instance: &Value) -> Result<(), KernelError> {
    if schema.is_null() || (schema.is_object() && schema.as_object().unwrap().is_empty()) {
        return Ok(());
    }
    SchemaValidator::compile(schema)?.validate(instance)
}

fn ensure_steps_object(vars: &mut Value) {
    if let Value::Object(map) = vars {
        map.entry("steps").or_insert_with(|| Value::Object(Default::default()));
    }
}

fn bind_output(vars: &mut Value, save_as: &str, output: Value) {
    if let Value::Object(map) = vars {
        if let Some(Value::Object(steps)) = map.get_mut("steps") {
            steps.insert(save_as.to_string(), output);
        }
    }
}

fn terminal_record(
    step: &Step,
    finished_at: DateTime<Utc>,
    outcome: StepOutcome,
    output: Option<Value>,
    error: Option<String>,
    attempts: u32,
) -> StepRecord {
    StepRecord {
        step_id: step.id.clone(),
        started_at: finished_at,
        finished_at,
        outcome,
        output,
        error,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{EchoTool, Tool};
    use async_trait::async_trait;
    use cadence_kernel::{FixedJitter, StepId};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn executor(catalog: ToolCatalog) -> PipelineExecutor {
        PipelineExecutor {
            catalog,
            default_retry: RetryPolicy {
                max_attempts: 5,
                base_delay: chrono::Duration::milliseconds(10),
                max_delay: chrono::Duration::milliseconds(50),
                jitter_ratio: 0.0,
            },
            default_step_timeout: StdDuration::from_secs(5),
            jitter: Arc::new(FixedJitter(0.0)),
        }
    }

    fn seed(now: DateTime<Utc>) -> Value {
        json!({"now": now.to_rfc3339(), "params": {}, "steps": {}})
    }

    struct ConstantTool(Value);

    #[async_trait]
    impl Tool for ConstantTool {
        fn input_schema(&self) -> Value {
            json!({})
        }
        fn output_schema(&self) -> Value {
            json!({})
        }
        async fn invoke(&self, _args: Value) -> Result<Value, KernelError> {
            Ok(self.0.clone())
        }
    }

    struct FlakyTool {
        fail_times: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn input_schema(&self) -> Value {
            json!({})
        }
        fn output_schema(&self) -> Value {
            json!({})
        }
        async fn invoke(&self, _args: Value) -> Result<Value, KernelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_times.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(KernelError::ToolError {
                    message: "transient".into(),
                    retryable: true,
                })
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    #[tokio::test]
    async fn two_step_pipeline_wires_output_into_next_input() {
        let mut catalog = ToolCatalog::new();
        catalog.register("core.a", Arc::new(ConstantTool(json!({"value": 42}))));
        catalog.register("core.b", Arc::new(EchoTool));
        let pipeline = Pipeline::new(vec![
            Step {
                id: StepId("a".into()),
                uses: "core.a".into(),
                with: json!({}),
                save_as: Some("x".into()),
                if_predicate: None,
                retry: None,
                timeout_secs: None,
            },
            Step {
                id: StepId("b".into()),
                uses: "core.b".into(),
                with: json!("${steps.x.value}"),
                save_as: Some("y".into()),
                if_predicate: None,
                retry: None,
                timeout_secs: None,
            },
        ]);

        let now = Utc::now();
        let result = executor(catalog)
            .run(&pipeline, seed(now), &CancelFlag::new(), || now)
            .await;

        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[1].output, Some(json!(42)));
    }

    #[tokio::test]
    async fn retryable_failure_retries_until_success() {
        let tool = Arc::new(FlakyTool {
            fail_times: AtomicU32::new(3),
            calls: AtomicU32::new(0),
        });
        let mut catalog = ToolCatalog::new();
        catalog.register("core.flaky", tool.clone());
        let pipeline = Pipeline::new(vec![Step {
            id: StepId("a".into()),
            uses: "core.flaky".into(),
            with: json!({}),
            save_as: None,
            if_predicate: None,
            retry: None,
            timeout_secs: None,
        }]);

        let now = Utc::now();
        let result = executor(catalog)
            .run(&pipeline, seed(now), &CancelFlag::new(), || now)
            .await;

        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.steps[0].attempts, 4);
    }

    #[tokio::test]
    async fn retry_exhaustion_is_retryable_not_permanent() {
        let tool = Arc::new(FlakyTool {
            fail_times: AtomicU32::new(100),
            calls: AtomicU32::new(0),
        });
        let mut catalog = ToolCatalog::new();
        catalog.register("core.flaky", tool.clone());
        let pipeline = Pipeline::new(vec![Step {
            id: StepId("a".into()),
            uses: "core.flaky".into(),
            with: json!({}),
            save_as: None,
            if_predicate: None,
            retry: Some(RetryPolicy {
                max_attempts: 3,
                base_delay: chrono::Duration::milliseconds(1),
                max_delay: chrono::Duration::milliseconds(5),
                jitter_ratio: 0.0,
            }),
            timeout_secs: None,
        }]);

        let now = Utc::now();
        let result = executor(catalog)
            .run(&pipeline, seed(now), &CancelFlag::new(), || now)
            .await;

        assert_eq!(result.outcome, RunOutcome::RetryableError);
        assert_eq!(result.steps[0].outcome, StepOutcome::RetryableError);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn skipped_step_does_not_fail_the_pipeline() {
        let mut catalog = ToolCatalog::new();
        catalog.register("core.echo", Arc::new(EchoTool));
        let pipeline = Pipeline::new(vec![Step {
            id: StepId("a".into()),
            uses: "core.echo".into(),
            with: json!({}),
            save_as: None,
            if_predicate: Some("false".into()),
            retry: None,
            timeout_secs: None,
        }]);

        let now = Utc::now();
        let result = executor(catalog)
            .run(&pipeline, seed(now), &CancelFlag::new(), || now)
            .await;

        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(result.steps[0].outcome, StepOutcome::Skipped);
    }

    #[tokio::test]
    async fn permanent_error_aborts_remaining_steps() {
        let mut catalog = ToolCatalog::new();
        catalog.register("core.echo", Arc::new(EchoTool));
        let pipeline = Pipeline::new(vec![
            Step {
                id: StepId("a".into()),
                uses: "core.missing".into(),
                with: json!({}),
                save_as: None,
                if_predicate: None,
                retry: None,
                timeout_secs: None,
            },
            Step {
                id: StepId("b".into()),
                uses: "core.echo".into(),
                with: json!({}),
                save_as: None,
                if_predicate: None,
                retry: None,
                timeout_secs: None,
            },
        ]);

        let now = Utc::now();
        let result = executor(catalog)
            .run(&pipeline, seed(now), &CancelFlag::new(), || now)
            .await;

        assert_eq!(result.outcome, RunOutcome::PermanentError);
        assert_eq!(result.steps.len(), 1, "step b must not run after a's permanent error");
    }

    /// §5 "cancel run": a cancel flag set before a step boundary is checked
    /// aborts the pipeline with `Canceled`, no retry, and no further steps.
    #[tokio::test]
    async fn cancel_flag_set_before_step_boundary_yields_canceled_outcome() {
        let mut catalog = ToolCatalog::new();
        catalog.register("core.echo", Arc::new(EchoTool));
        let pipeline = Pipeline::new(vec![
            Step {
                id: StepId("a".into()),
                uses: "core.echo".into(),
                with: json!({}),
                save_as: None,
                if_predicate: None,
                retry: None,
                timeout_secs: None,
            },
            Step {
                id: StepId("b".into()),
                uses: "core.echo".into(),
                with: json!({}),
                save_as: None,
                if_predicate: None,
                retry: None,
                timeout_secs: None,
            },
        ]);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let now = Utc::now();
        let result = executor(catalog).run(&pipeline, seed(now), &cancel, || now).await;

        assert_eq!(result.outcome, RunOutcome::Canceled);
        assert_eq!(result.steps.len(), 1, "no step runs once canceled, only the terminal marker");
        assert_eq!(result.steps[0].outcome, StepOutcome::Canceled);
    }
}
