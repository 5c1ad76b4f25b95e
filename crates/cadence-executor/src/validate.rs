//! Pipeline validation, run once at task create/edit time (§3 invariant:
//! "every `${steps.X...}` reference must resolve to a prior step's
//! `save_as`"; §9 "cyclic references ... validated at task create (topological
//! check on `${steps.X...}` references against ordered `save_as` bindings)").

use std::collections::HashSet;
use std::sync::OnceLock;

use cadence_kernel::{KernelError, Value};
use regex::Regex;

use crate::step::Pipeline;

fn step_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{\s*steps\.([A-Za-z_][A-Za-z0-9_]*)").expect("static regex"))
}

fn collect_refs_in_str(text: &str, out: &mut HashSet<String>) {
    for caps in step_ref_re().captures_iter(text) {
        out.insert(caps[1].to_string());
    }
}

fn collect_refs_in_value(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::String(s) => collect_refs_in_str(s, out),
        Value::Array(items) => items.iter().for_each(|v| collect_refs_in_value(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_refs_in_value(v, out)),
        _ => {}
    }
}

/// Validates the whole pipeline: unique step ids, unique `save_as` targets,
/// and every `steps.X` reference resolving to a `save_as` bound by a
/// strictly earlier step (a forward or self reference is a cycle and is
/// rejected the same way an unresolved reference is).
pub fn validate_pipeline(pipeline: &Pipeline) -> Result<(), KernelError> {
    let mut seen_ids = HashSet::new();
    let mut bound_so_far = HashSet::new();

    for step in &pipeline.steps {
        if !seen_ids.insert(step.id.clone()) {
            return Err(KernelError::Validation(format!(
                "duplicate step id `{}`",
                step.id
            )));
        }

        let mut refs = HashSet::new();
        collect_refs_in_value(&step.with, &mut refs);
        if let Some(predicate) = &step.if_predicate {
            collect_refs_in_str(predicate, &mut refs);
        }
        for r in &refs {
            if !bound_so_far.contains(r) {
                return Err(KernelError::Validation(format!(
                    "step `{}` references unresolved `steps.{}` (not bound by any earlier step)",
                    step.id, r
                )));
            }
        }

        if let Some(save_as) = &step.save_as {
            if !bound_so_far.insert(save_as.clone()) {
                return Err(KernelError::Validation(format!(
                    "duplicate save_as `{save_as}`"
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Step;
    use cadence_kernel::StepId;
    use serde_json::json;

    fn step(id: &str, with: Value, save_as: Option<&str>) -> Step {
        Step {
            id: StepId(id.to_string()),
            uses: "core.echo".into(),
            with,
            save_as: save_as.map(str::to_string),
            if_predicate: None,
            retry: None,
            timeout_secs: None,
        }
    }

    #[test]
    fn forward_reference_is_rejected() {
        let pipeline = Pipeline::new(vec![
            step("a", json!({"x": "${steps.b.value}"}), Some("a_out")),
            step("b", json!({}), Some("b_out")),
        ]);
        assert!(validate_pipeline(&pipeline).is_err());
    }

    #[test]
    fn backward_reference_is_accepted() {
        let pipeline = Pipeline::new(vec![
            step("a", json!({}), Some("a_out")),
            step("b", json!({"x": "${steps.a_out.value}"}), Some("b_out")),
        ]);
        assert!(validate_pipeline(&pipeline).is_ok());
    }

    #[test]
    fn duplicate_save_as_is_rejected() {
        let pipeline = Pipeline::new(vec![
            step("a", json!({}), Some("shared")),
            step("b", json!({}), Some("shared")),
        ]);
        assert!(validate_pipeline(&pipeline).is_err());
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let pipeline = Pipeline::new(vec![step("a", json!({}), None), step("a", json!({}), None)]);
        assert!(validate_pipeline(&pipeline).is_err());
    }
}
