//! Template resolver (§4.G).
//!
//! Syntax: `${<expr>}` inside any string leaf of the `with` object.
//! - An entire-string template (`"${steps.x}"`) substitutes the bound value,
//!   preserving its native JSON type.
//! - An embedded template (`"hi ${params.name}"`) coerces the resolved value
//!   to a string via canonical serialization and splices it into the literal
//!   text around it.
//!
//! The expression grammar is a restricted path language (dotted identifiers,
//! bracketed integer indices — see `cadence_kernel::value`) plus a small set
//! of time operators recognized only on the `now` root: `now+<N><unit>`,
//! unit in `{s, m, h, d}`. There is no arbitrary code execution: `resolve_expr`
//! either matches the time-operator grammar or falls through to plain path
//! lookup, nothing else is evaluated.

use std::sync::OnceLock;

use cadence_kernel::{resolve_path, KernelError, Value};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;

fn time_op_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^now\s*\+\s*(\d+)(s|m|h|d)$").expect("static regex"))
}

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").expect("static regex"))
}

fn unit_duration(amount: i64, unit: &str) -> Duration {
    match unit {
        "s" => Duration::seconds(amount),
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        _ => Duration::zero(),
    }
}

/// Resolves one `${...}` expression body against the variable map.
fn resolve_expr(expr: &str, vars: &Value) -> Result<Value, KernelError> {
    let expr = expr.trim();

    if let Some(caps) = time_op_re().captures(expr) {
        let amount: i64 = caps[1]
            .parse()
            .map_err(|_| KernelError::UnresolvedTemplate(format!("bad time offset in `{expr}`")))?;
        let delta = unit_duration(amount, &caps[2]);
        let now_value = resolve_path(vars, "now")?;
        let now_instant = now_value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| KernelError::UnresolvedTemplate("`now` is not a valid instant".into()))?;
        let result = now_instant + delta;
        return Ok(Value::String(result.to_rfc3339()));
    }

    resolve_path(vars, expr).cloned()
}

/// Coerces a resolved value to its canonical string form for embedded
/// (non-entire-string) substitution.
fn canonical_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Renders one string leaf. Returns the substituted `Value`, which is the
/// native resolved value when the whole string is a single template, or a
/// `Value::String` when the template is embedded or there is no template at
/// all.
fn render_str(literal: &str, vars: &Value) -> Result<Value, KernelError> {
    let trimmed = literal.trim();
    if trimmed.starts_with("${") && trimmed.ends_with('}') && trimmed.matches("${").count() == 1 {
        let expr = &trimmed[2..trimmed.len() - 1];
        return resolve_expr(expr, vars);
    }

    if !literal.contains("${") {
        return Ok(Value::String(literal.to_string()));
    }

    let mut out = String::with_capacity(literal.len());
    let mut last = 0;
    for caps in template_re().captures_iter(literal) {
        let whole = caps.get(0).unwrap();
        out.push_str(&literal[last..whole.start()]);
        let resolved = resolve_expr(&caps[1], vars)?;
        out.push_str(&canonical_string(&resolved));
        last = whole.end();
    }
    out.push_str(&literal[last..]);
    Ok(Value::String(out))
}

/// Recursively renders every string leaf of `with_obj` against `vars`.
/// Re-rendering the same `(with_obj, vars)` pair always yields the same
/// output (§8 property 5, "template purity") since this function is pure.
pub fn render(with_obj: &Value, vars: &Value) -> Result<Value, KernelError> {
    match with_obj {
        Value::String(s) => render_str(s, vars),
        Value::Array(items) => {
            let rendered: Result<Vec<Value>, KernelError> =
                items.iter().map(|item| render(item, vars)).collect();
            Ok(Value::Array(rendered?))
        }
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                rendered.insert(key.clone(), render(value, vars)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Value {
        json!({
            "now": "2025-01-01T00:00:00+00:00",
            "params": {"name": "ada"},
            "steps": {"fetch": {"value": 42}}
        })
    }

    #[test]
    fn entire_string_template_preserves_native_type() {
        let rendered = render(&json!("${steps.fetch.value}"), &vars()).unwrap();
        assert_eq!(rendered, json!(42));
    }

    #[test]
    fn embedded_template_coerces_to_string() {
        let rendered = render(&json!("hi ${params.name}!"), &vars()).unwrap();
        assert_eq!(rendered, json!("hi ada!"));
    }

    #[test]
    fn time_operator_adds_duration_to_now() {
        let rendered = render(&json!("${now+5m}"), &vars()).unwrap();
        assert_eq!(rendered, json!("2025-01-01T00:05:00+00:00"));
    }

    #[test]
    fn unresolved_path_is_an_error() {
        let err = render(&json!("${steps.missing.value}"), &vars()).unwrap_err();
        assert!(matches!(err, KernelError::UnresolvedTemplate(_)));
    }

    #[test]
    fn nested_object_and_array_render_recursively() {
        let template = json!({
            "a": ["${params.name}", 7],
            "b": {"c": "${steps.fetch.value}"}
        });
        let rendered = render(&template, &vars()).unwrap();
        assert_eq!(rendered, json!({"a": ["ada", 7], "b": {"c": 42}}));
    }

    #[test]
    fn rendering_twice_is_identical() {
        let template = json!("${params.name} saw ${steps.fetch.value}");
        let first = render(&template, &vars()).unwrap();
        let second = render(&template, &vars()).unwrap();
        assert_eq!(first, second);
    }
}
