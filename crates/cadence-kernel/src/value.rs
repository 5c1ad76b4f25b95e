//! The variable map: a JSON-shaped tree (§9 "dynamic typing in the variable
//! map"). Represented directly as `serde_json::Value` rather than a
//! hand-rolled tagged variant — the JSON object/array/scalar shape already is
//! the tagged variant the design note asks for, and every component in this
//! workspace already speaks `serde_json`.
//!
//! This module owns the *path language* shared by the template resolver
//! (§4.G) and the conditional evaluator (§4.H): dotted identifiers plus
//! bracketed integer indices, e.g. `steps.fetch.items[0].id`.

pub use serde_json::Value;

use crate::error::KernelError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parses a dotted/bracketed path expression into segments.
///
/// Grammar: `ident ('.' ident | '[' digits ']')*`
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, KernelError> {
    let mut segments = Vec::new();
    let mut chars = path.char_indices().peekable();
    let mut current = String::new();

    fn flush(current: &mut String, segments: &mut Vec<PathSegment>) {
        if !current.is_empty() {
            segments.push(PathSegment::Key(std::mem::take(current)));
        }
    }

    while let Some((_, c)) = chars.next() {
        match c {
            '.' => {
                flush(&mut current, &mut segments);
            }
            '[' => {
                flush(&mut current, &mut segments);
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some((_, ']')) => break,
                        Some((_, d)) if d.is_ascii_digit() => digits.push(d),
                        _ => {
                            return Err(KernelError::UnresolvedTemplate(format!(
                                "malformed index in path `{path}`"
                            )))
                        }
                    }
                }
                let index: usize = digits.parse().map_err(|_| {
                    KernelError::UnresolvedTemplate(format!("malformed index in path `{path}`"))
                })?;
                segments.push(PathSegment::Index(index));
            }
            _ => current.push(c),
        }
    }
    flush(&mut current, &mut segments);

    if segments.is_empty() {
        return Err(KernelError::UnresolvedTemplate(format!(
            "empty path expression `{path}`"
        )));
    }
    Ok(segments)
}

/// Navigates `root` following `segments`, returning `None` on any missing key,
/// out-of-range index, or type mismatch (object-index into an array, etc.).
pub fn get_path<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
            (PathSegment::Index(i), Value::Array(arr)) => arr.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolves a full path expression against `root`, returning an
/// `UnresolvedTemplate` error (per §4.G) when any segment fails to resolve.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Result<&'a Value, KernelError> {
    let segments = parse_path(path)?;
    get_path(root, &segments)
        .ok_or_else(|| KernelError::UnresolvedTemplate(format!("unresolved path `{path}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_object_and_array_paths() {
        let root = json!({
            "steps": {
                "fetch": {
                    "items": [{"id": 7}, {"id": 8}]
                }
            }
        });
        let value = resolve_path(&root, "steps.fetch.items[1].id").unwrap();
        assert_eq!(value, &json!(8));
    }

    #[test]
    fn missing_key_is_unresolved_template_error() {
        let root = json!({"steps": {}});
        let err = resolve_path(&root, "steps.missing.value").unwrap_err();
        assert!(matches!(err, KernelError::UnresolvedTemplate(_)));
    }

    #[test]
    fn out_of_range_index_is_unresolved() {
        let root = json!({"items": [1, 2]});
        assert!(resolve_path(&root, "items[5]").is_err());
    }
}
