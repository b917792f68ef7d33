use std::collections::HashMap;

use serde_json::Value;

/// Flat variable scope assembled as `{...payload, ...credentials, ...paginationVars}`.
pub type VariableScope = HashMap<String, Value>;

/// Builds the merged scope for a call. Later maps win on key collisions.
pub fn merge_scope(layers: &[&VariableScope]) -> VariableScope {
    let mut merged = VariableScope::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

pub fn scope_from_json(value: &Value) -> VariableScope {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => VariableScope::new(),
    }
}

/// Resolves `{var}`, `{{var}}`, and `<<var>>` placeholders in a single pass.
/// Resolved values are not re-scanned; unknown variables render as the
/// literal string `undefined` so callers can filter them out downstream.
pub fn substitute(input: &str, scope: &VariableScope) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let rest = &input[i..];
        if let Some(consumed) = try_placeholder(rest, "<<", ">>", scope, &mut out) {
            i += consumed;
        } else if let Some(consumed) = try_placeholder(rest, "{{", "}}", scope, &mut out) {
            i += consumed;
        } else if let Some(consumed) = try_placeholder(rest, "{", "}", scope, &mut out) {
            i += consumed;
        } else {
            let ch = rest.chars().next().unwrap_or('\0');
            out.push(ch);
            i += ch.len_utf8();
        }
    }

    out
}

/// Attempts to consume one `<open>name<close>` placeholder at the start of
/// `rest`. Returns the number of bytes consumed, or None if `rest` does not
/// begin with a well-formed placeholder (JSON braces fall through here).
fn try_placeholder(
    rest: &str,
    open: &str,
    close: &str,
    scope: &VariableScope,
    out: &mut String,
) -> Option<usize> {
    let inner_start = rest.strip_prefix(open)?;
    let end = inner_start.find(close)?;
    let name = inner_start[..end].trim();
    if name.is_empty() || !is_variable_name(name) {
        return None;
    }
    out.push_str(&resolve(name, scope));
    Some(open.len() + end + close.len())
}

fn is_variable_name(candidate: &str) -> bool {
    candidate
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Looks up `name` in the scope. The first dot segment selects the variable;
/// any remaining segments walk into its JSON value.
fn resolve(name: &str, scope: &VariableScope) -> String {
    let mut segments = name.split('.');
    let head = segments.next().unwrap_or_default();
    let Some(mut current) = scope.get(head) else {
        return "undefined".to_string();
    };

    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(arr) => segment.parse::<usize>().ok().and_then(|idx| arr.get(idx)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return "undefined".to_string(),
        }
    }

    render(current)
}

pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "undefined".to_string(),
        other => other.to_string(),
    }
}

/// Drops entries whose resolved value is empty, `undefined`, or `null`.
/// Applied to final header and query maps after substitution.
pub fn filter_unresolved(map: HashMap<String, String>) -> HashMap<String, String> {
    map.into_iter()
        .filter(|(_, v)| {
            let trimmed = v.trim();
            !trimmed.is_empty() && trimmed != "undefined" && trimmed != "null"
        })
        .collect()
}
