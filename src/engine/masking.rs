use serde_json::Value;

const MASK: &str = "[REDACTED]";
/// Values shorter than this are too likely to collide with ordinary text.
const MIN_SECRET_LEN: usize = 4;

/// Replaces every occurrence of a known credential value in `text`.
/// Applied to every error message surfaced to clients or the LLM.
pub fn mask_text(text: &str, secrets: &[String]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if secret.len() >= MIN_SECRET_LEN {
            out = out.replace(secret.as_str(), MASK);
        }
    }
    out
}

/// Recursively masks credential values inside a JSON document.
pub fn mask_json(value: &Value, secrets: &[String]) -> Value {
    match value {
        Value::String(s) => Value::String(mask_text(s, secrets)),
        Value::Array(arr) => Value::Array(arr.iter().map(|v| mask_json(v, secrets)).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map.iter() {
                out.insert(k.clone(), mask_json(v, secrets));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}
