use std::collections::HashMap;
use std::time::Duration;

use bumpalo::Bump;
use jsonata_rs::JsonAta;
use serde_json::Value;

use crate::error::EngineError;

/// Evaluates a JSONata expression with the given `$name` bindings.
///
/// Compilation and evaluation run on a blocking worker so a pathological
/// expression cannot stall the request path; the whole evaluation is bounded
/// by `timeout`.
pub async fn evaluate(
    expr: &str,
    bindings: HashMap<String, Value>,
    timeout: Duration,
) -> Result<Value, EngineError> {
    let expr = expr.trim().to_string();
    if expr.is_empty() {
        return Err(EngineError::Expression("empty expression".to_string()));
    }

    let handle = tokio::task::spawn_blocking(move || evaluate_sync(&expr, &bindings));

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(EngineError::Expression(format!(
            "expression worker failed: {join_err}"
        ))),
        Err(_) => Err(EngineError::Timeout(timeout)),
    }
}

/// Evaluates a stop-condition style predicate; any non-true result is false.
pub async fn evaluate_predicate(
    expr: &str,
    bindings: HashMap<String, Value>,
    timeout: Duration,
) -> Result<bool, EngineError> {
    let value = evaluate(expr, bindings, timeout).await?;
    Ok(value.as_bool().unwrap_or(false))
}

fn evaluate_sync(expr: &str, bindings: &HashMap<String, Value>) -> Result<Value, EngineError> {
    let arena = Bump::new();
    let engine = JsonAta::new(expr, &arena)
        .map_err(|e| EngineError::Expression(format!("parse failed: {e:?}")))?;

    let refs: HashMap<&str, &Value> = bindings
        .iter()
        .map(|(k, v)| (k.as_str(), v))
        .collect();

    let result = engine
        .evaluate(None, Some(&refs))
        .map_err(|e| EngineError::Expression(format!("evaluation failed: {e:?}")))?;

    Ok(jsonata_to_serde(result))
}

fn jsonata_to_serde<'a>(v: &'a jsonata_rs::Value<'a>) -> Value {
    if v.is_null() {
        return Value::Null;
    }
    if v.is_bool() {
        return Value::Bool(v.as_bool());
    }
    if v.is_number() {
        let n = v.as_f64();
        if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
            return Value::Number((n as i64).into());
        }
        return serde_json::json!(n);
    }
    if v.is_string() {
        return Value::String(v.as_str().to_string());
    }
    if v.is_array() {
        return Value::Array(v.members().map(jsonata_to_serde).collect());
    }
    if v.is_object() {
        let mut map = serde_json::Map::new();
        for (k, vv) in v.entries() {
            map.insert(k.to_string(), jsonata_to_serde(vv));
        }
        return Value::Object(map);
    }
    Value::Null
}
