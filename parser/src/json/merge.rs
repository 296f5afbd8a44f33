//! Keyword-wise intersection of two schema objects, used for `allOf` and
//! for schemas that combine `$ref`/`anyOf` with sibling keywords.

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Map, Value};

use super::compiler::limited_str;

const MIN_KEYS: [&str; 3] = ["minimum", "minLength", "minItems"];
const MAX_KEYS: [&str; 3] = ["maximum", "maxLength", "maxItems"];
// merged lazily: wrapped in allOf and compiled when reached
const SUBSCHEMA_KEYS: [&str; 3] = ["items", "additionalProperties", "additionalItems"];

fn types_of(v: &Value) -> Result<Vec<String>> {
    match v {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(a) => a
            .iter()
            .map(|t| {
                t.as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| anyhow!("Expected string in type list, got: {}", limited_str(t)))
            })
            .collect(),
        _ => bail!("Expected string or array for 'type', got: {}", limited_str(v)),
    }
}

fn intersect_types(a: &Value, b: &Value) -> Result<Value> {
    let ta = types_of(a)?;
    let tb = types_of(b)?;
    let mut res = vec![];
    for t in &ta {
        let ok = tb.contains(t) || (t == "integer" && tb.iter().any(|x| x == "number"));
        if ok && !res.contains(t) {
            res.push(t.clone());
        }
    }
    for t in &tb {
        if t == "integer" && ta.iter().any(|x| x == "number") && !res.contains(t) {
            res.push(t.clone());
        }
    }
    match res.len() {
        0 => bail!(
            "allOf with conflicting types: {} and {}",
            limited_str(a),
            limited_str(b)
        ),
        1 => Ok(Value::String(res.remove(0))),
        _ => Ok(Value::Array(res.into_iter().map(Value::String).collect())),
    }
}

fn num_pick(a: &Value, b: &Value, take_max: bool) -> Result<Value> {
    let (x, y) = match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x, y),
        _ => bail!("Expected numbers, got {} and {}", limited_str(a), limited_str(b)),
    };
    let pick_a = if take_max { x >= y } else { x <= y };
    Ok(if pick_a { a.clone() } else { b.clone() })
}

fn lazy_merge(a: &Value, b: &Value) -> Value {
    if a == b || b == &Value::Bool(true) {
        a.clone()
    } else if a == &Value::Bool(true) {
        b.clone()
    } else {
        json!({"allOf": [a, b]})
    }
}

fn merge_exclusive(key: &str, a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(*x || *y)),
        (Value::Number(_), Value::Number(_)) => num_pick(a, b, key == "exclusiveMinimum"),
        _ => bail!("cannot merge mixed forms of {}", key),
    }
}

/// Intersection of two schemas. Sub-schemas under the same property are
/// combined with `allOf` and merged when compiled.
pub fn merge_schemas(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Bool(false), _) | (_, Value::Bool(false)) => return Ok(Value::Bool(false)),
        (Value::Bool(true), _) => return Ok(b.clone()),
        (_, Value::Bool(true)) => return Ok(a.clone()),
        _ => {}
    }
    let (a, b) = match (a.as_object(), b.as_object()) {
        (Some(a), Some(b)) => (a, b),
        _ => bail!(
            "Expected object as json schema, got: {} and {}",
            limited_str(a),
            limited_str(b)
        ),
    };

    let mut res: Map<String, Value> = a.clone();
    for (key, vb) in b {
        let va = match a.get(key) {
            None => {
                res.insert(key.clone(), vb.clone());
                continue;
            }
            Some(va) => va,
        };
        if va == vb {
            continue;
        }
        let k = key.as_str();
        let merged = if k == "type" {
            intersect_types(va, vb)?
        } else if MIN_KEYS.contains(&k) {
            num_pick(va, vb, true)?
        } else if MAX_KEYS.contains(&k) {
            num_pick(va, vb, false)?
        } else if k == "exclusiveMinimum" || k == "exclusiveMaximum" {
            merge_exclusive(k, va, vb)?
        } else if k == "required" {
            let mut req = va.as_array().cloned().unwrap_or_default();
            for r in vb.as_array().into_iter().flatten() {
                if !req.contains(r) {
                    req.push(r.clone());
                }
            }
            Value::Array(req)
        } else if k == "properties" {
            let mut props = va.as_object().cloned().unwrap_or_default();
            for (name, sb) in vb.as_object().into_iter().flatten() {
                let merged = match props.get(name) {
                    Some(sa) => lazy_merge(sa, sb),
                    None => sb.clone(),
                };
                props.insert(name.clone(), merged);
            }
            Value::Object(props)
        } else if SUBSCHEMA_KEYS.contains(&k) {
            lazy_merge(va, vb)
        } else if k == "enum" {
            let other = vb.as_array().cloned().unwrap_or_default();
            Value::Array(
                va.as_array()
                    .into_iter()
                    .flatten()
                    .filter(|v| other.contains(v))
                    .cloned()
                    .collect(),
            )
        } else if k == "anyOf" || k == "oneOf" {
            let mut options = vec![];
            for x in va.as_array().into_iter().flatten() {
                for y in vb.as_array().into_iter().flatten() {
                    options.push(json!({"allOf": [x, y]}));
                }
            }
            Value::Array(options)
        } else if k == "const" {
            bail!(
                "allOf with conflicting const values: {} and {}",
                limited_str(va),
                limited_str(vb)
            )
        } else if k == "pattern" {
            bail!("intersection of patterns not implemented")
        } else if k == "format" {
            bail!("intersection of formats not implemented")
        } else if k.starts_with("x-") || super::compiler::IGNORED_KEYS.contains(&k) {
            va.clone()
        } else {
            bail!("cannot merge different values of {:?}", key)
        };
        res.insert(key.clone(), merged);
    }

    Ok(Value::Object(res))
}
