//! In-memory semantics of secure-transfer artifacts, mirroring what the
//! worker store's embedded runtime does: merging per-worker contributions,
//! splitting a transfer into template and operation payloads for the SMPC
//! path, and reconstructing the merged form from SMPC results.
//!
//! A secure transfer is `{key: {"data": scalar-or-nested-lists,
//! "operation": "sum"|"min"|"max", "type": "int"|"float"}}`; the merged
//! form is `{key: data}`.

use std::collections::BTreeMap;

use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecureOp {
    Sum,
    Min,
    Max,
}

impl SecureOp {
    fn parse(op: &str) -> anyhow::Result<Self> {
        match op {
            "sum" => Ok(SecureOp::Sum),
            "min" => Ok(SecureOp::Min),
            "max" => Ok(SecureOp::Max),
            other => anyhow::bail!("Unknown secure-transfer operation: {other}"),
        }
    }
}

fn combine_numbers(a: &Value, b: &Value, op: SecureOp) -> anyhow::Result<Value> {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        let combined = match op {
            SecureOp::Sum => a + b,
            SecureOp::Min => a.min(b),
            SecureOp::Max => a.max(b),
        };
        return Ok(Value::from(combined));
    }
    let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
        anyhow::bail!("Secure-transfer data must be numeric");
    };
    let combined = match op {
        SecureOp::Sum => a + b,
        SecureOp::Min => a.min(b),
        SecureOp::Max => a.max(b),
    };
    Ok(Value::from(combined))
}

fn combine_data(a: &Value, b: &Value, op: SecureOp) -> anyhow::Result<Value> {
    match (a, b) {
        (Value::Array(xs), Value::Array(ys)) => {
            anyhow::ensure!(
                xs.len() == ys.len(),
                "Secure-transfer contributions have mismatched shapes"
            );
            let combined: Vec<Value> = xs
                .iter()
                .zip(ys)
                .map(|(x, y)| combine_data(x, y, op))
                .collect::<anyhow::Result<_>>()?;
            Ok(Value::Array(combined))
        },
        (Value::Array(_), _) | (_, Value::Array(_)) => {
            anyhow::bail!("Secure-transfer contributions have mismatched shapes")
        },
        _ => combine_numbers(a, b, op),
    }
}

fn entry_parts(key: &str, entry: &Value) -> anyhow::Result<(Value, SecureOp)> {
    let data = entry
        .get("data")
        .ok_or_else(|| anyhow::anyhow!("Secure-transfer key {key} has no data"))?
        .clone();
    let op = entry
        .get("operation")
        .and_then(|o| o.as_str())
        .ok_or_else(|| anyhow::anyhow!("Secure-transfer key {key} has no operation"))?;
    Ok((data, SecureOp::parse(op)?))
}

/// Merge the per-worker secure transfers into `{key: combined_data}`, the
/// form the consuming step sees.
pub fn secure_transfers_to_merged_dict(transfers: &[Value]) -> anyhow::Result<Value> {
    let mut merged: BTreeMap<String, (Value, SecureOp)> = BTreeMap::new();
    let mut key_order: Vec<String> = Vec::new();
    for transfer in transfers {
        let entries = transfer
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("A secure transfer must be a JSON object"))?;
        for (key, entry) in entries {
            let (data, op) = entry_parts(key, entry)?;
            match merged.get_mut(key) {
                Some((current, current_op)) => {
                    anyhow::ensure!(
                        *current_op == op,
                        "Secure-transfer key {key} has conflicting operations"
                    );
                    *current = combine_data(current, &data, op)?;
                },
                None => {
                    key_order.push(key.clone());
                    merged.insert(key.clone(), (data, op));
                },
            }
        }
    }
    let mut result = serde_json::Map::new();
    for key in key_order {
        let (data, _) = merged.remove(&key).expect("key was inserted above");
        result.insert(key, data);
    }
    Ok(Value::Object(result))
}

fn zero_like(data: &Value) -> Value {
    match data {
        Value::Array(items) => Value::Array(items.iter().map(zero_like).collect()),
        _ => Value::from(0),
    }
}

fn flatten_into(data: &Value, out: &mut Vec<Value>) {
    match data {
        Value::Array(items) => items.iter().for_each(|item| flatten_into(item, out)),
        other => out.push(other.clone()),
    }
}

/// Split one secure transfer into the zeroed template plus the flattened
/// per-operation value lists handed to the SMPC cluster.
pub fn split_secure_transfer_dict(
    transfer: &Value,
) -> anyhow::Result<(Value, Vec<Value>, Vec<Value>, Vec<Value>)> {
    let entries = transfer
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("A secure transfer must be a JSON object"))?;
    let mut template = serde_json::Map::new();
    let (mut sums, mut mins, mut maxes) = (Vec::new(), Vec::new(), Vec::new());
    for (key, entry) in entries {
        let (data, op) = entry_parts(key, entry)?;
        let mut zeroed = entry.clone();
        zeroed["data"] = zero_like(&data);
        template.insert(key.clone(), zeroed);
        let out = match op {
            SecureOp::Sum => &mut sums,
            SecureOp::Min => &mut mins,
            SecureOp::Max => &mut maxes,
        };
        flatten_into(&data, out);
    }
    Ok((Value::Object(template), sums, mins, maxes))
}

fn unflatten_like(shape: &Value, values: &mut std::vec::IntoIter<Value>) -> anyhow::Result<Value> {
    match shape {
        Value::Array(items) => {
            let rebuilt: Vec<Value> = items
                .iter()
                .map(|item| unflatten_like(item, values))
                .collect::<anyhow::Result<_>>()?;
            Ok(Value::Array(rebuilt))
        },
        _ => values
            .next()
            .ok_or_else(|| anyhow::anyhow!("SMPC result has fewer values than the template")),
    }
}

/// Rebuild the merged `{key: data}` form from a template and the
/// per-operation result lists returned by the SMPC cluster.
pub fn construct_secure_transfer_dict(
    template: &Value,
    sum_values: Option<&Value>,
    min_values: Option<&Value>,
    max_values: Option<&Value>,
) -> anyhow::Result<Value> {
    let entries = template
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("A secure-transfer template must be a JSON object"))?;
    let as_iter = |values: Option<&Value>, op: &str| -> anyhow::Result<std::vec::IntoIter<Value>> {
        let items = match values {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => anyhow::bail!("SMPC {op} results must be a list"),
            None => Vec::new(),
        };
        Ok(items.into_iter())
    };
    let mut sums = as_iter(sum_values, "sum")?;
    let mut mins = as_iter(min_values, "min")?;
    let mut maxes = as_iter(max_values, "max")?;

    let mut result = serde_json::Map::new();
    for (key, entry) in entries {
        let (shape, op) = entry_parts(key, entry)?;
        let values = match op {
            SecureOp::Sum => &mut sums,
            SecureOp::Min => &mut mins,
            SecureOp::Max => &mut maxes,
        };
        result.insert(key.clone(), unflatten_like(&shape, values)?);
    }
    Ok(Value::Object(result))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_merge_sums_and_bounds() {
        let transfers = vec![
            json!({
                "n": {"data": 2, "operation": "sum", "type": "int"},
                "lo": {"data": 5.0, "operation": "min", "type": "float"},
                "v": {"data": [1.0, 2.0], "operation": "sum", "type": "float"},
            }),
            json!({
                "n": {"data": 3, "operation": "sum", "type": "int"},
                "lo": {"data": 2.5, "operation": "min", "type": "float"},
                "v": {"data": [10.0, 20.0], "operation": "sum", "type": "float"},
            }),
        ];
        let merged = secure_transfers_to_merged_dict(&transfers).unwrap();
        assert_eq!(merged, json!({"lo": 2.5, "n": 5, "v": [11.0, 22.0]}));
    }

    #[test]
    fn test_split_then_construct_is_identity_on_merged_form() {
        let transfer = json!({
            "n": {"data": 7, "operation": "sum", "type": "int"},
            "hi": {"data": [3.0, [4.0, 5.0]], "operation": "max", "type": "float"},
        });
        let (template, sums, mins, maxes) = split_secure_transfer_dict(&transfer).unwrap();
        assert_eq!(template["n"]["data"], json!(0));
        assert_eq!(template["hi"]["data"], json!([0, [0, 0]]));
        assert_eq!(sums, vec![json!(7)]);
        assert!(mins.is_empty());
        assert_eq!(maxes, vec![json!(3.0), json!(4.0), json!(5.0)]);

        let constructed = construct_secure_transfer_dict(
            &template,
            Some(&Value::Array(sums)),
            None,
            Some(&Value::Array(maxes)),
        )
        .unwrap();
        assert_eq!(constructed, json!({"hi": [3.0, [4.0, 5.0]], "n": 7}));
    }

    #[test]
    fn test_mismatched_shapes_are_rejected() {
        let transfers = vec![
            json!({"v": {"data": [1, 2], "operation": "sum", "type": "int"}}),
            json!({"v": {"data": [1], "operation": "sum", "type": "int"}}),
        ];
        assert!(secure_transfers_to_merged_dict(&transfers).is_err());
    }
}
