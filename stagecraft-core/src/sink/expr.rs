// stagecraft-core/src/sink/expr.rs
//! Aggregation expression evaluation

use serde_json::{Map, Number, Value};

use crate::error::{PipelineError, Result};
use crate::sink::operators::cached_regex;
use crate::value_utils::{get_nested_value, is_truthy, total_cmp, values_equal};

fn err(message: String) -> PipelineError {
    PipelineError::AggregationError(message)
}

/// Evaluate `expr` against `doc`
///
/// - `"$a.b"`: field path (`null` when missing)
/// - `"$$name"` / `"$$name.path"`: variable; `$$ROOT` and `$$CURRENT` are the document
/// - `{"$op": args}`: operator
/// - arrays and multi-key documents evaluate element-wise
pub fn evaluate(expr: &Value, doc: &Value, vars: &Map<String, Value>) -> Result<Value> {
    match expr {
        Value::String(s) if s.starts_with("$$") => variable(&s[2..], doc, vars),
        Value::String(s) if s.starts_with('$') => {
            Ok(get_nested_value(doc, &s[1..]).cloned().unwrap_or(Value::Null))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate(item, doc, vars))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some((op, args)) = map.iter().next() {
                    if op.starts_with('$') {
                        return operator(op, args, doc, vars);
                    }
                }
            }
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(key.clone(), evaluate(value, doc, vars)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn variable(name: &str, doc: &Value, vars: &Map<String, Value>) -> Result<Value> {
    let (head, rest) = match name.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (name, None),
    };
    let base = match head {
        "ROOT" | "CURRENT" => doc,
        // redact actions evaluate to themselves
        "KEEP" | "PRUNE" | "DESCEND" => return Ok(Value::String(format!("$${}", head))),
        _ => vars
            .get(head)
            .ok_or_else(|| err(format!("undefined variable $${}", head)))?,
    };
    Ok(match rest {
        Some(path) => get_nested_value(base, path).cloned().unwrap_or(Value::Null),
        None => base.clone(),
    })
}

fn args_list(op: &str, args: &Value, doc: &Value, vars: &Map<String, Value>) -> Result<Vec<Value>> {
    match args {
        Value::Array(items) => items.iter().map(|item| evaluate(item, doc, vars)).collect(),
        other => Err(err(format!("{} needs an array of arguments, got {}", op, other))),
    }
}

fn exactly<const N: usize>(op: &str, values: Vec<Value>) -> Result<[Value; N]> {
    let count = values.len();
    values
        .try_into()
        .map_err(|_| err(format!("{} takes {} arguments, got {}", op, N, count)))
}

fn number(op: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| err(format!("{} only supports numeric arguments, got {}", op, value)))
}

fn int_or_float(value: f64, all_ints: bool) -> Value {
    if all_ints && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn operator(op: &str, args: &Value, doc: &Value, vars: &Map<String, Value>) -> Result<Value> {
    match op {
        "$literal" => Ok(args.clone()),

        "$add" | "$multiply" => {
            let values = args_list(op, args, doc, vars)?;
            if values.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            let all_ints = values.iter().all(|v| v.is_i64() || v.is_u64());
            let mut acc = if op == "$add" { 0.0 } else { 1.0 };
            for value in &values {
                let n = number(op, value)?;
                acc = if op == "$add" { acc + n } else { acc * n };
            }
            Ok(int_or_float(acc, all_ints))
        }
        "$subtract" => {
            let [a, b] = exactly::<2>(op, args_list(op, args, doc, vars)?)?;
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let all_ints = (a.is_i64() || a.is_u64()) && (b.is_i64() || b.is_u64());
            Ok(int_or_float(number(op, &a)? - number(op, &b)?, all_ints))
        }
        "$divide" => {
            let [a, b] = exactly::<2>(op, args_list(op, args, doc, vars)?)?;
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let divisor = number(op, &b)?;
            if divisor == 0.0 {
                return Err(err("can't $divide by zero".to_string()));
            }
            Ok(int_or_float(number(op, &a)? / divisor, false))
        }

        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            let [a, b] = exactly::<2>(op, args_list(op, args, doc, vars)?)?;
            let ordering = total_cmp(&a, &b);
            let result = match op {
                "$eq" => values_equal(&a, &b),
                "$ne" => !values_equal(&a, &b),
                "$gt" => ordering.is_gt(),
                "$gte" => ordering.is_ge(),
                "$lt" => ordering.is_lt(),
                _ => ordering.is_le(),
            };
            Ok(Value::Bool(result))
        }

        "$and" => Ok(Value::Bool(args_list(op, args, doc, vars)?.iter().all(is_truthy))),
        "$or" => Ok(Value::Bool(args_list(op, args, doc, vars)?.iter().any(is_truthy))),
        "$not" => {
            let value = match args {
                Value::Array(_) => {
                    let [value] = exactly::<1>(op, args_list(op, args, doc, vars)?)?;
                    value
                }
                other => evaluate(other, doc, vars)?,
            };
            Ok(Value::Bool(!is_truthy(&value)))
        }

        "$cond" => {
            let (condition, then_branch, else_branch) = match args {
                Value::Object(map) => (
                    map.get("if").ok_or_else(|| err("$cond needs 'if'".to_string()))?,
                    map.get("then").ok_or_else(|| err("$cond needs 'then'".to_string()))?,
                    map.get("else").ok_or_else(|| err("$cond needs 'else'".to_string()))?,
                ),
                Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
                _ => return Err(err("$cond needs {if, then, else} or a 3-element array".to_string())),
            };
            if is_truthy(&evaluate(condition, doc, vars)?) {
                evaluate(then_branch, doc, vars)
            } else {
                evaluate(else_branch, doc, vars)
            }
        }

        "$in" => {
            let [needle, haystack] = exactly::<2>(op, args_list(op, args, doc, vars)?)?;
            match haystack {
                Value::Array(items) => Ok(Value::Bool(items.iter().any(|item| values_equal(item, &needle)))),
                other => Err(err(format!("$in needs an array as second argument, got {}", other))),
            }
        }

        "$regexMatch" => {
            let spec = args
                .as_object()
                .ok_or_else(|| err("$regexMatch needs a document".to_string()))?;
            let input = match spec.get("input") {
                Some(input) => evaluate(input, doc, vars)?,
                None => return Err(err("$regexMatch needs 'input'".to_string())),
            };
            let pattern = spec
                .get("regex")
                .and_then(Value::as_str)
                .ok_or_else(|| err("$regexMatch needs a string 'regex'".to_string()))?;
            let options = spec.get("options").and_then(Value::as_str).unwrap_or("");
            let regex = cached_regex(pattern, options)?;
            Ok(Value::Bool(input.as_str().map_or(false, |s| regex.is_match(s))))
        }

        "$mergeObjects" => {
            let values = match args {
                Value::Array(_) => args_list(op, args, doc, vars)?,
                other => vec![evaluate(other, doc, vars)?],
            };
            let mut merged = Map::new();
            for value in values {
                match value {
                    Value::Object(map) => merged.extend(map),
                    Value::Null => {}
                    other => return Err(err(format!("$mergeObjects needs documents, got {}", other))),
                }
            }
            Ok(Value::Object(merged))
        }

        other => Err(err(format!("unsupported expression operator {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: Value, doc: Value) -> Value {
        evaluate(&expr, &doc, &Map::new()).unwrap()
    }

    #[test]
    fn test_field_paths_and_literals() {
        let doc = json!({"a": {"b": 2}});
        assert_eq!(eval(json!("$a.b"), doc.clone()), json!(2));
        assert_eq!(eval(json!("$missing"), doc.clone()), json!(null));
        assert_eq!(eval(json!({"$literal": "$a"}), doc.clone()), json!("$a"));
        assert_eq!(eval(json!("$$ROOT"), doc.clone()), doc);
    }

    #[test]
    fn test_arithmetic() {
        let doc = json!({"q": 3, "p": 2.5});
        assert_eq!(eval(json!({"$add": ["$q", 10]}), doc.clone()), json!(13));
        assert_eq!(eval(json!({"$multiply": ["$q", "$p", 2]}), doc.clone()), json!(15.0));
        assert_eq!(eval(json!({"$subtract": ["$q", 1]}), doc.clone()), json!(2));
        assert_eq!(eval(json!({"$divide": ["$q", 2]}), doc.clone()), json!(1.5));
        assert!(evaluate(&json!({"$divide": [1, 0]}), &doc, &Map::new()).is_err());
    }

    #[test]
    fn test_cond_and_comparisons() {
        let doc = json!({"age": 40});
        let expr = json!({"$cond": {"if": {"$gt": ["$age", 30]}, "then": "Adult", "else": "Child"}});
        assert_eq!(eval(expr, doc.clone()), json!("Adult"));
        assert_eq!(eval(json!({"$not": [{"$eq": ["$age", 40]}]}), doc.clone()), json!(false));
        assert_eq!(eval(json!({"$in": ["$age", [1, 40]]}), doc), json!(true));
    }

    #[test]
    fn test_regex_match_and_merge() {
        let doc = json!({"name": "Seyed", "extra": {"x": 1}});
        assert_eq!(
            eval(json!({"$regexMatch": {"input": "$name", "regex": "^sey", "options": "i"}}), doc.clone()),
            json!(true)
        );
        assert_eq!(
            eval(json!({"$mergeObjects": [{"y": 2}, "$extra"]}), doc),
            json!({"y": 2, "x": 1})
        );
    }

    #[test]
    fn test_variables() {
        let vars = json!({"owner": {"id": 7}}).as_object().cloned().unwrap();
        let value = evaluate(&json!("$$owner.id"), &json!({}), &vars).unwrap();
        assert_eq!(value, json!(7));
        assert!(evaluate(&json!("$$nobody"), &json!({}), &vars).is_err());
    }

    #[test]
    fn test_unknown_operator() {
        assert!(matches!(
            evaluate(&json!({"$frobnicate": 1}), &json!({}), &Map::new()),
            Err(PipelineError::AggregationError(_))
        ));
    }
}
