// stagecraft-core/src/sink/executor.rs
//! Stage-by-stage execution over in-memory documents

use std::collections::HashMap;

use ahash::AHashMap;
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::sink::{expr, operators};
use crate::value_utils::{
    canonical_json_string, compare_values_with_none, get_nested_value, remove_nested_value,
    set_nested_value, total_cmp, values_equal,
};

fn err(message: String) -> PipelineError {
    PipelineError::AggregationError(message)
}

/// Result of running a pipeline
#[derive(Debug, Default)]
pub struct Execution {
    pub documents: Vec<Value>,
    /// Collection named by a trailing `$out`
    pub out: Option<String>,
}

/// Runs pipelines against a snapshot of named collections
pub struct Executor<'a> {
    collections: &'a HashMap<String, Vec<Value>>,
}

impl<'a> Executor<'a> {
    pub fn new(collections: &'a HashMap<String, Vec<Value>>) -> Self {
        Executor { collections }
    }

    pub fn run(&self, pipeline: &[Value], documents: Vec<Value>) -> Result<Execution> {
        self.run_with_vars(pipeline, documents, &Map::new())
    }

    fn run_with_vars(&self, pipeline: &[Value], mut docs: Vec<Value>, vars: &Map<String, Value>) -> Result<Execution> {
        let mut out = None;

        for (position, stage) in pipeline.iter().enumerate() {
            let (name, spec) = match stage.as_object() {
                Some(map) if map.len() == 1 => match map.iter().next() {
                    Some(entry) => entry,
                    None => return Err(err("empty stage".to_string())),
                },
                _ => return Err(err(format!("stage must be a single-key document: {}", stage))),
            };

            docs = match name.as_str() {
                "$match" => self.match_stage(spec, docs, vars)?,
                "$project" => project(spec, docs, vars)?,
                "$group" => group(spec, docs, vars)?,
                "$sort" => sort(spec, docs)?,
                "$skip" => {
                    let n = count_arg(name, spec)?;
                    docs.into_iter().skip(n).collect()
                }
                "$limit" => {
                    let n = count_arg(name, spec)?;
                    if n == 0 {
                        return Err(err("$limit must be positive".to_string()));
                    }
                    docs.into_iter().take(n).collect()
                }
                "$count" => count(spec, docs)?,
                "$unwind" => unwind(spec, docs)?,
                "$lookup" => self.lookup(spec, docs, vars)?,
                "$addFields" | "$set" => add_fields(spec, docs, vars)?,
                "$replaceRoot" => {
                    let new_root = spec
                        .get("newRoot")
                        .ok_or_else(|| err("$replaceRoot needs newRoot".to_string()))?;
                    replace_root(new_root, docs, vars)?
                }
                "$replaceWith" => replace_root(spec, docs, vars)?,
                "$redact" => redact(spec, docs, vars)?,
                "$out" => {
                    if position + 1 != pipeline.len() {
                        return Err(err("$out must be the last stage".to_string()));
                    }
                    out = Some(out_target(spec)?);
                    docs
                }
                other => return Err(err(format!("Unknown pipeline stage: {}", other))),
            };

            log_debug!("{} -> {} document(s)", name, docs.len());
        }

        Ok(Execution { documents: docs, out })
    }

    fn match_stage(&self, spec: &Value, docs: Vec<Value>, vars: &Map<String, Value>) -> Result<Vec<Value>> {
        let filter = spec
            .as_object()
            .ok_or_else(|| err("$match must be a document".to_string()))?;
        let mut kept = Vec::with_capacity(docs.len());
        for doc in docs {
            if operators::matches(&doc, filter, vars)? {
                kept.push(doc);
            }
        }
        Ok(kept)
    }

    fn lookup(&self, spec: &Value, docs: Vec<Value>, vars: &Map<String, Value>) -> Result<Vec<Value>> {
        let spec = spec
            .as_object()
            .ok_or_else(|| err("$lookup must be a document".to_string()))?;
        let from = spec
            .get("from")
            .and_then(Value::as_str)
            .ok_or_else(|| err("$lookup needs 'from'".to_string()))?;
        let as_name = spec
            .get("as")
            .and_then(Value::as_str)
            .ok_or_else(|| err("$lookup needs 'as'".to_string()))?;
        let foreign_docs: &[Value] = self.collections.get(from).map(Vec::as_slice).unwrap_or(&[]);

        let keys = match (spec.get("localField"), spec.get("foreignField")) {
            (Some(Value::String(local)), Some(Value::String(foreign))) => Some((local, foreign)),
            (None, None) => None,
            _ => return Err(err("$lookup needs both localField and foreignField".to_string())),
        };
        let sub_pipeline: &[Value] = match spec.get("pipeline") {
            Some(Value::Array(stages)) => stages,
            Some(_) => return Err(err("$lookup pipeline must be an array".to_string())),
            None => &[],
        };
        let lets = match spec.get("let") {
            Some(Value::Object(lets)) => Some(lets),
            Some(_) => return Err(err("$lookup let must be a document".to_string())),
            None => None,
        };
        if keys.is_none() && lets.is_none() && sub_pipeline.is_empty() {
            return Err(err("$lookup needs localField/foreignField or let/pipeline".to_string()));
        }

        let mut joined_docs = Vec::with_capacity(docs.len());
        for mut doc in docs {
            let mut candidates: Vec<Value> = match keys {
                Some((local, foreign)) => {
                    let local_value = get_nested_value(&doc, local).cloned().unwrap_or(Value::Null);
                    foreign_docs
                        .iter()
                        .filter(|other| {
                            let foreign_value = get_nested_value(other, foreign).unwrap_or(&Value::Null);
                            join_key_matches(&local_value, foreign_value)
                        })
                        .cloned()
                        .collect()
                }
                None => foreign_docs.to_vec(),
            };

            if lets.is_some() || !sub_pipeline.is_empty() {
                let mut scope = vars.clone();
                if let Some(lets) = lets {
                    for (name, value) in lets {
                        scope.insert(name.clone(), expr::evaluate(value, &doc, vars)?);
                    }
                }
                candidates = self.run_with_vars(sub_pipeline, candidates, &scope)?.documents;
            }

            set_nested_value(&mut doc, as_name, Value::Array(candidates));
            joined_docs.push(doc);
        }
        Ok(joined_docs)
    }
}

fn join_key_matches(local: &Value, foreign: &Value) -> bool {
    match local {
        Value::Array(items) => items.iter().any(|item| values_equal(item, foreign)),
        single => values_equal(single, foreign),
    }
}

fn count_arg(name: &str, spec: &Value) -> Result<usize> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| err(format!("{} needs a non-negative integer, got {}", name, spec)))
}

fn out_target(spec: &Value) -> Result<String> {
    match spec {
        Value::String(collection) => Ok(collection.clone()),
        Value::Object(target) => target
            .get("coll")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| err("$out needs 'coll'".to_string())),
        other => Err(err(format!("invalid $out target {}", other))),
    }
}

// ============================================================================
// $project
// ============================================================================

fn projection_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn project(spec: &Value, docs: Vec<Value>, vars: &Map<String, Value>) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| err("$project must be a document".to_string()))?;
    if spec.is_empty() {
        return Err(err("$project needs at least one field".to_string()));
    }

    let exclude_id = matches!(spec.get("_id").and_then(projection_flag), Some(false));
    let mut others = spec.iter().filter(|(field, _)| field.as_str() != "_id").peekable();
    let exclusion = match others.peek() {
        None => exclude_id,
        Some(_) => others.all(|(_, value)| projection_flag(value) == Some(false)),
    };

    let mut projected = Vec::with_capacity(docs.len());
    for doc in docs {
        if exclusion {
            let mut shaped = doc;
            for (field, value) in spec {
                if projection_flag(value) == Some(false) {
                    remove_nested_value(&mut shaped, field);
                }
            }
            projected.push(shaped);
            continue;
        }

        let mut shaped = Value::Object(Map::new());
        if !exclude_id {
            if let Some(id) = doc.get("_id") {
                set_nested_value(&mut shaped, "_id", id.clone());
            }
        }
        for (field, value) in spec {
            match projection_flag(value) {
                Some(true) => {
                    if let Some(found) = get_nested_value(&doc, field) {
                        set_nested_value(&mut shaped, field, found.clone());
                    }
                }
                Some(false) if field == "_id" => {}
                Some(false) => {
                    return Err(err(format!(
                        "cannot exclude '{}' in an inclusion projection",
                        field
                    )))
                }
                None => {
                    let computed = expr::evaluate(value, &doc, vars)?;
                    set_nested_value(&mut shaped, field, computed);
                }
            }
        }
        projected.push(shaped);
    }
    Ok(projected)
}

// ============================================================================
// $group
// ============================================================================

fn group(spec: &Value, docs: Vec<Value>, vars: &Map<String, Value>) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| err("$group must be a document".to_string()))?;
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| err("$group needs an _id".to_string()))?;

    // bucket key -> (evaluated _id, members); `order` keeps first-seen order
    let mut buckets: AHashMap<String, (Value, Vec<Value>)> = AHashMap::new();
    let mut order: Vec<String> = Vec::new();
    for doc in docs {
        let id = expr::evaluate(id_expr, &doc, vars)?;
        let key = canonical_json_string(&id);
        match buckets.get_mut(&key) {
            Some((_, members)) => members.push(doc),
            None => {
                order.push(key.clone());
                buckets.insert(key, (id, vec![doc]));
            }
        }
    }

    let mut results = Vec::with_capacity(order.len());
    for key in order {
        let (id, members) = match buckets.remove(&key) {
            Some(bucket) => bucket,
            None => continue,
        };
        let mut row = Map::new();
        row.insert("_id".to_string(), id);
        for (field, accumulator) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
            row.insert(field.clone(), accumulate(field, accumulator, &members, vars)?);
        }
        results.push(Value::Object(row));
    }
    Ok(results)
}

fn accumulate(field: &str, spec: &Value, members: &[Value], vars: &Map<String, Value>) -> Result<Value> {
    let (op, arg) = match spec.as_object() {
        Some(map) if map.len() == 1 => match map.iter().next() {
            Some(entry) => entry,
            None => return Err(err(format!("empty accumulator for '{}'", field))),
        },
        _ => return Err(err(format!("'{}' must be a single accumulator document", field))),
    };

    if op == "$count" {
        return Ok(Value::from(members.len() as u64));
    }

    let values = members
        .iter()
        .map(|doc| expr::evaluate(arg, doc, vars))
        .collect::<Result<Vec<_>>>()?;

    match op.as_str() {
        "$sum" => {
            let numbers: Vec<&Value> = values.iter().filter(|v| v.is_number()).collect();
            let all_ints = numbers.iter().all(|v| v.is_i64());
            if all_ints {
                let total = numbers
                    .iter()
                    .filter_map(|v| v.as_i64())
                    .fold(0i64, |acc, n| acc.saturating_add(n));
                Ok(Value::from(total))
            } else {
                let total: f64 = numbers.iter().filter_map(|v| v.as_f64()).sum();
                Ok(Value::from(total))
            }
        }
        "$avg" => {
            let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(Value::from(numbers.iter().sum::<f64>() / numbers.len() as f64))
            }
        }
        "$min" => Ok(values
            .into_iter()
            .filter(|v| !v.is_null())
            .min_by(total_cmp)
            .unwrap_or(Value::Null)),
        "$max" => Ok(values
            .into_iter()
            .filter(|v| !v.is_null())
            .max_by(total_cmp)
            .unwrap_or(Value::Null)),
        "$first" => Ok(values.into_iter().next().unwrap_or(Value::Null)),
        "$last" => Ok(values.into_iter().last().unwrap_or(Value::Null)),
        "$push" => Ok(Value::Array(values)),
        "$addToSet" => {
            let mut seen = ahash::AHashSet::new();
            let unique = values
                .into_iter()
                .filter(|v| seen.insert(canonical_json_string(v)))
                .collect();
            Ok(Value::Array(unique))
        }
        other => Err(err(format!("Unknown accumulator: {}", other))),
    }
}

// ============================================================================
// $sort, $count, $unwind
// ============================================================================

fn sort(spec: &Value, mut docs: Vec<Value>) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| err("$sort must be a document".to_string()))?;
    let mut keys = Vec::with_capacity(spec.len());
    for (field, direction) in spec {
        let descending = match direction.as_i64() {
            Some(1) => false,
            Some(-1) => true,
            _ => return Err(err(format!("$sort direction for '{}' must be 1 or -1", field))),
        };
        keys.push((field.as_str(), descending));
    }

    docs.sort_by(|a, b| {
        for (field, descending) in &keys {
            let ordering = compare_values_with_none(get_nested_value(a, field), get_nested_value(b, field));
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering.is_ne() {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
    Ok(docs)
}

fn count(spec: &Value, docs: Vec<Value>) -> Result<Vec<Value>> {
    let name = spec
        .as_str()
        .filter(|name| !name.is_empty() && !name.starts_with('$'))
        .ok_or_else(|| err(format!("invalid $count field {}", spec)))?;
    if docs.is_empty() {
        return Ok(Vec::new());
    }
    let mut row = Map::new();
    row.insert(name.to_string(), Value::from(docs.len() as u64));
    Ok(vec![Value::Object(row)])
}

fn unwind(spec: &Value, docs: Vec<Value>) -> Result<Vec<Value>> {
    let (path, index_field, preserve) = match spec {
        Value::String(path) => (path.as_str(), None, false),
        Value::Object(options) => (
            options
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| err("$unwind needs a path".to_string()))?,
            options.get("includeArrayIndex").and_then(Value::as_str),
            options
                .get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        other => return Err(err(format!("invalid $unwind {}", other))),
    };
    let field = path
        .strip_prefix('$')
        .ok_or_else(|| err(format!("$unwind path must start with $: {}", path)))?;

    let mut unwound = Vec::with_capacity(docs.len());
    for doc in docs {
        match get_nested_value(&doc, field).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for (i, item) in items.into_iter().enumerate() {
                    let mut copy = doc.clone();
                    set_nested_value(&mut copy, field, item);
                    if let Some(index_field) = index_field {
                        set_nested_value(&mut copy, index_field, Value::from(i as u64));
                    }
                    unwound.push(copy);
                }
            }
            Some(Value::Array(_)) if preserve => {
                let mut copy = doc;
                remove_nested_value(&mut copy, field);
                if let Some(index_field) = index_field {
                    set_nested_value(&mut copy, index_field, Value::Null);
                }
                unwound.push(copy);
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    let mut copy = doc;
                    if let Some(index_field) = index_field {
                        set_nested_value(&mut copy, index_field, Value::Null);
                    }
                    unwound.push(copy);
                }
            }
            Some(_) => {
                let mut copy = doc;
                if let Some(index_field) = index_field {
                    set_nested_value(&mut copy, index_field, Value::Null);
                }
                unwound.push(copy);
            }
        }
    }
    Ok(unwound)
}

// ============================================================================
// $addFields, $replaceRoot, $redact
// ============================================================================

fn add_fields(spec: &Value, docs: Vec<Value>, vars: &Map<String, Value>) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| err("$addFields must be a document".to_string()))?;
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        for (field, value) in spec {
            let computed = expr::evaluate(value, &doc, vars)?;
            set_nested_value(&mut doc, field, computed);
        }
        out.push(doc);
    }
    Ok(out)
}

fn replace_root(new_root: &Value, docs: Vec<Value>, vars: &Map<String, Value>) -> Result<Vec<Value>> {
    docs.iter()
        .map(|doc| match expr::evaluate(new_root, doc, vars)? {
            root @ Value::Object(_) => Ok(root),
            other => Err(err(format!("replacement root must be a document, got {}", other))),
        })
        .collect()
}

fn redact(spec: &Value, docs: Vec<Value>, vars: &Map<String, Value>) -> Result<Vec<Value>> {
    let mut kept = Vec::with_capacity(docs.len());
    for doc in docs {
        if let Some(doc) = redact_document(spec, doc, vars)? {
            kept.push(doc);
        }
    }
    Ok(kept)
}

fn redact_document(spec: &Value, doc: Value, vars: &Map<String, Value>) -> Result<Option<Value>> {
    let action = expr::evaluate(spec, &doc, vars)?;
    match action.as_str() {
        Some("$$KEEP") => Ok(Some(doc)),
        Some("$$PRUNE") => Ok(None),
        Some("$$DESCEND") => {
            let map = match doc {
                Value::Object(map) => map,
                other => return Ok(Some(other)),
            };
            let mut descended = Map::new();
            for (key, value) in map {
                let value = match value {
                    sub @ Value::Object(_) => redact_document(spec, sub, vars)?,
                    Value::Array(items) => {
                        let mut kept = Vec::with_capacity(items.len());
                        for item in items {
                            match item {
                                sub @ Value::Object(_) => {
                                    if let Some(sub) = redact_document(spec, sub, vars)? {
                                        kept.push(sub);
                                    }
                                }
                                other => kept.push(other),
                            }
                        }
                        Some(Value::Array(kept))
                    }
                    other => Some(other),
                };
                if let Some(value) = value {
                    descended.insert(key, value);
                }
            }
            Ok(Some(Value::Object(descended)))
        }
        _ => Err(err(format!(
            "$redact must resolve to $$DESCEND, $$PRUNE or $$KEEP, got {}",
            action
        ))),
    }
}
