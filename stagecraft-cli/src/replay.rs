//! Replays a JSON list of builder calls onto a `PipelineBuilder`
//!
//! Each element is a single-key object naming the call:
//!
//! ```json
//! [
//!   {"filter": {"caption__contains": "hello", "owner__deleted_at": null}},
//!   {"order_by": ["-_id"]},
//!   {"slice": [0, 10]}
//! ]
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value};
use stagecraft_core::{GroupKey, Lookup, PipelineBuilder, SchemaCatalog, Window, Q};

pub fn replay(mut builder: PipelineBuilder, calls: &[Value], catalog: &SchemaCatalog) -> Result<PipelineBuilder> {
    for (position, call) in calls.iter().enumerate() {
        let (name, args) = match call.as_object() {
            Some(map) if map.len() == 1 => map
                .iter()
                .next()
                .ok_or_else(|| anyhow!("call #{} is empty", position))?,
            _ => bail!("call #{} must be a single-key object, got {}", position, call),
        };
        builder = apply(builder, name, args, catalog)
            .with_context(|| format!("call #{} ({})", position, name))?;
    }
    Ok(builder)
}

fn object<'a>(name: &str, args: &'a Value) -> Result<&'a Map<String, Value>> {
    args.as_object()
        .ok_or_else(|| anyhow!("'{}' takes an object, got {}", name, args))
}

fn string<'a>(name: &str, args: &'a Value) -> Result<&'a str> {
    args.as_str()
        .ok_or_else(|| anyhow!("'{}' takes a string, got {}", name, args))
}

fn unsigned(name: &str, args: &Value) -> Result<u64> {
    args.as_u64()
        .ok_or_else(|| anyhow!("'{}' takes a non-negative integer, got {}", name, args))
}

fn pairs(map: &Map<String, Value>) -> Vec<(String, Value)> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn apply(builder: PipelineBuilder, name: &str, args: &Value, catalog: &SchemaCatalog) -> Result<PipelineBuilder> {
    let builder = match name {
        "filter" => builder.filter(pairs(object(name, args)?))?,
        "project" => builder.project(pairs(object(name, args)?))?,
        "add_fields" => builder.add_fields(pairs(object(name, args)?))?,
        "order_by" => {
            let fields = match args {
                Value::String(field) => vec![field.clone()],
                Value::Array(items) => items
                    .iter()
                    .map(|item| string(name, item).map(str::to_string))
                    .collect::<Result<Vec<_>>>()?,
                other => bail!("'order_by' takes a string or a list, got {}", other),
            };
            builder.order_by(fields)?
        }
        "group" => builder.group(group_key(args)?)?,
        "annotate" => {
            let spec = object(name, args)?;
            let field = spec
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("'annotate' needs a 'name'"))?;
            let accumulator = spec
                .get("accumulator")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("'annotate' needs an 'accumulator'"))?;
            let value = spec.get("value").cloned().unwrap_or(Value::Null);
            builder.annotate(field, accumulator, value)?
        }
        "unwind" => match args {
            Value::String(path) => builder.unwind(path, None, false)?,
            Value::Object(spec) => {
                let path = spec
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("'unwind' needs a 'path'"))?;
                let index = spec.get("include_array_index").and_then(Value::as_str);
                let preserve = spec
                    .get("preserve_null_and_empty_arrays")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                builder.unwind(path, index, preserve)?
            }
            other => bail!("'unwind' takes a path or an object, got {}", other),
        },
        "lookup" => builder.lookup(lookup(object(name, args)?, catalog)?)?,
        "replace_root" | "replace_with" => {
            let (field, merge) = match args {
                Value::String(field) => (field.as_str(), None),
                Value::Object(spec) => (
                    spec.get("field")
                        .and_then(Value::as_str)
                        .ok_or_else(|| anyhow!("'{}' needs a 'field'", name))?,
                    spec.get("merge").and_then(Value::as_object).cloned(),
                ),
                other => bail!("'{}' takes a field or an object, got {}", name, other),
            };
            if name == "replace_root" {
                builder.replace_root(field, merge)?
            } else {
                builder.replace_with(field, merge)?
            }
        }
        "redact" => match args.as_array().map(Vec::as_slice) {
            Some([value1, condition, value2, then_value, else_value]) => builder.redact(
                value1.clone(),
                string(name, condition)?,
                value2.clone(),
                string(name, then_value)?,
                string(name, else_value)?,
            )?,
            _ => bail!("'redact' takes [value1, condition, value2, then, else]"),
        },
        "raw" => builder.raw(args.clone())?,
        "out" => match args {
            Value::String(collection) => builder.out(collection, None)?,
            Value::Object(spec) => {
                let collection = spec
                    .get("coll")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("'out' needs a 'coll'"))?;
                builder.out(collection, spec.get("db").and_then(Value::as_str))?
            }
            other => bail!("'out' takes a collection or an object, got {}", other),
        },
        "count" => builder.count(args.as_str().unwrap_or("count"))?,
        "skip" => builder.skip(unsigned(name, args)?)?,
        "limit" => builder.limit(unsigned(name, args)?)?,
        "slice" => builder.slice(window(args)?)?,
        other => bail!("unknown builder call '{}'", other),
    };
    Ok(builder)
}

fn group_key(args: &Value) -> Result<GroupKey> {
    Ok(match args {
        Value::Null => GroupKey::All,
        Value::String(field) => GroupKey::from(field.as_str()),
        Value::Array(items) => GroupKey::Fields(
            items
                .iter()
                .map(|item| string("group", item).map(str::to_string))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Object(mapping) => GroupKey::Mapping(
            mapping
                .iter()
                .map(|(key, field)| string("group", field).map(|field| (key.clone(), field.to_string())))
                .collect::<Result<Vec<_>>>()?,
        ),
        other => bail!("'group' takes null, a field, a list or an object, got {}", other),
    })
}

/// `n`, `[start, stop]` or `[start, stop, step]`
fn window(args: &Value) -> Result<Window> {
    let integer = |value: &Value| {
        value
            .as_i64()
            .ok_or_else(|| anyhow!("'slice' bounds must be integers, got {}", value))
    };
    match args {
        Value::Number(_) => Ok(Window::Index(integer(args)?)),
        Value::Array(items) => match items.as_slice() {
            [start, stop] => Ok(Window::range(integer(start)?, integer(stop)?)),
            [start, stop, step] => Ok(Window::Range {
                start: integer(start)?,
                stop: integer(stop)?,
                step: Some(integer(step)?),
            }),
            _ => bail!("'slice' takes 2 or 3 bounds"),
        },
        other => bail!("'slice' takes an index or a list of bounds, got {}", other),
    }
}

fn lookup(spec: &Map<String, Value>, catalog: &SchemaCatalog) -> Result<Lookup> {
    let from = spec
        .get("from")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("'lookup' needs a 'from' schema"))?;
    let schema = catalog
        .get(from)
        .ok_or_else(|| anyhow!("unknown schema '{}'", from))?;
    let as_name = spec
        .get("as")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("'lookup' needs an 'as' name"))?;

    let mut lookup = Lookup::new(schema, as_name);
    if let Some(local) = spec.get("local_field") {
        lookup = lookup.local_field(string("local_field", local)?);
    }
    if let Some(foreign) = spec.get("foreign_field") {
        lookup = lookup.foreign_field(string("foreign_field", foreign)?);
    }
    if let Some(lets) = spec.get("let") {
        let lets = lets
            .as_array()
            .ok_or_else(|| anyhow!("'let' takes a list of field names"))?;
        for var in lets {
            lookup = lookup.let_var(string("let", var)?);
        }
    }
    if let Some(queries) = spec.get("query") {
        let queries = queries
            .as_array()
            .ok_or_else(|| anyhow!("'query' takes a list of keyword objects"))?;
        for query in queries {
            lookup = lookup.query(Q::new(pairs(object("query", query)?))?);
        }
    }
    Ok(lookup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::from_json(&json!({"schemas": {
            "Account": {"collection": "account", "fields": {
                "username": {"type": "string"},
                "deleted_at": {"type": "datetime"}
            }},
            "Post": {"collection": "post", "fields": {
                "owner": {"type": "reference", "to": "Account", "db_field": "owner_id"},
                "caption": {"type": "string"}
            }}
        }}))
        .unwrap()
    }

    fn compile(calls: Value) -> Result<Vec<Value>> {
        let catalog = catalog();
        let schema = catalog.get("Post").unwrap();
        let builder = PipelineBuilder::new(&schema);
        let calls = calls.as_array().cloned().unwrap();
        Ok(replay(builder, &calls, &catalog)?.pipeline())
    }

    #[test]
    fn test_replay_filter_order_slice() {
        let pipeline = compile(json!([
            {"filter": {"caption": "hi"}},
            {"order_by": ["-_id"]},
            {"slice": [2, 10]}
        ]))
        .unwrap();
        assert_eq!(
            pipeline,
            vec![
                json!({"$match": {"caption": "hi"}}),
                json!({"$sort": {"_id": -1}}),
                json!({"$skip": 2}),
                json!({"$limit": 8}),
            ]
        );
    }

    #[test]
    fn test_replay_lookup_with_query() {
        let pipeline = compile(json!([
            {"lookup": {"from": "Account", "as": "owner_doc", "let": ["owner"], "query": [{"_id": "owner"}]}}
        ]))
        .unwrap();
        assert_eq!(pipeline[0]["$lookup"]["let"], json!({"owner": "$owner_id"}));
    }

    #[test]
    fn test_replay_reports_bad_calls() {
        let err = compile(json!([{"frobnicate": 1}])).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown builder call"));
        assert!(compile(json!([{"filter": {"missing": 1}}])).is_err());
        assert!(compile(json!([{"slice": [1, 5, 2]}])).is_err());
    }
}
