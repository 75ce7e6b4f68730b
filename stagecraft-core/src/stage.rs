// stagecraft-core/src/stage.rs
//! Typed pipeline stages
//!
//! Every stage renders to exactly the document the native engine expects
//! (`{"$match": ...}`, `{"$lookup": ...}`, ...).

use std::fmt;

use serde_json::{json, Map, Value};

/// One aggregation pipeline stage
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Map<String, Value>),
    /// Body of `$lookup` (`from`, `as`, and either the key pair or
    /// `let`/`pipeline`)
    Lookup(Map<String, Value>),
    Unwind {
        path: String,
        include_array_index: Option<String>,
        preserve_null_and_empty_arrays: bool,
    },
    Project(Map<String, Value>),
    /// Body of `$group`; `_id` first, then accumulators in insertion order
    Group(Map<String, Value>),
    Sort(Vec<(String, i32)>),
    Skip(u64),
    Limit(u64),
    AddFields(Map<String, Value>),
    ReplaceRoot(Value),
    ReplaceWith(Value),
    Redact(Value),
    Out {
        collection: String,
        db: Option<String>,
    },
    Count(String),
    /// Caller-supplied stage kept verbatim
    Raw(Value),
}

impl Stage {
    /// Stage keyword, e.g. `"$group"`
    pub fn name(&self) -> &str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Lookup(_) => "$lookup",
            Stage::Unwind { .. } => "$unwind",
            Stage::Project(_) => "$project",
            Stage::Group(_) => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
            Stage::AddFields(_) => "$addFields",
            Stage::ReplaceRoot(_) => "$replaceRoot",
            Stage::ReplaceWith(_) => "$replaceWith",
            Stage::Redact(_) => "$redact",
            Stage::Out { .. } => "$out",
            Stage::Count(_) => "$count",
            Stage::Raw(value) => value
                .as_object()
                .and_then(|map| map.keys().next())
                .map(String::as_str)
                .unwrap_or("raw"),
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Stage::Match(_))
    }

    pub fn is_out(&self) -> bool {
        matches!(self, Stage::Out { .. })
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Stage::Group(_))
    }

    /// Classify a caller-supplied stage document. Single-key `$match` and
    /// `$out` documents become typed so that match merging and the
    /// terminal-stage guard see them; everything else stays raw.
    pub fn raw(value: Value) -> Stage {
        if let Value::Object(map) = &value {
            if map.len() == 1 {
                match map.iter().next() {
                    Some((key, Value::Object(body))) if key == "$match" => {
                        return Stage::Match(body.clone());
                    }
                    Some((key, Value::String(collection))) if key == "$out" => {
                        return Stage::Out {
                            collection: collection.clone(),
                            db: None,
                        };
                    }
                    Some((key, Value::Object(target))) if key == "$out" => {
                        if let (Some(Value::String(db)), Some(Value::String(coll))) =
                            (target.get("db"), target.get("coll"))
                        {
                            return Stage::Out {
                                collection: coll.clone(),
                                db: Some(db.clone()),
                            };
                        }
                    }
                    _ => {}
                }
            }
        }
        Stage::Raw(value)
    }

    pub fn to_value(&self) -> Value {
        match self {
            Stage::Match(body) => json!({ "$match": body }),
            Stage::Lookup(body) => json!({ "$lookup": body }),
            Stage::Unwind {
                path,
                include_array_index,
                preserve_null_and_empty_arrays,
            } => {
                let path = format!("${}", path);
                if include_array_index.is_none() && !preserve_null_and_empty_arrays {
                    return json!({ "$unwind": path });
                }
                let mut body = Map::new();
                body.insert("path".to_string(), Value::String(path));
                if let Some(index) = include_array_index {
                    body.insert("includeArrayIndex".to_string(), Value::String(index.clone()));
                }
                body.insert(
                    "preserveNullAndEmptyArrays".to_string(),
                    Value::Bool(*preserve_null_and_empty_arrays),
                );
                json!({ "$unwind": body })
            }
            Stage::Project(body) => json!({ "$project": body }),
            Stage::Group(body) => json!({ "$group": body }),
            Stage::Sort(keys) => {
                let body: Map<String, Value> = keys
                    .iter()
                    .map(|(field, direction)| (field.clone(), json!(direction)))
                    .collect();
                json!({ "$sort": body })
            }
            Stage::Skip(n) => json!({ "$skip": n }),
            Stage::Limit(n) => json!({ "$limit": n }),
            Stage::AddFields(body) => json!({ "$addFields": body }),
            Stage::ReplaceRoot(new_root) => json!({ "$replaceRoot": { "newRoot": new_root } }),
            Stage::ReplaceWith(new_root) => json!({ "$replaceWith": new_root }),
            Stage::Redact(expr) => json!({ "$redact": expr }),
            Stage::Out { collection, db } => match db {
                Some(db) => json!({ "$out": { "db": db, "coll": collection } }),
                None => json!({ "$out": collection }),
            },
            Stage::Count(name) => json!({ "$count": name }),
            Stage::Raw(value) => value.clone(),
        }
    }
}

impl From<&Stage> for Value {
    fn from(stage: &Stage) -> Self {
        stage.to_value()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwind_forms() {
        let short = Stage::Unwind {
            path: "tags".to_string(),
            include_array_index: None,
            preserve_null_and_empty_arrays: false,
        };
        assert_eq!(short.to_value(), json!({"$unwind": "$tags"}));

        let long = Stage::Unwind {
            path: "owner".to_string(),
            include_array_index: None,
            preserve_null_and_empty_arrays: true,
        };
        assert_eq!(
            long.to_value(),
            json!({"$unwind": {"path": "$owner", "preserveNullAndEmptyArrays": true}})
        );

        let indexed = Stage::Unwind {
            path: "tags".to_string(),
            include_array_index: Some("idx".to_string()),
            preserve_null_and_empty_arrays: false,
        };
        assert_eq!(
            indexed.to_value(),
            json!({"$unwind": {"path": "$tags", "includeArrayIndex": "idx", "preserveNullAndEmptyArrays": false}})
        );
    }

    #[test]
    fn test_out_forms() {
        let plain = Stage::Out {
            collection: "archive".to_string(),
            db: None,
        };
        assert_eq!(plain.to_value(), json!({"$out": "archive"}));

        let qualified = Stage::Out {
            collection: "archive".to_string(),
            db: Some("backup".to_string()),
        };
        assert_eq!(
            qualified.to_value(),
            json!({"$out": {"db": "backup", "coll": "archive"}})
        );
    }

    #[test]
    fn test_sort_keeps_key_order() {
        let sort = Stage::Sort(vec![("b".to_string(), -1), ("a".to_string(), 1)]);
        assert_eq!(sort.to_value().to_string(), r#"{"$sort":{"b":-1,"a":1}}"#);
    }

    #[test]
    fn test_raw_classification() {
        assert!(Stage::raw(json!({"$match": {"a": 1}})).is_match());
        assert!(Stage::raw(json!({"$out": "x"})).is_out());
        assert!(Stage::raw(json!({"$out": {"db": "d", "coll": "c"}})).is_out());

        let sample = Stage::raw(json!({"$sample": {"size": 3}}));
        assert_eq!(sample.name(), "$sample");
        assert_eq!(sample.to_value(), json!({"$sample": {"size": 3}}));
    }

    #[test]
    fn test_names() {
        assert_eq!(Stage::Group(Map::new()).name(), "$group");
        assert_eq!(Stage::Skip(1).name(), "$skip");
        assert_eq!(Stage::ReplaceRoot(json!("$a")).to_value(), json!({"$replaceRoot": {"newRoot": "$a"}}));
    }
}
