// stagecraft-core/src/compiler.rs
//! Keyword condition compiler
//!
//! Turns `field__operator = value` keywords into `$match` constraint maps,
//! or into aggregation expressions for `$expr` contexts (lookup
//! sub-pipelines, computed fields).

use serde_json::{json, Map, Value};

use crate::error::{PipelineError, Result};
use crate::expressions::{Condition, Operand};
use crate::operators::Operator;
use crate::resolver::{self, PATH_SEPARATOR};
use crate::schema::{RelationKind, Schema};

const EXPR_KEY: &str = "$expr";

/// Output of compiling one keyword
///
/// `constraints` belongs to the match stage of the keyword itself;
/// each entry of `fragments` becomes its own match stage (conditions
/// reached by descending into an embedded document).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CompiledMatch {
    pub constraints: Map<String, Value>,
    pub fragments: Vec<Map<String, Value>>,
}

impl CompiledMatch {
    /// Constraints plus every fragment folded into one map
    pub fn into_single(self) -> Map<String, Value> {
        let mut merged = self.constraints;
        for fragment in self.fragments {
            merge_constraints(&mut merged, fragment);
        }
        merged
    }
}

/// Schema-less reading of a keyword key.
///
/// One segment is a plain equality. With two segments the second must be
/// an operator. Longer keys treat a trailing operator as such and
/// everything before it as a dotted path.
pub fn parse_key(key: &str, operand: &Operand) -> Result<(String, Option<Operator>)> {
    let segments: Vec<&str> = key.split(PATH_SEPARATOR).collect();
    let (path, operator) = match segments.as_slice() {
        [single] => (single.to_string(), None),
        [field, op] => (field.to_string(), Some(Operator::parse(op)?)),
        [fields @ .., last] => match Operator::lookup(last) {
            Some(op) => (fields.join("."), Some(op)),
            None => (segments.join("."), None),
        },
        [] => return Err(PipelineError::InvalidField(key.to_string())),
    };
    if operand.is_expr() {
        check_expr_operator(key, operator)?;
    }
    Ok((path, operator))
}

/// Field expressions are only allowed on the value side of comparisons
pub fn validate_comparison(key: &str) -> Result<Operator> {
    let token = match key.rsplit_once(PATH_SEPARATOR) {
        Some((_, token)) => token,
        None => return Err(PipelineError::InvalidOperator(key.to_string())),
    };
    match Operator::lookup(token) {
        Some(op) if op.is_comparison() => Ok(op),
        _ => Err(PipelineError::InvalidOperator(token.to_string())),
    }
}

fn check_expr_operator(key: &str, operator: Option<Operator>) -> Result<()> {
    match operator {
        Some(op) if op.is_comparison() => Ok(()),
        Some(op) => Err(PipelineError::InvalidOperator(op.as_str().to_string())),
        None => Err(PipelineError::InvalidOperator(key.to_string())),
    }
}

/// Compile one keyword. Without a schema the key is taken at face value.
pub fn compile_entry(key: &str, operand: &Operand, schema: Option<&Schema>) -> Result<CompiledMatch> {
    match schema {
        Some(schema) => compile_bound(key, &operand.bind(schema), schema, ""),
        None => {
            if key.starts_with('$') {
                return raw_entry(key, operand);
            }
            let (path, operator) = parse_key(key, operand)?;
            emit(&path, operator, operand)
        }
    }
}

/// Compile a keyword list into a single constraint map
pub fn compile_predicate_leaf(
    conditions: &[Condition],
    schema: Option<&Schema>,
) -> Result<Map<String, Value>> {
    let mut merged = Map::new();
    for condition in conditions {
        let compiled = compile_entry(&condition.key, &condition.operand, schema)?;
        merge_constraints(&mut merged, compiled.into_single());
    }
    Ok(merged)
}

fn raw_entry(key: &str, operand: &Operand) -> Result<CompiledMatch> {
    let mut compiled = CompiledMatch::default();
    compiled.constraints.insert(key.to_string(), operand.to_value()?);
    Ok(compiled)
}

fn compile_bound(key: &str, operand: &Operand, schema: &Schema, prefix: &str) -> Result<CompiledMatch> {
    if key.starts_with('$') {
        return raw_entry(key, operand);
    }

    let segments: Vec<&str> = key.split(PATH_SEPARATOR).collect();
    let (head, tail) = match segments.split_first() {
        Some(parts) => parts,
        None => return Err(PipelineError::InvalidField(key.to_string())),
    };

    let head_segments: Vec<&str> = head.split('.').collect();
    check_local_path(schema, &head_segments)?;
    let (path, field) = resolver::lookup(schema, &head_segments)?;
    let path = format!("{}{}", prefix, path);

    let token = match tail.first() {
        Some(token) => *token,
        None => {
            if operand.is_expr() {
                return Err(PipelineError::InvalidOperator(key.to_string()));
            }
            return emit(&path, None, operand);
        }
    };

    // a reference only holds the foreign key until it is joined
    if let Some((target, RelationKind::Embedded)) = field.relation() {
        if Operator::lookup(token).is_none() {
            let nested_key = tail.join(PATH_SEPARATOR);
            let nested = compile_bound(&nested_key, operand, target, &format!("{}.", path))?;
            let mut compiled = CompiledMatch::default();
            compiled.fragments.push(nested.constraints);
            compiled.fragments.extend(nested.fragments);
            return Ok(compiled);
        }
    }

    let operator = Operator::parse(token)?;
    if tail.len() > 1 {
        return Err(PipelineError::InvalidOperator(tail[1..].join(PATH_SEPARATOR)));
    }
    if operand.is_expr() {
        check_expr_operator(key, Some(operator))?;
    }
    emit(&path, Some(operator), operand)
}

/// Dotted heads may only cross embedded documents
fn check_local_path(schema: &Schema, segments: &[&str]) -> Result<()> {
    for end in 1..segments.len() {
        let (_, field) = resolver::lookup(schema, &segments[..end])?;
        if field.is_reference() {
            return Err(PipelineError::InvalidField(segments[end].to_string()));
        }
    }
    Ok(())
}

fn emit(path: &str, operator: Option<Operator>, operand: &Operand) -> Result<CompiledMatch> {
    let mut compiled = CompiledMatch::default();
    let value = operand.to_value()?;

    let op = match operator {
        None => {
            compiled.constraints.insert(path.to_string(), value);
            return Ok(compiled);
        }
        Some(op) => op,
    };

    if operand.is_expr() {
        compiled.constraints.insert(
            EXPR_KEY.to_string(),
            json!({ op.mongo(): [format!("${}", path), value] }),
        );
        return Ok(compiled);
    }

    let constraint = if op.is_text() {
        let literal = literal_text(&value);
        let pattern = op.regex_pattern(&literal).unwrap_or(literal);
        if op.is_case_insensitive() {
            json!({ "$regex": pattern, "$options": "i" })
        } else {
            json!({ "$regex": pattern })
        }
    } else {
        json!({ op.mongo(): value })
    };
    compiled.constraints.insert(path.to_string(), constraint);
    Ok(compiled)
}

fn literal_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expression form of a keyword list, as used inside `$expr`
pub fn compile_expr(conditions: &[Condition], schema: Option<&Schema>) -> Result<Value> {
    let mut parts = conditions
        .iter()
        .map(|condition| expr_condition(condition, schema))
        .collect::<Result<Vec<_>>>()?;
    match parts.len() {
        1 => Ok(parts.remove(0)),
        _ => Ok(json!({ "$and": parts })),
    }
}

fn expr_condition(condition: &Condition, schema: Option<&Schema>) -> Result<Value> {
    let (path, operator) = match schema {
        None => parse_key(&condition.key, &condition.operand)?,
        Some(schema) => {
            let segments: Vec<&str> = resolver::split_path(&condition.key);
            let (fields, operator) = match segments.split_last() {
                Some((last, rest)) if !rest.is_empty() => match Operator::lookup(last) {
                    Some(op) => (rest.to_vec(), Some(op)),
                    None => (segments.clone(), None),
                },
                _ => (segments.clone(), None),
            };
            if condition.operand.is_expr() {
                check_expr_operator(&condition.key, operator)?;
            }
            (resolver::resolve(schema, &fields)?, operator)
        }
    };

    let field = format!("${}", path);
    let value = match schema {
        Some(schema) => condition.operand.bind(schema).to_value()?,
        None => condition.operand.to_value()?,
    };
    let op = operator.unwrap_or(Operator::Exact);

    let expr = match op {
        Operator::Nin => json!({ "$not": [{ "$in": [field, value] }] }),
        Operator::Not => json!({ "$not": [{ "$eq": [field, value] }] }),
        op if op.is_text() => {
            let literal = literal_text(&value);
            let pattern = op.regex_pattern(&literal).unwrap_or(literal);
            if op.is_case_insensitive() {
                json!({ "$regexMatch": { "input": field, "regex": pattern, "options": "i" } })
            } else {
                json!({ "$regexMatch": { "input": field, "regex": pattern } })
            }
        }
        op => json!({ op.mongo(): [field, value] }),
    };
    Ok(expr)
}

/// Replace bare strings naming a `let` variable with `$$variable`
pub fn substitute_let_vars(value: &Value, vars: &[String]) -> Value {
    match value {
        Value::String(s) if vars.iter().any(|var| var == s) => Value::String(format!("$${}", s)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_let_vars(item, vars))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_let_vars(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Fold `source` into `target`; later keys win
pub fn merge_constraints(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        target.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expressions::F;
    use crate::schema::FieldType;
    use std::sync::Arc;

    fn schema() -> Schema {
        let address = Arc::new(
            Schema::embedded("Address")
                .field("city", FieldType::String)
                .field_with_db("zip", "z", FieldType::String),
        );
        Schema::document("Account", "account")
            .field("username", FieldType::String)
            .field("age", FieldType::Int)
            .field_with_db("address", "addr", FieldType::Embedded(address.clone()))
            .field_with_db(
                "referrer",
                "referrer_id",
                FieldType::Reference(Arc::new(
                    Schema::document("Account", "account").field("username", FieldType::String),
                )),
            )
            .field("places", FieldType::list_of(FieldType::Embedded(address)))
    }

    fn bound(key: &str, operand: impl Into<Operand>) -> Result<CompiledMatch> {
        compile_entry(key, &operand.into(), Some(&schema()))
    }

    #[test]
    fn test_plain_equality() {
        let compiled = bound("username", "seyed").unwrap();
        assert_eq!(Value::Object(compiled.constraints), json!({"username": "seyed"}));
        assert!(compiled.fragments.is_empty());
    }

    #[test]
    fn test_comparison_operators() {
        assert_eq!(
            Value::Object(bound("age__gte", 18).unwrap().constraints),
            json!({"age": {"$gte": 18}})
        );
        assert_eq!(
            Value::Object(bound("age__in", json!([1, 2])).unwrap().constraints),
            json!({"age": {"$in": [1, 2]}})
        );
        assert_eq!(
            Value::Object(bound("age__exact", 3).unwrap().constraints),
            json!({"age": {"$eq": 3}})
        );
    }

    #[test]
    fn test_text_operators() {
        assert_eq!(
            Value::Object(bound("username__icontains", "Se").unwrap().constraints),
            json!({"username": {"$regex": "Se", "$options": "i"}})
        );
        assert_eq!(
            Value::Object(bound("username__startswith", "a.b").unwrap().constraints),
            json!({"username": {"$regex": "^a\\.b"}})
        );
        assert_eq!(
            Value::Object(bound("username__iexact", "x").unwrap().constraints),
            json!({"username": {"$regex": "^x$", "$options": "i"}})
        );
    }

    #[test]
    fn test_field_expression_operand() {
        let compiled = bound("age__gt", F::field("min_age")).unwrap();
        assert_eq!(
            Value::Object(compiled.constraints),
            json!({"$expr": {"$gt": ["$age", "$min_age"]}})
        );
        // both sides use storage names
        assert_eq!(
            Value::Object(bound("age__lt", F::field("address__zip") * 2).unwrap().constraints),
            json!({"$expr": {"$lt": ["$age", {"$multiply": ["$addr.z", 2]}]}})
        );
        assert!(matches!(
            bound("age__in", F::field("ages")),
            Err(PipelineError::InvalidOperator(op)) if op == "in"
        ));
        assert!(matches!(
            bound("age", F::field("ages")),
            Err(PipelineError::InvalidOperator(op)) if op == "age"
        ));
    }

    #[test]
    fn test_embedded_recursion_emits_fragment() {
        let compiled = bound("address__zip__startswith", "99").unwrap();
        assert!(compiled.constraints.is_empty());
        assert_eq!(compiled.fragments.len(), 1);
        assert_eq!(
            Value::Object(compiled.fragments[0].clone()),
            json!({"addr.z": {"$regex": "^99"}})
        );

        let compiled = bound("address__city", "Tehran").unwrap();
        assert_eq!(
            Value::Object(compiled.fragments[0].clone()),
            json!({"addr.city": "Tehran"})
        );
    }

    #[test]
    fn test_unjoined_reference_is_not_descended() {
        assert!(matches!(
            bound("referrer__username__exact", "x"),
            Err(PipelineError::InvalidOperator(op)) if op == "username"
        ));
        assert!(matches!(
            bound("referrer.username", "x"),
            Err(PipelineError::InvalidField(f)) if f == "username"
        ));
        assert_eq!(
            Value::Object(bound("referrer__in", json!([1, 2])).unwrap().constraints),
            json!({"referrer_id": {"$in": [1, 2]}})
        );

        // embedded lists are still reachable
        let compiled = bound("places__city", "Tehran").unwrap();
        assert_eq!(
            Value::Object(compiled.fragments[0].clone()),
            json!({"places.city": "Tehran"})
        );
    }

    #[test]
    fn test_unknown_names() {
        assert!(matches!(bound("nickname", 1), Err(PipelineError::InvalidField(f)) if f == "nickname"));
        assert!(matches!(bound("age__ge", 1), Err(PipelineError::InvalidOperator(op)) if op == "ge"));
        assert!(matches!(
            bound("address__street", 1),
            Err(PipelineError::InvalidField(f)) if f == "street"
        ));
    }

    #[test]
    fn test_parse_key_without_schema() {
        let op = Operand::from(1);
        assert_eq!(parse_key("age", &op).unwrap(), ("age".to_string(), None));
        assert_eq!(parse_key("age__lt", &op).unwrap(), ("age".to_string(), Some(Operator::Lt)));
        assert_eq!(
            parse_key("a__b__gte", &op).unwrap(),
            ("a.b".to_string(), Some(Operator::Gte))
        );
        assert_eq!(parse_key("a__b__c", &op).unwrap(), ("a.b.c".to_string(), None));
        assert!(matches!(parse_key("a__b", &op), Err(PipelineError::InvalidOperator(t)) if t == "b"));
    }

    #[test]
    fn test_validate_comparison() {
        assert_eq!(validate_comparison("age__lte").unwrap(), Operator::Lte);
        assert!(matches!(validate_comparison("key__ge"), Err(PipelineError::InvalidOperator(t)) if t == "ge"));
        assert!(matches!(validate_comparison("key__in"), Err(PipelineError::InvalidOperator(t)) if t == "in"));
    }

    #[test]
    fn test_expr_rendering() {
        let conditions = vec![
            Condition::new("age__nin", json!([1])),
            Condition::new("username__not", "x"),
            Condition::new("address__city__icontains", "teh"),
        ];
        assert_eq!(
            compile_expr(&conditions, Some(&schema())).unwrap(),
            json!({"$and": [
                {"$not": [{"$in": ["$age", [1]]}]},
                {"$not": [{"$eq": ["$username", "x"]}]},
                {"$regexMatch": {"input": "$addr.city", "regex": "teh", "options": "i"}}
            ]})
        );
    }

    #[test]
    fn test_substitute_let_vars() {
        let value = json!({"$ne": ["$_id", "owner"], "other": ["owner", "x"]});
        assert_eq!(
            substitute_let_vars(&value, &["owner".to_string()]),
            json!({"$ne": ["$_id", "$$owner"], "other": ["$$owner", "x"]})
        );
    }

    #[test]
    fn test_merge_is_last_write_wins() {
        let mut target = json!({"a": 1, "age": {"$gte": 1}, "$expr": {"$gt": ["$a", "$b"]}})
            .as_object()
            .cloned()
            .unwrap();
        merge_constraints(
            &mut target,
            json!({"age": {"$lte": 5}, "$expr": {"$lt": ["$a", "$c"]}, "b": 2})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(
            Value::Object(target.clone()),
            json!({"a": 1, "age": {"$lte": 5}, "$expr": {"$lt": ["$a", "$c"]}, "b": 2})
        );
        let keys: Vec<&str> = target.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a", "age", "$expr", "b"]);
    }
}
