// stagecraft-core/src/sink/operators.rs
//! `$match` evaluation for the in-memory sink
//!
//! Field operators (`$eq`, `$gt`, `$regex`, ...) are `OperatorMatcher`
//! implementations looked up in a static registry. Logical keys (`$and`,
//! `$or`, `$nor`, the array form of `$not`) and `$expr` are handled by
//! [`matches`] itself.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::sink::expr;
use crate::value_utils::{collect_path_values, compare_values, is_truthy, values_equal};

// ============================================================================
// REGEX CACHE
// ============================================================================

const REGEX_CACHE_SIZE: usize = 128;

lazy_static! {
    /// Compiled patterns keyed by `"options/pattern"`
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> = Mutex::new(LruCache::new(
        NonZeroUsize::new(REGEX_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN)
    ));
}

/// Compile `pattern` with native-engine options (`i`, `m`, `s`, `x`),
/// reusing a cached instance when one exists
pub fn cached_regex(pattern: &str, options: &str) -> Result<Regex> {
    let flags: String = options
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();
    let key = format!("{}/{}", flags, pattern);

    if let Some(regex) = REGEX_CACHE.lock().get(&key) {
        return Ok(regex.clone());
    }

    let source = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", flags, pattern)
    };
    let regex = Regex::new(&source).map_err(|e| {
        PipelineError::AggregationError(format!("invalid regex '{}': {}", pattern, e))
    })?;
    REGEX_CACHE.lock().put(key, regex.clone());
    Ok(regex)
}

// ============================================================================
// TRAIT
// ============================================================================

/// One field-level query operator
pub trait OperatorMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// `values` are the document values at the field path (empty when
    /// the field is missing). `siblings` is the whole operator document,
    /// for operators that read a companion key (`$regex` + `$options`).
    fn matches(&self, values: &[&Value], operand: &Value, siblings: &Map<String, Value>) -> Result<bool>;
}

/// The values themselves plus the elements of array values, so that
/// `{"tags": "a"}` matches `{"tags": ["a", "b"]}`
fn with_elements<'a>(values: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(*value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn any_equal(values: &[&Value], operand: &Value) -> bool {
    if values.is_empty() {
        return operand.is_null();
    }
    with_elements(values).iter().any(|v| values_equal(v, operand))
}

fn any_ordered<P>(values: &[&Value], operand: &Value, accept: P) -> bool
where
    P: Fn(std::cmp::Ordering) -> bool,
{
    with_elements(values)
        .iter()
        .any(|v| compare_values(v, operand).map_or(false, &accept))
}

fn operand_list<'a>(name: &str, operand: &'a Value) -> Result<&'a Vec<Value>> {
    operand
        .as_array()
        .ok_or_else(|| PipelineError::AggregationError(format!("{} needs an array", name)))
}

// ============================================================================
// OPERATORS
// ============================================================================

pub struct EqOperator;

impl OperatorMatcher for EqOperator {
    fn name(&self) -> &'static str {
        "$eq"
    }

    fn matches(&self, values: &[&Value], operand: &Value, _siblings: &Map<String, Value>) -> Result<bool> {
        Ok(any_equal(values, operand))
    }
}

pub struct NeOperator;

impl OperatorMatcher for NeOperator {
    fn name(&self) -> &'static str {
        "$ne"
    }

    fn matches(&self, values: &[&Value], operand: &Value, _siblings: &Map<String, Value>) -> Result<bool> {
        Ok(!any_equal(values, operand))
    }
}

macro_rules! ordering_operator {
    ($ty:ident, $name:literal, $accept:expr) => {
        pub struct $ty;

        impl OperatorMatcher for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn matches(&self, values: &[&Value], operand: &Value, _siblings: &Map<String, Value>) -> Result<bool> {
                Ok(any_ordered(values, operand, $accept))
            }
        }
    };
}

ordering_operator!(GtOperator, "$gt", |o| o.is_gt());
ordering_operator!(GteOperator, "$gte", |o| o.is_ge());
ordering_operator!(LtOperator, "$lt", |o| o.is_lt());
ordering_operator!(LteOperator, "$lte", |o| o.is_le());

pub struct InOperator;

impl OperatorMatcher for InOperator {
    fn name(&self) -> &'static str {
        "$in"
    }

    fn matches(&self, values: &[&Value], operand: &Value, _siblings: &Map<String, Value>) -> Result<bool> {
        let list = operand_list(self.name(), operand)?;
        Ok(list.iter().any(|candidate| any_equal(values, candidate)))
    }
}

pub struct NinOperator;

impl OperatorMatcher for NinOperator {
    fn name(&self) -> &'static str {
        "$nin"
    }

    fn matches(&self, values: &[&Value], operand: &Value, siblings: &Map<String, Value>) -> Result<bool> {
        Ok(!InOperator.matches(values, operand, siblings)?)
    }
}

pub struct ExistsOperator;

impl OperatorMatcher for ExistsOperator {
    fn name(&self) -> &'static str {
        "$exists"
    }

    fn matches(&self, values: &[&Value], operand: &Value, _siblings: &Map<String, Value>) -> Result<bool> {
        Ok(values.is_empty() != is_truthy(operand))
    }
}

pub struct RegexOperator;

impl OperatorMatcher for RegexOperator {
    fn name(&self) -> &'static str {
        "$regex"
    }

    fn matches(&self, values: &[&Value], operand: &Value, siblings: &Map<String, Value>) -> Result<bool> {
        let pattern = operand
            .as_str()
            .ok_or_else(|| PipelineError::AggregationError("$regex needs a string".to_string()))?;
        let options = siblings.get("$options").and_then(Value::as_str).unwrap_or("");
        let regex = cached_regex(pattern, options)?;
        Ok(with_elements(values)
            .iter()
            .any(|v| v.as_str().map_or(false, |s| regex.is_match(s))))
    }
}

/// `{"$options": ..}` is consumed by `$regex`
pub struct OptionsOperator;

impl OperatorMatcher for OptionsOperator {
    fn name(&self) -> &'static str {
        "$options"
    }

    fn matches(&self, _values: &[&Value], _operand: &Value, siblings: &Map<String, Value>) -> Result<bool> {
        if siblings.contains_key("$regex") {
            Ok(true)
        } else {
            Err(PipelineError::AggregationError("$options without $regex".to_string()))
        }
    }
}

/// Field-level `$not`: negates an operator document, or an equality
pub struct NotOperator;

impl OperatorMatcher for NotOperator {
    fn name(&self) -> &'static str {
        "$not"
    }

    fn matches(&self, values: &[&Value], operand: &Value, _siblings: &Map<String, Value>) -> Result<bool> {
        match operand {
            Value::Object(doc) if is_operator_document(doc) => Ok(!match_operators(values, doc)?),
            other => Ok(!any_equal(values, other)),
        }
    }
}

lazy_static! {
    pub static ref OPERATOR_REGISTRY: HashMap<&'static str, Box<dyn OperatorMatcher>> = {
        let mut registry: HashMap<&'static str, Box<dyn OperatorMatcher>> = HashMap::new();
        let operators: Vec<Box<dyn OperatorMatcher>> = vec![
            Box::new(EqOperator),
            Box::new(NeOperator),
            Box::new(GtOperator),
            Box::new(GteOperator),
            Box::new(LtOperator),
            Box::new(LteOperator),
            Box::new(InOperator),
            Box::new(NinOperator),
            Box::new(ExistsOperator),
            Box::new(RegexOperator),
            Box::new(OptionsOperator),
            Box::new(NotOperator),
        ];
        for operator in operators {
            registry.insert(operator.name(), operator);
        }
        registry
    };
}

// ============================================================================
// FILTER EVALUATION
// ============================================================================

fn is_operator_document(doc: &Map<String, Value>) -> bool {
    !doc.is_empty() && doc.keys().all(|k| k.starts_with('$'))
}

fn match_operators(values: &[&Value], doc: &Map<String, Value>) -> Result<bool> {
    for (name, operand) in doc {
        let operator = OPERATOR_REGISTRY.get(name.as_str()).ok_or_else(|| {
            PipelineError::AggregationError(format!("unsupported query operator {}", name))
        })?;
        if !operator.matches(values, operand, doc)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters<'a>(name: &str, operand: &'a Value) -> Result<Vec<&'a Map<String, Value>>> {
    operand_list(name, operand)?
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| PipelineError::AggregationError(format!("{} entries must be documents", name)))
        })
        .collect()
}

/// Does `doc` satisfy a `$match` body? `vars` are the `$$` bindings of an
/// enclosing `$lookup`.
pub fn matches(doc: &Value, filter: &Map<String, Value>, vars: &Map<String, Value>) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => all(doc, &sub_filters(key, condition)?, vars)?,
            "$or" => any(doc, &sub_filters(key, condition)?, vars)?,
            "$nor" => !any(doc, &sub_filters(key, condition)?, vars)?,
            "$not" => !all(doc, &sub_filters(key, condition)?, vars)?,
            "$expr" => is_truthy(&expr::evaluate(condition, doc, vars)?),
            other if other.starts_with('$') => {
                return Err(PipelineError::AggregationError(format!(
                    "unsupported top-level operator {}",
                    other
                )))
            }
            field => {
                let values = collect_path_values(doc, field);
                match condition {
                    Value::Object(ops) if is_operator_document(ops) => match_operators(&values, ops)?,
                    literal => any_equal(&values, literal),
                }
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn all(doc: &Value, filters: &[&Map<String, Value>], vars: &Map<String, Value>) -> Result<bool> {
    for filter in filters {
        if !matches(doc, filter, vars)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any(doc: &Value, filters: &[&Map<String, Value>], vars: &Map<String, Value>) -> Result<bool> {
    for filter in filters {
        if matches(doc, filter, vars)? {
            return Ok(true);
        }
    }
    Ok(false)
}
