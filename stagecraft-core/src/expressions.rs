// stagecraft-core/src/expressions.rs
//! Expression value types
//!
//! - [`F`]: field references and arithmetic (`$add`, `$multiply`, ...)
//! - [`Cond`]: ternary `$cond` expressions
//! - [`Q`]: boolean predicate trees over keyword conditions
//! - [`Operand`]: anything that can sit on the value side of a keyword
//!
//! All of them are immutable trees; combining two values builds a new node.

use std::fmt;
use std::ops::{Add, BitAnd, BitOr, Div, Mul, Not, Sub};

use serde_json::{json, Map, Value};

use crate::compiler;
use crate::error::{PipelineError, Result};
use crate::operators::{Accumulator, CondOperator, Operator};
use crate::resolver::{self, PATH_SEPARATOR};
use crate::schema::{FieldType, Schema};

// ============================================================================
// F - computed field expressions
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ArithOp {
    pub fn mongo(&self) -> &'static str {
        match self {
            ArithOp::Add => "$add",
            ArithOp::Subtract => "$subtract",
            ArithOp::Multiply => "$multiply",
            ArithOp::Divide => "$divide",
        }
    }

    /// Variadic in the native engine, so same-operator chains flatten
    pub fn is_associative(&self) -> bool {
        matches!(self, ArithOp::Add | ArithOp::Multiply)
    }
}

/// Computed field expression
#[derive(Clone, Debug, PartialEq)]
pub enum F {
    /// Dotted document path, rendered as `"$path"`
    Field(String),
    Value(Value),
    Arith { op: ArithOp, operands: Vec<F> },
    /// Pre-built `$group` accumulator over an expression
    Accumulate { accumulator: Accumulator, expr: Box<F> },
}

impl F {
    /// Field reference; `__` separators become dots
    pub fn field(path: &str) -> F {
        F::Field(path.replace(PATH_SEPARATOR, "."))
    }

    pub fn value(value: impl Into<Value>) -> F {
        F::Value(value.into())
    }

    /// Append `rhs` under `op`. `(a * b) * c` becomes one `$multiply`
    /// with three operands; `$subtract`/`$divide` nest instead.
    pub fn combine(self, op: ArithOp, rhs: impl Into<F>) -> F {
        match self {
            F::Arith {
                op: current,
                mut operands,
            } if current == op && op.is_associative() => {
                operands.push(rhs.into());
                F::Arith { op, operands }
            }
            lhs => F::Arith {
                op,
                operands: vec![lhs, rhs.into()],
            },
        }
    }

    pub fn accumulate(self, accumulator: Accumulator) -> F {
        F::Accumulate {
            accumulator,
            expr: Box::new(self),
        }
    }

    pub fn sum(self) -> F {
        self.accumulate(Accumulator::Sum)
    }

    pub fn avg(self) -> F {
        self.accumulate(Accumulator::Avg)
    }

    pub fn min(self) -> F {
        self.accumulate(Accumulator::Min)
    }

    pub fn max(self) -> F {
        self.accumulate(Accumulator::Max)
    }

    pub fn first(self) -> F {
        self.accumulate(Accumulator::First)
    }

    pub fn last(self) -> F {
        self.accumulate(Accumulator::Last)
    }

    pub fn push(self) -> F {
        self.accumulate(Accumulator::Push)
    }

    pub fn add_to_set(self) -> F {
        self.accumulate(Accumulator::AddToSet)
    }

    /// Rewrite field paths to the storage paths `schema` declares. Paths
    /// it does not know (fields made by raw stages) stay as written.
    pub fn bind(&self, schema: &Schema) -> F {
        match self {
            F::Field(path) => match resolver::resolve_path(schema, path) {
                Ok(storage) => F::Field(storage),
                Err(_) => self.clone(),
            },
            F::Value(_) => self.clone(),
            F::Arith { op, operands } => F::Arith {
                op: *op,
                operands: operands.iter().map(|operand| operand.bind(schema)).collect(),
            },
            F::Accumulate { accumulator, expr } => F::Accumulate {
                accumulator: *accumulator,
                expr: Box::new(expr.bind(schema)),
            },
        }
    }

    /// Best-effort static type of the expression's result
    pub fn output_type(&self, schema: &Schema) -> FieldType {
        match self {
            F::Field(path) => crate::resolver::lookup(schema, &crate::resolver::split_path(path))
                .map(|(_, field)| field.field_type.clone())
                .unwrap_or(FieldType::Dynamic),
            F::Value(Value::String(_)) => FieldType::String,
            F::Value(Value::Bool(_)) => FieldType::Boolean,
            F::Value(Value::Number(n)) if n.is_i64() || n.is_u64() => FieldType::Int,
            F::Value(Value::Number(_)) => FieldType::Float,
            F::Value(Value::Array(_)) => FieldType::list_of(FieldType::Dynamic),
            F::Value(Value::Object(_)) => FieldType::Dict,
            F::Value(Value::Null) => FieldType::Dynamic,
            F::Arith { .. } => FieldType::Float,
            F::Accumulate { accumulator, expr } => {
                let source = expr.output_type(schema);
                accumulator.output_type(Some(&source))
            }
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            F::Field(path) => Value::String(format!("${}", path)),
            F::Value(value) => value.clone(),
            F::Arith { op, operands } => {
                let operands: Vec<Value> = operands.iter().map(F::to_value).collect();
                json!({ op.mongo(): operands })
            }
            F::Accumulate { accumulator, expr } => match accumulator {
                // $count takes no argument
                Accumulator::Count => json!({ accumulator.mongo(): {} }),
                _ => json!({ accumulator.mongo(): expr.to_value() }),
            },
        }
    }
}

macro_rules! impl_f_from_literal {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for F {
                fn from(value: $ty) -> Self {
                    F::Value(Value::from(value))
                }
            }
        )*
    };
}

impl_f_from_literal!(i32, i64, u32, u64, f64, bool, &str, String);

impl From<Value> for F {
    fn from(value: Value) -> Self {
        F::Value(value)
    }
}

impl From<F> for Value {
    fn from(expr: F) -> Self {
        expr.to_value()
    }
}

impl<T: Into<F>> Add<T> for F {
    type Output = F;

    fn add(self, rhs: T) -> F {
        self.combine(ArithOp::Add, rhs)
    }
}

impl<T: Into<F>> Sub<T> for F {
    type Output = F;

    fn sub(self, rhs: T) -> F {
        self.combine(ArithOp::Subtract, rhs)
    }
}

impl<T: Into<F>> Mul<T> for F {
    type Output = F;

    fn mul(self, rhs: T) -> F {
        self.combine(ArithOp::Multiply, rhs)
    }
}

impl<T: Into<F>> Div<T> for F {
    type Output = F;

    fn div(self, rhs: T) -> F {
        self.combine(ArithOp::Divide, rhs)
    }
}

// ============================================================================
// Cond - conditional expressions
// ============================================================================

/// `{"$cond": {"if": {op: [lhs, rhs]}, "then": .., "else": ..}}`
#[derive(Clone, Debug, PartialEq)]
pub struct Cond {
    lhs: Value,
    op: CondOperator,
    rhs: Value,
    then_value: Value,
    else_value: Value,
}

impl Cond {
    /// `op` is one of `>`, `>=`, `<`, `<=`, `==`, `!=`
    pub fn new(
        lhs: impl Into<Value>,
        op: &str,
        rhs: impl Into<Value>,
        then_value: impl Into<Value>,
        else_value: impl Into<Value>,
    ) -> Result<Cond> {
        Ok(Cond {
            lhs: lhs.into(),
            op: CondOperator::parse(op)?,
            rhs: rhs.into(),
            then_value: then_value.into(),
            else_value: else_value.into(),
        })
    }

    pub fn to_value(&self) -> Value {
        json!({
            "$cond": {
                "if": { self.op.mongo(): [self.lhs.clone(), self.rhs.clone()] },
                "then": self.then_value.clone(),
                "else": self.else_value.clone(),
            }
        })
    }
}

impl From<Cond> for Value {
    fn from(cond: Cond) -> Self {
        cond.to_value()
    }
}

// ============================================================================
// Operand - keyword values
// ============================================================================

/// Value side of a keyword condition, projection or computed field
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Literal(Value),
    Expr(F),
    Cond(Cond),
    Predicate(Q),
}

impl Operand {
    pub fn is_expr(&self) -> bool {
        matches!(self, Operand::Expr(_))
    }

    /// Predicates render in `$expr` form
    pub fn to_value(&self) -> Result<Value> {
        match self {
            Operand::Literal(value) => Ok(value.clone()),
            Operand::Expr(expr) => Ok(expr.to_value()),
            Operand::Cond(cond) => Ok(cond.to_value()),
            Operand::Predicate(q) => q.to_expr(),
        }
    }

    /// Same operand with any field expression bound to `schema`
    pub fn bind(&self, schema: &Schema) -> Operand {
        match self {
            Operand::Expr(expr) => Operand::Expr(expr.bind(schema)),
            other => other.clone(),
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Operand::Literal(value) => Some(value),
            _ => None,
        }
    }
}

macro_rules! impl_operand_from_literal {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Operand {
                fn from(value: $ty) -> Self {
                    Operand::Literal(Value::from(value))
                }
            }
        )*
    };
}

impl_operand_from_literal!(i32, i64, u32, u64, f64, bool, &str, String, Vec<Value>);

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Literal(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Operand {
    fn from(value: Option<T>) -> Self {
        Operand::Literal(value.map(Into::into).unwrap_or(Value::Null))
    }
}

impl From<F> for Operand {
    fn from(expr: F) -> Self {
        Operand::Expr(expr)
    }
}

impl From<Cond> for Operand {
    fn from(cond: Cond) -> Self {
        Operand::Cond(cond)
    }
}

impl From<Q> for Operand {
    fn from(q: Q) -> Self {
        Operand::Predicate(q)
    }
}

/// Keyword list: `kw! { "age__gte" => 30, "name" => "John" }`
#[macro_export]
macro_rules! kw {
    () => {
        ::std::vec::Vec::<(::std::string::String, $crate::expressions::Operand)>::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {
        vec![$(($key.to_string(), $crate::expressions::Operand::from($value))),+]
    };
}

// ============================================================================
// Q - predicates
// ============================================================================

/// One `key: value` keyword condition, key still in `field__op` form
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub key: String,
    pub operand: Operand,
}

impl Condition {
    pub fn new(key: impl Into<String>, operand: impl Into<Operand>) -> Self {
        Condition {
            key: key.into(),
            operand: operand.into(),
        }
    }
}

/// Boolean predicate tree
#[derive(Clone, Debug, PartialEq)]
pub enum Q {
    /// Implicit conjunction of keyword conditions
    Leaf(Vec<Condition>),
    And(Vec<Q>),
    Or(Vec<Q>),
    Not(Box<Q>),
}

impl Q {
    /// Operator suffixes are checked here; field names are checked once
    /// the predicate meets a schema (`filter`, `lookup`, `add_fields`).
    pub fn new<I, K, V>(conditions: I) -> Result<Q>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Operand>,
    {
        let conditions: Vec<Condition> = conditions
            .into_iter()
            .map(|(k, v)| Condition::new(k, v))
            .collect();
        for condition in &conditions {
            compiler::parse_key(&condition.key, &condition.operand)?;
        }
        Ok(Q::Leaf(conditions))
    }

    /// Single-condition shorthand
    pub fn kw(key: &str, value: impl Into<Operand>) -> Result<Q> {
        Q::new([(key, value.into())])
    }

    /// Same-combinator chains flatten into one operand list
    pub fn and(self, other: Q) -> Q {
        match (self, other) {
            (Q::And(mut left), Q::And(right)) => {
                left.extend(right);
                Q::And(left)
            }
            (Q::And(mut left), right) => {
                left.push(right);
                Q::And(left)
            }
            (left, Q::And(right)) => {
                let mut all = Vec::with_capacity(right.len() + 1);
                all.push(left);
                all.extend(right);
                Q::And(all)
            }
            (left, right) => Q::And(vec![left, right]),
        }
    }

    pub fn or(self, other: Q) -> Q {
        match (self, other) {
            (Q::Or(mut left), Q::Or(right)) => {
                left.extend(right);
                Q::Or(left)
            }
            (Q::Or(mut left), right) => {
                left.push(right);
                Q::Or(left)
            }
            (left, Q::Or(right)) => {
                let mut all = Vec::with_capacity(right.len() + 1);
                all.push(left);
                all.extend(right);
                Q::Or(all)
            }
            (left, right) => Q::Or(vec![left, right]),
        }
    }

    pub fn negate(self) -> Q {
        Q::Not(Box::new(self))
    }

    /// Every keyword condition in the tree, depth first
    pub fn conditions(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        self.collect_conditions(&mut out);
        out
    }

    fn collect_conditions<'a>(&'a self, out: &mut Vec<&'a Condition>) {
        match self {
            Q::Leaf(conditions) => out.extend(conditions.iter()),
            Q::And(children) | Q::Or(children) => {
                for child in children {
                    child.collect_conditions(out);
                }
            }
            Q::Not(inner) => inner.collect_conditions(out),
        }
    }

    /// Match-stage body; field paths resolve through `schema` when given
    pub fn to_match(&self, schema: Option<&Schema>) -> Result<Map<String, Value>> {
        match self {
            Q::Leaf(conditions) => compiler::compile_predicate_leaf(conditions, schema),
            Q::And(children) => Ok(combinator("$and", children, schema)?),
            Q::Or(children) => Ok(combinator("$or", children, schema)?),
            Q::Not(inner) => {
                let mut map = Map::new();
                map.insert(
                    "$not".to_string(),
                    Value::Array(vec![Value::Object(inner.to_match(schema)?)]),
                );
                Ok(map)
            }
        }
    }

    /// `{"$match": ...}` without schema resolution
    pub fn to_stage(&self) -> Result<Value> {
        Ok(json!({ "$match": Value::Object(self.to_match(None)?) }))
    }

    /// Aggregation-expression form (as used inside `$expr`)
    pub fn to_expr(&self) -> Result<Value> {
        self.to_expr_with(None)
    }

    pub fn to_expr_with(&self, schema: Option<&Schema>) -> Result<Value> {
        match self {
            Q::Leaf(conditions) => compiler::compile_expr(conditions, schema),
            Q::And(children) | Q::Or(children) => {
                let key = if matches!(self, Q::And(_)) { "$and" } else { "$or" };
                let parts = children
                    .iter()
                    .map(|child| child.to_expr_with(schema))
                    .collect::<Result<Vec<_>>>()?;
                Ok(json!({ key: parts }))
            }
            Q::Not(inner) => Ok(json!({ "$not": [inner.to_expr_with(schema)?] })),
        }
    }
}

fn combinator(key: &str, children: &[Q], schema: Option<&Schema>) -> Result<Map<String, Value>> {
    let parts = children
        .iter()
        .map(|child| child.to_match(schema).map(Value::Object))
        .collect::<Result<Vec<_>>>()?;
    let mut map = Map::new();
    map.insert(key.to_string(), Value::Array(parts));
    Ok(map)
}

impl BitAnd for Q {
    type Output = Q;

    fn bitand(self, rhs: Q) -> Q {
        self.and(rhs)
    }
}

impl BitOr for Q {
    type Output = Q;

    fn bitor(self, rhs: Q) -> Q {
        self.or(rhs)
    }
}

impl Not for Q {
    type Output = Q;

    fn not(self) -> Q {
        self.negate()
    }
}

impl fmt::Display for Q {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_stage() {
            Ok(stage) => write!(f, "{}", stage),
            Err(err) => write!(f, "<invalid predicate: {}>", err),
        }
    }
}

/// Aliases matching the long names used in documentation
pub type FieldExpr = F;
pub type ConditionalExpr = Cond;
pub type Predicate = Q;

impl TryFrom<Operand> for Q {
    type Error = PipelineError;

    fn try_from(operand: Operand) -> Result<Q> {
        match operand {
            Operand::Predicate(q) => Ok(q),
            other => Err(PipelineError::InvalidArgument(format!(
                "expected a predicate, got {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f_binary_operations() {
        assert_eq!(
            (F::field("age") - F::field("income")).to_value(),
            json!({"$subtract": ["$age", "$income"]})
        );
        assert_eq!(
            (F::field("income") / F::field("expenses")).to_value(),
            json!({"$divide": ["$income", "$expenses"]})
        );
        assert_eq!((F::field("age") + 10).to_value(), json!({"$add": ["$age", 10]}));
        assert_eq!((F::field("price") / 2).to_value(), json!({"$divide": ["$price", 2]}));
    }

    #[test]
    fn test_f_same_operator_chains_flatten() {
        let product = F::field("quantity") * F::field("price") * F::field("nano");
        assert_eq!(
            product.to_value(),
            json!({"$multiply": ["$quantity", "$price", "$nano"]})
        );

        let sum = F::field("a") + 1 + 2;
        assert_eq!(sum.to_value(), json!({"$add": ["$a", 1, 2]}));
    }

    #[test]
    fn test_f_non_associative_chains_nest() {
        let diff = F::field("a") - F::field("b") - F::field("c");
        assert_eq!(
            diff.to_value(),
            json!({"$subtract": [{"$subtract": ["$a", "$b"]}, "$c"]})
        );
    }

    #[test]
    fn test_f_mixed_operators_nest() {
        let expr = (F::field("a") + F::field("b")) * 2;
        assert_eq!(
            expr.to_value(),
            json!({"$multiply": [{"$add": ["$a", "$b"]}, 2]})
        );
    }

    #[test]
    fn test_f_field_normalizes_separator() {
        assert_eq!(F::field("owner__name").to_value(), json!("$owner.name"));
    }

    #[test]
    fn test_f_accumulators() {
        assert_eq!(F::field("age").sum().to_value(), json!({"$sum": "$age"}));
        assert_eq!(
            (F::field("price") * F::field("qty")).avg().to_value(),
            json!({"$avg": {"$multiply": ["$price", "$qty"]}})
        );
        assert_eq!(
            F::field("x").accumulate(Accumulator::Count).to_value(),
            json!({"$count": {}})
        );
    }

    #[test]
    fn test_cond_operators() {
        let cond = Cond::new(25, ">", 20, "High", "Low").unwrap();
        assert_eq!(
            cond.to_value(),
            json!({"$cond": {"if": {"$gt": [25, 20]}, "then": "High", "else": "Low"}})
        );
        let cond = Cond::new(40, "!=", 35, "Not Equal", "Equal").unwrap();
        assert_eq!(
            cond.to_value(),
            json!({"$cond": {"if": {"$ne": [40, 35]}, "then": "Not Equal", "else": "Equal"}})
        );
        let cond = Cond::new(18, "<=", 20, "Less or Equal", "Greater").unwrap();
        assert_eq!(
            cond.to_value(),
            json!({"$cond": {"if": {"$lte": [18, 20]}, "then": "Less or Equal", "else": "Greater"}})
        );
    }

    #[test]
    fn test_cond_nests_and_accepts_field_expressions() {
        let inner = Cond::new(20, "<", 25, "Within Range", "Out of Range").unwrap();
        let outer = Cond::new(15, ">", 10, inner, "Invalid").unwrap();
        assert_eq!(
            outer.to_value(),
            json!({"$cond": {
                "if": {"$gt": [15, 10]},
                "then": {"$cond": {"if": {"$lt": [20, 25]}, "then": "Within Range", "else": "Out of Range"}},
                "else": "Invalid"
            }})
        );

        let adult = Cond::new(F::field("age"), ">", 30, "Adult", "Child").unwrap();
        assert_eq!(adult.to_value()["$cond"]["if"], json!({"$gt": ["$age", 30]}));
    }

    #[test]
    fn test_cond_invalid_operator() {
        assert!(matches!(
            Cond::new(25, "invalid_operator", 20, "High", "Low"),
            Err(PipelineError::InvalidOperator(op)) if op == "invalid_operator"
        ));
    }

    #[test]
    fn test_q_or_flattens_chains() {
        let q1 = Q::kw("name", "John").unwrap();
        let q2 = Q::kw("name", "Alice").unwrap();
        let q3 = Q::kw("name", "Bob").unwrap();

        let combined = q1.clone() | q2.clone() | q3.clone();
        assert_eq!(
            combined.to_stage().unwrap(),
            json!({"$match": {"$or": [{"name": "John"}, {"name": "Alice"}, {"name": "Bob"}]}})
        );
    }

    #[test]
    fn test_q_and_of_negations() {
        let q1 = Q::kw("name", "John").unwrap();
        let q2 = Q::kw("age__lt", 30).unwrap();
        let combined = !q1 & !q2;
        assert_eq!(
            combined.to_stage().unwrap(),
            json!({"$match": {"$and": [
                {"$not": [{"name": "John"}]},
                {"$not": [{"age": {"$lt": 30}}]}
            ]}})
        );
    }

    #[test]
    fn test_q_flattening_is_symmetric() {
        let a = Q::kw("a", 1).unwrap();
        let b = Q::kw("b", 2).unwrap();
        let c = Q::kw("c", 3).unwrap();
        let right_nested = a & (b & c);
        match right_nested {
            Q::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("expected flattened $and, got {:?}", other),
        }
    }

    #[test]
    fn test_q_mixed_combinators_nest() {
        let q = (Q::kw("x", 1).unwrap() | Q::kw("y", 2).unwrap()) & Q::kw("z", 3).unwrap();
        assert_eq!(
            q.to_stage().unwrap(),
            json!({"$match": {"$and": [{"$or": [{"x": 1}, {"y": 2}]}, {"z": 3}]}})
        );
    }

    #[test]
    fn test_q_rejects_unknown_operator_at_construction() {
        assert!(matches!(
            Q::kw("age__ge", 3),
            Err(PipelineError::InvalidOperator(op)) if op == "ge"
        ));
    }

    #[test]
    fn test_q_expr_form() {
        let q = Q::kw("_id__ne", "owner").unwrap() & Q::kw("username__ne", "seyed").unwrap();
        assert_eq!(
            q.to_expr().unwrap(),
            json!({"$and": [{"$ne": ["$_id", "owner"]}, {"$ne": ["$username", "seyed"]}]})
        );
    }

    #[test]
    fn test_kw_macro_builds_operands() {
        let pairs = crate::kw! { "age__gte" => 30, "name" => "John", "ratio__lt" => F::field("cap") };
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].1, Operand::Literal(json!(30)));
        assert!(pairs[2].1.is_expr());
    }
}
