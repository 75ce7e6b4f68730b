// stagecraft-core/src/operators.rs
//! Fixed operator vocabularies
//!
//! - [`Operator`]: keyword suffixes accepted by `filter` (`age__gte`, ...)
//! - [`CondOperator`]: symbolic comparisons used by `Cond` and `redact`
//! - [`Accumulator`]: `$group` accumulators accepted by `annotate`

use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;

use crate::error::{PipelineError, Result};
use crate::schema::FieldType;

/// Keyword operator suffix
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    Exact,
    IExact,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    In,
    Nin,
    Ne,
    Not,
    Lt,
    Lte,
    Gt,
    Gte,
}

lazy_static! {
    /// Suffix token -> operator
    static ref OPERATOR_TABLE: HashMap<&'static str, Operator> = Operator::ALL
        .iter()
        .map(|op| (op.as_str(), *op))
        .collect();
}

impl Operator {
    pub const ALL: [Operator; 16] = [
        Operator::Exact,
        Operator::IExact,
        Operator::Contains,
        Operator::IContains,
        Operator::StartsWith,
        Operator::IStartsWith,
        Operator::EndsWith,
        Operator::IEndsWith,
        Operator::In,
        Operator::Nin,
        Operator::Ne,
        Operator::Not,
        Operator::Lt,
        Operator::Lte,
        Operator::Gt,
        Operator::Gte,
    ];

    /// `None` when the token is not an operator (it may be a nested field)
    pub fn lookup(token: &str) -> Option<Operator> {
        OPERATOR_TABLE.get(token).copied()
    }

    /// Like [`Operator::lookup`] but fails with `InvalidOperator`
    pub fn parse(token: &str) -> Result<Operator> {
        Self::lookup(token).ok_or_else(|| PipelineError::InvalidOperator(token.to_string()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Exact => "exact",
            Operator::IExact => "iexact",
            Operator::Contains => "contains",
            Operator::IContains => "icontains",
            Operator::StartsWith => "startswith",
            Operator::IStartsWith => "istartswith",
            Operator::EndsWith => "endswith",
            Operator::IEndsWith => "iendswith",
            Operator::In => "in",
            Operator::Nin => "nin",
            Operator::Ne => "ne",
            Operator::Not => "not",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
        }
    }

    /// Native operator keyword
    pub fn mongo(&self) -> &'static str {
        match self {
            Operator::Exact => "$eq",
            Operator::IExact
            | Operator::Contains
            | Operator::IContains
            | Operator::StartsWith
            | Operator::IStartsWith
            | Operator::EndsWith
            | Operator::IEndsWith => "$regex",
            Operator::In => "$in",
            Operator::Nin => "$nin",
            Operator::Ne => "$ne",
            Operator::Not => "$not",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte
        )
    }

    /// Operators compiled to a `$regex` constraint
    pub fn is_text(&self) -> bool {
        self.mongo() == "$regex"
    }

    pub fn is_case_insensitive(&self) -> bool {
        matches!(
            self,
            Operator::IExact | Operator::IContains | Operator::IStartsWith | Operator::IEndsWith
        )
    }

    /// Anchored pattern for text operators; the literal is escaped
    pub fn regex_pattern(&self, literal: &str) -> Option<String> {
        let escaped = regex::escape(literal);
        match self {
            Operator::IExact => Some(format!("^{}$", escaped)),
            Operator::Contains | Operator::IContains => Some(escaped),
            Operator::StartsWith | Operator::IStartsWith => Some(format!("^{}", escaped)),
            Operator::EndsWith | Operator::IEndsWith => Some(format!("{}$", escaped)),
            _ => None,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symbolic comparison for conditional expressions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CondOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
}

impl CondOperator {
    pub fn parse(symbol: &str) -> Result<CondOperator> {
        match symbol {
            ">" => Ok(CondOperator::Gt),
            ">=" => Ok(CondOperator::Gte),
            "<" => Ok(CondOperator::Lt),
            "<=" => Ok(CondOperator::Lte),
            "==" => Ok(CondOperator::Eq),
            "!=" => Ok(CondOperator::Ne),
            other => Err(PipelineError::InvalidOperator(other.to_string())),
        }
    }

    pub fn mongo(&self) -> &'static str {
        match self {
            CondOperator::Gt => "$gt",
            CondOperator::Gte => "$gte",
            CondOperator::Lt => "$lt",
            CondOperator::Lte => "$lte",
            CondOperator::Eq => "$eq",
            CondOperator::Ne => "$ne",
        }
    }
}

/// `$group` accumulator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Accumulator {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
    StdDevPop,
    StdDevSamp,
    Count,
    Median,
    MergeObjects,
    Top,
    Bottom,
    TopN,
    BottomN,
    FirstN,
    LastN,
    MaxN,
    MinN,
}

lazy_static! {
    static ref ACCUMULATOR_TABLE: HashMap<&'static str, Accumulator> = {
        let mut table = HashMap::new();
        for acc in Accumulator::ALL {
            table.insert(acc.name(), acc);
        }
        // snake_case spellings
        table.insert("add_to_set", Accumulator::AddToSet);
        table.insert("std_dev_pop", Accumulator::StdDevPop);
        table.insert("std_dev_samp", Accumulator::StdDevSamp);
        table.insert("merge_objects", Accumulator::MergeObjects);
        table.insert("top_n", Accumulator::TopN);
        table.insert("bottom_n", Accumulator::BottomN);
        table.insert("first_n", Accumulator::FirstN);
        table.insert("last_n", Accumulator::LastN);
        table.insert("max_n", Accumulator::MaxN);
        table.insert("min_n", Accumulator::MinN);
        table
    };
}

impl Accumulator {
    pub const ALL: [Accumulator; 21] = [
        Accumulator::Sum,
        Accumulator::Avg,
        Accumulator::Min,
        Accumulator::Max,
        Accumulator::First,
        Accumulator::Last,
        Accumulator::Push,
        Accumulator::AddToSet,
        Accumulator::StdDevPop,
        Accumulator::StdDevSamp,
        Accumulator::Count,
        Accumulator::Median,
        Accumulator::MergeObjects,
        Accumulator::Top,
        Accumulator::Bottom,
        Accumulator::TopN,
        Accumulator::BottomN,
        Accumulator::FirstN,
        Accumulator::LastN,
        Accumulator::MaxN,
        Accumulator::MinN,
    ];

    /// Accepts the native camelCase name (with or without `$`) or snake_case
    pub fn parse(name: &str) -> Result<Accumulator> {
        ACCUMULATOR_TABLE
            .get(name.trim_start_matches('$'))
            .copied()
            .ok_or_else(|| PipelineError::AnnotationError(format!("Invalid accumulator: {}", name)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Accumulator::Sum => "sum",
            Accumulator::Avg => "avg",
            Accumulator::Min => "min",
            Accumulator::Max => "max",
            Accumulator::First => "first",
            Accumulator::Last => "last",
            Accumulator::Push => "push",
            Accumulator::AddToSet => "addToSet",
            Accumulator::StdDevPop => "stdDevPop",
            Accumulator::StdDevSamp => "stdDevSamp",
            Accumulator::Count => "count",
            Accumulator::Median => "median",
            Accumulator::MergeObjects => "mergeObjects",
            Accumulator::Top => "top",
            Accumulator::Bottom => "bottom",
            Accumulator::TopN => "topN",
            Accumulator::BottomN => "bottomN",
            Accumulator::FirstN => "firstN",
            Accumulator::LastN => "lastN",
            Accumulator::MaxN => "maxN",
            Accumulator::MinN => "minN",
        }
    }

    pub fn mongo(&self) -> String {
        format!("${}", self.name())
    }

    /// Type registered for the output field. `source` is the type of the
    /// accumulated field when the value resolved to one.
    pub fn output_type(&self, source: Option<&FieldType>) -> FieldType {
        match self {
            Accumulator::Sum | Accumulator::Avg | Accumulator::StdDevPop | Accumulator::StdDevSamp => {
                FieldType::Float
            }
            Accumulator::Count => FieldType::Int,
            Accumulator::MergeObjects => FieldType::Dict,
            Accumulator::Push
            | Accumulator::AddToSet
            | Accumulator::TopN
            | Accumulator::BottomN
            | Accumulator::FirstN
            | Accumulator::LastN
            | Accumulator::MaxN
            | Accumulator::MinN => {
                FieldType::list_of(source.cloned().unwrap_or(FieldType::Dynamic))
            }
            Accumulator::Min
            | Accumulator::Max
            | Accumulator::First
            | Accumulator::Last
            | Accumulator::Top
            | Accumulator::Bottom => source.cloned().unwrap_or(FieldType::Dynamic),
            Accumulator::Median => FieldType::Float,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_distinguishes_fields_from_operators() {
        assert_eq!(Operator::lookup("gte"), Some(Operator::Gte));
        assert_eq!(Operator::lookup("city"), None);
        assert!(matches!(
            Operator::parse("ge"),
            Err(PipelineError::InvalidOperator(token)) if token == "ge"
        ));
    }

    #[test]
    fn test_regex_patterns_are_anchored_and_escaped() {
        assert_eq!(Operator::IExact.regex_pattern("X").unwrap(), "^X$");
        assert_eq!(Operator::Contains.regex_pattern("a.b").unwrap(), "a\\.b");
        assert_eq!(Operator::IStartsWith.regex_pattern("Jo").unwrap(), "^Jo");
        assert_eq!(Operator::EndsWith.regex_pattern("son").unwrap(), "son$");
        assert_eq!(Operator::Gt.regex_pattern("x"), None);
    }

    #[test]
    fn test_operator_classes() {
        assert!(Operator::Lte.is_comparison());
        assert!(!Operator::Ne.is_comparison());
        assert!(Operator::IEndsWith.is_text() && Operator::IEndsWith.is_case_insensitive());
        assert!(!Operator::Exact.is_text());
    }

    #[test]
    fn test_cond_operator_mapping() {
        assert_eq!(CondOperator::parse(">=").unwrap().mongo(), "$gte");
        assert_eq!(CondOperator::parse("!=").unwrap().mongo(), "$ne");
        assert!(matches!(
            CondOperator::parse("=>"),
            Err(PipelineError::InvalidOperator(_))
        ));
    }

    #[test]
    fn test_accumulator_names_and_types() {
        assert_eq!(Accumulator::parse("addToSet").unwrap(), Accumulator::AddToSet);
        assert_eq!(Accumulator::parse("add_to_set").unwrap(), Accumulator::AddToSet);
        assert_eq!(Accumulator::parse("$sum").unwrap().mongo(), "$sum");
        assert!(matches!(
            Accumulator::parse("total"),
            Err(PipelineError::AnnotationError(_))
        ));

        assert_eq!(Accumulator::Avg.output_type(Some(&FieldType::Int)), FieldType::Float);
        assert_eq!(
            Accumulator::Push.output_type(Some(&FieldType::String)),
            FieldType::list_of(FieldType::String)
        );
        assert_eq!(Accumulator::Max.output_type(None), FieldType::Dynamic);
        assert_eq!(Accumulator::Count.output_type(None), FieldType::Int);
    }
}
