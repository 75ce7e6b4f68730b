// stagecraft-core/src/lib.rs
// Schema-aware aggregation pipeline builder

#[macro_use]
pub mod logging;

pub mod builder;
pub mod compiler;
pub mod config;
pub mod error;
pub mod expressions;
pub mod operators;
pub mod resolver;
pub mod schema;
pub mod sink;
pub mod stage;
pub mod value_utils;

// Public exports
pub use builder::{Filter, GroupKey, Lookup, PipelineBuilder, SubQuery, Window};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use expressions::{ArithOp, Cond, ConditionalExpr, FieldExpr, Operand, Predicate, F, Q};
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use operators::{Accumulator, CondOperator, Operator};
pub use schema::{FieldDescriptor, FieldType, RelationKind, Schema, SchemaCatalog};
pub use sink::{MemorySink, Sink};
pub use stage::Stage;
