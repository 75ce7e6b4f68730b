// stagecraft-core/src/resolver.rs
//! Field path resolution
//!
//! Turns a logical path (`owner__address__city` or `owner.address.city`)
//! into the dotted storage path (`owner_id.addr.city`), checking every
//! segment against the schema and descending through relations.

use crate::error::{PipelineError, Result};
use crate::schema::{FieldDescriptor, Schema};

/// Separator between path segments (and operator suffixes) in keyword keys
pub const PATH_SEPARATOR: &str = "__";

/// Split a logical path on both `__` and `.`
pub fn split_path(path: &str) -> Vec<&str> {
    path.split(PATH_SEPARATOR)
        .flat_map(|part| part.split('.'))
        .collect()
}

/// Resolve already-split segments to a dotted storage path.
///
/// Fails with `InvalidField` naming the first segment that does not exist.
pub fn resolve(schema: &Schema, segments: &[&str]) -> Result<String> {
    lookup(schema, segments).map(|(path, _)| path)
}

pub fn resolve_path(schema: &Schema, path: &str) -> Result<String> {
    resolve(schema, &split_path(path))
}

/// `"$" + storage path`, the form used inside expressions
pub fn field_ref(schema: &Schema, path: &str) -> Result<String> {
    Ok(format!("${}", resolve_path(schema, path)?))
}

/// Resolve and also return the descriptor of the last segment
pub fn lookup<'a>(schema: &'a Schema, segments: &[&str]) -> Result<(String, &'a FieldDescriptor)> {
    let (first, rest) = segments
        .split_first()
        .ok_or_else(|| PipelineError::InvalidField(String::new()))?;

    let mut field = schema
        .get_field(first)
        .ok_or_else(|| PipelineError::InvalidField(first.to_string()))?;
    let mut storage = vec![field.db_field.as_str()];

    for segment in rest {
        let target = match field.relation() {
            Some((target, _)) => target,
            None => return Err(PipelineError::InvalidField(segment.to_string())),
        };
        field = target
            .get_field(segment)
            .ok_or_else(|| PipelineError::InvalidField(segment.to_string()))?;
        storage.push(field.db_field.as_str());
    }

    Ok((storage.join("."), field))
}
