//! Schema collaborator
//!
//! The compiler only needs a read interface over declared models: does a
//! field exist, what is it called in storage, what type is it, and does it
//! point at another schema. Builders clone a [`Schema`] into a private
//! view and mutate that copy as stages add or drop fields.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};

pub const ID_FIELD: &str = "_id";

/// How a relational field is stored
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationKind {
    /// Inline sub-document, reachable with a dotted path
    Embedded,
    /// Document in another collection, reachable only through a join
    Reference,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldType {
    String,
    Int,
    Long,
    Float,
    Boolean,
    DateTime,
    ObjectId,
    Dict,
    /// Type unknown at compile time (computed fields, `$max` results, ...)
    Dynamic,
    List(Box<FieldType>),
    Embedded(Arc<Schema>),
    Reference(Arc<Schema>),
}

impl FieldType {
    pub fn list_of(inner: FieldType) -> Self {
        FieldType::List(Box::new(inner))
    }

    /// Relation target, looking through one list layer
    pub fn relation(&self) -> Option<(&Arc<Schema>, RelationKind)> {
        match self {
            FieldType::Embedded(schema) => Some((schema, RelationKind::Embedded)),
            FieldType::Reference(schema) => Some((schema, RelationKind::Reference)),
            FieldType::List(inner) => match inner.as_ref() {
                FieldType::Embedded(schema) => Some((schema, RelationKind::Embedded)),
                FieldType::Reference(schema) => Some((schema, RelationKind::Reference)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, FieldType::List(_))
    }

    /// Type of one element after `$unwind`; scalars unwind to themselves
    pub fn element_type(&self) -> FieldType {
        match self {
            FieldType::List(inner) => inner.as_ref().clone(),
            other => other.clone(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Long => "long",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::DateTime => "datetime",
            FieldType::ObjectId => "objectid",
            FieldType::Dict => "dict",
            FieldType::Dynamic => "dynamic",
            FieldType::List(_) => "list",
            FieldType::Embedded(_) => "embedded",
            FieldType::Reference(_) => "reference",
        }
    }

    /// Scalar type names only; relations and lists need a target
    pub fn scalar_from_str(value: &str) -> Option<Self> {
        match value {
            "string" | "str" => Some(FieldType::String),
            "int" | "integer" => Some(FieldType::Int),
            "long" => Some(FieldType::Long),
            "float" | "double" | "number" | "decimal" => Some(FieldType::Float),
            "bool" | "boolean" => Some(FieldType::Boolean),
            "datetime" | "date" => Some(FieldType::DateTime),
            "objectid" | "object_id" => Some(FieldType::ObjectId),
            "dict" | "object" => Some(FieldType::Dict),
            "dynamic" | "any" => Some(FieldType::Dynamic),
            _ => None,
        }
    }
}

/// One declared field: logical name, storage name and type
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub db_field: String,
    pub field_type: FieldType,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        FieldDescriptor {
            db_field: name.clone(),
            name,
            field_type,
        }
    }

    pub fn with_db_field(mut self, db_field: impl Into<String>) -> Self {
        self.db_field = db_field.into();
        self
    }

    pub fn relation(&self) -> Option<(&Arc<Schema>, RelationKind)> {
        self.field_type.relation()
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.relation(), Some((_, RelationKind::Embedded)))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.relation(), Some((_, RelationKind::Reference)))
    }

    pub fn is_list(&self) -> bool {
        self.field_type.is_list()
    }

    /// Same descriptor with its embedded document swapped for `target`
    fn with_embedded(&self, target: Schema) -> FieldDescriptor {
        let target = Arc::new(target);
        let field_type = match &self.field_type {
            FieldType::List(_) => FieldType::list_of(FieldType::Embedded(target)),
            _ => FieldType::Embedded(target),
        };
        FieldDescriptor {
            field_type,
            ..self.clone()
        }
    }
}

/// A declared model (document or embedded document)
#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    name: String,
    collection: Option<String>,
    fields: BTreeMap<String, FieldDescriptor>,
}

impl Schema {
    /// Top-level document stored in `collection`; carries `_id`
    pub fn document(name: impl Into<String>, collection: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            ID_FIELD.to_string(),
            FieldDescriptor::new(ID_FIELD, FieldType::ObjectId),
        );
        Schema {
            name: name.into(),
            collection: Some(collection.into()),
            fields,
        }
    }

    /// Inline sub-document type
    pub fn embedded(name: impl Into<String>) -> Self {
        Schema {
            name: name.into(),
            collection: None,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field declaration
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.insert_field(FieldDescriptor::new(name, field_type));
        self
    }

    pub fn field_with_db(
        mut self,
        name: impl Into<String>,
        db_field: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        self.insert_field(FieldDescriptor::new(name, field_type).with_db_field(db_field));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn is_embedded(&self) -> bool {
        self.collection.is_none()
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn db_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|f| f.db_field.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.values()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Insert or replace
    pub fn insert_field(&mut self, field: FieldDescriptor) {
        self.fields.insert(field.name.clone(), field);
    }

    pub fn remove_field(&mut self, name: &str) -> Option<FieldDescriptor> {
        self.fields.remove(name)
    }

    pub fn retain_fields<P>(&mut self, mut keep: P)
    where
        P: FnMut(&FieldDescriptor) -> bool,
    {
        self.fields.retain(|_, field| keep(field));
    }

    pub fn clear_fields(&mut self) {
        self.fields.clear();
    }

    /// Drop one field, possibly nested in embedded documents. The
    /// embedded parents stay, minus the dropped leaf.
    pub fn remove_path<S: AsRef<str>>(&mut self, segments: &[S]) {
        let (head, rest) = match segments.split_first() {
            Some(parts) => parts,
            None => return,
        };
        if rest.is_empty() {
            self.fields.remove(head.as_ref());
            return;
        }
        let narrowed = match self.fields.get(head.as_ref()) {
            Some(field) => match field.relation() {
                Some((target, RelationKind::Embedded)) => {
                    let mut inner = target.as_ref().clone();
                    inner.remove_path(rest);
                    field.with_embedded(inner)
                }
                _ => return,
            },
            None => return,
        };
        self.insert_field(narrowed);
    }

    /// Keep only the fields named by `paths`; a longer path keeps its
    /// embedded parent narrowed to the named children
    pub fn retain_paths(&mut self, paths: &[Vec<String>]) {
        let mut kept = BTreeMap::new();
        for (name, field) in &self.fields {
            let tails: Vec<Vec<String>> = paths
                .iter()
                .filter(|path| path.first() == Some(name))
                .map(|path| path[1..].to_vec())
                .collect();
            if tails.is_empty() {
                continue;
            }
            let field = match field.relation() {
                Some((target, RelationKind::Embedded)) if tails.iter().all(|tail| !tail.is_empty()) => {
                    let mut inner = target.as_ref().clone();
                    inner.retain_paths(&tails);
                    field.with_embedded(inner)
                }
                _ => field.clone(),
            };
            kept.insert(name.clone(), field);
        }
        self.fields = kept;
    }
}

/// Named schemas loaded from one JSON document
///
/// ```json
/// {"schemas": {
///     "account": {"collection": "account", "fields": {"username": "string"}},
///     "post": {"collection": "post", "fields": {
///         "owner": {"type": "reference", "to": "account", "db_field": "owner_id"},
///         "hashtags": {"type": "list", "of": "string"}
///     }}
/// }}
/// ```
#[derive(Clone, Debug, Default)]
pub struct SchemaCatalog {
    schemas: BTreeMap<String, Arc<Schema>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, schema: Schema) -> Arc<Schema> {
        let schema = Arc::new(schema);
        self.schemas.insert(schema.name().to_string(), schema.clone());
        schema
    }

    pub fn get(&self, name: &str) -> Option<Arc<Schema>> {
        self.schemas.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_json(&value)
    }

    pub fn from_json(doc: &Value) -> Result<Self> {
        let specs = doc
            .get("schemas")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                PipelineError::SchemaError("catalog must contain a 'schemas' object".to_string())
            })?;

        let mut catalog = SchemaCatalog::new();
        let mut visiting = Vec::new();
        for name in specs.keys() {
            catalog.build(name, specs, &mut visiting)?;
        }
        Ok(catalog)
    }

    // Depth-first so relation targets exist before the schemas pointing at them
    fn build(
        &mut self,
        name: &str,
        specs: &Map<String, Value>,
        visiting: &mut Vec<String>,
    ) -> Result<Arc<Schema>> {
        if let Some(schema) = self.schemas.get(name) {
            return Ok(schema.clone());
        }
        if visiting.iter().any(|v| v == name) {
            return Err(PipelineError::SchemaError(format!(
                "relation cycle detected: {} -> {}",
                visiting.join(" -> "),
                name
            )));
        }

        let spec = specs
            .get(name)
            .and_then(Value::as_object)
            .ok_or_else(|| PipelineError::SchemaError(format!("unknown schema '{}'", name)))?;

        visiting.push(name.to_string());

        let embedded = spec.get("embedded").and_then(Value::as_bool).unwrap_or(false);
        let mut schema = if embedded {
            Schema::embedded(name)
        } else {
            let collection = match spec.get("collection") {
                Some(Value::String(c)) => c.clone(),
                Some(_) => {
                    return Err(PipelineError::SchemaError(format!(
                        "schema '{}': collection must be a string",
                        name
                    )))
                }
                None => name.to_lowercase(),
            };
            Schema::document(name, collection)
        };

        if let Some(fields) = spec.get("fields") {
            let fields = fields.as_object().ok_or_else(|| {
                PipelineError::SchemaError(format!("schema '{}': fields must be an object", name))
            })?;
            for (field_name, field_spec) in fields {
                let field_type = self.parse_type(name, field_name, field_spec, specs, visiting)?;
                let mut descriptor = FieldDescriptor::new(field_name.as_str(), field_type);
                if let Some(db_field) = field_spec.get("db_field") {
                    let db_field = db_field.as_str().ok_or_else(|| {
                        PipelineError::SchemaError(format!(
                            "schema '{}': db_field of '{}' must be a string",
                            name, field_name
                        ))
                    })?;
                    descriptor = descriptor.with_db_field(db_field);
                }
                schema.insert_field(descriptor);
            }
        }

        visiting.pop();
        Ok(self.insert(schema))
    }

    fn parse_type(
        &mut self,
        schema: &str,
        field: &str,
        spec: &Value,
        specs: &Map<String, Value>,
        visiting: &mut Vec<String>,
    ) -> Result<FieldType> {
        let type_name = match spec {
            Value::String(s) => s.as_str(),
            Value::Object(obj) => obj.get("type").and_then(Value::as_str).ok_or_else(|| {
                PipelineError::SchemaError(format!(
                    "schema '{}': field '{}' needs a string 'type'",
                    schema, field
                ))
            })?,
            _ => {
                return Err(PipelineError::SchemaError(format!(
                    "schema '{}': field '{}' must be a type name or an object",
                    schema, field
                )))
            }
        };

        if let Some(scalar) = FieldType::scalar_from_str(type_name) {
            return Ok(scalar);
        }

        match type_name {
            "list" | "array" => match spec.get("of") {
                Some(inner) => Ok(FieldType::list_of(
                    self.parse_type(schema, field, inner, specs, visiting)?,
                )),
                None => Ok(FieldType::list_of(FieldType::Dynamic)),
            },
            "embedded" | "reference" => {
                let target = spec.get("to").and_then(Value::as_str).ok_or_else(|| {
                    PipelineError::SchemaError(format!(
                        "schema '{}': {} field '{}' needs a 'to' target",
                        schema, type_name, field
                    ))
                })?;
                let target = self.build(target, specs, visiting)?;
                if type_name == "embedded" {
                    Ok(FieldType::Embedded(target))
                } else {
                    Ok(FieldType::Reference(target))
                }
            }
            other => Err(PipelineError::SchemaError(format!(
                "schema '{}': unsupported type '{}' for field '{}'",
                schema, other, field
            ))),
        }
    }
}
