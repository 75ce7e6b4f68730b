// stagecraft-core/src/builder.rs
//! Pipeline builder
//!
//! A `PipelineBuilder` owns an ordered stage list and a private copy of the
//! schema it was created from. Every chained call validates against that
//! schema view, appends one or more stages and updates the view so that
//! later calls see fields introduced by joins, projections and
//! accumulators.

use std::collections::HashSet;
use std::fmt;
use std::ops::{Range, RangeTo};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::compiler::{self, merge_constraints, substitute_let_vars};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::expressions::{Cond, Operand, F, Q};
use crate::operators::{Accumulator, Operator};
use crate::resolver::{self, split_path, PATH_SEPARATOR};
use crate::schema::{FieldDescriptor, FieldType, Schema, ID_FIELD};
use crate::sink::Sink;
use crate::stage::Stage;

// ============================================================================
// Call arguments
// ============================================================================

/// Argument of [`PipelineBuilder::filter`]
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Predicate(Q),
    Keywords(Vec<(String, Operand)>),
}

impl From<Q> for Filter {
    fn from(q: Q) -> Self {
        Filter::Predicate(q)
    }
}

impl<K: Into<String>, V: Into<Operand>> From<Vec<(K, V)>> for Filter {
    fn from(pairs: Vec<(K, V)>) -> Self {
        Filter::Keywords(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<Operand>, const N: usize> From<[(K, V); N]> for Filter {
    fn from(pairs: [(K, V); N]) -> Self {
        Filter::Keywords(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Grouping key of [`PipelineBuilder::group`]
#[derive(Debug, Clone, PartialEq)]
pub enum GroupKey {
    /// One bucket for every document (`_id: null`)
    All,
    Field(String),
    /// Expanded to `{field: "$field", ...}`
    Fields(Vec<String>),
    /// `{output_key: "$field", ...}`
    Mapping(Vec<(String, String)>),
}

impl From<&str> for GroupKey {
    fn from(field: &str) -> Self {
        if field.is_empty() {
            GroupKey::All
        } else {
            GroupKey::Field(field.to_string())
        }
    }
}

impl From<String> for GroupKey {
    fn from(field: String) -> Self {
        GroupKey::from(field.as_str())
    }
}

impl From<Vec<&str>> for GroupKey {
    fn from(fields: Vec<&str>) -> Self {
        GroupKey::Fields(fields.into_iter().map(String::from).collect())
    }
}

impl From<Vec<(&str, &str)>> for GroupKey {
    fn from(mapping: Vec<(&str, &str)>) -> Self {
        GroupKey::Mapping(
            mapping
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl<T: Into<GroupKey>> From<Option<T>> for GroupKey {
    fn from(key: Option<T>) -> Self {
        key.map(Into::into).unwrap_or(GroupKey::All)
    }
}

/// Index or slice access: `Window::Index(n)` takes the first `n`
/// documents, `Window::Range` skips `start` and keeps `stop - start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Index(i64),
    Range {
        start: i64,
        stop: i64,
        step: Option<i64>,
    },
}

impl Window {
    pub fn range(start: i64, stop: i64) -> Self {
        Window::Range {
            start,
            stop,
            step: None,
        }
    }

    /// `(skip, skip + limit)`
    pub fn bounds(&self) -> Result<(u64, u64)> {
        match *self {
            Window::Index(n) if n < 0 => Err(PipelineError::IndexError),
            Window::Index(n) => Ok((0, n as u64)),
            Window::Range { step: Some(_), .. } => Err(PipelineError::IndexError),
            Window::Range { start, stop, .. } if start < 0 || stop < 0 || start >= stop => {
                Err(PipelineError::IndexError)
            }
            Window::Range { start, stop, .. } => Ok((start as u64, stop as u64)),
        }
    }
}

impl From<i64> for Window {
    fn from(n: i64) -> Self {
        Window::Index(n)
    }
}

impl From<i32> for Window {
    fn from(n: i32) -> Self {
        Window::Index(n as i64)
    }
}

impl From<Range<i64>> for Window {
    fn from(range: Range<i64>) -> Self {
        Window::range(range.start, range.end)
    }
}

impl From<RangeTo<i64>> for Window {
    fn from(range: RangeTo<i64>) -> Self {
        Window::range(0, range.end)
    }
}

/// One element of a correlated lookup's sub-pipeline
#[derive(Debug, Clone)]
pub enum SubQuery {
    /// Rendered as `{"$match": {"$expr": ...}}` against the joined schema
    Predicate(Q),
    /// Stages of another builder, spliced in
    Pipeline(PipelineBuilder),
}

impl From<Q> for SubQuery {
    fn from(q: Q) -> Self {
        SubQuery::Predicate(q)
    }
}

impl From<PipelineBuilder> for SubQuery {
    fn from(builder: PipelineBuilder) -> Self {
        SubQuery::Pipeline(builder)
    }
}

/// Arguments of [`PipelineBuilder::lookup`]
///
/// Either `local_field` (plus an optional `foreign_field`) for an
/// equi-join, or `let` variables plus sub-queries for a correlated join.
#[derive(Debug, Clone)]
pub struct Lookup {
    from: Arc<Schema>,
    as_name: String,
    query: Vec<SubQuery>,
    let_vars: Vec<String>,
    raw_let: Map<String, Value>,
    local_field: Option<String>,
    foreign_field: Option<String>,
}

impl Lookup {
    pub fn new(from: impl Into<Arc<Schema>>, as_name: impl Into<String>) -> Self {
        Lookup {
            from: from.into(),
            as_name: as_name.into(),
            query: Vec::new(),
            let_vars: Vec::new(),
            raw_let: Map::new(),
            local_field: None,
            foreign_field: None,
        }
    }

    pub fn query(mut self, sub_query: impl Into<SubQuery>) -> Self {
        self.query.push(sub_query.into());
        self
    }

    /// Bind a source field; sub-queries reference it by its bare name
    pub fn let_var(mut self, field: impl Into<String>) -> Self {
        self.let_vars.push(field.into());
        self
    }

    /// Binding passed through verbatim
    pub fn raw_let(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.raw_let.insert(name.into(), value.into());
        self
    }

    pub fn local_field(mut self, field: impl Into<String>) -> Self {
        self.local_field = Some(field.into());
        self
    }

    pub fn foreign_field(mut self, field: impl Into<String>) -> Self {
        self.foreign_field = Some(field.into());
        self
    }
}

// ============================================================================
// PipelineBuilder
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    base: Arc<Schema>,
    schema: Schema,
    stages: Vec<Stage>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new(schema: &Schema) -> Self {
        Self::with_config(schema, PipelineConfig::default())
    }

    pub fn with_config(schema: &Schema, config: PipelineConfig) -> Self {
        PipelineBuilder {
            base: Arc::new(schema.clone()),
            schema: schema.clone(),
            stages: Vec::new(),
            config,
        }
    }

    /// Collection the pipeline runs against
    pub fn collection(&self) -> Option<&str> {
        self.base.collection()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn pipeline(&self) -> Vec<Value> {
        self.stages.iter().map(Stage::to_value).collect()
    }

    /// Current schema view
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Hand the finished pipeline to a sink
    pub fn aggregate(&self, sink: &dyn Sink) -> Result<Vec<Value>> {
        let collection = self.collection().ok_or_else(|| {
            PipelineError::InvalidArgument(format!(
                "schema '{}' is not bound to a collection",
                self.base.name()
            ))
        })?;
        log_debug!(
            "Running {} stage(s) against '{}'",
            self.stages.len(),
            collection
        );
        sink.aggregate(collection, &self.pipeline())
    }

    fn guard(&mut self, method: &str) -> Result<()> {
        if matches!(self.stages.last(), Some(stage) if stage.is_out()) {
            return Err(PipelineError::OutStageError(method.to_string()));
        }
        if method != "annotate" && matches!(self.stages.last(), Some(Stage::Group(_))) {
            self.close_group();
        }
        Ok(())
    }

    /// Past its accumulators, a `$group` leaves only `_id` and the
    /// accumulated fields
    fn close_group(&mut self) {
        let body = match self.stages.last() {
            Some(Stage::Group(body)) => body.clone(),
            _ => return,
        };
        let id_type = match body.get(ID_FIELD) {
            Some(Value::Object(_)) => FieldType::Dict,
            _ => FieldType::Dynamic,
        };
        self.schema.retain_fields(|field| field.name != ID_FIELD && body.contains_key(&field.name));
        self.schema.insert_field(FieldDescriptor::new(ID_FIELD, id_type));
    }

    fn push(&mut self, stage: Stage) {
        log_trace!("Appending stage {}", stage);
        self.stages.push(stage);
    }

    // ========== Filtering ==========

    /// Append match stages from a predicate or a keyword list.
    ///
    /// Keywords that reach into a referenced document (`owner__name=..`)
    /// first join that collection and unwind it. Consecutive match stages
    /// are merged afterwards.
    pub fn filter(mut self, filter: impl Into<Filter>) -> Result<Self> {
        self.guard("filter")?;
        match filter.into() {
            Filter::Predicate(q) => {
                let body = q.to_match(Some(&self.schema))?;
                self.push(Stage::Match(body));
            }
            Filter::Keywords(pairs) => self.filter_keywords(pairs)?,
        }
        self.merge_matches();
        Ok(self)
    }

    fn filter_keywords(&mut self, pairs: Vec<(String, Operand)>) -> Result<()> {
        let mut joined: HashSet<String> = HashSet::new();

        for (key, operand) in &pairs {
            if key.starts_with('$') {
                let compiled = compiler::compile_entry(key, operand, Some(&self.schema))?;
                self.push_compiled(compiled);
                continue;
            }

            let head = split_path(key)
                .first()
                .map(|s| s.to_string())
                .unwrap_or_default();
            if joined.contains(&head) {
                continue;
            }

            let field = self
                .schema
                .get_field(&head)
                .cloned()
                .ok_or_else(|| PipelineError::InvalidField(head.clone()))?;

            if field.is_reference() && reaches_into_relation(key) {
                let batch: Vec<&(String, Operand)> = pairs
                    .iter()
                    .filter(|(k, _)| split_path(k).first().copied() == Some(head.as_str()))
                    .collect();
                self.join_reference(&field, &batch)?;
                joined.insert(head);
            } else {
                let compiled = compiler::compile_entry(key, operand, Some(&self.schema))?;
                self.push_compiled(compiled);
            }
        }
        Ok(())
    }

    /// `$lookup` + `$unwind` for a referenced field, then one match per
    /// keyword of the batch against the materialized document
    fn join_reference(&mut self, field: &FieldDescriptor, batch: &[&(String, Operand)]) -> Result<()> {
        let target = match field.relation() {
            Some((target, _)) => target.clone(),
            None => return Err(PipelineError::InvalidField(field.name.clone())),
        };
        let from = target
            .collection()
            .map(str::to_string)
            .unwrap_or_else(|| target.name().to_lowercase());

        log_debug!(
            "Joining '{}' through '{}' for {} condition(s)",
            from,
            field.name,
            batch.len()
        );

        let mut lookup = Map::new();
        lookup.insert("from".to_string(), Value::String(from));
        lookup.insert("localField".to_string(), Value::String(field.db_field.clone()));
        lookup.insert(
            "foreignField".to_string(),
            Value::String(self.config.foreign_field.clone()),
        );
        lookup.insert("as".to_string(), Value::String(field.name.clone()));
        self.push(Stage::Lookup(lookup));
        self.push(Stage::Unwind {
            path: field.name.clone(),
            include_array_index: None,
            preserve_null_and_empty_arrays: self.config.preserve_null_on_join,
        });

        self.schema.insert_field(FieldDescriptor::new(
            field.name.clone(),
            FieldType::Embedded(target),
        ));

        for (key, operand) in batch {
            let rewritten = key.replacen(PATH_SEPARATOR, ".", 1);
            let compiled = compiler::compile_entry(&rewritten, operand, Some(&self.schema))?;
            self.push_compiled(compiled);
        }
        Ok(())
    }

    fn push_compiled(&mut self, compiled: compiler::CompiledMatch) {
        if !compiled.constraints.is_empty() {
            self.push(Stage::Match(compiled.constraints));
        }
        for fragment in compiled.fragments {
            self.push(Stage::Match(fragment));
        }
    }

    /// Fold every run of consecutive match stages into its first stage
    fn merge_matches(&mut self) {
        let before = self.stages.len();
        let mut merged: Vec<Stage> = Vec::with_capacity(before);

        for stage in std::mem::take(&mut self.stages) {
            match stage {
                Stage::Match(next) => match merged.last_mut() {
                    Some(Stage::Match(current)) => merge_constraints(current, next),
                    _ => merged.push(Stage::Match(next)),
                },
                other => merged.push(other),
            }
        }

        if merged.len() != before {
            log_debug!("Merged match stages: {} -> {} stage(s)", before, merged.len());
        }
        self.stages = merged;
    }

    // ========== Shaping ==========

    /// `1` keeps a field, `0` drops it, anything else is computed.
    pub fn project<I, K, V>(mut self, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Operand>,
    {
        self.guard("project")?;

        let mut body = Map::new();
        let mut included: Vec<Vec<String>> = Vec::new();
        let mut excluded: Vec<String> = Vec::new();
        let mut computed: Vec<FieldDescriptor> = Vec::new();
        let mut id_excluded = false;

        for (key, operand) in fields {
            let mut key: String = key.into();
            if key == "id" {
                key = ID_FIELD.to_string();
            }
            let operand: Operand = operand.into();

            match projection_flag(&operand) {
                Some(flag) => {
                    let path = resolver::resolve_path(&self.schema, &key)?;
                    body.insert(path, json!(flag));
                    if flag == 1 {
                        included.push(split_path(&key).into_iter().map(str::to_string).collect());
                    } else if key == ID_FIELD {
                        id_excluded = true;
                    } else {
                        excluded.push(key);
                    }
                }
                None => {
                    body.insert(key.clone(), operand.bind(&self.schema).to_value()?);
                    computed.push(FieldDescriptor::new(key, operand_type(&operand, &self.schema)));
                }
            }
        }

        let inclusion = !included.is_empty() || !computed.is_empty();
        if inclusion && !excluded.is_empty() {
            return Err(PipelineError::InvalidProjection(format!(
                "cannot mix inclusion and exclusion (excluded: {})",
                excluded.join(", ")
            )));
        }

        if inclusion {
            if !id_excluded {
                included.push(vec![ID_FIELD.to_string()]);
            }
            self.schema.retain_paths(&included);
            for field in computed {
                self.schema.insert_field(field);
            }
        } else {
            for key in &excluded {
                self.schema.remove_path(&split_path(key));
            }
            if id_excluded {
                self.schema.remove_field(ID_FIELD);
            }
        }

        self.push(Stage::Project(body));
        Ok(self)
    }

    /// Start a `$group` stage; follow with [`annotate`](Self::annotate)
    pub fn group(mut self, key: impl Into<GroupKey>) -> Result<Self> {
        self.guard("group")?;
        let id = match key.into() {
            GroupKey::All => Value::Null,
            GroupKey::Field(field) => self.group_ref(&field),
            GroupKey::Fields(fields) => Value::Object(
                fields
                    .iter()
                    .map(|field| (field.replace(PATH_SEPARATOR, "."), self.group_ref(field)))
                    .collect(),
            ),
            GroupKey::Mapping(mapping) => Value::Object(
                mapping
                    .iter()
                    .map(|(out, field)| (out.clone(), self.group_ref(field)))
                    .collect(),
            ),
        };

        let mut body = Map::new();
        body.insert(ID_FIELD.to_string(), id);
        self.push(Stage::Group(body));
        Ok(self)
    }

    /// Resolved `"$path"`, or the name itself when it is not a field
    fn group_ref(&self, field: &str) -> Value {
        match resolver::resolve_path(&self.schema, field) {
            Ok(path) => Value::String(format!("${}", path)),
            Err(_) => Value::String(field.to_string()),
        }
    }

    /// Add `name: {accumulator: value}` to the preceding `$group` stage.
    ///
    /// A string `value` naming a field becomes a field reference; any other
    /// string is used as a literal.
    pub fn annotate(mut self, name: &str, accumulator: &str, value: impl Into<Operand>) -> Result<Self> {
        self.guard("annotate")?;
        self.check_group("annotate")?;
        let accumulator = Accumulator::parse(accumulator)?;

        let operand: Operand = value.into();
        let (value, source) = match &operand {
            Operand::Literal(Value::String(s)) => match resolver::lookup(&self.schema, &split_path(s)) {
                Ok((path, field)) => (
                    Value::String(format!("${}", path)),
                    Some(field.field_type.clone()),
                ),
                Err(_) => (Value::String(s.clone()), None),
            },
            Operand::Expr(expr) => (
                expr.bind(&self.schema).to_value(),
                Some(expr.output_type(&self.schema)),
            ),
            other => (other.to_value()?, None),
        };

        let rendered = match accumulator {
            Accumulator::Count => json!({ accumulator.mongo(): {} }),
            _ => json!({ accumulator.mongo(): value }),
        };
        let field_type = accumulator.output_type(source.as_ref());
        self.add_accumulator(name, rendered, field_type)?;
        Ok(self)
    }

    /// Keyword form: each value is a pre-built accumulator such as
    /// `F::field("price").sum()` or a raw `{"$sum": ...}` document.
    pub fn annotate_with<I, K, V>(mut self, accumulators: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Operand>,
    {
        self.guard("annotate")?;
        self.check_group("annotate")?;

        for (name, operand) in accumulators {
            let name: String = name.into();
            let (rendered, field_type) = match operand.into() {
                Operand::Expr(expr @ F::Accumulate { .. }) => {
                    let field_type = expr.output_type(&self.schema);
                    (expr.bind(&self.schema).to_value(), field_type)
                }
                Operand::Literal(Value::Object(doc)) if doc.len() == 1 => {
                    let accumulator = match doc.keys().next() {
                        Some(key) => Accumulator::parse(key)?,
                        None => continue,
                    };
                    (Value::Object(doc), accumulator.output_type(None))
                }
                other => {
                    return Err(PipelineError::AnnotationError(format!(
                        "'{}' must be an accumulator expression, got {:?}",
                        name, other
                    )))
                }
            };
            self.add_accumulator(&name, rendered, field_type)?;
        }
        Ok(self)
    }

    fn check_group(&self, method: &str) -> Result<()> {
        match self.stages.last() {
            None => Err(PipelineError::AnnotationError(format!(
                "'{}' needs a preceding $group stage, but the pipeline is empty",
                method
            ))),
            Some(stage) if !stage.is_group() => Err(PipelineError::AnnotationError(format!(
                "'{}' needs a preceding $group stage, not {}",
                method,
                stage.name()
            ))),
            Some(_) => Ok(()),
        }
    }

    fn add_accumulator(&mut self, name: &str, rendered: Value, field_type: FieldType) -> Result<()> {
        match self.stages.last_mut() {
            Some(Stage::Group(body)) => {
                if body.contains_key(name) {
                    return Err(PipelineError::AlreadyExistsField(name.to_string()));
                }
                body.insert(name.to_string(), rendered);
            }
            _ => {
                return Err(PipelineError::AnnotationError(
                    "accumulators can only be added to a $group stage".to_string(),
                ))
            }
        }
        self.schema
            .insert_field(FieldDescriptor::new(name, field_type));
        Ok(())
    }

    /// One `$sort` stage; a leading `-` sorts descending
    pub fn order_by<I, S>(mut self, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.guard("order_by")?;
        let mut keys = Vec::new();
        for field in fields {
            let field = field.as_ref();
            let (name, direction) = match field.strip_prefix('-') {
                Some(name) => (name, -1),
                None => (field, 1),
            };
            keys.push((resolver::resolve_path(&self.schema, name)?, direction));
        }
        self.push(Stage::Sort(keys));
        Ok(self)
    }

    /// Scalars are wrapped in `$literal`; `__` in names becomes `.`
    pub fn add_fields<I, K, V>(mut self, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Operand>,
    {
        self.guard("add_fields")?;
        let mut body = Map::new();

        for (key, operand) in fields {
            let key = key.into().replace(PATH_SEPARATOR, ".");
            let operand: Operand = operand.into();
            let value = match &operand {
                Operand::Literal(v @ (Value::Array(_) | Value::Object(_))) => v.clone(),
                Operand::Literal(v) => json!({ "$literal": v }),
                Operand::Expr(expr) => expr.bind(&self.schema).to_value(),
                Operand::Cond(cond) => cond.to_value(),
                Operand::Predicate(q) => q.to_expr_with(Some(&self.schema))?,
            };
            if !key.contains('.') {
                let field_type = operand_type(&operand, &self.schema);
                self.schema.insert_field(FieldDescriptor::new(key.clone(), field_type));
            }
            body.insert(key, value);
        }

        self.push(Stage::AddFields(body));
        Ok(self)
    }

    /// Join another collection, by key pair or by correlated sub-pipeline
    pub fn lookup(mut self, lookup: Lookup) -> Result<Self> {
        self.guard("lookup")?;
        if self.schema.contains(&lookup.as_name) {
            return Err(PipelineError::AlreadyExistsField(lookup.as_name));
        }

        let has_let = !lookup.let_vars.is_empty() || !lookup.raw_let.is_empty();
        let from = lookup.from.collection().ok_or_else(|| {
            PipelineError::InvalidArgument(format!(
                "'{}' is not bound to a collection",
                lookup.from.name()
            ))
        })?;

        let mut body = Map::new();
        body.insert("from".to_string(), Value::String(from.to_string()));

        match (&lookup.local_field, has_let) {
            (Some(local), false) => {
                let foreign = lookup
                    .foreign_field
                    .as_deref()
                    .unwrap_or(&self.config.foreign_field);
                let local_path = resolver::resolve_path(&self.schema, local)?;
                let foreign_path = resolver::resolve_path(&lookup.from, foreign)?;
                body.insert("localField".to_string(), Value::String(local_path));
                body.insert("foreignField".to_string(), Value::String(foreign_path));
            }
            (None, true) => {
                let mut lets = Map::new();
                for var in &lookup.let_vars {
                    lets.insert(var.clone(), Value::String(resolver::field_ref(&self.schema, var)?));
                }
                for (name, value) in &lookup.raw_let {
                    lets.insert(name.clone(), value.clone());
                }
                let vars: Vec<String> = lets.keys().cloned().collect();

                let mut pipeline = Vec::new();
                for sub_query in &lookup.query {
                    match sub_query {
                        SubQuery::Predicate(q) => {
                            let expr = q.to_expr_with(Some(&lookup.from))?;
                            pipeline.push(json!({
                                "$match": { "$expr": substitute_let_vars(&expr, &vars) }
                            }));
                        }
                        SubQuery::Pipeline(builder) => {
                            pipeline.extend(
                                builder
                                    .pipeline()
                                    .iter()
                                    .map(|stage| substitute_let_vars(stage, &vars)),
                            );
                        }
                    }
                }
                body.insert("let".to_string(), Value::Object(lets));
                body.insert("pipeline".to_string(), Value::Array(pipeline));
            }
            (Some(_), true) => {
                return Err(PipelineError::InvalidArgument(
                    "lookup takes either local_field/foreign_field or let, not both".to_string(),
                ))
            }
            (None, false) => {
                return Err(PipelineError::InvalidArgument(
                    "lookup needs local_field (and foreign_field) or let".to_string(),
                ))
            }
        }

        body.insert("as".to_string(), Value::String(lookup.as_name.clone()));
        self.push(Stage::Lookup(body));
        self.schema.insert_field(FieldDescriptor::new(
            lookup.as_name,
            FieldType::list_of(FieldType::Embedded(lookup.from)),
        ));
        Ok(self)
    }

    /// `$unwind`; the short string form is used when no option is set
    pub fn unwind(
        mut self,
        path: &str,
        include_array_index: Option<&str>,
        preserve_null_and_empty_arrays: bool,
    ) -> Result<Self> {
        self.guard("unwind")?;
        let segments = split_path(path);
        let (storage, field) = resolver::lookup(&self.schema, &segments)?;
        let element = FieldDescriptor {
            field_type: field.field_type.element_type(),
            ..field.clone()
        };

        if let Some(index) = include_array_index {
            if self.schema.contains(index) {
                return Err(PipelineError::AlreadyExistsField(index.to_string()));
            }
        }

        self.push(Stage::Unwind {
            path: storage,
            include_array_index: include_array_index.map(str::to_string),
            preserve_null_and_empty_arrays,
        });

        if segments.len() == 1 {
            self.schema.insert_field(element);
        }
        if let Some(index) = include_array_index {
            self.schema.insert_field(FieldDescriptor::new(index, FieldType::Int));
        }
        Ok(self)
    }

    /// `$replaceRoot` with an embedded document, optionally merged with
    /// extra fields
    pub fn replace_root(mut self, embedded_field: &str, merge: Option<Map<String, Value>>) -> Result<Self> {
        self.guard("replace_root")?;
        let new_root = self.replacement(embedded_field, merge)?;
        self.push(Stage::ReplaceRoot(new_root));
        Ok(self)
    }

    /// `$replaceWith`, same arguments as [`replace_root`](Self::replace_root)
    pub fn replace_with(mut self, embedded_field: &str, merge: Option<Map<String, Value>>) -> Result<Self> {
        self.guard("replace_with")?;
        let new_root = self.replacement(embedded_field, merge)?;
        self.push(Stage::ReplaceWith(new_root));
        Ok(self)
    }

    fn replacement(&mut self, embedded_field: &str, merge: Option<Map<String, Value>>) -> Result<Value> {
        let (path, field) = resolver::lookup(&self.schema, &split_path(embedded_field))?;
        let target = match &field.field_type {
            FieldType::Embedded(target) => target.clone(),
            _ => return Err(PipelineError::InvalidEmbeddedField(embedded_field.to_string())),
        };

        let field_ref = Value::String(format!("${}", path));
        let new_root = match &merge {
            Some(extra) => json!({ "$mergeObjects": [Value::Object(extra.clone()), field_ref] }),
            None => field_ref,
        };

        self.schema.clear_fields();
        for field in target.fields() {
            self.schema.insert_field(field.clone());
        }
        if let Some(extra) = merge {
            for (name, value) in extra {
                if !self.schema.contains(&name) {
                    let field_type = F::Value(value).output_type(&target);
                    self.schema.insert_field(FieldDescriptor::new(name, field_type));
                }
            }
        }
        Ok(new_root)
    }

    /// `$redact` over `{"$cond": {"if": {op: [value1, value2]}, ...}}`.
    /// Actions are `DESCEND`, `PRUNE` or `KEEP`, with or without `$$`.
    pub fn redact(
        mut self,
        value1: impl Into<Value>,
        condition: &str,
        value2: impl Into<Value>,
        then_value: &str,
        else_value: &str,
    ) -> Result<Self> {
        self.guard("redact")?;
        let then_value = redact_action(then_value)?;
        let else_value = redact_action(else_value)?;
        let cond = Cond::new(value1, condition, value2, then_value, else_value)?;
        self.push(Stage::Redact(cond.to_value()));
        Ok(self)
    }

    /// Append a stage document verbatim
    pub fn raw(mut self, stage: Value) -> Result<Self> {
        self.guard("raw")?;
        self.push(Stage::raw(stage));
        Ok(self)
    }

    /// Terminal `$out`; nothing can be chained afterwards
    pub fn out(mut self, collection: &str, db: Option<&str>) -> Result<Self> {
        self.guard("out")?;
        self.push(Stage::Out {
            collection: collection.to_string(),
            db: db.map(str::to_string),
        });
        Ok(self)
    }

    /// `$count`; the schema view becomes the single counter field
    pub fn count(mut self, name: &str) -> Result<Self> {
        self.guard("count")?;
        if name.is_empty() || name.starts_with('$') || name.contains('.') {
            return Err(PipelineError::InvalidArgument(format!(
                "invalid $count field name '{}'",
                name
            )));
        }
        self.push(Stage::Count(name.to_string()));
        self.schema.clear_fields();
        self.schema.insert_field(FieldDescriptor::new(name, FieldType::Int));
        Ok(self)
    }

    pub fn skip(mut self, n: u64) -> Result<Self> {
        self.guard("skip")?;
        self.push(Stage::Skip(n));
        Ok(self)
    }

    pub fn limit(mut self, n: u64) -> Result<Self> {
        self.guard("limit")?;
        self.push(Stage::Limit(n));
        Ok(self)
    }

    /// Index/slice access: `slice(5)` keeps the first five documents,
    /// `slice(3..10)` skips three and keeps seven.
    pub fn slice(mut self, window: impl Into<Window>) -> Result<Self> {
        self.guard("slice")?;
        let (start, stop) = window.into().bounds()?;
        if start > 0 {
            self.push(Stage::Skip(start));
        }
        if stop > start {
            self.push(Stage::Limit(stop - start));
        }
        Ok(self)
    }
}

impl fmt::Display for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string_pretty(&Value::Array(self.pipeline()))
            .map_err(|_| fmt::Error)?;
        write!(f, "{}", rendered)
    }
}

/// More than a bare name or `name__operator` after the head segment
fn reaches_into_relation(key: &str) -> bool {
    let segments = split_path(key);
    match &segments[1..] {
        [] => false,
        [token] => Operator::lookup(token).is_none(),
        _ => true,
    }
}

fn projection_flag(operand: &Operand) -> Option<i64> {
    match operand.as_literal()? {
        Value::Number(n) => match n.as_i64() {
            Some(flag @ (0 | 1)) => Some(flag),
            _ => None,
        },
        Value::Bool(true) => Some(1),
        Value::Bool(false) => Some(0),
        _ => None,
    }
}

fn operand_type(operand: &Operand, schema: &Schema) -> FieldType {
    match operand {
        Operand::Literal(value) => F::Value(value.clone()).output_type(schema),
        Operand::Expr(expr) => expr.output_type(schema),
        Operand::Predicate(_) => FieldType::Boolean,
        Operand::Cond(_) => FieldType::Dynamic,
    }
}

fn redact_action(token: &str) -> Result<String> {
    let action = token.trim_start_matches('$').to_uppercase();
    match action.as_str() {
        "DESCEND" | "PRUNE" | "KEEP" => Ok(format!("$${}", action)),
        _ => Err(PipelineError::InvalidArgument(format!(
            "redact action must be DESCEND, PRUNE or KEEP, got '{}'",
            token
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kw;

    fn person() -> Schema {
        Schema::document("Person", "person")
            .field("name", FieldType::String)
            .field("age", FieldType::Int)
            .field("tags", FieldType::list_of(FieldType::String))
    }

    #[test]
    fn test_window_bounds() {
        assert_eq!(Window::from(0).bounds().unwrap(), (0, 0));
        assert_eq!(Window::from(5).bounds().unwrap(), (0, 5));
        assert_eq!(Window::from(3..10).bounds().unwrap(), (3, 10));
        assert_eq!(Window::from(..4).bounds().unwrap(), (0, 4));
        assert!(matches!(Window::from(-1).bounds(), Err(PipelineError::IndexError)));
        assert!(matches!(Window::from(5..5).bounds(), Err(PipelineError::IndexError)));
        assert!(matches!(
            Window::Range { start: 0, stop: 4, step: Some(2) }.bounds(),
            Err(PipelineError::IndexError)
        ));
    }

    #[test]
    fn test_reaches_into_relation() {
        assert!(!reaches_into_relation("owner"));
        assert!(!reaches_into_relation("owner__in"));
        assert!(reaches_into_relation("owner__deleted_at"));
        assert!(reaches_into_relation("owner__deleted_at__gte"));
    }

    #[test]
    fn test_redact_action_normalization() {
        assert_eq!(redact_action("prune").unwrap(), "$$PRUNE");
        assert_eq!(redact_action("$$keep").unwrap(), "$$KEEP");
        assert_eq!(redact_action("$Descend").unwrap(), "$$DESCEND");
        assert!(matches!(redact_action("drop"), Err(PipelineError::InvalidArgument(_))));
    }

    #[test]
    fn test_out_guard_names_method() {
        let builder = PipelineBuilder::new(&person()).out("archive", None).unwrap();
        match builder.clone().filter(crate::kw! { "age" => 3 }) {
            Err(PipelineError::OutStageError(method)) => assert_eq!(method, "filter"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            builder.clone().slice(2),
            Err(PipelineError::OutStageError(m)) if m == "slice"
        ));
        assert!(matches!(
            builder.out("again", None),
            Err(PipelineError::OutStageError(m)) if m == "out"
        ));
    }

    #[test]
    fn test_unwind_updates_schema_view() {
        let builder = PipelineBuilder::new(&person())
            .unwind("tags", Some("position"), false)
            .unwrap();
        assert_eq!(
            builder.schema().get_field("tags").unwrap().field_type,
            FieldType::String
        );
        assert_eq!(
            builder.schema().get_field("position").unwrap().field_type,
            FieldType::Int
        );
        assert_eq!(
            builder.pipeline(),
            vec![json!({"$unwind": {"path": "$tags", "includeArrayIndex": "position", "preserveNullAndEmptyArrays": false}})]
        );
    }

    #[test]
    fn test_count_resets_schema() {
        let builder = PipelineBuilder::new(&person()).count("total").unwrap();
        assert_eq!(builder.schema().field_names(), vec!["total"]);
        assert_eq!(builder.pipeline(), vec![json!({"$count": "total"})]);
    }

    #[test]
    fn test_display_is_json_array() {
        let builder = PipelineBuilder::new(&person()).skip(2).unwrap();
        let parsed: Value = serde_json::from_str(&builder.to_string()).unwrap();
        assert_eq!(parsed, json!([{"$skip": 2}]));
    }
}
