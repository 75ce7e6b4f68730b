// stagecraft-core/src/sink/mod.rs
//! Execution targets for compiled pipelines
//!
//! A [`Sink`] takes a collection name and a pipeline and returns the
//! resulting documents. [`MemorySink`] evaluates pipelines against
//! documents held in memory; a driver-backed sink only needs to forward
//! the pipeline.

pub mod expr;
pub mod operators;
mod executor;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{PipelineError, Result};
pub use executor::{Execution, Executor};

/// Anything that can run an aggregation pipeline
pub trait Sink {
    fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Value>>;
}

impl<F> Sink for F
where
    F: Fn(&str, &[Value]) -> Result<Vec<Value>>,
{
    fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Value>> {
        self(collection, pipeline)
    }
}

/// In-memory collections that pipelines can be run against
///
/// A trailing `$out` replaces the target collection with the results.
#[derive(Debug, Default)]
pub struct MemorySink {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load collections from a `{"name": [documents...]}` document
    pub fn from_json(data: &Value) -> Result<Self> {
        let map = data.as_object().ok_or_else(|| {
            PipelineError::InvalidArgument("dataset must be a document of collections".to_string())
        })?;
        let sink = MemorySink::new();
        for (name, docs) in map {
            let docs = docs.as_array().ok_or_else(|| {
                PipelineError::InvalidArgument(format!("collection '{}' must be an array", name))
            })?;
            sink.insert_many(name, docs.iter().cloned())?;
        }
        Ok(sink)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let data: Value = serde_json::from_str(&raw)?;
        Self::from_json(&data)
    }

    pub fn insert(&self, collection: &str, doc: Value) -> Result<()> {
        self.insert_many(collection, std::iter::once(doc))
    }

    /// Documents must be JSON objects
    pub fn insert_many<I>(&self, collection: &str, docs: I) -> Result<()>
    where
        I: IntoIterator<Item = Value>,
    {
        let docs = docs
            .into_iter()
            .map(|doc| match doc {
                Value::Object(_) => Ok(doc),
                other => Err(PipelineError::InvalidArgument(format!(
                    "documents must be JSON objects, got {}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
        Ok(())
    }

    /// Snapshot of a collection (empty when it does not exist)
    pub fn documents(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Sink for MemorySink {
    fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Value>> {
        let execution = {
            let collections = self.collections.read();
            let docs = collections.get(collection).cloned().unwrap_or_default();
            Executor::new(&collections).run(pipeline, docs)
        };

        let execution = match execution {
            Ok(execution) => execution,
            Err(e) => {
                log_error!("pipeline on '{}' failed: {}", collection, e);
                return Err(e);
            }
        };

        if let Some(target) = execution.out {
            log_debug!("$out wrote {} document(s) to '{}'", execution.documents.len(), target);
            self.collections
                .write()
                .insert(target, execution.documents.clone());
        }
        Ok(execution.documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> MemorySink {
        MemorySink::from_json(&json!({
            "account": [
                {"_id": 1, "username": "seyed"},
                {"_id": 2, "username": "mehdi"}
            ],
            "post": [
                {"_id": 10, "owner_id": 1, "caption": "hello world"},
                {"_id": 11, "owner_id": 2, "caption": "bye"},
                {"_id": 12, "owner_id": 1, "caption": "hello again"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_lookup_equi_join() {
        let sink = sample();
        let result = sink
            .aggregate(
                "post",
                &[
                    json!({"$match": {"caption": {"$regex": "hello"}}}),
                    json!({"$lookup": {"from": "account", "localField": "owner_id", "foreignField": "_id", "as": "owner"}}),
                    json!({"$unwind": {"path": "$owner", "preserveNullAndEmptyArrays": true}}),
                    json!({"$match": {"owner.username": "seyed"}}),
                ],
            )
            .unwrap();
        let ids: Vec<_> = result.iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids, vec![json!(10), json!(12)]);
    }

    #[test]
    fn test_lookup_with_let_and_pipeline() {
        let sink = sample();
        let result = sink
            .aggregate(
                "account",
                &[json!({"$lookup": {
                    "from": "post",
                    "let": {"id": "$_id"},
                    "pipeline": [{"$match": {"$expr": {"$eq": ["$owner_id", "$$id"]}}}],
                    "as": "posts"
                }})],
            )
            .unwrap();
        assert_eq!(result[0]["posts"].as_array().unwrap().len(), 2);
        assert_eq!(result[1]["posts"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_out_replaces_target_collection() {
        let sink = sample();
        sink.aggregate("post", &[json!({"$match": {"owner_id": 2}}), json!({"$out": "archive"})])
            .unwrap();
        assert_eq!(sink.documents("archive").len(), 1);
        assert_eq!(sink.collection_names(), vec!["account", "archive", "post"]);
    }

    #[test]
    fn test_closure_sink() {
        let echo = |collection: &str, pipeline: &[Value]| -> Result<Vec<Value>> {
            Ok(vec![json!({"collection": collection, "stages": pipeline.len()})])
        };
        let result = echo.aggregate("post", &[json!({"$limit": 1})]).unwrap();
        assert_eq!(result, vec![json!({"collection": "post", "stages": 1})]);
    }

    #[test]
    fn test_rejects_non_documents() {
        let sink = MemorySink::new();
        assert!(matches!(
            sink.insert("x", json!(5)),
            Err(PipelineError::InvalidArgument(_))
        ));
        assert!(MemorySink::from_json(&json!({"x": 1})).is_err());
    }
}
