// Compiled pipelines executed by the in-memory sink
use serde_json::{json, Value};
use stagecraft_core::{
    kw, Cond, FieldType, Lookup, MemorySink, PipelineBuilder, PipelineError, Schema, Sink, F, Q,
};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

fn account() -> Arc<Schema> {
    Arc::new(
        Schema::document("Account", "account")
            .field("username", FieldType::String)
            .field("is_verified", FieldType::Boolean)
            .field("deleted_at", FieldType::DateTime),
    )
}

fn post() -> Schema {
    Schema::document("Post", "post")
        .field_with_db("owner", "owner_id", FieldType::Reference(account()))
        .field("caption", FieldType::String)
        .field("likes", FieldType::Int)
        .field("hashtags", FieldType::list_of(FieldType::String))
}

fn dataset() -> Value {
    json!({
        "account": [
            {"_id": 1, "username": "seyed", "is_verified": true, "deleted_at": null},
            {"_id": 2, "username": "mehdi", "is_verified": false, "deleted_at": "2023-01-01"},
            {"_id": 3, "username": "sara", "is_verified": true}
        ],
        "post": [
            {"_id": 10, "owner_id": 1, "caption": "hello world", "likes": 5, "hashtags": ["a", "b"]},
            {"_id": 11, "owner_id": 2, "caption": "hello there", "likes": 7, "hashtags": ["b"]},
            {"_id": 12, "owner_id": 1, "caption": "goodbye", "likes": 1, "hashtags": []},
            {"_id": 13, "owner_id": 3, "caption": "Hello again", "likes": 3, "hashtags": ["c"]},
            {"_id": 14, "owner_id": 99, "caption": "hello orphan", "likes": 0}
        ]
    })
}

fn sink() -> MemorySink {
    MemorySink::from_json(&dataset()).unwrap()
}

fn ids(docs: &[Value]) -> Vec<Value> {
    docs.iter().map(|doc| doc["_id"].clone()).collect()
}

#[test]
fn test_joined_filter_keeps_live_owners() {
    let docs = PipelineBuilder::new(&post())
        .filter(kw! { "caption__contains" => "hello", "owner__deleted_at" => Value::Null })
        .unwrap()
        .aggregate(&sink())
        .unwrap();
    // 14 has no owner and is kept by the preserving unwind
    assert_eq!(ids(&docs), vec![json!(10), json!(14)]);
    assert_eq!(docs[0]["owner"]["username"], json!("seyed"));
}

#[test]
fn test_case_insensitive_text_filter_and_ordering() {
    let docs = PipelineBuilder::new(&post())
        .filter(kw! { "caption__istartswith" => "HELLO" })
        .unwrap()
        .order_by(["-likes"])
        .unwrap()
        .slice(1..3)
        .unwrap()
        .aggregate(&sink())
        .unwrap();
    assert_eq!(ids(&docs), vec![json!(10), json!(13)]);
}

#[test]
fn test_group_count_and_sum() {
    let docs = PipelineBuilder::new(&post())
        .filter(kw! { "owner__in" => vec![json!(1), json!(2)] })
        .unwrap()
        .group("owner")
        .unwrap()
        .annotate("posts", "count", Value::Null)
        .unwrap()
        .annotate("likes", "sum", "likes")
        .unwrap()
        .order_by(["-posts"])
        .unwrap()
        .aggregate(&sink())
        .unwrap();
    assert_eq!(
        docs,
        vec![
            json!({"_id": 1, "posts": 2, "likes": 6}),
            json!({"_id": 2, "posts": 1, "likes": 7}),
        ]
    );
}

#[test]
fn test_add_fields_and_projection() {
    let docs = PipelineBuilder::new(&post())
        .add_fields(kw! {
            "score" => F::field("likes") * 2 + 1,
            "popular" => Cond::new("$likes", ">=", 5, true, false).unwrap(),
        })
        .unwrap()
        .project(kw! { "score" => 1, "popular" => 1, "_id" => 0 })
        .unwrap()
        .limit(2)
        .unwrap()
        .aggregate(&sink())
        .unwrap();
    assert_eq!(
        docs,
        vec![
            json!({"score": 11, "popular": true}),
            json!({"score": 15, "popular": true}),
        ]
    );
}

#[test]
fn test_unwind_and_count() {
    let docs = PipelineBuilder::new(&post())
        .unwind("hashtags", None, false)
        .unwrap()
        .filter(kw! { "hashtags" => "b" })
        .unwrap()
        .count("total")
        .unwrap()
        .aggregate(&sink())
        .unwrap();
    assert_eq!(docs, vec![json!({"total": 2})]);
}

#[test]
fn test_lookup_equi_join_and_replace_root() {
    let docs = PipelineBuilder::new(&post())
        .filter(kw! { "likes__gte" => 5 })
        .unwrap()
        .lookup(Lookup::new(account(), "author").local_field("owner"))
        .unwrap()
        .unwind("author", None, false)
        .unwrap()
        .replace_root("author", None)
        .unwrap()
        .order_by(["username"])
        .unwrap()
        .aggregate(&sink())
        .unwrap();
    let names: Vec<_> = docs.iter().map(|doc| doc["username"].clone()).collect();
    assert_eq!(names, vec![json!("mehdi"), json!("seyed")]);
}

#[test]
fn test_correlated_lookup() {
    let verified = PipelineBuilder::new(&account())
        .filter(kw! { "is_verified" => true })
        .unwrap();
    let docs = PipelineBuilder::new(&post())
        .lookup(
            Lookup::new(account(), "owner_doc")
                .let_var("owner")
                .query(Q::kw("_id", "owner").unwrap())
                .query(verified),
        )
        .unwrap()
        .filter(kw! { "owner_doc__ne" => Vec::<Value>::new() })
        .unwrap()
        .aggregate(&sink())
        .unwrap();
    assert_eq!(ids(&docs), vec![json!(10), json!(12), json!(13)]);
}

#[test]
fn test_out_writes_target_collection() {
    let sink = sink();
    let docs = PipelineBuilder::new(&post())
        .filter(Q::kw("likes__lt", 2).unwrap() | Q::kw("caption", "hello there").unwrap())
        .unwrap()
        .out("picked", None)
        .unwrap()
        .aggregate(&sink)
        .unwrap();
    assert_eq!(docs.len(), 3);
    assert_eq!(ids(&sink.documents("picked")), vec![json!(11), json!(12), json!(14)]);
}

#[test]
fn test_redact_prunes_documents() {
    let docs = PipelineBuilder::new(&post())
        .redact("$likes", ">", 4, "KEEP", "PRUNE")
        .unwrap()
        .aggregate(&sink())
        .unwrap();
    assert_eq!(ids(&docs), vec![json!(10), json!(11)]);
}

#[test]
fn test_sink_errors_surface() {
    let result = PipelineBuilder::new(&post())
        .raw(json!({"$facet": {}}))
        .unwrap()
        .aggregate(&sink());
    assert!(matches!(result, Err(PipelineError::AggregationError(_))));

    let embedded = Schema::embedded("Address").field("city", FieldType::String);
    assert!(matches!(
        PipelineBuilder::new(&embedded).aggregate(&sink()),
        Err(PipelineError::InvalidArgument(_))
    ));
}

#[test]
fn test_closure_sink_receives_pipeline() {
    let capture = |collection: &str, pipeline: &[Value]| -> stagecraft_core::Result<Vec<Value>> {
        Ok(vec![json!({"collection": collection, "pipeline": pipeline})])
    };
    let result = PipelineBuilder::new(&post())
        .limit(3)
        .unwrap()
        .aggregate(&capture)
        .unwrap();
    assert_eq!(
        result,
        vec![json!({"collection": "post", "pipeline": [{"$limit": 3}]})]
    );
}

#[test]
fn test_sink_loads_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", dataset()).unwrap();
    let sink = MemorySink::from_file(file.path()).unwrap();
    assert_eq!(sink.collection_names(), vec!["account", "post"]);
    assert_eq!(sink.aggregate("post", &[]).unwrap().len(), 5);
}
