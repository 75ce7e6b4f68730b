use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use stagecraft_core::{logging, MemorySink, PipelineBuilder, PipelineConfig, SchemaCatalog};
use std::fs;
use std::path::{Path, PathBuf};

mod replay;

#[derive(Parser)]
#[command(name = "stagecraft")]
#[command(about = "stagecraft CLI - compile chained query calls into aggregation pipelines")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the pipeline produced by a query file
    Compile(QueryArgs),
    /// Compile a query file and run it against in-memory collections
    Run {
        #[command(flatten)]
        query: QueryArgs,
        /// JSON file of the form {"collection": [documents...], ...}
        #[arg(long)]
        data: PathBuf,
    },
}

#[derive(Args)]
struct QueryArgs {
    /// Schema catalog (JSON)
    #[arg(long)]
    schemas: PathBuf,
    /// Schema the pipeline starts from
    #[arg(long)]
    model: String,
    /// JSON list of builder calls
    #[arg(long)]
    query: PathBuf,
    /// Builder configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    logging::init_from_env();
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile(query) => {
            let builder = build(&query)?;
            println!("{}", builder);
            Ok(())
        }
        Commands::Run { query, data } => {
            let builder = build(&query)?;
            let documents = run(&builder, &data)?;
            let json = serde_json::to_string_pretty(&documents)
                .with_context(|| "Failed to serialize results")?;
            println!("{}", json);
            Ok(())
        }
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in file: {}", path.display()))
}

/// Load the catalog and config, then replay the query file
fn build(args: &QueryArgs) -> Result<PipelineBuilder> {
    let catalog = SchemaCatalog::from_json(&read_json(&args.schemas)?)
        .with_context(|| format!("Invalid schema catalog: {}", args.schemas.display()))?;
    let schema = catalog
        .get(&args.model)
        .ok_or_else(|| anyhow::anyhow!("Schema '{}' not found in catalog", args.model))?;

    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Invalid config: {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let config = config.with_env().with_context(|| "Invalid environment overrides")?;
    config.apply_logging()?;

    let calls = read_json(&args.query)?;
    let calls = calls
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Query file must hold a list of calls"))?;

    replay::replay(PipelineBuilder::with_config(&schema, config), calls, &catalog)
        .with_context(|| format!("Failed to build pipeline from {}", args.query.display()))
}

fn run(builder: &PipelineBuilder, data: &Path) -> Result<Vec<Value>> {
    let sink = MemorySink::from_file(data)
        .with_context(|| format!("Failed to load data: {}", data.display()))?;
    let documents = builder
        .aggregate(&sink)
        .with_context(|| "Pipeline execution failed")?;
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_json(value: Value) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", value).unwrap();
        file
    }

    fn schemas() -> NamedTempFile {
        temp_json(json!({"schemas": {
            "Person": {"collection": "people", "fields": {
                "name": "string",
                "age": "int"
            }}
        }}))
    }

    #[test]
    fn test_build_and_run_from_files() {
        let schemas = schemas();
        let query = temp_json(json!([
            {"filter": {"age__gte": 30}},
            {"project": {"name": 1, "_id": 0}},
            {"order_by": "name"}
        ]));
        let data = temp_json(json!({"people": [
            {"_id": 1, "name": "Zed", "age": 40},
            {"_id": 2, "name": "Ann", "age": 20},
            {"_id": 3, "name": "Bob", "age": 31}
        ]}));

        let args = QueryArgs {
            schemas: schemas.path().to_path_buf(),
            model: "Person".to_string(),
            query: query.path().to_path_buf(),
            config: None,
        };
        let builder = build(&args).unwrap();
        assert_eq!(builder.len(), 3);

        let documents = run(&builder, data.path()).unwrap();
        assert_eq!(documents, vec![json!({"name": "Bob"}), json!({"name": "Zed"})]);
    }

    #[test]
    fn test_unknown_model_is_reported() {
        let schemas = schemas();
        let query = temp_json(json!([]));
        let args = QueryArgs {
            schemas: schemas.path().to_path_buf(),
            model: "Nobody".to_string(),
            query: query.path().to_path_buf(),
            config: None,
        };
        let err = build(&args).unwrap_err();
        assert!(err.to_string().contains("Nobody"));
    }

    #[test]
    fn test_config_file_is_validated() {
        let schemas = schemas();
        let query = temp_json(json!([]));
        let config = temp_json(json!({"foreign_key": "_id"}));
        let args = QueryArgs {
            schemas: schemas.path().to_path_buf(),
            model: "Person".to_string(),
            query: query.path().to_path_buf(),
            config: Some(config.path().to_path_buf()),
        };
        assert!(build(&args).is_err());
    }

    #[test]
    fn test_cli_parses_run_subcommand() {
        let cli = Cli::try_parse_from([
            "stagecraft", "run", "--schemas", "s.json", "--model", "Person", "--query", "q.json",
            "--data", "d.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { query, data } => {
                assert_eq!(query.model, "Person");
                assert_eq!(data, PathBuf::from("d.json"));
            }
            Commands::Compile(_) => panic!("expected run"),
        }
    }
}
