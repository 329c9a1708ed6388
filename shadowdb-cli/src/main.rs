use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value as JsonValue};
use shadowdb_core::find_options::parse_sort;
use shadowdb_core::{
    DatabaseConfig, DatabaseCore, Document, FindOptions, IndexOptions, LogLevel, TextSearchOptions,
};
use std::fs;
use std::path::{Path, PathBuf};

const DATABASE_NAME: &str = "shadowdb";

#[derive(Parser)]
#[command(name = "shadowdb")]
#[command(about = "ShadowDB CLI - run queries against an in-memory copy of a JSON fixture")]
#[command(version)]
struct Cli {
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Fixture file and collection every command reads from
#[derive(Args)]
struct Source {
    /// JSON fixture: { "collection_name": [documents...], ... }
    fixture: PathBuf,
    /// Collection to query
    collection: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Find documents
    Find {
        #[command(flatten)]
        source: Source,
        /// Filter document (JSON)
        #[arg(long, default_value = "{}")]
        filter: String,
        /// Projection document (JSON)
        #[arg(long)]
        projection: Option<String>,
        /// Sort specification (JSON), e.g. '{"age": -1}'
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        skip: Option<usize>,
        /// 0 means no limit
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Count matching documents
    Count {
        #[command(flatten)]
        source: Source,
        /// Filter document (JSON)
        #[arg(long, default_value = "{}")]
        filter: String,
        #[arg(long)]
        skip: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run an aggregation pipeline
    Aggregate {
        #[command(flatten)]
        source: Source,
        /// Pipeline (JSON array of stages)
        #[arg(long)]
        pipeline: String,
    },
    /// Ranked text search
    Text {
        #[command(flatten)]
        source: Source,
        /// Field covered by the text index (repeatable)
        #[arg(long = "field", required = true)]
        fields: Vec<String>,
        /// Search string: terms, "quoted phrases" and -negations
        #[arg(long)]
        search: String,
        /// Filter applied before scoring (JSON)
        #[arg(long)]
        filter: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: usize,
        /// Projection document (JSON)
        #[arg(long)]
        projection: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DatabaseConfig::new();
    if let Some(level) = cli.log_level.as_deref() {
        let level: LogLevel = level.parse().map_err(anyhow::Error::msg)?;
        config = config.with_log_level(level);
    } else {
        shadowdb_core::logging::init_from_env();
    }

    let output = match cli.command {
        Commands::Find {
            source,
            filter,
            projection,
            sort,
            skip,
            limit,
        } => {
            let db = load_fixture(&source.fixture, &config)?;
            let mut options = FindOptions::new();
            if let Some(projection) = projection {
                options = options.with_projection(parse_document(&projection, "projection")?);
            }
            if let Some(sort) = sort {
                options = options.with_sort(parse_sort(&parse_document(&sort, "sort")?)?);
            }
            options.skip = skip;
            options.limit = limit;
            let docs = db
                .find_with_options(&source.collection, &parse_document(&filter, "filter")?, &options)
                .with_context(|| format!("find on '{}' failed", source.collection))?;
            documents_to_json(&docs)
        }
        Commands::Count {
            source,
            filter,
            skip,
            limit,
        } => {
            let db = load_fixture(&source.fixture, &config)?;
            let count = db
                .count(&source.collection, &parse_document(&filter, "filter")?, skip, limit)
                .with_context(|| format!("count on '{}' failed", source.collection))?;
            JsonValue::from(count)
        }
        Commands::Aggregate { source, pipeline } => {
            let mut db = load_fixture(&source.fixture, &config)?;
            let pipeline: JsonValue = serde_json::from_str(&pipeline).context("Invalid JSON in pipeline")?;
            let docs = db
                .aggregate_json(&source.collection, &pipeline)
                .with_context(|| format!("aggregate on '{}' failed", source.collection))?;
            documents_to_json(&docs)
        }
        Commands::Text {
            source,
            fields,
            search,
            filter,
            limit,
            projection,
        } => {
            let mut db = load_fixture(&source.fixture, &config)?;
            let keys: Document = fields
                .iter()
                .map(|field| (field.clone(), shadowdb_core::Value::from("text")))
                .collect();
            db.create_index(&source.collection, &keys, IndexOptions::new())
                .context("Failed to create text index")?;

            let options = TextSearchOptions {
                filter: filter.map(|f| parse_document(&f, "filter")).transpose()?,
                limit,
                projection: projection.map(|p| parse_document(&p, "projection")).transpose()?,
            };
            let result = db
                .text_search(&source.collection, &search, &options)
                .with_context(|| format!("text search on '{}' failed", source.collection))?;
            result.to_document().to_json()
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Load a fixture into a fresh in-memory store
/// Format: { "collection_name": [documents...], ... }
fn load_fixture(file: &Path, config: &DatabaseConfig) -> Result<DatabaseCore> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;

    let data: Map<String, JsonValue> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in file: {}", file.display()))?;

    let mut db = DatabaseCore::with_config(DATABASE_NAME, config);
    for (collection_name, documents) in data {
        let docs = documents
            .as_array()
            .with_context(|| format!("Collection '{}' must be an array", collection_name))?
            .iter()
            .map(Document::from_json)
            .collect::<shadowdb_core::Result<Vec<_>>>()
            .with_context(|| format!("Collection '{}' contains a non-object document", collection_name))?;

        db.insert_many(&collection_name, docs)
            .with_context(|| format!("Failed to load documents into {}", collection_name))?;
    }
    Ok(db)
}

fn parse_document(raw: &str, what: &str) -> Result<Document> {
    let json: JsonValue = serde_json::from_str(raw).with_context(|| format!("Invalid JSON in {}", what))?;
    Document::from_json(&json).with_context(|| format!("{} must be a JSON object", what))
}

fn documents_to_json(docs: &[Document]) -> JsonValue {
    JsonValue::Array(docs.iter().map(Document::to_json).collect())
}
