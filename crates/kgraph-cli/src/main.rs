//! kgraph CLI: multi-tenant knowledge graph storage and retrieval.
//!
//! Commands: init, import, search, get, delete, stats, advise, serve,
//! completions

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde_json::{json, Map, Value};
use tracing::{info, Level};

use kgraph_core::{BackendKind, Direction, EngineConfig, HashEmbedder, TenantContext};
use kgraph_import::{BatchLoader, CommitMode, ImportOptions, InputFormat, SchemaMapping};
use kgraph_mcp::{KgraphMcpService, ToolDispatcher};
use kgraph_query::advisor::patterns_for_request;
use kgraph_query::formatter::{format_results, format_search, OutputFormat, QueryResult, ResultRow};
use kgraph_query::{IndexAdvisor, QueryEngine, SearchRequest};
use kgraph_store::KnowledgeGraph;

const STORE_DIR: &str = ".kgraph";
const CONFIG_FILE: &str = "config.toml";

#[derive(Parser)]
#[command(name = "kgraph")]
#[command(version)]
#[command(about = "Multi-tenant knowledge graph storage and retrieval")]
struct Cli {
    /// Configuration file (default: ./.kgraph/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tenant to act for
    #[arg(long, global = true, default_value = "default")]
    tenant: String,

    /// Keep the tenant in its own schema instead of the shared tables
    #[arg(long, global = true)]
    separate_schema: bool,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = Format::Json)]
    format: Format,

    /// More logging on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Table,
    Markdown,
}

impl From<Format> for OutputFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Json => Self::Json,
            Format::Table => Self::Table,
            Format::Markdown => Self::Markdown,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    File,
    Relational,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Upsert,
    Bulk,
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceFormatArg {
    Auto,
    Csv,
    Json,
    JsonLines,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Vector,
    Graph,
    Hybrid,
    Pagerank,
    Multihop,
    Filtered,
    Traverse,
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Outgoing,
    Incoming,
    Both,
}

#[derive(Clone, Copy, ValueEnum)]
enum RerankArg {
    Text,
    Semantic,
    Structural,
    Hybrid,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a store and its configuration
    Init {
        /// Directory to initialize
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[arg(long, value_enum, default_value_t = BackendArg::File)]
        backend: BackendArg,
    },
    /// Import a CSV or JSON file through a schema mapping
    Import {
        file: PathBuf,
        /// Mapping file (JSON or TOML)
        #[arg(long)]
        mapping: PathBuf,
        #[arg(long, value_enum, default_value_t = ModeArg::Upsert)]
        mode: ModeArg,
        #[arg(long = "source-format", value_enum, default_value_t = SourceFormatArg::Auto)]
        source_format: SourceFormatArg,
        /// Key holding the rows when the JSON document is an object
        #[arg(long)]
        array_key: Option<String>,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Abort on the first bad row instead of recording it
        #[arg(long)]
        fail_fast: bool,
    },
    /// Search with one of the retrieval strategies
    #[command(alias = "s")]
    Search {
        #[arg(value_enum)]
        strategy: Option<StrategyArg>,
        /// Seed entity ids
        #[arg(long = "seed")]
        seeds: Vec<String>,
        /// Query text, embedded for vector strategies
        #[arg(long)]
        text: Option<String>,
        /// Maximum hops (hop count for multihop)
        #[arg(long)]
        depth: Option<u32>,
        #[arg(long, value_enum)]
        direction: Option<DirectionArg>,
        /// Restrict to one entity type
        #[arg(long = "type")]
        entity_type: Option<String>,
        /// Relation types to follow (traverse)
        #[arg(long = "relation-type")]
        relation_types: Vec<String>,
        /// Property equality filter, key=value (filtered)
        #[arg(long = "property")]
        properties: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_enum)]
        rerank: Option<RerankArg>,
        /// Full request as JSON ("-" reads stdin); overrides the flags above
        #[arg(long)]
        request: Option<String>,
    },
    /// Read an entity (or a relation)
    Get {
        id: String,
        #[arg(long)]
        relation: bool,
    },
    /// Delete entities (or one relation)
    #[command(alias = "rm")]
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(long)]
        relation: bool,
    },
    /// Entity and relation counts by type
    Stats,
    /// Index recommendations for a workload of search requests
    Advise {
        /// JSON array of search requests to analyze
        #[arg(long)]
        workload: Option<PathBuf>,
        /// Create the recommended indexes
        #[arg(long)]
        apply: bool,
    },
    /// Serve the tools over MCP on stdio
    Serve,
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let ctx = if cli.separate_schema {
        TenantContext::separate(cli.tenant.clone())
    } else {
        TenantContext::shared(cli.tenant.clone())
    };
    let format = OutputFormat::from(cli.format);

    match cli.command {
        Commands::Init { ref dir, backend } => init(dir, backend),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "kgraph", &mut io::stdout());
            Ok(())
        }
        Commands::Import {
            ref file,
            ref mapping,
            mode,
            source_format,
            ref array_key,
            batch_size,
            fail_fast,
        } => {
            let graph = open_graph(cli.config.as_deref())?;
            let mapping = SchemaMapping::load(mapping).with_context(|| format!("loading mapping {}", mapping.display()))?;
            let defaults = ImportOptions::from_config(graph.config());
            let options = ImportOptions {
                batch_size: batch_size.unwrap_or(defaults.batch_size),
                mode: match mode {
                    ModeArg::Upsert => CommitMode::Upsert,
                    ModeArg::Bulk => CommitMode::Bulk,
                },
                skip_errors: !fail_fast,
                format: match source_format {
                    SourceFormatArg::Auto => InputFormat::Auto,
                    SourceFormatArg::Csv => InputFormat::Csv,
                    SourceFormatArg::Json => InputFormat::Json,
                    SourceFormatArg::JsonLines => InputFormat::JsonLines,
                },
                array_key: array_key.clone(),
            };
            let result = BatchLoader::new(graph, mapping)
                .with_options(options)
                .on_progress(|p| info!(batch = p.batch, rows = p.rows_processed, total = p.total_rows, "imported batch"))
                .import_path(&ctx, file)
                .await?;
            print_json(&serde_json::to_value(result)?)
        }
        Commands::Search {
            strategy,
            ref seeds,
            ref text,
            depth,
            direction,
            ref entity_type,
            ref relation_types,
            ref properties,
            limit,
            rerank,
            ref request,
        } => {
            let value = match request {
                Some(raw) => read_request(raw)?,
                None => {
                    let Some(strategy) = strategy else {
                        bail!("a strategy or --request is required");
                    };
                    build_request(strategy, seeds, text.as_deref(), depth, direction, entity_type.as_deref(), relation_types, properties, limit, rerank)?
                }
            };
            let request = SearchRequest::from_json(value)?;
            let engine = open_engine(cli.config.as_deref())?;
            let response = engine.search(&ctx, &request).await?;
            println!("{}", format_search(&response, format));
            Ok(())
        }
        Commands::Get { ref id, relation } => {
            let graph = open_graph(cli.config.as_deref())?;
            if relation {
                let relation = graph.get_relation(&ctx, id).await?;
                print_json(&serde_json::to_value(relation)?)
            } else {
                let entity = graph.get_entity(&ctx, id).await?;
                match format {
                    OutputFormat::Json => print_json(&serde_json::to_value(entity)?),
                    other => {
                        println!("{}", format_results(&QueryResult::from_entities(&[entity]), other));
                        Ok(())
                    }
                }
            }
        }
        Commands::Delete { ref ids, relation } => {
            let graph = open_graph(cli.config.as_deref())?;
            if relation {
                for id in ids {
                    graph.delete_relation(&ctx, id).await?;
                }
                return print_json(&json!({ "deleted": ids }));
            }
            if let [id] = ids.as_slice() {
                graph.delete_entity(&ctx, id).await?;
                return print_json(&json!({ "deleted": 1 }));
            }
            let removed = graph.batch_delete_entities(&ctx, ids).await?;
            print_json(&json!({ "requested": ids.len(), "deleted": removed }))
        }
        Commands::Stats => {
            let graph = open_graph(cli.config.as_deref())?;
            let stats = graph.stats(&ctx).await?;
            if let OutputFormat::Json = format {
                let mut value = serde_json::to_value(&stats)?;
                if let Value::Object(ref mut map) = value {
                    map.insert("tenant".into(), json!(ctx.tenant_id));
                    map.insert("avg_out_degree".into(), json!(stats.avg_out_degree()));
                }
                return print_json(&value);
            }
            let mut rows = Vec::new();
            for (kind, counts) in [("entity", &stats.entities_by_type), ("relation", &stats.relations_by_type)] {
                for (ty, count) in counts {
                    let fields = [("kind", json!(kind)), ("type", json!(ty)), ("count", json!(count))]
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v))
                        .collect();
                    rows.push(ResultRow { fields });
                }
            }
            let result = QueryResult {
                columns: vec!["kind".into(), "type".into(), "count".into()],
                total: rows.len(),
                rows,
            };
            println!("{}", format_results(&result, format));
            Ok(())
        }
        Commands::Advise { ref workload, apply } => {
            let engine = open_engine(cli.config.as_deref())?;
            if let Some(path) = workload {
                let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                let requests: Vec<Value> = serde_json::from_str(&raw).context("workload must be a JSON array")?;
                for value in requests {
                    let request = SearchRequest::from_json(value)?;
                    engine.patterns().record_all(patterns_for_request(&request.query));
                }
            }
            let report = engine.index_advice(&ctx, &IndexAdvisor::default()).await?;
            if apply {
                for rec in &report.recommendations {
                    engine.graph().create_index(&ctx, &rec.definition).await?;
                    info!(index = %rec.definition.name, "index created");
                }
            }
            print_json(&serde_json::to_value(&report)?)
        }
        Commands::Serve => {
            use rmcp::{transport::stdio, ServiceExt};
            let engine = Arc::new(open_engine(cli.config.as_deref())?);
            let service = KgraphMcpService::new(Arc::new(ToolDispatcher::new(engine)));
            info!("serving MCP on stdio");
            let running = service.serve(stdio()).await?;
            running.waiting().await?;
            Ok(())
        }
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// === Store setup ===

fn init(dir: &Path, backend: BackendArg) -> Result<()> {
    let store = dir.join(STORE_DIR);
    let config_path = store.join(CONFIG_FILE);
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }
    std::fs::create_dir_all(&store).with_context(|| format!("creating {}", store.display()))?;

    let mut config = EngineConfig::default();
    config.storage.backend = match backend {
        BackendArg::File => BackendKind::File,
        BackendArg::Relational => BackendKind::Relational,
    };
    config.storage.path = PathBuf::from("graph.db");
    std::fs::write(&config_path, toml::to_string_pretty(&config)?)?;

    let graph = KnowledgeGraph::open(resolve(config, &config_path))?;
    println!(
        "Initialized kgraph store at {} ({:?} backend)",
        store.display(),
        graph.backend_kind()
    );
    Ok(())
}

/// Relative storage paths are relative to the config file.
fn resolve(mut config: EngineConfig, config_path: &Path) -> EngineConfig {
    if config.storage.path.is_relative() {
        if let Some(base) = config_path.parent() {
            config.storage.path = base.join(&config.storage.path);
        }
    }
    config
}

fn load_config(explicit: Option<&Path>) -> Result<EngineConfig> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let default = Path::new(STORE_DIR).join(CONFIG_FILE);
            if !default.exists() {
                bail!("no kgraph store here; run `kgraph init` or pass --config");
            }
            default
        }
    };
    let config = EngineConfig::load(&path).with_context(|| format!("loading {}", path.display()))?;
    Ok(resolve(config, &path))
}

fn open_graph(config: Option<&Path>) -> Result<Arc<KnowledgeGraph>> {
    Ok(Arc::new(KnowledgeGraph::open(load_config(config)?)?))
}

fn open_engine(config: Option<&Path>) -> Result<QueryEngine> {
    let graph = open_graph(config)?;
    let dim = graph.config().query.vector_dimension;
    Ok(QueryEngine::new(graph).with_embedder(Arc::new(HashEmbedder::new(dim))))
}

// === Search requests ===

fn read_request(raw: &str) -> Result<Value> {
    let text = if raw == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        raw.to_string()
    };
    serde_json::from_str(&text).context("--request must be JSON")
}

#[allow(clippy::too_many_arguments)]
fn build_request(
    strategy: StrategyArg,
    seeds: &[String],
    text: Option<&str>,
    depth: Option<u32>,
    direction: Option<DirectionArg>,
    entity_type: Option<&str>,
    relation_types: &[String],
    properties: &[String],
    limit: Option<usize>,
    rerank: Option<RerankArg>,
) -> Result<Value> {
    let name = match strategy {
        StrategyArg::Vector => "vector",
        StrategyArg::Graph => "graph",
        StrategyArg::Hybrid => "hybrid",
        StrategyArg::Pagerank => "pagerank",
        StrategyArg::Multihop => "multihop",
        StrategyArg::Filtered => "filtered",
        StrategyArg::Traverse => "traverse",
    };
    let mut req = Map::new();
    req.insert("strategy".into(), json!(name));
    if !seeds.is_empty() || matches!(strategy, StrategyArg::Graph | StrategyArg::Pagerank | StrategyArg::Multihop | StrategyArg::Traverse) {
        req.insert("seeds".into(), json!(seeds));
    }
    if let Some(t) = text {
        req.insert("text".into(), json!(t));
    }
    if let Some(d) = depth {
        let key = if matches!(strategy, StrategyArg::Multihop) { "hops" } else { "max_depth" };
        req.insert(key.into(), json!(d));
    }
    if let Some(d) = direction {
        let d = match d {
            DirectionArg::Outgoing => Direction::Outgoing,
            DirectionArg::Incoming => Direction::Incoming,
            DirectionArg::Both => Direction::Both,
        };
        req.insert("direction".into(), serde_json::to_value(d)?);
    }
    if let Some(t) = entity_type {
        req.insert("entity_type".into(), json!(t));
    }
    if matches!(strategy, StrategyArg::Traverse) {
        req.insert("relation_types".into(), json!(relation_types));
    }
    if !properties.is_empty() {
        let mut props = Map::new();
        for p in properties {
            let Some((k, v)) = p.split_once('=') else {
                bail!("--property expects key=value, got '{p}'");
            };
            // Values that parse as JSON keep their type; anything else is a string.
            let v = serde_json::from_str(v).unwrap_or_else(|_| json!(v));
            props.insert(k.to_string(), v);
        }
        req.insert("properties".into(), Value::Object(props));
    }
    if let Some(l) = limit {
        req.insert("limit".into(), json!(l));
    }
    if let Some(r) = rerank {
        let strategy = match r {
            RerankArg::Text => "text",
            RerankArg::Semantic => "semantic",
            RerankArg::Structural => "structural",
            RerankArg::Hybrid => "hybrid",
        };
        req.insert("rerank".into(), json!({ "strategy": strategy }));
    }
    Ok(Value::Object(req))
}
