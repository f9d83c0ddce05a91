//! kgraph Benchmark Binary
//!
//! Measures ingest and search on the file backend at 100, 1,000 and 10,000
//! entities.
//! Run with: `cargo run --bin kgraph-bench --release`

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use kgraph_core::monitor::percentile;
use kgraph_core::{BackendKind, EngineConfig, Entity, HashEmbedder, Relation, TenantContext, WriteMode};
use kgraph_query::request::{GraphQuerySpec, HybridQuery, VectorQuery};
use kgraph_query::{QueryEngine, QueryRequest, SearchRequest};
use kgraph_store::KnowledgeGraph;

// ---------------------------------------------------------------------------
// Synthetic data generation
// ---------------------------------------------------------------------------

const ENTITY_TYPES: &[&str] = &["Person", "Company", "Project", "Document", "Topic"];

const RELATION_TYPES: &[&str] = &["WORKS_FOR", "CONTRIBUTES_TO", "MENTIONS", "RELATED_TO"];

const SEARCH_TERMS: &[&str] = &[
    "architecture",
    "performance",
    "scalability",
    "deployment",
    "migration",
    "security",
    "pipeline",
    "database",
    "monitoring",
    "release",
    "encryption",
    "latency",
    "throughput",
    "consensus",
    "caching",
    "replication",
    "failover",
    "partitioning",
    "serialization",
    "concurrency",
];

const DIMENSION: usize = 64;
const BATCH: usize = 100;

fn generate_entity(i: usize, embedder: &HashEmbedder) -> Entity {
    let entity_type = ENTITY_TYPES[i % ENTITY_TYPES.len()];
    let description = format!(
        "{} {} about {} and {}",
        entity_type,
        i,
        SEARCH_TERMS[i % SEARCH_TERMS.len()],
        SEARCH_TERMS[(i + 7) % SEARCH_TERMS.len()]
    );
    Entity::new(format!("e{i}"), entity_type)
        .with_property("name", format!("{entity_type} {i}"))
        .with_embedding(embedder.embed_text(&description))
        .with_property("description", description)
}

/// A chain plus one pseudo-random edge per entity, so traversals fan out.
fn generate_relations(n: usize) -> Vec<Relation> {
    let mut relations = Vec::with_capacity(n * 2);
    for i in 0..n {
        let rel_type = RELATION_TYPES[i % RELATION_TYPES.len()];
        if i + 1 < n {
            let (s, t) = (format!("e{i}"), format!("e{}", i + 1));
            relations.push(Relation::new(Relation::derive_id(&s, rel_type, &t), rel_type, s, t));
        }
        let j = (i * 7 + 3) % n;
        if j != i {
            let (s, t) = (format!("e{i}"), format!("e{j}"));
            let rel_type = RELATION_TYPES[(i + 1) % RELATION_TYPES.len()];
            relations.push(Relation::new(Relation::derive_id(&s, rel_type, &t), rel_type, s, t));
        }
    }
    relations
}

// ---------------------------------------------------------------------------
// Percentile computation
// ---------------------------------------------------------------------------

fn percentiles(mut latencies: Vec<f64>) -> [f64; 3] {
    latencies.sort_by(f64::total_cmp);
    [
        percentile(&latencies, 50.0),
        percentile(&latencies, 95.0),
        percentile(&latencies, 99.0),
    ]
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn format_duration_us(us: f64) -> String {
    if us >= 1_000_000.0 {
        format!("{:.1} s", us / 1_000_000.0)
    } else if us >= 1_000.0 {
        format!("{:.0} ms", us / 1_000.0)
    } else {
        format!("{:.0} us", us)
    }
}

fn format_throughput(per_sec: f64) -> String {
    if per_sec >= 1_000_000.0 {
        format!("{:.1}M/s", per_sec / 1_000_000.0)
    } else if per_sec >= 1_000.0 {
        format!("{:.1}K/s", per_sec / 1_000.0)
    } else {
        format!("{:.0}/s", per_sec)
    }
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1_024 * 1_024 {
        format!("{:.1} MB", bytes as f64 / (1_024.0 * 1_024.0))
    } else {
        format!("{:.0} KB", bytes as f64 / 1_024.0)
    }
}

fn format_scale(n: usize) -> String {
    if n >= 1_000_000 {
        format!("{}M", n / 1_000_000)
    } else if n >= 1_000 {
        format!("{}K", n / 1_000)
    } else {
        n.to_string()
    }
}

// ---------------------------------------------------------------------------
// Benchmark results
// ---------------------------------------------------------------------------

type MetricRow = (&'static str, fn(&ScaleResult) -> f64);

#[derive(Default)]
struct ScaleResult {
    ingest_entities_per_sec: f64,
    ingest_relations_per_sec: f64,
    vector: [f64; 3],
    graph: [f64; 3],
    hybrid: [f64; 3],
    store_size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Benchmark runner for a single scale
// ---------------------------------------------------------------------------

async fn run_benchmark(n: usize) -> Result<ScaleResult> {
    let tmp = tempfile::TempDir::new()?;
    let db_path = tmp.path().join("bench.db");

    let mut config = EngineConfig::default();
    config.storage.backend = BackendKind::File;
    config.storage.path = db_path.clone();
    config.query.vector_dimension = DIMENSION;
    // Measure the backend, not the cache.
    config.cache.enabled = false;

    let graph = Arc::new(KnowledgeGraph::open(config)?);
    let embedder = Arc::new(HashEmbedder::new(DIMENSION));
    let engine = QueryEngine::new(Arc::clone(&graph)).with_embedder(embedder.clone());
    let ctx = TenantContext::shared("bench");

    let mut result = ScaleResult::default();

    // --- Bulk Ingest ---
    let entities: Vec<Entity> = (0..n).map(|i| generate_entity(i, &embedder)).collect();
    let start = Instant::now();
    for chunk in entities.chunks(BATCH) {
        graph.batch_add_entities(&ctx, chunk.to_vec(), WriteMode::Upsert).await?;
    }
    result.ingest_entities_per_sec = n as f64 / start.elapsed().as_secs_f64();

    let relations = generate_relations(n);
    let count = relations.len();
    let start = Instant::now();
    for chunk in relations.chunks(BATCH) {
        graph.batch_add_relations(&ctx, chunk.to_vec(), WriteMode::Upsert).await?;
    }
    result.ingest_relations_per_sec = count as f64 / start.elapsed().as_secs_f64();

    let num_searches = 50;

    // --- Vector Search ---
    let mut latencies = Vec::with_capacity(num_searches);
    for i in 0..num_searches {
        let request = SearchRequest::new(QueryRequest::Vector(VectorQuery {
            embedding: Some(embedder.embed_text(SEARCH_TERMS[i % SEARCH_TERMS.len()])),
            ..VectorQuery::default()
        }))
        .with_limit(10);
        let start = Instant::now();
        engine.search(&ctx, &request).await?;
        latencies.push(start.elapsed().as_micros() as f64);
    }
    result.vector = percentiles(latencies);

    // --- Graph Search ---
    let mut latencies = Vec::with_capacity(num_searches);
    for i in 0..num_searches {
        let request = SearchRequest::new(QueryRequest::Graph(GraphQuerySpec {
            seeds: vec![format!("e{}", (i * 13) % n)],
            max_depth: Some(2),
            ..GraphQuerySpec::default()
        }))
        .with_limit(10);
        let start = Instant::now();
        engine.search(&ctx, &request).await?;
        latencies.push(start.elapsed().as_micros() as f64);
    }
    result.graph = percentiles(latencies);

    // --- Hybrid Search ---
    let mut latencies = Vec::with_capacity(num_searches);
    for i in 0..num_searches {
        let request = SearchRequest::new(QueryRequest::Hybrid(HybridQuery {
            text: Some(SEARCH_TERMS[i % SEARCH_TERMS.len()].to_string()),
            ..HybridQuery::default()
        }))
        .with_limit(10);
        let start = Instant::now();
        engine.search(&ctx, &request).await?;
        latencies.push(start.elapsed().as_micros() as f64);
    }
    result.hybrid = percentiles(latencies);

    // --- Store Size ---
    result.store_size_bytes = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    Ok(result)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let scales: &[usize] = &[100, 1_000, 10_000];

    println!();
    println!("kgraph Benchmark");
    println!("================");
    println!("Platform: {} {}", std::env::consts::OS, std::env::consts::ARCH);
    println!("Date: {}", Utc::now().format("%Y-%m-%d"));
    println!();

    eprint!("Warming up... ");
    run_benchmark(10).await?;
    eprintln!("done.");
    println!();

    let mut results: Vec<(usize, ScaleResult)> = Vec::new();
    for &n in scales {
        eprint!("Benchmarking {} entities... ", n);
        let start = Instant::now();
        let result = run_benchmark(n).await?;
        eprintln!("done in {:.1}s", start.elapsed().as_secs_f64());
        results.push((n, result));
    }

    println!();

    let col0 = 24;
    let colw = 14;

    print!("| {:col0$}", "Operation");
    for &n in scales {
        print!("| {:>colw$}", format!("{} entities", format_scale(n)));
    }
    println!("|");

    print!("|{}", "-".repeat(col0 + 1));
    for _ in scales {
        print!("|{}", "-".repeat(colw + 1));
    }
    println!("|");

    let throughput_rows: Vec<MetricRow> = vec![
        ("Entity Ingest", |r: &ScaleResult| r.ingest_entities_per_sec),
        ("Relation Ingest", |r: &ScaleResult| r.ingest_relations_per_sec),
    ];
    for (label, getter) in &throughput_rows {
        print!("| {:col0$}", label);
        for (_, r) in &results {
            print!("| {:>colw$}", format_throughput(getter(r)));
        }
        println!("|");
    }

    let latency_rows: Vec<MetricRow> = vec![
        ("Vector Search (p50)", |r: &ScaleResult| r.vector[0]),
        ("Vector Search (p95)", |r: &ScaleResult| r.vector[1]),
        ("Vector Search (p99)", |r: &ScaleResult| r.vector[2]),
        ("Graph Search (p50)", |r: &ScaleResult| r.graph[0]),
        ("Graph Search (p95)", |r: &ScaleResult| r.graph[1]),
        ("Graph Search (p99)", |r: &ScaleResult| r.graph[2]),
        ("Hybrid Search (p50)", |r: &ScaleResult| r.hybrid[0]),
        ("Hybrid Search (p95)", |r: &ScaleResult| r.hybrid[1]),
        ("Hybrid Search (p99)", |r: &ScaleResult| r.hybrid[2]),
    ];
    for (label, getter) in &latency_rows {
        print!("| {:col0$}", label);
        for (_, r) in &results {
            print!("| {:>colw$}", format_duration_us(getter(r)));
        }
        println!("|");
    }

    print!("| {:col0$}", "Store Size");
    for (_, r) in &results {
        print!("| {:>colw$}", format_size(r.store_size_bytes));
    }
    println!("|");

    println!();
    Ok(())
}
