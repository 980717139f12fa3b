use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use semsearch_core::chunker::{ChunkingConfig, TextChunker};
use semsearch_core::config::{BackendKind, Config, Settings};
use semsearch_core::traits::{IndexStore, TokenCodec};
use semsearch_embed::{get_default_embedder, HfTokenCodec};
use semsearch_pipeline::PageSearchEngine;
use semsearch_vector::{LanceStore, VectorIndex};

#[derive(Debug, Parser)]
#[command(name = "semsearch", version, about = "Chunk text and rank the chunks against a query")]
struct Cli {
    /// Override `index.backend`
    #[arg(long, global = true, value_enum)]
    backend: Option<Backend>,

    /// Use the deterministic hashing embedder instead of the local model
    #[arg(long, global = true)]
    fake: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    Lance,
}

impl From<Backend> for BackendKind {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Memory => BackendKind::Memory,
            Backend::Lance => BackendKind::Lance,
        }
    }
}

#[derive(Debug, Args)]
struct InputArgs {
    /// Text file to read; stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the chunks of the input as JSON lines
    Chunk {
        #[command(flatten)]
        input: InputArgs,
        #[arg(long)]
        max_tokens: Option<usize>,
        #[arg(long)]
        overlap_tokens: Option<usize>,
    },
    /// Replace a namespace with the chunks of the input
    Index {
        #[command(flatten)]
        input: InputArgs,
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// Rank indexed chunks against a query
    Query {
        query: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// Chunk, index and query one document in a single step
    Search {
        query: String,
        #[command(flatten)]
        input: InputArgs,
        /// Label for the document, e.g. the URL it came from
        #[arg(long, default_value = "stdin")]
        source: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Print index statistics
    Stats,
    /// Empty one namespace, or the whole index
    Clear {
        #[arg(short, long)]
        namespace: Option<String>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn read_input(args: &InputArgs) -> Result<String> {
    match &args.input {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
            Ok(buf)
        }
    }
}

fn load_codec(settings: &Settings) -> Result<Arc<dyn TokenCodec>> {
    let path = settings.tokenizer_path();
    Ok(Arc::new(HfTokenCodec::from_file(&path)?))
}

fn print_chunks(
    settings: &Settings,
    input: &InputArgs,
    max_tokens: Option<usize>,
    overlap_tokens: Option<usize>,
) -> Result<()> {
    let config = ChunkingConfig::new(
        max_tokens.unwrap_or(settings.chunking.max_tokens),
        overlap_tokens.unwrap_or(settings.chunking.overlap_tokens),
    )?;
    let chunker = TextChunker::new(load_codec(settings)?, config)?;
    for chunk in chunker.chunk_text(&read_input(input)?)? {
        println!("{}", serde_json::to_string(&chunk)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Config::load()?.settings()?;
    if let Some(b) = cli.backend {
        settings.index.backend = b.into();
    }
    settings.embedding.use_fake |= cli.fake;
    init_tracing(&settings.log.level);

    if let Command::Chunk { input, max_tokens, overlap_tokens } = &cli.command {
        return print_chunks(&settings, input, *max_tokens, *overlap_tokens);
    }

    let embedder = get_default_embedder(&settings.embedding)?;
    match settings.index.backend {
        BackendKind::Memory => {
            if matches!(cli.command, Command::Index { .. } | Command::Query { .. }) {
                warn!("memory backend does not persist between runs; use --backend lance");
            }
            let index = VectorIndex::in_memory(embedder);
            run(cli.command, &settings, index)
        }
        BackendKind::Lance => {
            let uri = semsearch_core::config::expand_path(&settings.index.uri);
            let store = LanceStore::open(&uri.to_string_lossy(), &settings.index.table, embedder.dim())?;
            run(cli.command, &settings, VectorIndex::with_store(embedder, store))
        }
    }
}

fn run<S: IndexStore>(command: Command, settings: &Settings, index: VectorIndex<S>) -> Result<()> {
    let index = Arc::new(index.with_batch_size(settings.embedding.batch_size).with_progress(true));
    let default_ns = settings.index.namespace.clone();
    let top_k = |k: Option<usize>| k.unwrap_or(settings.search.default_top_k);

    match command {
        Command::Chunk { input, max_tokens, overlap_tokens } => {
            print_chunks(settings, &input, max_tokens, overlap_tokens)?;
        }
        Command::Index { input, namespace } => {
            let engine = engine(settings, index)?;
            let ns = namespace.unwrap_or(default_ns);
            let count = engine.ingest(&ns, &read_input(&input)?)?;
            info!(namespace = %ns, chunks = count, "index complete");
            println!("{count}");
        }
        Command::Query { query, top_k: k, namespace } => {
            let engine = engine(settings, index)?;
            let hits = engine.query(&namespace.unwrap_or(default_ns), &query, top_k(k))?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
        Command::Search { query, input, source, top_k: k } => {
            let engine = engine(settings, index)?;
            let response = engine.search_page(&source, &read_input(&input)?, &query, top_k(k))?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Stats => println!("{}", serde_json::to_string_pretty(&index.stats())?),
        Command::Clear { namespace } => match namespace {
            Some(ns) => index.clear_in(&ns)?,
            None => index.clear()?,
        },
    }
    Ok(())
}

fn engine<S: IndexStore>(settings: &Settings, index: Arc<VectorIndex<S>>) -> Result<PageSearchEngine<S>> {
    let engine = PageSearchEngine::fitted(load_codec(settings)?, settings.chunking, index)?;
    Ok(engine.with_max_top_k(settings.search.max_top_k))
}
