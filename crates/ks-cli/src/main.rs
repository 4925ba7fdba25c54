mod clients;
mod config;
mod http;
mod server;
mod service;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rmcp::{ServiceExt, transport::stdio};

use ks_store::{KernelExport, Store, TensionSignal};

use crate::config::Config;
use crate::service::{Document, KernelService, parse_direction};

#[derive(Parser)]
#[command(name = "ks", about = "Kernel Studio: tension retrieval and refusal over a person's writings")]
struct Cli {
    /// Kernel to operate on
    #[arg(long, global = true)]
    kernel: Option<String>,

    /// Config file (default: <data dir>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a kernel and print its id
    Create {
        /// Display name
        name: String,
        #[arg(long, default_value = "")]
        bio: String,
        #[arg(long, default_value = "")]
        era: String,
    },

    /// List kernels
    List,

    /// Delete a kernel and everything ingested into it
    Delete {
        /// Kernel id
        id: String,
    },

    /// Ingest text documents (.txt, .md) into the selected kernel
    Ingest {
        /// File path(s) to ingest
        files: Vec<PathBuf>,

        /// Ingest all matching files in a directory
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Ask the selected kernel a question
    Query {
        /// Question text
        text: String,

        /// Mask to boost (repeatable)
        #[arg(long = "mask")]
        masks: Vec<String>,
    },

    /// List tensions, highest scar first
    Tensions {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the concept graph as JSON
    Graph,

    /// Show kernel statistics
    Stats,

    /// Update a tension's signals
    Mark {
        /// Tension id
        tension_id: String,

        /// Remembered cost in [0, 1]
        #[arg(long)]
        scar: Option<f64>,

        /// Refusal flag
        #[arg(long)]
        refusal: Option<bool>,

        /// toward_a, toward_b, balanced or unknown
        #[arg(long)]
        direction: Option<String>,
    },

    /// Export the selected kernel to a JSON file
    Export {
        /// Output file path
        path: PathBuf,
    },

    /// Import a kernel from a JSON file
    Import {
        /// Input file path
        path: PathBuf,
    },

    /// Start MCP server on stdio transport
    Serve,

    /// Start the HTTP API
    Http {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

fn data_dir() -> PathBuf {
    std::env::var("KS_DATA_DIR")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(ks_store::default_base_dir)
}

fn open_service(data_dir: &Path, config: &Config) -> Result<KernelService> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let store = Store::open(&data_dir.join(ks_store::DB_FILE)).context("failed to open store")?;
    let embedder = clients::build_embedder(&config.embedding)?;
    let generator = clients::build_generator(&config.generator)?;
    let mut service = KernelService::new(store, embedder, generator, config.engine.clone())
        .context("invalid engine settings")?;
    if let Some(workers) = config.embedding.workers {
        service = service.with_workers(workers);
    }
    Ok(service)
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let data_dir = data_dir();
    let config = Config::load(cli.config.as_deref(), &data_dir)?;
    let service = open_service(&data_dir, &config)?;

    match &cli.command {
        Commands::Create { name, bio, era } => cmd_create(&service, name, bio, era),
        Commands::List => cmd_list(&service),
        Commands::Delete { id } => cmd_delete(&service, id),
        Commands::Ingest { files, dir } => cmd_ingest(&cli, &service, files, dir.as_deref()),
        Commands::Query { text, masks } => cmd_query(&cli, &service, text, masks),
        Commands::Tensions { limit } => cmd_tensions(&cli, &service, *limit),
        Commands::Graph => cmd_graph(&cli, &service),
        Commands::Stats => cmd_stats(&cli, &service),
        Commands::Mark {
            tension_id,
            scar,
            refusal,
            direction,
        } => cmd_mark(&cli, &service, tension_id, *scar, *refusal, direction.as_deref()),
        Commands::Export { path } => cmd_export(&cli, &service, path),
        Commands::Import { path } => cmd_import(&service, path),
        Commands::Serve => cmd_serve(&cli, service),
        Commands::Http { host, port } => {
            let host = host.clone().unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            cmd_http(service, &host, port)
        }
    }
}

fn selected_kernel(cli: &Cli) -> Result<&str> {
    cli.kernel
        .as_deref()
        .context("no kernel selected; pass --kernel <id> (see `ks list`)")
}

/// Async surfaces get their own runtime. The service, and the blocking HTTP
/// clients inside it, is dropped on this thread after the runtime is gone.
fn run_async<F>(service: KernelService, f: impl FnOnce(Arc<KernelService>) -> F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let service = Arc::new(service);
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let result = runtime.block_on(f(Arc::clone(&service)));
    drop(runtime);
    drop(service);
    result
}

fn cmd_serve(cli: &Cli, service: KernelService) -> Result<()> {
    let default_kernel = cli.kernel.clone();
    run_async(service, |service| async move {
        tracing::info!("starting MCP server");
        let server = server::KsServer::new(service, default_kernel);
        let running = server
            .serve(stdio())
            .await
            .context("failed to start MCP server")?;
        running.waiting().await?;
        Ok(())
    })
}

fn cmd_http(service: KernelService, host: &str, port: u16) -> Result<()> {
    run_async(service, |service| async move { http::serve(service, host, port).await })
}

fn cmd_create(service: &KernelService, name: &str, bio: &str, era: &str) -> Result<()> {
    let record = service
        .create_kernel(name, bio, era)
        .context("failed to create kernel")?;
    println!("created {} ({})", record.profile.id, record.profile.display_name());
    Ok(())
}

fn cmd_list(service: &KernelService) -> Result<()> {
    let kernels = service.list_kernels().context("failed to list kernels")?;
    if kernels.is_empty() {
        println!("(no kernels)");
    }
    for k in kernels {
        println!(
            "{}  {:<5}  {}",
            k.profile.id,
            k.status.as_str(),
            k.profile.display_name()
        );
    }
    Ok(())
}

fn cmd_delete(service: &KernelService, id: &str) -> Result<()> {
    service
        .delete_kernel(id)
        .with_context(|| format!("failed to delete kernel {id}"))?;
    println!("deleted {id}");
    Ok(())
}

fn cmd_ingest(cli: &Cli, service: &KernelService, files: &[PathBuf], dir: Option<&Path>) -> Result<()> {
    let kernel = selected_kernel(cli)?;
    let mut paths: Vec<PathBuf> = files.to_vec();

    if let Some(dir) = dir {
        let entries =
            fs::read_dir(dir).with_context(|| format!("failed to read dir {}", dir.display()))?;
        let mut found: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|ext| matches!(ext, "txt" | "md"))
            })
            .collect();
        found.sort();
        paths.extend(found);
    }
    anyhow::ensure!(!paths.is_empty(), "nothing to ingest; pass files or --dir");

    let mut documents = Vec::with_capacity(paths.len());
    for path in &paths {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("unnamed");
        documents.push(Document::new(name, text));
    }

    let report = service
        .ingest(kernel, &documents)
        .context("ingest failed")?;
    for doc in &report.documents {
        println!(
            "ingested {} → {} chunks, {} tensions",
            doc.name, doc.chunks, doc.tensions
        );
    }
    for skipped in &report.skipped {
        eprintln!("skipped {}: {}", skipped.name, skipped.error);
    }
    println!(
        "done. chunks={}, tensions={}, edges={}",
        report.stats.chunks, report.stats.tensions, report.stats.edges
    );
    Ok(())
}

fn cmd_query(cli: &Cli, service: &KernelService, text: &str, masks: &[String]) -> Result<()> {
    let kernel = selected_kernel(cli)?;
    let outcome = service
        .chat(kernel, text, masks)
        .context("query failed")?;
    println!("{}", outcome.answer);

    if let Some(refusal) = &outcome.refusal {
        eprintln!("--- refused: {} ---", refusal.code);
    }
    if cli.verbose {
        eprintln!(
            "--- policy={:?}, method={:?}, tensions={}, chunks={}, excluded={} ---",
            service.policy(),
            outcome.trace.method,
            outcome.trace.tensions_used,
            outcome.trace.chunks_used,
            outcome.pack.excluded
        );
        if let Some(reason) = &outcome.trace.fallback_reason {
            eprintln!("--- fallback: {reason} ---");
        }
    }
    Ok(())
}

fn cmd_tensions(cli: &Cli, service: &KernelService, limit: usize) -> Result<()> {
    let kernel = selected_kernel(cli)?;
    let tensions = service
        .tensions(kernel, limit)
        .context("failed to load tensions")?;
    if tensions.is_empty() {
        println!("(no tensions)");
    }
    for t in tensions {
        println!(
            "{}  {} vs {}  scar={:.2}  {}{}",
            t.id,
            t.pole_a,
            t.pole_b,
            t.scar_valence,
            t.collapse_direction.as_str(),
            if t.refusal { "  refusal" } else { "" }
        );
    }
    Ok(())
}

fn cmd_graph(cli: &Cli, service: &KernelService) -> Result<()> {
    let kernel = selected_kernel(cli)?;
    let graph = service.graph(kernel).context("failed to load graph")?;
    println!("{}", serde_json::to_string_pretty(&graph)?);
    Ok(())
}

fn cmd_stats(cli: &Cli, service: &KernelService) -> Result<()> {
    let kernel = selected_kernel(cli)?;
    let record = service.get_kernel(kernel).context("failed to load kernel")?;
    let stats = service.stats(kernel).context("failed to load stats")?;

    println!("kernel:     {} ({})", record.profile.id, record.profile.display_name());
    println!("status:     {}", record.status.as_str());
    println!("chunks:     {}", stats.chunks);
    println!("tensions:   {}", stats.tensions);
    println!("refusals:   {}", stats.refusal_tensions);
    println!("edges:      {}", stats.edges);
    println!("nodes:      {}", stats.nodes);
    Ok(())
}

fn cmd_mark(
    cli: &Cli,
    service: &KernelService,
    tension_id: &str,
    scar: Option<f64>,
    refusal: Option<bool>,
    direction: Option<&str>,
) -> Result<()> {
    let kernel = selected_kernel(cli)?;
    let signal = TensionSignal {
        scar_valence: scar,
        refusal,
        collapse_direction: direction.map(parse_direction).transpose()?,
    };
    let t = service
        .mark_tension(kernel, tension_id, &signal)
        .with_context(|| format!("failed to mark tension {tension_id}"))?;
    println!(
        "marked {}: {} vs {}  scar={:.2}  {}  refusal={}",
        t.id,
        t.pole_a,
        t.pole_b,
        t.scar_valence,
        t.collapse_direction.as_str(),
        t.refusal
    );
    Ok(())
}

fn cmd_export(cli: &Cli, service: &KernelService, path: &Path) -> Result<()> {
    let kernel = selected_kernel(cli)?;
    let export = service.export(kernel).context("failed to export kernel")?;
    let json = serde_json::to_string_pretty(&export).context("failed to serialize kernel")?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;

    println!(
        "exported {} to {} ({} chunks, {} tensions)",
        kernel,
        path.display(),
        export.chunks.len(),
        export.tensions.len()
    );
    Ok(())
}

fn cmd_import(service: &KernelService, path: &Path) -> Result<()> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let export: KernelExport = serde_json::from_str(&raw).context("invalid kernel JSON")?;
    let record = service.import(export).context("failed to import kernel")?;
    println!(
        "imported {} ({}) from {}",
        record.profile.id,
        record.profile.display_name(),
        path.display()
    );
    Ok(())
}
