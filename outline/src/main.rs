use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use outline::buffer::LineTable;
use outline::catalog::{CatalogSnapshot, StateCatalog};
use outline::config::EngineConfig;
use outline::core::{Forest, OutlineNode};
use outline::fold::{self, FoldRegion};
use outline::links::{self, Link};
use outline::storage::{DocumentStore, FsDocumentStore};
use outline::sync::CycleOutcome;
use outline::tree;
use outline::{OutlineTreeBuilder, SyncConfig, SyncCoordinator, serialize};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "outline",
    about = "Outline document tooling built on the outline crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Engine config (TOML). Defaults to the per-user config file when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse outline files and print their heading tree.
    Parse(ParseArgs),

    /// Rewrite outline files in canonical form.
    Format(FormatArgs),

    /// List the links found under each heading.
    Links(ListArgs),

    /// List the collapsible regions of each heading.
    Folds(ListArgs),

    /// Cycle the workflow state of one heading and settle its CLOSED stamp.
    Cycle(CycleArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Outline files or directories containing outline files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Outline files or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Outline files or directories to scan.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CycleArgs {
    /// Outline file to edit.
    file: PathBuf,
    /// 1-based line number of the heading.
    #[arg(long)]
    line: usize,
    /// How many times to cycle before the CLOSED decision is made.
    #[arg(long, default_value_t = 1)]
    times: usize,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

/// One parsed document plus the catalog it was parsed with.
struct Document {
    path: PathBuf,
    text: String,
    catalog: StateCatalog,
    forest: Forest,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Parse(args) => handle_parse(args, &config),
        Commands::Format(args) => handle_format(args, &config),
        Commands::Links(args) => handle_links(args, &config),
        Commands::Folds(args) => handle_folds(args, &config),
        Commands::Cycle(args) => handle_cycle(args, &config),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // a second init (tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            EngineConfig::load(path).with_context(|| format!("loading config {:?}", path))
        }
        None => EngineConfig::discover().context("loading the default config"),
    }
}

/// In-band `#+TODO:` keywords win over the configured catalog.
fn catalog_for(text: &str, config: &EngineConfig) -> Result<StateCatalog> {
    match tree::declared_todo_keywords(text) {
        Some(words) => {
            debug!(?words, "using in-band state keywords");
            StateCatalog::from_todo_keywords(&words).context("reading #+TODO keywords")
        }
        None => config.catalog().context("building the configured state catalog"),
    }
}

fn read_document(path: &Path, config: &EngineConfig) -> Result<Document> {
    let text = FsDocumentStore.read_text(path)?;
    let catalog = catalog_for(&text, config).with_context(|| format!("in {:?}", path))?;
    let forest = OutlineTreeBuilder::new(&catalog)
        .with_path(Some(path.to_path_buf()))
        .parse(&text);
    debug!(?path, nodes = forest.len(), "parsed document");
    Ok(Document {
        path: path.to_path_buf(),
        text,
        catalog,
        forest,
    })
}

fn read_inputs(inputs: &[PathBuf], config: &EngineConfig) -> Result<Vec<Document>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no outline files found in the provided inputs");
    }
    expanded
        .iter()
        .map(|path| read_document(path, config))
        .collect()
}

fn print_header(docs: &[Document], idx: usize) {
    if docs.len() > 1 {
        if idx > 0 {
            println!();
        }
        println!("== {} ==", docs[idx].path.display());
    }
}

fn handle_parse(args: ParseArgs, config: &EngineConfig) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let docs = read_inputs(&inputs, config)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            forest: &'a Forest,
        }

        let payload: Vec<JsonOutput<'_>> = docs
            .iter()
            .map(|doc| JsonOutput {
                path: doc.path.display().to_string(),
                forest: &doc.forest,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, doc) in docs.iter().enumerate() {
            print_header(&docs, idx);
            for node in doc.forest.nodes() {
                println!("{}", describe(node));
            }
        }
    }
    Ok(())
}

/// One indented summary line per heading.
fn describe(node: &OutlineNode) -> String {
    let mut line = format!("{}- {}", "  ".repeat(node.depth() - 1), node.title());
    if let Some(state) = node.state() {
        line = format!("{line} [{state}]");
    }
    if !node.tags().is_empty() {
        let tags: Vec<&str> = node.tags().iter().map(String::as_str).collect();
        line = format!("{line} :{}:", tags.join(":"));
    }
    if let Some(deadline) = node.deadline() {
        line = format!("{line} due {deadline}");
    }
    line
}

fn handle_format(args: FormatArgs, config: &EngineConfig) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let docs = read_inputs(&inputs, config)?;

    for (idx, doc) in docs.iter().enumerate() {
        let formatted = serialize(&doc.forest);
        if in_place {
            FsDocumentStore.write_text(&doc.path, &formatted)?;
            info!(path = ?doc.path, "formatted");
        } else {
            print_header(&docs, idx);
            print!("{formatted}");
            if !formatted.ends_with('\n') {
                println!();
            }
        }
    }
    Ok(())
}

#[derive(Debug, serde::Serialize)]
struct NodeLinks<'a> {
    line: Option<usize>,
    title: &'a str,
    links: Vec<Link>,
}

fn collect_links(forest: &Forest) -> Vec<NodeLinks<'_>> {
    forest
        .nodes()
        .into_iter()
        .map(|node| NodeLinks {
            line: node.line().map(|l| l + 1),
            title: node.title(),
            links: links::node_links(node),
        })
        .filter(|entry| !entry.links.is_empty())
        .collect()
}

fn handle_links(args: ListArgs, config: &EngineConfig) -> Result<()> {
    let ListArgs { inputs, json } = args;
    let docs = read_inputs(&inputs, config)?;

    if json {
        let payload: Vec<_> = docs
            .iter()
            .map(|doc| (doc.path.display().to_string(), collect_links(&doc.forest)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    for (idx, doc) in docs.iter().enumerate() {
        print_header(&docs, idx);
        for entry in collect_links(&doc.forest) {
            println!("{}: {}", entry.line.unwrap_or(0), entry.title);
            for link in entry.links {
                println!("  {:<16} {} ({})", format!("{:?}", link.kind), link.target, link.label());
            }
        }
    }
    Ok(())
}

fn handle_folds(args: ListArgs, config: &EngineConfig) -> Result<()> {
    let ListArgs { inputs, json } = args;
    let docs = read_inputs(&inputs, config)?;

    let regions = |doc: &Document| -> Vec<FoldRegion> {
        fold::compute_regions(&doc.forest, &LineTable::new(doc.text.as_str()))
    };

    if json {
        let payload: Vec<_> = docs
            .iter()
            .map(|doc| (doc.path.display().to_string(), regions(doc)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    for (idx, doc) in docs.iter().enumerate() {
        print_header(&docs, idx);
        for region in regions(doc) {
            let title = doc.forest.find(region.node_id).map_or("", OutlineNode::title);
            println!(
                "{:>6}..{:<6} {}{}",
                region.start,
                region.end,
                "*".repeat(region.depth),
                if title.is_empty() { String::new() } else { format!(" {title}") }
            );
        }
    }
    Ok(())
}

/// Cycles the heading on `line` (1-based) `times` times, then settles the CLOSED
/// decision as if the user had stopped cycling.
fn cycle_text(
    text: String,
    catalog: StateCatalog,
    sync: SyncConfig,
    line: usize,
    times: usize,
) -> Result<String> {
    let snapshot = CatalogSnapshot {
        version: 1,
        catalog: Arc::new(catalog),
    };
    let mut coordinator = SyncCoordinator::new(snapshot, sync);
    coordinator.load_from_text(text);

    let offset = line
        .checked_sub(1)
        .and_then(|idx| coordinator.buffer().line_start(idx))
        .with_context(|| format!("line {line} is outside the document"))?;

    for _ in 0..times {
        match coordinator.cycle_state(offset)? {
            CycleOutcome::NotAHeading => anyhow::bail!("line {line} is not a heading"),
            CycleOutcome::Cycled { from, to, .. } | CycleOutcome::TextOnly { from, to, .. } => {
                debug!(?from, ?to, "cycled");
            }
        }
    }
    let report = coordinator.flush()?;
    debug!(?report, "settled");
    Ok(coordinator.text().to_string())
}

fn handle_cycle(args: CycleArgs, config: &EngineConfig) -> Result<()> {
    let CycleArgs {
        file,
        line,
        times,
        in_place,
    } = args;
    let path = fs::canonicalize(&file).with_context(|| format!("resolving path {:?}", file))?;
    let doc = read_document(&path, config)?;
    let updated = cycle_text(doc.text, doc.catalog, config.sync_config(), line, times)
        .with_context(|| format!("cycling {:?}", path))?;

    if in_place {
        FsDocumentStore.write_text(&path, &updated)?;
        println!("Updated {:?}", path);
    } else {
        print!("{updated}");
        if !updated.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn is_outline_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == "org" || ext == "outline")
        .unwrap_or(false)
}

fn collect_outline_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = ?canonical, "scanning directory");
            for file in collect_outline_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_outline_file(&canonical) {
                anyhow::bail!("{:?} is not an outline file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_outline_file(&canonical) {
        debug!(file = ?canonical, "found outline file");
        out.push(canonical);
    }
    Ok(())
}
