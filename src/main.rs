//! dirscope - Disk usage analyzer with a persistent scan cache.
//!
//! Usage:
//!   dscope scan [PATH]                 Scan (incrementally) and show summary
//!   dscope query PATH                  Show the cached record for a path
//!   dscope stale --older-than AGE      List records not confirmed recently
//!   dscope purge --older-than AGE      Delete old tombstones
//!   dscope forget PATH                 Drop cached records below a path
//!   dscope --help                      Show help

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Context, Result, bail};
use tracing_subscriber::EnvFilter;

use dirscope_core::EntryKind;
use dirscope_session::{
    CacheRecord, Coordinator, CoordinatorConfig, ScanPolicy, SessionHandle, TreeNode,
};

#[derive(Parser)]
#[command(
    name = "dirscope",
    version,
    about = "Disk usage analyzer with a persistent scan cache",
    long_about = "dirscope shows where your disk space goes.\n\n\
                  Results are cached, so scanning the same directory again only \
                  re-reads the parts that changed."
)]
struct Cli {
    /// Cache database location (overrides the config file)
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Worker threads for subtree walks (0 = number of CPUs)
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a directory and show summary
    Scan {
        /// Path to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        #[command(flatten)]
        policy: PolicyArgs,

        /// Maximum depth to display
        #[arg(short, long, default_value = "2")]
        depth: u32,

        /// Number of top entries to show per directory
        #[arg(short = 'n', long, default_value = "10")]
        top: usize,
    },

    /// Show the cached record for a path without scanning
    Query {
        /// Path to look up
        path: PathBuf,
    },

    /// List live records not confirmed within the given age
    Stale {
        /// Age threshold (e.g. "30d", "12h", "1w"; plain numbers are days)
        #[arg(long, default_value = "30d")]
        older_than: String,
    },

    /// Delete tombstoned records older than the given age
    Purge {
        /// Age threshold (e.g. "30d", "12h", "1w"; plain numbers are days)
        #[arg(long, default_value = "30d")]
        older_than: String,
    },

    /// Remove every cached record at or below a path
    Forget {
        /// Path whose records are dropped
        path: PathBuf,
    },
}

#[derive(Args)]
struct PolicyArgs {
    /// Resolve symlink targets (targets are never descended)
    #[arg(long)]
    follow_symlinks: bool,

    /// Descend into other filesystems
    #[arg(long)]
    cross_fs: bool,

    /// Limit traversal depth (depth-limited scans bypass the cache)
    #[arg(long)]
    max_depth: Option<u32>,

    /// Glob pattern of names to skip (repeatable)
    #[arg(short, long = "ignore")]
    ignore: Vec<String>,

    /// Skip hidden entries
    #[arg(long)]
    no_hidden: bool,

    /// Re-check every cached directory, not only changed ones
    #[arg(long)]
    deep_verify: bool,
}

impl PolicyArgs {
    fn to_policy(&self) -> Result<ScanPolicy> {
        ScanPolicy::builder()
            .follow_symlinks(self.follow_symlinks)
            .cross_filesystems(self.cross_fs)
            .max_depth(self.max_depth)
            .ignore_patterns(self.ignore.clone())
            .include_hidden(!self.no_hidden)
            .deep_verify(self.deep_verify)
            .build()
            .context("Invalid scan policy")
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();
    let coordinator = open_coordinator(&cli)?;

    match cli.command {
        Command::Scan {
            path,
            policy,
            depth,
            top,
        } => run_scan(&coordinator, &path, policy.to_policy()?, depth, top)?,
        Command::Query { path } => run_query(&coordinator, &path)?,
        Command::Stale { older_than } => run_stale(&coordinator, parse_duration(&older_than)?)?,
        Command::Purge { older_than } => {
            let purged = coordinator
                .purge_tombstones(parse_duration(&older_than)?)
                .context("Purge failed")?;
            println!("Purged {purged} tombstoned record(s)");
        }
        Command::Forget { path } => {
            let removed = coordinator.forget(&path).context("Forget failed")?;
            println!("Removed {removed} record(s) under {}", path.display());
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_coordinator(cli: &Cli) -> Result<Coordinator> {
    let mut config = match &cli.config {
        Some(path) => CoordinatorConfig::load_from(path).context("Failed to load config")?,
        None => CoordinatorConfig::load(),
    };
    if let Some(cache) = &cli.cache {
        config.cache_path = cache.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    tracing::debug!(cache = %config.cache_path.display(), workers = config.workers, "opening cache");
    Coordinator::new(config).context("Failed to open cache")
}

/// Run a scan and display summary.
fn run_scan(
    coordinator: &Coordinator,
    path: &Path,
    policy: ScanPolicy,
    max_depth: u32,
    top_n: usize,
) -> Result<()> {
    let handle = coordinator.start_scan(path, policy).context("Scan failed to start")?;
    let root = handle.root().to_path_buf();
    eprintln!("Scanning {}...", root.display());

    wait_with_progress(&handle);
    let outcome = handle.wait().context("Scan failed")?;
    let tree = &outcome.tree;
    let summary = &outcome.summary;

    println!();
    println!("{}", "─".repeat(60));
    println!(" {} - {}", root.display(), format_size(tree.total_size()));
    println!(
        " {} files, {} directories",
        tree.stats.total_files, tree.stats.total_dirs
    );
    println!(" Scanned in {:.2}s", tree.scan_duration.as_secs_f64());
    println!(
        " {} listed, {} re-walked, {} reused, {} revived, {} tombstoned",
        summary.dirs_listed,
        summary.dirs_rewalked(),
        summary.subtrees_reused,
        summary.subtrees_revived,
        summary.paths_tombstoned
    );
    if let Some((largest, size)) = &tree.stats.largest_file {
        println!(" Largest file: {} ({})", largest.display(), format_size(*size));
    }
    println!("{}", "─".repeat(60));
    println!();

    print_node(&tree.root, &root, 0, max_depth, top_n, tree.root.size);

    if tree.has_warnings() {
        println!();
        println!("{} warning(s) during scan", tree.warnings.len());
        for warning in tree.warnings.iter().take(top_n) {
            println!("  {}", warning.message());
        }
    }

    Ok(())
}

/// Show live progress on stderr until the session finishes.
fn wait_with_progress(handle: &SessionHandle) {
    while !handle.is_finished() {
        let progress = handle.progress();
        eprint!(
            "\r {:<12} {:>10} entries {:>10}",
            progress.state.to_string(),
            progress.entries_scanned,
            format_size(progress.bytes_scanned)
        );
        thread::sleep(Duration::from_millis(200));
    }
    eprintln!();
}

/// Show a cached record.
fn run_query(coordinator: &Coordinator, path: &Path) -> Result<()> {
    let Some(record) = coordinator.query_cache(path).context("Query failed")? else {
        bail!("No cached record for {}", path.display());
    };

    println!("{}", path.display());
    println!("  kind:          {}", kind_label(record.kind));
    println!("  size:          {}", format_size(record.size));
    if record.is_dir() {
        println!("  files:         {}", record.file_count);
    }
    println!("  errors:        {}", record.error_count);
    if let Some(error) = &record.error {
        println!("  error:         {error}");
    }
    if let Some(link) = &record.link {
        let broken = if link.broken { " (broken)" } else { "" };
        println!("  target:        {}{broken}", link.target);
    }
    println!("  modified:      {}", format_time(record.modified));
    println!("  last scanned:  {}", format_time(record.last_scanned));
    if let Some(at) = record.tombstoned_at {
        println!("  missing since: {}", format_time(at));
    }
    if let Some(fingerprint) = &record.fingerprint {
        println!("  fingerprint:   {}", fingerprint.to_hex());
    }
    Ok(())
}

/// List stale records.
fn run_stale(coordinator: &Coordinator, max_age: Duration) -> Result<()> {
    let stale = coordinator.list_stale(max_age).context("Stale query failed")?;
    if stale.is_empty() {
        println!("No stale records.");
        return Ok(());
    }

    for (path, record) in &stale {
        print_record_line(path, record);
    }
    println!();
    println!("{} stale record(s)", stale.len());
    Ok(())
}

fn print_record_line(path: &Path, record: &CacheRecord) {
    println!(
        "{:>10}  {}  {}{}",
        format_size(record.size),
        format_time(record.last_scanned),
        path.display(),
        if record.is_dir() { "/" } else { "" }
    );
}

/// Print a node and its largest children.
fn print_node(node: &TreeNode, path: &Path, depth: u32, max_depth: u32, top_n: usize, root_size: u64) {
    let indent = "  ".repeat(depth as usize);
    let ratio = if root_size > 0 {
        node.size as f64 / root_size as f64 * 100.0
    } else {
        0.0
    };

    let bar = make_bar(ratio / 100.0, 10);

    let name = if depth == 0 {
        path.display().to_string()
    } else {
        node.name.to_string()
    };

    let dir_marker = if node.is_dir() { "/" } else { "" };
    let error_marker = if node.error.is_some() { " !" } else { "" };

    println!(
        "{}{}{:<40} {:>10} {:>5.1}% {}{}",
        indent,
        if node.is_dir() { "▼ " } else { "  " },
        truncate(&format!("{name}{dir_marker}"), 40),
        format_size(node.size),
        ratio,
        bar,
        error_marker
    );

    if node.is_dir() && depth < max_depth {
        for child in node.children_by_size().take(top_n) {
            let child_path = path.join(child.name.as_str());
            print_node(child, &child_path, depth + 1, max_depth, top_n, root_size);
        }

        let remaining = node.child_count().saturating_sub(top_n);
        if remaining > 0 {
            let indent = "  ".repeat((depth + 1) as usize);
            println!("{indent}  ... and {remaining} more");
        }
    }
}

fn kind_label(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::File => "file",
        EntryKind::Directory => "directory",
        EntryKind::Symlink => "symlink",
        EntryKind::Special => "special",
        EntryKind::Inaccessible => "inaccessible",
    }
}

/// Create a simple ASCII bar.
fn make_bar(ratio: f64, width: usize) -> String {
    let filled = (ratio * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

fn format_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Truncate a string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

/// Parse a duration string (e.g., "30d", "1w", "12h"). Plain numbers are days.
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num, multiplier) = if let Some(n) = s.strip_suffix('w') {
        (n.parse::<f64>()?, 7.0 * 24.0 * 60.0 * 60.0)
    } else if let Some(n) = s.strip_suffix('d') {
        (n.parse::<f64>()?, 24.0 * 60.0 * 60.0)
    } else if let Some(n) = s.strip_suffix('h') {
        (n.parse::<f64>()?, 60.0 * 60.0)
    } else {
        (s.parse::<f64>()?, 24.0 * 60.0 * 60.0)
    };

    if !num.is_finite() || num < 0.0 {
        bail!("Invalid age: {s}");
    }
    match Duration::try_from_secs_f64(num * multiplier) {
        Ok(age) => Ok(age),
        Err(_) => bail!("Age out of range: {s}"),
    }
}
