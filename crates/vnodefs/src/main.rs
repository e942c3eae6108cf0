#![deny(unsafe_code)]

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use tracing::{debug, instrument};
use tracing_subscriber::EnvFilter;

use vnodefs::{
    Backend, DirEntry, MountConfig, NodeId, NodeType, PassthroughBackend, RefCountingKernel,
    VolumeService,
};

/// Browse a host directory through the node-id volume layer
#[derive(Parser)]
#[command(name = "vnodefs")]
#[command(author, version)]
#[command(after_help = "EXAMPLES:
    # Print the tree below /usr/share/doc, two levels deep
    vnodefs /usr/share/doc tree --depth 2

    # Stat a file through the volume
    vnodefs ~/src stat project/Cargo.toml

    # Volume information and counters after a full walk
    vnodefs --stable-ids ~/src info
")]
struct Cli {
    /// Directory to serve
    source: PathBuf,

    /// Use the host inode numbers as node ids
    #[arg(long, env = "VNODEFS_STABLE_IDS")]
    stable_ids: bool,

    /// Maximum node tree depth
    #[arg(long, value_name = "N")]
    max_depth: Option<usize>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the directory tree
    Tree {
        /// Directory to start from, relative to the source
        #[arg(default_value = "")]
        path: String,

        /// Levels to descend
        #[arg(short, long, default_value = "3")]
        depth: usize,
    },

    /// Show attributes of one object
    Stat {
        path: String,
    },

    /// Write a file's contents to stdout
    Cat {
        path: String,
    },

    /// Show volume information and counters
    Info {
        /// Walk the whole tree first so the counters mean something
        #[arg(long)]
        walk: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let backend = PassthroughBackend::new(&cli.source)
        .with_context(|| format!("cannot serve {}", cli.source.display()))?;

    let mut config = MountConfig::default().with_node_ids(cli.stable_ids);
    if let Some(depth) = cli.max_depth {
        config = config.with_max_tree_depth(depth);
    }

    let kernel = Arc::new(RefCountingKernel::new());
    let volume = VolumeService::new(Backend::path(backend), Arc::clone(&kernel) as _, config);
    let root = volume.mount().context("mount failed")?;
    debug!(root, "volume mounted");

    let result = match &cli.command {
        Commands::Tree { path, depth } => tree(&volume, root, path, *depth),
        Commands::Stat { path } => stat(&volume, root, path),
        Commands::Cat { path } => cat(&volume, root, path),
        Commands::Info { walk } => info(&volume, root, *walk),
    };

    volume.unmount().context("unmount failed")?;
    debug!(vnodes = kernel.vnode_count(), "kernel references after unmount");
    result
}

/// Walk `path` from `root`. The returned node carries a kernel reference.
fn resolve(volume: &VolumeService, root: NodeId, path: &str) -> Result<NodeId> {
    let mut current = root;
    let mut owned = false;
    for name in path.split('/').filter(|c| !c.is_empty()) {
        let next = volume.lookup(current, name);
        if owned {
            volume.put_vnode(current);
        }
        current = next.with_context(|| format!("cannot resolve {path}: {name}"))?;
        owned = true;
    }
    if !owned {
        // Callers always put what they get back.
        volume.lookup(root, ".").context("cannot reference root")?;
    }
    Ok(current)
}

fn list(volume: &VolumeService, dir: NodeId) -> Result<Vec<DirEntry>> {
    let cookie = volume.open_dir(dir).context("open_dir failed")?;
    let mut entries = Vec::new();
    let result = loop {
        match volume.read_dir(dir, cookie, 64, 16 * 1024) {
            Ok(batch) if batch.is_empty() => break Ok(()),
            Ok(batch) => entries.extend(batch),
            Err(e) => break Err(e),
        }
    };
    volume.close_dir(dir, cookie)?;
    volume.free_dir_cookie(dir, cookie)?;
    result.context("read_dir failed")?;
    Ok(entries)
}

#[instrument(level = "info", name = "cmd::tree", skip(volume, root))]
fn tree(volume: &VolumeService, root: NodeId, path: &str, depth: usize) -> Result<()> {
    let dir = resolve(volume, root, path)?;
    let mut out = io::stdout().lock();
    writeln!(out, "{}", if path.is_empty() { "/" } else { path })?;
    let result = print_tree(volume, dir, depth, "", &mut out);
    volume.put_vnode(dir);
    result
}

fn print_tree(
    volume: &VolumeService,
    dir: NodeId,
    depth: usize,
    prefix: &str,
    out: &mut impl Write,
) -> Result<()> {
    if depth == 0 {
        return Ok(());
    }
    let mut entries: Vec<_> = list(volume, dir)?
        .into_iter()
        .filter(|e| e.name != "." && e.name != "..")
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let count = entries.len();
    for (i, entry) in entries.into_iter().enumerate() {
        let last = i + 1 == count;
        let branch = if last { "└── " } else { "├── " };
        let suffix = if entry.node_type.is_dir() { "/" } else { "" };
        writeln!(out, "{prefix}{branch}{}{suffix}", entry.name)?;

        if entry.node_type.is_dir() {
            let child = volume.lookup(dir, &entry.name)?;
            let nested = format!("{prefix}{}", if last { "    " } else { "│   " });
            let result = print_tree(volume, child, depth - 1, &nested, out);
            volume.put_vnode(child);
            result?;
        }
    }
    Ok(())
}

fn stat(volume: &VolumeService, root: NodeId, path: &str) -> Result<()> {
    let node = resolve(volume, root, path)?;
    let result = volume.read_stat(node);
    let name = volume.get_vnode_name(node).unwrap_or_else(|_| path.to_owned());
    volume.put_vnode(node);
    let st = result.with_context(|| format!("stat {path}"))?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["name".to_string(), name]);
    table.add_row(vec!["node".to_string(), st.ino.to_string()]);
    table.add_row(vec!["type".to_string(), st.node_type().label().to_string()]);
    table.add_row(vec!["mode".to_string(), format!("{:o}", st.mode & 0o7777)]);
    table.add_row(vec!["links".to_string(), st.nlink.to_string()]);
    table.add_row(vec!["uid:gid".to_string(), format!("{}:{}", st.uid, st.gid)]);
    table.add_row(vec!["size".to_string(), st.size.to_string()]);
    table.add_row(vec!["mtime".to_string(), format!("{}.{:09}", st.mtime.sec, st.mtime.nsec)]);
    println!("{table}");
    Ok(())
}

fn cat(volume: &VolumeService, root: NodeId, path: &str) -> Result<()> {
    let node = resolve(volume, root, path)?;
    let result = copy_out(volume, node);
    volume.put_vnode(node);
    result.with_context(|| format!("cat {path}"))
}

fn copy_out(volume: &VolumeService, node: NodeId) -> Result<()> {
    let st = volume.read_stat(node)?;
    if st.node_type() != NodeType::File {
        bail!("not a regular file");
    }
    let cookie = volume.open(node, libc::O_RDONLY)?;
    let mut out = io::stdout().lock();
    let mut pos = 0u64;
    let result = loop {
        match volume.read(node, cookie, pos, 64 * 1024) {
            Ok(chunk) if chunk.is_empty() => break Ok(()),
            Ok(chunk) => {
                out.write_all(&chunk)?;
                pos += chunk.len() as u64;
            }
            Err(e) => break Err(e),
        }
    };
    volume.close(node, cookie)?;
    volume.free_cookie(node, cookie)?;
    Ok(result?)
}

fn walk(volume: &VolumeService, dir: NodeId) -> Result<()> {
    for entry in list(volume, dir)? {
        if entry.name == "." || entry.name == ".." || !entry.node_type.is_dir() {
            continue;
        }
        let child = volume.lookup(dir, &entry.name)?;
        let result = walk(volume, child);
        volume.put_vnode(child);
        result?;
    }
    Ok(())
}

fn info(volume: &VolumeService, root: NodeId, walk_tree: bool) -> Result<()> {
    if walk_tree {
        walk(volume, root)?;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["Volume", ""]);
    table.add_row(vec!["name".to_string(), volume.name().to_string()]);
    table.add_row(vec!["stable ids".to_string(), volume.config().use_node_ids.to_string()]);
    table.add_row(vec!["capabilities".to_string(), format!("{:?}", volume.capabilities())]);
    match volume.read_fs_info() {
        Ok(fs) => {
            table.add_row(vec!["block size".to_string(), fs.block_size.to_string()]);
            table.add_row(vec!["io size".to_string(), fs.io_size.to_string()]);
            table.add_row(vec!["blocks".to_string(), format!("{} ({} free)", fs.total_blocks, fs.free_blocks)]);
            table.add_row(vec!["nodes".to_string(), fs.total_nodes.to_string()]);
        }
        Err(e) => {
            table.add_row(vec!["fs info".to_string(), format!("unavailable: {e}")]);
        }
    }
    println!("{table}");

    let stats = volume.stats();
    let mut counters = Table::new();
    counters.load_preset(UTF8_FULL_CONDENSED);
    counters.set_header(vec!["Counter", "Value"]);
    for (name, value) in stats.rows() {
        counters.add_row(vec![name.to_string(), value.to_string()]);
    }
    counters.add_row(vec!["live nodes".to_string(), stats.live_nodes().to_string()]);
    let graph = volume.graph().lock();
    counters.add_row(vec!["graph entries".to_string(), graph.entry_count().to_string()]);
    drop(graph);
    println!("{counters}");
    Ok(())
}
