//! blockkv command-line tool
//!
//! Creates, inspects and edits a single-file blockkv database. The database
//! holds one B-tree whose header block is recorded in reserved superblock
//! slot 0.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use blockkv_storage::{BTree, BlockStorage, FileBlockStorage, Store, StoreConfig, TreeOptions};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Reserved superblock slot holding the tree header block.
const TREE_SLOT: usize = 0;

#[derive(Parser, Debug)]
#[command(name = "blockkv")]
#[command(about = "Inspect and edit blockkv database files")]
#[command(version)]
struct Args {
    /// Configuration file (TOML, YAML or JSON) with store settings
    #[arg(short, long, env = "BLOCKKV_CONFIG")]
    config: Option<PathBuf>,

    /// Block size in bytes, overrides the configuration file
    #[arg(long)]
    block_size: Option<usize>,

    /// Number of blocks kept in the page cache
    #[arg(long)]
    cache_blocks: Option<usize>,

    /// Database file
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new database with an empty tree
    Init {
        /// Longest key the tree accepts
        #[arg(long, default_value = "64")]
        max_key: u16,
    },
    /// Print superblock, allocator and tree statistics
    Info,
    /// Store a value under a key
    Put {
        key: String,
        /// Value text; omit to read the value from --file
        value: Option<String>,
        /// Read the value from this file instead
        #[arg(short, long, conflicts_with = "value")]
        file: Option<PathBuf>,
    },
    /// Print the value stored under a key
    Get { key: String },
    /// Remove a key
    Del { key: String },
    /// List keys in order
    Scan {
        /// First key to visit
        #[arg(long)]
        from: Option<String>,
        /// Visit keys in descending order
        #[arg(long)]
        reverse: bool,
        /// Stop after this many keys
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Walk the tree and verify its structure
    #[cfg(debug_assertions)]
    Check,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    debug!("store config: {:?}", config);

    match args.command {
        Command::Init { max_key } => init(&args.db, config, max_key),
        command => {
            let store = open_store(&args.db, config)?;
            let result = run(&store, command);
            // Flush even when the command failed part way through
            store.close().context("failed to close database")?;
            result
        }
    }
}

/// Layers the configuration file, `BLOCKKV_*` environment variables and
/// command-line flags, in increasing priority.
fn load_config(args: &Args) -> Result<StoreConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.as_path()).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("BLOCKKV")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let mut store_config: StoreConfig = builder
        .build()
        .context("failed to read configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(block_size) = args.block_size {
        store_config.block_size = block_size;
    }
    if let Some(cache_blocks) = args.cache_blocks {
        store_config.cache_blocks = cache_blocks;
    }
    store_config.validate()?;
    Ok(store_config)
}

fn init(path: &Path, config: StoreConfig, max_key: u16) -> Result<()> {
    let storage = FileBlockStorage::create_new(path, config.block_size)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let store = Store::create(storage, config)?;
    let tree = store.create_tree(TreeOptions::new(max_key))?;
    store.set_reserved_block(TREE_SLOT, tree.header_block())?;
    info!(
        "created {} with tree at block {} (order {})",
        path.display(),
        tree.header_block(),
        tree.order()?
    );
    drop(tree);
    store.close()?;
    Ok(())
}

fn open_store(path: &Path, mut config: StoreConfig) -> Result<Store<FileBlockStorage>> {
    let storage = FileBlockStorage::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    // The file records its own block size
    config.block_size = storage.block_size();
    Ok(Store::open(storage, config)?)
}

fn open_tree(store: &Store<FileBlockStorage>) -> Result<BTree<FileBlockStorage>> {
    let header = store.reserved_block(TREE_SLOT)?;
    if header == 0 {
        bail!("database has no tree; was it created with `init`?");
    }
    let tree = store
        .open_tree(header, TreeOptions::default())
        .with_context(|| format!("failed to open tree at block {}", header))?;
    Ok(tree)
}

fn run(store: &Store<FileBlockStorage>, command: Command) -> Result<()> {
    let tree = open_tree(store)?;
    let mut out = io::stdout().lock();

    match command {
        Command::Init { .. } => bail!("database already holds a tree at block {}", tree.header_block()),
        Command::Info => {
            let sb = store.superblock();
            writeln!(out, "block size:       {}", sb.block_size)?;
            writeln!(out, "database size:    {} blocks", sb.database_size)?;
            writeln!(out, "allocated:        {} blocks", sb.allocated_blocks)?;
            writeln!(out, "freemap root:     {}", sb.freemap_root)?;
            writeln!(out, "freemap depth:    {}", store.freemap_depth())?;
            writeln!(out, "tree header:      {}", tree.header_block())?;
            writeln!(out, "max key length:   {}", tree.max_key_length()?)?;
            writeln!(out, "order:            {}", tree.order()?)?;
            writeln!(out, "height:           {}", tree.height()?)?;
            writeln!(out, "keys:             {}", tree.len()?)?;
            let stats = store.pager_stats();
            writeln!(
                out,
                "page cache:       {}/{} cached, {} hits, {} misses, {} evictions",
                stats.cached, stats.capacity, stats.hits, stats.misses, stats.evictions
            )?;
        }
        Command::Put { key, value, file } => {
            let mut entry = tree.insert(key.as_bytes())?;
            match (value, file) {
                (Some(value), _) => entry.write_value(value.as_bytes())?,
                (None, Some(path)) => {
                    let mut input = File::open(&path)
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    entry.set_value_len(0)?;
                    let copied = io::copy(&mut input, &mut entry.stream())?;
                    debug!("streamed {} bytes into {:?}", copied, key);
                }
                (None, None) => bail!("either a value or --file is required"),
            }
        }
        Command::Get { key } => match tree.get(key.as_bytes())? {
            Some(value) => out.write_all(&value)?,
            None => bail!("key {:?} not found", key),
        },
        Command::Del { key } => {
            if !tree.delete(key.as_bytes())? {
                bail!("key {:?} not found", key);
            }
        }
        Command::Scan {
            from,
            reverse,
            limit,
        } => {
            let entries = match (&from, reverse) {
                (None, false) => tree.ascending(),
                (None, true) => tree.descending(),
                (Some(start), false) => tree.ascending_from(start.as_bytes()),
                (Some(start), true) => tree.descending_from(start.as_bytes()),
            };
            for entry in entries.take(limit.unwrap_or(usize::MAX)) {
                let mut entry = entry?;
                let len = entry.value_len()?;
                writeln!(out, "{}\t{}", String::from_utf8_lossy(entry.key()), len)?;
            }
        }
        #[cfg(debug_assertions)]
        Command::Check => {
            let keys = tree.check_integrity()?;
            writeln!(out, "ok: {} keys", keys)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "blockkv",
            "--block-size",
            "1024",
            "--cache-blocks",
            "32",
            "db.bkv",
            "info",
        ])
        .unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.cache_blocks, 32);
        assert_eq!(config.grow_blocks, StoreConfig::default().grow_blocks);
    }

    #[test]
    fn test_config_file_is_layered_under_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockkv.toml");
        std::fs::write(&path, "block_size = 2048\ngrow_blocks = 128\n").unwrap();

        let config_arg = path.to_str().unwrap();
        let args = Args::try_parse_from([
            "blockkv",
            "--config",
            config_arg,
            "--cache-blocks",
            "64",
            "db.bkv",
            "info",
        ])
        .unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.block_size, 2048);
        assert_eq!(config.grow_blocks, 128);
        assert_eq!(config.cache_blocks, 64);
    }

    #[test]
    fn test_invalid_block_size_is_rejected() {
        let args = Args::try_parse_from(["blockkv", "--block-size", "1000", "db.bkv", "info"]).unwrap();
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_put_requires_value_or_file_not_both() {
        assert!(Args::try_parse_from(["blockkv", "db", "put", "k", "v", "--file", "x"]).is_err());
    }

    #[test]
    fn test_init_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("round.bkv");
        let config = StoreConfig::default().with_block_size(1024).with_cache_blocks(16);
        init(&db, config.clone(), 32).unwrap();

        let store = open_store(&db, config.clone()).unwrap();
        run(
            &store,
            Command::Put {
                key: "alpha".into(),
                value: Some("one".into()),
                file: None,
            },
        )
        .unwrap();
        store.close().unwrap();

        let store = open_store(&db, config).unwrap();
        let tree = open_tree(&store).unwrap();
        assert_eq!(tree.max_key_length().unwrap(), 32);
        assert_eq!(tree.get(b"alpha").unwrap().as_deref(), Some(&b"one"[..]));
        drop(tree);
        store.close().unwrap();
    }
}
