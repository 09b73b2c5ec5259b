//! LakeMeta CLI - Diagnostics for an on-disk entity store
//!
//! Inspects the binary keys, name mappings and transaction mark of a store
//! directory. Only `next-id` writes (it advances the transaction mark).

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lakemeta_common::config::KV_PATH;
use lakemeta_common::{EntityKind, KvConfig, NamePath};
use lakemeta_kv::{
    BinaryEntityKeyEncoder, NameMappingService, OrderedByteStore, RandomIdGenerator,
    StoreOptions, TransactionIdGenerator, VersionedValue, tables, txn,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "lakemeta-cli")]
#[command(about = "LakeMeta KV store diagnostics")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "/etc/lakemeta/kv.toml")]
    config: String,

    /// Store directory (overrides the configuration file)
    #[arg(long, env = "LAKEMETA_KV_PATH")]
    path: Option<PathBuf>,

    /// Extra configuration setting, e.g. --set lakemeta.entity.store.kv.options.durability=none
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    settings: Vec<(String, String)>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dump stored entries
    Scan {
        /// Only keys of this entity kind (name or short code)
        #[arg(short, long, conflicts_with = "prefix")]
        kind: Option<EntityKind>,
        /// Only keys starting with this hex prefix
        #[arg(short, long)]
        prefix: Option<String>,
        /// Maximum number of entries
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
    /// Decode a hex encoded key
    Decode {
        /// Key bytes in hex
        key: String,
    },
    /// Show the key of a dotted path without allocating ids
    Resolve {
        /// Entity kind (name or short code)
        kind: EntityKind,
        /// Dotted path, e.g. metalake1.catalog2
        path: NamePath,
    },
    /// List name mappings
    Names,
    /// Show the transaction high-water mark
    Mark,
    /// Issue transaction ids (advances the mark)
    NextId {
        /// Number of ids
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
}

/// Parse a `key=value` pair
fn parse_key_value(s: &str) -> Result<(String, String)> {
    let Some((key, value)) = s.split_once('=') else {
        bail!("expected KEY=VALUE, got '{s}'");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("empty key in '{s}'");
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Flatten nested TOML tables into dotted keys
fn flatten(prefix: &str, value: &toml::Value, out: &mut HashMap<String, String>) {
    match value {
        toml::Value::Table(table) => {
            for (key, child) in table {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&key, child, out);
            }
        }
        toml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

fn load_config(args: &Args) -> Result<KvConfig> {
    let mut settings = HashMap::new();

    if Path::new(&args.config).exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config))?;
        let value: toml::Value =
            toml::from_str(&text).with_context(|| format!("parsing {}", args.config))?;
        flatten("", &value, &mut settings);
        debug!("Loaded {} setting(s) from {}", settings.len(), args.config);
    }

    if let Some(path) = &args.path {
        settings.insert(KV_PATH.to_string(), path.display().to_string());
    }
    for (key, value) in &args.settings {
        settings.insert(key.clone(), value.clone());
    }

    Ok(KvConfig::from_map(&settings)?)
}

fn open_store(config: &KvConfig) -> Result<Arc<OrderedByteStore>> {
    let options = StoreOptions::from_map(&config.store.options)?;
    let store = OrderedByteStore::open(&config.store.path, &options)
        .with_context(|| format!("opening store at {}", config.store.path.display()))?;
    Ok(Arc::new(store))
}

fn build_encoder(store: &Arc<OrderedByteStore>, config: &KvConfig) -> BinaryEntityKeyEncoder {
    let mapping = NameMappingService::new(
        Arc::clone(store),
        Arc::new(RandomIdGenerator),
        &config.mapping,
    );
    BinaryEntityKeyEncoder::new(Arc::new(mapping))
}

/// One line per stored entry
fn describe(encoder: &BinaryEntityKeyEncoder, key: &[u8], value: &[u8]) -> String {
    let key_hex = hex::encode(key);
    if key == tables::LAST_TIMESTAMP {
        return format!("{key_hex}  <transaction mark>");
    }
    if key.starts_with(tables::NAME_PREFIX) || key.starts_with(tables::ID_PREFIX) {
        return format!("{key_hex}  <name mapping, {} byte value>", value.len());
    }
    let entity = match encoder.decode(key) {
        Ok((kind, path)) => format!("{kind} {path}"),
        Err(e) => format!("<{e}>"),
    };
    match VersionedValue::from_bytes(value) {
        Ok(v) => format!(
            "{key_hex}  {entity}  version={} payload={} bytes",
            v.version,
            v.payload.len()
        ),
        Err(_) => format!("{key_hex}  {entity}  <{} raw bytes>", value.len()),
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    let store = open_store(&config)?;

    match args.command {
        Commands::Scan {
            kind,
            prefix,
            limit,
        } => {
            let prefix = match (kind, prefix) {
                (Some(kind), _) => {
                    let mut prefix = kind.short_code().to_vec();
                    prefix.push(lakemeta_kv::encoder::SEPARATOR);
                    prefix
                }
                (None, Some(hex_prefix)) => {
                    hex::decode(&hex_prefix).context("prefix must be hex")?
                }
                (None, None) => Vec::new(),
            };
            let encoder = build_encoder(&store, &config);
            let shown = if limit == 0 {
                0
            } else {
                let mut printed = 0;
                store.scan_with(&prefix, |key, value| {
                    println!("{}", describe(&encoder, key, value));
                    printed += 1;
                    printed < limit
                })?
            };
            println!("({shown} entries)");
        }
        Commands::Decode { key } => {
            let bytes = hex::decode(key.trim()).context("key must be hex")?;
            let (kind, path) = build_encoder(&store, &config).decode(&bytes)?;
            println!("Kind: {kind}");
            println!("Path: {path}");
        }
        Commands::Resolve { kind, path } => {
            let encoder = build_encoder(&store, &config);
            match encoder.encode_existing(&path, kind)? {
                Some(key) => {
                    println!("Key:     {}", hex::encode(&key));
                    if let Some(mapping_key) = encoder.mapping_key(&path, kind)? {
                        println!("Mapping: {mapping_key}");
                    }
                    let stored = store.get(&key)?.is_some();
                    println!("Stored:  {}", if stored { "yes" } else { "no" });
                }
                None => println!("{kind} {path} is not mapped"),
            }
        }
        Commands::Names => {
            let encoder = build_encoder(&store, &config);
            let mapping = encoder.mapping();
            let entries = mapping.entries()?;
            for (name, id) in &entries {
                println!("{id:>20}  {name}");
            }
            println!("({} mappings)", entries.len());
            if let Some(highest) = mapping.highest_allocated_id()? {
                println!("Highest id: {highest}");
            }
        }
        Commands::Mark => match txn::load_mark(&store)? {
            Some(mark) => {
                println!("Mark:   {mark}");
                println!("Millis: {}", txn::id_millis(mark));
                println!("Count:  {}", mark & ((1 << txn::COUNTER_BITS) - 1));
            }
            None => println!("No transaction mark stored"),
        },
        Commands::NextId { count } => {
            let generator =
                TransactionIdGenerator::new(store.clone(), config.transaction.clone());
            generator.start()?;
            for _ in 0..count {
                println!("{}", generator.next_id()?);
            }
            generator.stop()?;
            info!("Issued {} transaction id(s)", count);
        }
    }

    Ok(())
}
