//! Binary entry point for the colstore inspection CLI.
#![forbid(unsafe_code)]

mod config;

use std::error::Error;
use std::path::PathBuf;

use bytes::Bytes;
use clap::{Args, Parser, Subcommand, ValueEnum};
use colstore::{
    admin::{
        decode_attribute_chunk, open_pool, open_relation, verify, AdminOpenOptions, Inspector,
        VerifyLevel,
    },
    storage::{attstream::AttrType, Compression, StoreOptions, Values},
    types::{BlockNumber, Tid},
};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

#[derive(Parser, Debug)]
#[command(
    name = "colstore",
    version,
    about = "Inspect and verify colstore relation files",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(
        long,
        global = true,
        env = "COLSTORE_CONFIG",
        value_name = "FILE",
        help = "TOML config file with a [store] table"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Override buffer pool size (pages)")]
    cache_pages: Option<usize>,

    #[arg(long, global = true, value_enum, help = "Override leaf stream compression")]
    compression: Option<CompressionArg>,

    #[arg(long, global = true, help = "Override the TOAST threshold (bytes)")]
    toast_threshold: Option<usize>,

    #[arg(long, global = true, help = "Skip page checksum verification on load")]
    no_verify_checksums: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty relation file.
    Init {
        #[arg(value_name = "RELATION")]
        path: PathBuf,
        /// Attribute types in column order: int1, int2, int4, int8, text or
        /// fixed:N.
        #[arg(long = "attr", value_name = "TYPE", required = true)]
        attrs: Vec<String>,
        /// Insert this many generated rows after creating the relation.
        #[arg(long, default_value_t = 0)]
        seed_rows: usize,
    },
    /// Classify one page by its trailing tag.
    PageType {
        #[arg(value_name = "RELATION")]
        path: PathBuf,
        block: u32,
    },
    /// List the undo page chain.
    UndoPages {
        #[arg(value_name = "RELATION")]
        path: PathBuf,
    },
    /// List every TOAST page.
    ToastPages {
        #[arg(value_name = "RELATION")]
        path: PathBuf,
    },
    /// List every B-tree page.
    BtreePages {
        #[arg(value_name = "RELATION")]
        path: PathBuf,
    },
    /// Show the meta page.
    Meta {
        #[arg(value_name = "RELATION")]
        path: PathBuf,
    },
    /// List the chunks of both streams on one leaf.
    DumpAttstreams {
        #[arg(value_name = "RELATION")]
        path: PathBuf,
        block: u32,
    },
    /// Decode one hex-encoded chunk without a relation.
    DecodeChunk {
        #[arg(long)]
        by_value: bool,
        #[arg(long, allow_hyphen_values = true)]
        length: i16,
        #[arg(long, default_value_t = 0)]
        prev_tid: u64,
        #[arg(long)]
        last_tid: u64,
        #[arg(value_name = "HEX")]
        chunk: String,
    },
    /// Check page types, tree partitions, the undo chain and TOAST chains.
    Verify {
        #[arg(value_name = "RELATION")]
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = VerifyLevelArg::Full)]
        level: VerifyLevelArg,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompressionArg {
    None,
    Snappy,
}

impl From<CompressionArg> for Compression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => Compression::None,
            CompressionArg::Snappy => Compression::Snappy,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

fn main() {
    install_tracing_subscriber();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_env("COLSTORE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let open_opts = build_open_options(&cli.open)?;
    let format = cli.format;
    match cli.command {
        Command::Init {
            path,
            attrs,
            seed_rows,
        } => {
            let attrs = attrs
                .iter()
                .map(|s| parse_attr(s))
                .collect::<Result<Vec<_>, _>>()?;
            if path.exists() {
                return Err(format!("{} already exists", path.display()).into());
            }
            let mut opts = open_opts.clone();
            opts.create_if_missing = true;
            let rel = open_relation(&path, &opts, &attrs)?;
            if seed_rows > 0 {
                let rows: Vec<Values> = (0..seed_rows).map(|i| seed_row(&attrs, i)).collect();
                for batch in rows.chunks(512) {
                    rel.insert(1, 0, batch)?;
                }
            }
            rel.flush()?;
            rel.tree().emit_stats();
            let meta = Inspector::new(rel.pool()).meta_page_snapshot()?;
            emit(format, &meta, || {
                println!(
                    "created {} with {} attributes, {} rows",
                    path.display(),
                    attrs.len(),
                    seed_rows
                )
            })?;
        }
        Command::PageType { path, block } => {
            let pool = open_pool(&path, &open_opts)?;
            let ty = Inspector::new(&pool).page_type(BlockNumber(block))?;
            emit(format, &ty, || println!("{block}: {ty}"))?;
        }
        Command::UndoPages { path } => {
            let pool = open_pool(&path, &open_opts)?;
            let rows = Inspector::new(&pool).scan_undo_pages()?;
            emit(format, &rows, || {
                println!("block  records  free  first(counter@block+off)  last  next");
                for r in &rows {
                    println!(
                        "{:>5}  {:>7}  {:>4}  {}@{}+{}  {}@{}+{}  {}",
                        r.block,
                        r.record_count,
                        r.free_space,
                        r.first_pointer.counter,
                        r.first_pointer.block,
                        r.first_pointer.offset,
                        r.last_pointer.counter,
                        r.last_pointer.block,
                        r.last_pointer.offset,
                        r.next
                    );
                }
            })?;
        }
        Command::ToastPages { path } => {
            let pool = open_pool(&path, &open_opts)?;
            let rows = Inspector::new(&pool).scan_toast_pages()?;
            emit(format, &rows, || {
                println!("block  tid  total  offset  prev  next  size  compressed");
                for r in &rows {
                    println!(
                        "{:>5}  {}  {}  {}  {}  {}  {}  {}",
                        r.block,
                        r.owning_tid.0,
                        r.total_size,
                        r.chunk_offset,
                        r.prev,
                        r.next,
                        r.decompressed_size,
                        r.is_compressed
                    );
                }
            })?;
        }
        Command::BtreePages { path } => {
            let pool = open_pool(&path, &open_opts)?;
            let rows = Inspector::new(&pool).scan_btree_pages()?;
            emit(format, &rows, || {
                println!("block  attno  level  lokey  hikey  items  compressed  stored  raw  free  next");
                for r in &rows {
                    println!(
                        "{:>5}  {:>5}  {:>5}  {}  {}  {}  {}  {}  {}  {}  {}",
                        r.block,
                        r.attno,
                        r.level,
                        r.lokey.0,
                        r.hikey.0,
                        r.item_count,
                        opt(r.compressed_count),
                        opt(r.stored_size),
                        opt(r.uncompressed_size),
                        r.free_space,
                        r.next
                    );
                }
            })?;
        }
        Command::Meta { path } => {
            let pool = open_pool(&path, &open_opts)?;
            let meta = Inspector::new(&pool).meta_page_snapshot()?;
            emit(format, &meta, || {
                println!("undo_head={} undo_tail={}", meta.undo_head, meta.undo_tail);
                println!("undo_tail_first_counter={}", meta.undo_tail_first_counter);
                println!(
                    "oldest={}@{}+{}",
                    meta.oldest_pointer.counter, meta.oldest_pointer.block, meta.oldest_pointer.offset
                );
                println!("free_list_head={} flags={:#x}", meta.free_list_head, meta.flags);
                println!("natts={} next_tid={}", meta.natts, meta.next_tid.0);
                for (attno, root) in meta.roots.iter().enumerate() {
                    println!("  attno {attno}: root {root}");
                }
            })?;
        }
        Command::DumpAttstreams { path, block } => {
            let pool = open_pool(&path, &open_opts)?;
            let rows = Inspector::new(&pool).dump_attstreams(BlockNumber(block))?;
            emit(format, &rows, || {
                for r in &rows {
                    println!(
                        "attno={} chunk={} upper={} compressed={} byval={} len={} at={}+{} prev={} first={} last={} count={} {}",
                        r.attno,
                        r.chunk_no,
                        r.upper_stream,
                        r.compressed,
                        r.attbyval,
                        r.attlen,
                        r.chunk_start,
                        r.chunk_len,
                        r.prev_tid.0,
                        r.first_tid.0,
                        r.last_tid.0,
                        r.count,
                        r.chunk
                    );
                }
            })?;
        }
        Command::DecodeChunk {
            by_value,
            length,
            prev_tid,
            last_tid,
            chunk,
        } => {
            let raw = hex::decode(chunk.trim())?;
            let decoded = decode_attribute_chunk(by_value, length, Tid(prev_tid), Tid(last_tid), &raw)?;
            emit(format, &decoded, || {
                println!("count={}", decoded.count);
                for (i, tid) in decoded.tids.iter().enumerate() {
                    let value = if decoded.nulls[i] {
                        "NULL".to_string()
                    } else if decoded.toasted[i] {
                        format!("toast:{}", decoded.values[i])
                    } else {
                        decoded.values[i].clone()
                    };
                    println!("{} {}", tid.0, value);
                }
            })?;
        }
        Command::Verify { path, level } => {
            let report = verify(&path, &open_opts, level.into())?;
            emit(format, &report, || {
                println!(
                    "Verify ({:?}) => success={} pages={} btree={} undo={} toast={} free={} leaves={} items={} toast_chains={}",
                    report.level,
                    report.success,
                    report.counts.pages,
                    report.counts.btree_pages,
                    report.counts.undo_pages,
                    report.counts.toast_pages,
                    report.counts.free_pages,
                    report.counts.leaves,
                    report.counts.items,
                    report.counts.toast_chains,
                );
                for finding in &report.findings {
                    println!("  [{:?}] {}", finding.severity, finding.message);
                }
            })?;
            if !report.success {
                std::process::exit(2);
            }
        }
    }
    Ok(())
}

fn build_open_options(args: &OpenArgs) -> Result<AdminOpenOptions, Box<dyn Error>> {
    let cfg = CliConfig::load(args.config.clone())?;
    if let Some(path) = cfg.path() {
        tracing::debug!(path = %path.display(), "cli.config");
    }
    let mut store: StoreOptions = cfg.store().clone();
    if let Some(pages) = args.cache_pages {
        store = store.cache_pages(pages);
    }
    if let Some(compression) = args.compression {
        store = store.compression(compression.into());
    }
    if let Some(threshold) = args.toast_threshold {
        store = store.toast_threshold(threshold);
    }
    if args.no_verify_checksums {
        store = store.verify_checksums(false);
    }
    store.validate()?;
    Ok(AdminOpenOptions::new(store))
}

fn parse_attr(spec: &str) -> Result<AttrType, Box<dyn Error>> {
    let attr = match spec {
        "int1" => AttrType::by_value(1)?,
        "int2" => AttrType::by_value(2)?,
        "int4" => AttrType::by_value(4)?,
        "int8" => AttrType::by_value(8)?,
        "text" | "varlena" => AttrType::VARLENA,
        other => match other.strip_prefix("fixed:") {
            Some(len) => AttrType::fixed(len.parse()?)?,
            None => return Err(format!("unknown attribute type '{other}'").into()),
        },
    };
    Ok(attr)
}

/// Deterministic row `i`: integers count up, text grows every few rows and
/// every tenth value is NULL.
fn seed_row(attrs: &[AttrType], i: usize) -> Values {
    attrs
        .iter()
        .enumerate()
        .map(|(col, attr)| {
            if (i + col) % 10 == 9 {
                return None;
            }
            let bytes = match attr.fixed_len() {
                Some(len) => {
                    let n = (i as u64).to_be_bytes();
                    let mut v = vec![0u8; len];
                    let take = len.min(8);
                    v[len - take..].copy_from_slice(&n[8 - take..]);
                    v
                }
                None => format!("row-{i}-").repeat(1 + (i * 37) % 700).into_bytes(),
            };
            Some(Bytes::from(bytes))
        })
        .collect()
}

fn opt(value: Option<usize>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}
