//! StormKV shard tool
//!
//! Formats, recovers and inspects a file-backed shard.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stormkv::layout::ShardLayout;
use stormkv::{Config, Engine, FileDevice, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// StormKV shard tool
#[derive(Parser, Debug)]
#[command(name = "stormctl")]
#[command(about = "Format, recover and inspect StormKV shards")]
#[command(version)]
struct Args {
    /// Shard device file
    #[arg(short, long, default_value = "./stormkv.shard")]
    device: PathBuf,

    /// Data area size in MB
    #[arg(long, default_value = "1024")]
    size_mb: u64,

    /// Device block size in bytes
    #[arg(long, default_value = "8192")]
    block_size: usize,

    /// Segment size in KB
    #[arg(long, default_value = "32768")]
    segment_kb: u64,

    /// Raw object slot size in KB
    #[arg(long, default_value = "1024")]
    raw_kb: u64,

    /// Pages per log
    #[arg(long, default_value = "256")]
    log_pages: u64,

    /// Keep every POT page in memory
    #[arg(long)]
    no_lean: bool,

    /// Skip checksum verification
    #[arg(long)]
    no_checksums: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write empty metadata to the device
    Format,

    /// Run recovery and print what it did
    Recover,

    /// Print layout, index and usage statistics
    Inspect,

    /// Store a value
    Put {
        key: String,
        value: String,

        /// Data block to store the object at
        #[arg(short, long)]
        address: u64,

        /// Container id
        #[arg(short, long, default_value = "0")]
        cntr: u16,
    },

    /// Print a value
    Get {
        key: String,

        #[arg(short, long, default_value = "0")]
        cntr: u16,
    },

    /// Delete a value
    Del {
        key: String,

        #[arg(short, long, default_value = "0")]
        cntr: u16,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stormkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("stormctl v{}", stormkv::VERSION);

    if let Err(e) = run(args) {
        tracing::error!(fatal = e.is_fatal(), "{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::builder()
        .total_size(args.size_mb * 1024 * 1024)
        .block_size(args.block_size)
        .segment_size(args.segment_kb * 1024)
        .raw_object_size(args.raw_kb * 1024)
        .log_pages(args.log_pages)
        .lean_memory(!args.no_lean)
        .checksums(!args.no_checksums)
        .build();

    match args.command {
        Commands::Format => {
            let layout = ShardLayout::new(&config)?;
            let device = FileDevice::open(&args.device, layout.block_size, layout.total_blocks())?;
            Engine::format(&device, &layout)?;
            println!(
                "formatted {} ({} blocks)",
                args.device.display(),
                layout.total_blocks()
            );
        }
        Commands::Recover => {
            let engine = Engine::open_path(&args.device, config)?;
            let report = engine.recovery_report();
            println!("plan:          {:?}", report.plan);
            for m in &report.merges {
                println!(
                    "merged {}:     {} pages applied, {} skipped, {} records, high LSN {}",
                    m.log, m.pages_applied, m.pages_skipped, m.records_applied, m.high_lsn
                );
            }
            println!("checkpoint:    {}", report.checkpoint.lsn);
            println!("objects:       {}", report.objects_rebuilt);
            println!("active pages:  {}", report.active_pages);
            println!("raw slots:     {}", report.slab.count_ones());
            engine.close()?;
        }
        Commands::Inspect => {
            let engine = Engine::open_path(&args.device, config)?;
            let layout = engine.layout();
            println!("blocks:        {}", layout.total_blocks());
            println!("data blocks:   {}", layout.data_blocks);
            println!("segments:      {}", layout.segments);
            println!("raw slots:     {}", layout.raw_slots);
            println!("hash slots:    {}", layout.hash_size);

            let audit = engine.audit()?;
            println!("objects:       {}", audit.entries);
            println!("buckets:       {} chained, {} free-listed, {} pooled",
                audit.chained_buckets, audit.free_listed_buckets, audit.pool_buckets);

            let usage = engine.segment_usage();
            for (seg, class) in usage.segments().iter().enumerate().filter(|(_, c)| c.objects > 0) {
                println!(
                    "segment {:>5}: class {:>4} blocks, {} objects, {} blocks used",
                    seg, class.class_blocks, class.objects, class.blocks_used
                );
            }
            engine.close()?;
        }
        Commands::Put { key, value, address, cntr } => {
            let engine = Engine::open_path(&args.device, config)?;
            let info = engine.put(key.as_bytes(), cntr, address, value.as_bytes())?;
            println!("stored at block {} ({} blocks)", info.address, info.blocks);
            engine.close()?;
        }
        Commands::Get { key, cntr } => {
            let engine = Engine::open_path(&args.device, config)?;
            match engine.read(key.as_bytes(), cntr)? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(nil)"),
            }
            engine.close()?;
        }
        Commands::Del { key, cntr } => {
            let engine = Engine::open_path(&args.device, config)?;
            let existed = engine.delete(key.as_bytes(), cntr)?;
            println!("{}", if existed { "deleted" } else { "(nil)" });
            engine.close()?;
        }
    }
    Ok(())
}
