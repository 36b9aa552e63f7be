//! bioq - Bio Submission Workload Driver
//!
//! Builds an I/O submitter over an in-memory or file-backed device, pushes a
//! block write pattern through it (optionally reading everything back), waits
//! for every completion and reports what the submitter did with it.
//!
//! ```text
//! ┌──────────────┐    ┌─────────────────────┐    ┌──────────────┐
//! │   Workload   │───▶│     IoSubmitter     │───▶│    Device    │
//! │  (pattern)   │    │ bioQ0 … bioQ{n-1}   │    │ memory/file  │
//! └──────▲───────┘    └─────────────────────┘    └──────┬───────┘
//!        └──────────── CompletionWaiter ◀───────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use bytes::BytesMut;
use clap::{Parser, ValueEnum};
use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bioq::bio::{PhysicalBlockNumber, BLOCK_SIZE, SECTORS_PER_BLOCK};
use bioq::{
    Bio, BioOp, BioQAction, BlockDevice, Completion, CompletionWaiter, IoSubmitter,
    MemoryDevice, RequestInfo, SubmitterConfig, VioType,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Order in which blocks are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Pattern {
    /// Ascending PBNs; every bio back-merges
    Sequential,
    /// Descending PBNs; every bio front-merges
    Reverse,
    /// Ascending PBNs `stride` apart; nothing merges unless stride is 1
    Strided,
}

impl Pattern {
    fn pbns(self, start: u64, blocks: u64, stride: u64) -> Vec<PhysicalBlockNumber> {
        match self {
            Pattern::Sequential => (start..start + blocks).collect(),
            Pattern::Reverse => (start..start + blocks).rev().collect(),
            Pattern::Strided => (0..blocks).map(|i| start + i * stride).collect(),
        }
    }
}

/// bioq - drive a bio submission bank with a synthetic workload
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML submitter configuration; flags below override it
    #[arg(long, env = "BIOQ_CONFIG")]
    config: Option<PathBuf>,

    /// Number of bio queue threads
    #[arg(long, env = "BIOQ_THREADS")]
    threads: Option<u32>,

    /// Consecutive PBNs per queue before rotating
    #[arg(long, env = "BIOQ_ROTATION_INTERVAL")]
    rotation_interval: Option<u32>,

    /// Maximum active requests (merge map holds twice this per queue)
    #[arg(long, env = "BIOQ_MAX_REQUESTS")]
    max_requests_active: Option<u32>,

    /// Disable bio merging
    #[arg(long, env = "BIOQ_NO_MERGE")]
    no_merge: bool,

    /// Apply MD RAID5 sync-flag hints
    #[arg(long, env = "BIOQ_RAID5")]
    raid5: bool,

    /// Back the device with this file instead of memory
    #[arg(long, env = "BIOQ_DEVICE_FILE")]
    device_file: Option<PathBuf>,

    /// Write pattern
    #[arg(long, value_enum, default_value = "sequential")]
    pattern: Pattern,

    /// Number of blocks to write
    #[arg(long, default_value = "1024")]
    blocks: u64,

    /// First PBN written
    #[arg(long, default_value = "0")]
    start_pbn: u64,

    /// PBN distance for the strided pattern
    #[arg(long, default_value = "2")]
    stride: u64,

    /// Read every block back and verify it
    #[arg(long)]
    read_back: bool,

    /// Finish with a flush
    #[arg(long)]
    flush: bool,

    /// Print the final state dump as JSON
    #[arg(long)]
    dump_json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = build_config(&args)?;
    let pbns = args.pattern.pbns(args.start_pbn, args.blocks, args.stride.max(1));
    let capacity = (pbns.iter().copied().max().unwrap_or(0) + 1) * SECTORS_PER_BLOCK;
    let device = open_device(&args, capacity)?;

    info!("Starting bio submission workload");
    info!("  Device: {} ({} sectors)", device.name(), capacity);
    info!("  Queues: {}", config.thread_count);
    info!("  Rotation interval: {}", config.rotation_interval);
    info!("  Merging: {}", config.use_bio_map);
    info!("  Pattern: {:?} x {} blocks", args.pattern, pbns.len());

    let submitter = IoSubmitter::create(config, device).context("failed to create I/O submitter")?;

    let started = Instant::now();
    let writes = submit_pass(&submitter, &pbns, BioOp::Write)?;
    let failed = await_pass(writes).await.iter().filter(|c| c.status().is_err()).count();
    info!(
        "Wrote {} blocks in {:?} ({} failed)",
        pbns.len(),
        started.elapsed(),
        failed
    );

    if args.read_back {
        let started = Instant::now();
        let reads = submit_pass(&submitter, &pbns, BioOp::Read)?;
        let mismatches = await_pass(reads)
            .await
            .into_iter()
            .filter(|c| !verify(c))
            .count();
        info!(
            "Read back {} blocks in {:?} ({} mismatched)",
            pbns.len(),
            started.elapsed(),
            mismatches
        );
        if mismatches > 0 {
            error!("{} blocks did not read back as written", mismatches);
        }
    }

    if args.flush {
        let (waiter, rx) = CompletionWaiter::new();
        let info = Arc::new(RequestInfo::new(0, VioType::Metadata, waiter));
        submitter.submit_flush(vec![Bio::empty_flush(info)])?;
        match rx.await {
            Ok(done) if done.status().is_ok() => info!("Flush complete"),
            Ok(done) => warn!("Flush failed: {:?}", done.status()),
            Err(_) => bail!("flush completion was dropped"),
        }
    }

    let dump = submitter.dump_state();
    if args.dump_json {
        println!("{}", serde_json::to_string_pretty(&dump)?);
    } else {
        println!("{}", dump);
    }

    submitter.shutdown();
    submitter.release();
    info!("bioq finished");
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .init();
    }
}

fn build_config(args: &Args) -> anyhow::Result<SubmitterConfig> {
    let mut config = match &args.config {
        Some(path) => SubmitterConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SubmitterConfig::default(),
    };
    if let Some(threads) = args.threads {
        config.thread_count = threads;
    }
    if let Some(rotation) = args.rotation_interval {
        config.rotation_interval = rotation;
    }
    if let Some(max) = args.max_requests_active {
        config.max_requests_active = max;
    }
    if args.no_merge {
        config.use_bio_map = false;
    }
    if args.raid5 {
        config.md_raid5_mode = true;
    }
    config.validate()?;
    Ok(config)
}

fn open_device(args: &Args, capacity: u64) -> anyhow::Result<Arc<dyn BlockDevice>> {
    match &args.device_file {
        #[cfg(unix)]
        Some(path) => Ok(Arc::new(
            bioq::FileDevice::open(path, capacity)
                .with_context(|| format!("opening {}", path.display()))?,
        )),
        #[cfg(not(unix))]
        Some(_) => bail!("file devices are only supported on unix"),
        None => Ok(Arc::new(
            MemoryDevice::new("mem0", capacity).with_async_completion()?,
        )),
    }
}

// =============================================================================
// Workload
// =============================================================================

fn block_payload(pbn: PhysicalBlockNumber) -> BytesMut {
    let mut data = BytesMut::zeroed(BLOCK_SIZE);
    data.fill(pbn as u8);
    data[..8].copy_from_slice(&pbn.to_le_bytes());
    data
}

fn verify(done: &Completion) -> bool {
    done.status().is_ok() && done.bio().data() == &block_payload(done.bio().owner().pbn())[..]
}

fn submit_pass(
    submitter: &IoSubmitter,
    pbns: &[PhysicalBlockNumber],
    op: BioOp,
) -> anyhow::Result<Vec<oneshot::Receiver<Completion>>> {
    let mut waits = Vec::with_capacity(pbns.len());
    for &pbn in pbns {
        let (waiter, rx) = CompletionWaiter::new();
        let info = Arc::new(RequestInfo::new(pbn, VioType::Data, waiter));
        let data = match op {
            BioOp::Write => block_payload(pbn),
            _ => BytesMut::zeroed(BLOCK_SIZE),
        };
        submitter
            .submit_bio(Bio::for_block(info, op, data), BioQAction::Data)
            .with_context(|| format!("submitting {} of PBN {}", op, pbn))?;
        waits.push(rx);
    }
    Ok(waits)
}

async fn await_pass(waits: Vec<oneshot::Receiver<Completion>>) -> Vec<Completion> {
    join_all(waits)
        .await
        .into_iter()
        .filter_map(|done| match done {
            Ok(done) => Some(done),
            Err(_) => {
                warn!("completion dropped without a result");
                None
            }
        })
        .collect()
}
