//! Latency report - per-primitive operation latency histograms.
//!
//! Times every operation individually with `Instant` and records it into
//! an HDR histogram, then prints percentiles. `--csv` additionally writes
//! one summary row per primitive.

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use hdrhistogram::Histogram;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flash_substrate::numa;
use flash_substrate::{
    AtomicBlockPool, BlockPool, ByteRing, MpmcQueue, PoolOptions, SpinBlockPool, SpscQueue,
    ZeroPolicy,
};

/// Highest latency tracked, in ns. Larger samples are clamped.
const MAX_TRACKED_NS: u64 = 1_000_000;

#[derive(Parser, Debug)]
#[command(name = "latency-report", about = "Per-operation latency of the substrate primitives")]
struct Args {
    /// Operations timed per primitive
    #[arg(long, default_value_t = 1_000_000)]
    iterations: u64,

    /// Queue capacity and ring size (power of two)
    #[arg(long, default_value_t = 4096)]
    capacity: usize,

    /// NUMA node for pool and ring memory
    #[arg(long)]
    node: Option<usize>,

    /// Pin the benchmark thread to the last core
    #[arg(long)]
    pin: bool,

    /// Zero pools on release
    #[arg(long)]
    zero_on_release: bool,

    /// Write a CSV summary to this path
    #[arg(long)]
    csv: Option<PathBuf>,
}

/// One line of the CSV summary.
#[derive(Serialize, Debug)]
struct Summary {
    primitive: &'static str,
    samples: u64,
    min_ns: u64,
    p50_ns: u64,
    p90_ns: u64,
    p99_ns: u64,
    p999_ns: u64,
    p9999_ns: u64,
    max_ns: u64,
    mean_ns: f64,
}

impl Summary {
    fn from_histogram(primitive: &'static str, h: &Histogram<u64>) -> Self {
        Self {
            primitive,
            samples: h.len(),
            min_ns: h.min(),
            p50_ns: h.value_at_quantile(0.50),
            p90_ns: h.value_at_quantile(0.90),
            p99_ns: h.value_at_quantile(0.99),
            p999_ns: h.value_at_quantile(0.999),
            p9999_ns: h.value_at_quantile(0.9999),
            max_ns: h.max(),
            mean_ns: h.mean(),
        }
    }

    fn print(&self) {
        println!("\n=== {} (ns) ===", self.primitive);
        println!("Samples: {}", self.samples);
        println!("---------------------------");
        println!("Min:    {:6}", self.min_ns);
        println!("P50:    {:6}", self.p50_ns);
        println!("P90:    {:6}", self.p90_ns);
        println!("P99:    {:6}", self.p99_ns);
        println!("P99.9:  {:6}", self.p999_ns);
        println!("P99.99: {:6}", self.p9999_ns);
        println!("Max:    {:6}", self.max_ns);
        println!("Mean:   {:9.1}", self.mean_ns);
    }
}

/// Time `op` `iterations` times and collect the samples.
fn measure<F: FnMut(u64)>(
    iterations: u64,
    mut op: F,
) -> Result<Histogram<u64>, hdrhistogram::CreationError> {
    let mut histogram = Histogram::<u64>::new_with_bounds(1, MAX_TRACKED_NS, 3)?;
    for i in 0..iterations {
        let start = Instant::now();
        op(i);
        let elapsed = start.elapsed().as_nanos() as u64;
        histogram.saturating_record(elapsed.max(1));
    }
    Ok(histogram)
}

fn run(args: &Args) -> Result<Vec<Summary>, Box<dyn std::error::Error>> {
    let mut options = PoolOptions::default();
    if let Some(node) = args.node {
        options = options.on_node(node);
    }
    if args.zero_on_release {
        options = options.zero_policy(ZeroPolicy::OnRelease);
    }
    let n = args.iterations;
    let mut summaries = Vec::new();

    let pool = BlockPool::<64, 4096>::with_options(options)?;
    let h = measure(n, |_| {
        if let Some(block) = pool.acquire() {
            std::hint::black_box(block);
            pool.release(block);
        }
    })?;
    summaries.push(Summary::from_histogram("block_pool acquire+release", &h));

    let pool = AtomicBlockPool::<64, 4096>::with_options(options)?;
    let h = measure(n, |_| {
        if let Some(block) = pool.acquire() {
            std::hint::black_box(block);
            pool.release(block);
        }
    })?;
    summaries.push(Summary::from_histogram("atomic_pool acquire+release", &h));

    let pool = SpinBlockPool::<64, 4096>::with_options(options)?;
    let h = measure(n, |_| {
        if let Some(block) = pool.acquire() {
            std::hint::black_box(block);
            pool.release(block);
        }
    })?;
    summaries.push(Summary::from_histogram("spin_pool acquire+release", &h));

    let (mut tx, mut rx) = SpscQueue::<u64>::with_capacity(args.capacity)?;
    let h = measure(n, |i| {
        let _ = tx.try_push(i);
        std::hint::black_box(rx.try_pop());
    })?;
    summaries.push(Summary::from_histogram("spsc push+pop", &h));

    let queue = MpmcQueue::<u64>::with_capacity(args.capacity.max(2))?;
    let h = measure(n, |i| {
        let _ = queue.try_enqueue(i);
        std::hint::black_box(queue.try_dequeue());
    })?;
    summaries.push(Summary::from_histogram("mpmc enqueue+dequeue", &h));

    let (mut writer, mut reader) = ByteRing::with_capacity(args.capacity.max(2), args.node)?;
    let frame = [0x5Au8; 64];
    let mut out = [0u8; 64];
    let h = measure(n, |_| {
        writer.write(&frame);
        std::hint::black_box(reader.read(&mut out));
    })?;
    summaries.push(Summary::from_histogram("byte_ring write+read 64B", &h));

    Ok(summaries)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(?args, numa = numa::numa_available(), node = ?numa::current_node(), "starting");

    if args.pin && !numa::pin_to_last_core() {
        warn!("could not pin to last core, running unpinned");
    }

    let summaries = run(&args)?;
    for summary in &summaries {
        summary.print();
    }

    if let Some(path) = &args.csv {
        let mut writer = csv::Writer::from_path(path)?;
        for summary in &summaries {
            writer.serialize(summary)?;
        }
        writer.flush()?;
        info!(path = %path.display(), rows = summaries.len(), "csv summary written");
    }

    Ok(())
}
