//! Pipeline demo - the full market-data path on the substrate.
//!
//! ```text
//! [Feed] --fill_from--> [ByteRing] --peek/consume--> [Parser]
//!    --SpscQueue<Tick>--> [Worker] --ObjectPool<Enriched>--> [MpmcQueue] --> [Consumers]
//! ```
//!
//! The feed is a synthetic `io::Read` that emits fixed 32-byte frames, so
//! the run is deterministic and the consumers' checksum can be verified.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use clap::Parser;
use crossbeam_utils::Backoff;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use flash_substrate::numa;
use flash_substrate::{
    AtomicBlockPool, ByteRing, MpmcQueue, ObjectPool, PoolOptions, Pooled, SpscQueue,
};

/// Size of one encoded tick on the wire.
const FRAME_LEN: usize = 32;

type EnrichedBlocks = AtomicBlockPool<64, 4096>;

#[derive(Parser, Debug)]
#[command(name = "pipeline-demo", about = "Feed -> ring -> parser -> worker -> consumers")]
struct Args {
    /// Number of ticks pushed through the pipeline
    #[arg(long, default_value_t = 1_000_000)]
    ticks: u64,

    /// Byte ring size (power of two)
    #[arg(long, default_value_t = 1 << 16)]
    ring_size: usize,

    /// SPSC and MPMC capacity (power of two)
    #[arg(long, default_value_t = 1024)]
    capacity: usize,

    /// Number of consumer threads on the MPMC queue
    #[arg(long, default_value_t = 2)]
    consumers: usize,

    /// NUMA node for the ring and the object pool
    #[arg(long)]
    node: Option<usize>,

    /// Pin each stage to its own core, starting at this core id
    #[arg(long)]
    pin: Option<usize>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Tick {
    instrument: u32,
    side: u8,
    price: i64,
    qty: u64,
    seq: u64,
}

impl Tick {
    /// Deterministic tick for sequence number `seq`.
    fn synthetic(seq: u64) -> Self {
        Self {
            instrument: (seq % 64) as u32,
            side: (seq % 2) as u8,
            price: 1_000_000 + (seq.wrapping_mul(7919) % 2000) as i64 - 1000,
            qty: 1 + seq % 500,
            seq,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.instrument.to_le_bytes());
        out[4] = self.side;
        out[5..8].fill(0);
        out[8..16].copy_from_slice(&self.price.to_le_bytes());
        out[16..24].copy_from_slice(&self.qty.to_le_bytes());
        out[24..32].copy_from_slice(&self.seq.to_le_bytes());
    }

    fn decode(frame: &[u8; FRAME_LEN]) -> Self {
        let word = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&frame[at..at + 8]);
            b
        };
        let mut instrument = [0u8; 4];
        instrument.copy_from_slice(&frame[0..4]);
        Self {
            instrument: u32::from_le_bytes(instrument),
            side: frame[4],
            price: i64::from_le_bytes(word(8)),
            qty: u64::from_le_bytes(word(16)),
            seq: u64::from_le_bytes(word(24)),
        }
    }
}

/// Worker output: one pooled object per tick.
#[derive(Debug)]
struct Enriched {
    tick: Tick,
    /// Signed by side: buys positive, sells negative
    notional: i64,
}

impl From<Tick> for Enriched {
    fn from(tick: Tick) -> Self {
        let signed_qty = if tick.side == 0 { tick.qty as i64 } else { -(tick.qty as i64) };
        Self { tick, notional: tick.price.wrapping_mul(signed_qty) }
    }
}

/// Synthetic exchange feed. Only ever emits whole frames.
struct SyntheticFeed {
    next_seq: u64,
    total: u64,
}

impl io::Read for SyntheticFeed {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = (self.total - self.next_seq) as usize;
        let frames = (buf.len() / FRAME_LEN).min(remaining);
        for chunk in buf.chunks_exact_mut(FRAME_LEN).take(frames) {
            Tick::synthetic(self.next_seq).encode(chunk);
            self.next_seq += 1;
        }
        Ok(frames * FRAME_LEN)
    }
}

/// Reassemble a frame that may straddle the ring's wrap point.
fn frame_from(head: &[u8], tail: &[u8]) -> Option<[u8; FRAME_LEN]> {
    if head.len() + tail.len() < FRAME_LEN {
        return None;
    }
    let mut frame = [0u8; FRAME_LEN];
    let first = head.len().min(FRAME_LEN);
    frame[..first].copy_from_slice(&head[..first]);
    frame[first..].copy_from_slice(&tail[..FRAME_LEN - first]);
    Some(frame)
}

/// Retry `attempt` with backoff until it accepts the value.
fn retry<T, R>(mut value: T, mut attempt: impl FnMut(T) -> Result<R, T>) -> R {
    let backoff = Backoff::new();
    loop {
        match attempt(value) {
            Ok(out) => return out,
            Err(back) => {
                value = back;
                backoff.snooze();
            }
        }
    }
}

fn pin_stage(base: Option<usize>, stage: usize, name: &str) {
    if let Some(base) = base {
        let core = base + stage;
        if numa::pin_to_core(core) {
            debug!(stage = name, core, "stage pinned");
        } else {
            warn!(stage = name, core, "could not pin stage");
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(?args, numa = numa::numa_available(), "starting pipeline");
    if args.ring_size < 2 * FRAME_LEN {
        return Err(format!("ring size must be at least {} bytes", 2 * FRAME_LEN).into());
    }

    let mut options = PoolOptions::default();
    if let Some(node) = args.node {
        options = options.on_node(node);
    }
    let pool: ObjectPool<Enriched, EnrichedBlocks> = ObjectPool::with_options(options)?;
    let out: MpmcQueue<Pooled<'_, Enriched, EnrichedBlocks>> =
        MpmcQueue::with_capacity(args.capacity.max(2))?;
    let (mut ring_writer, mut ring_reader) = ByteRing::with_capacity(args.ring_size, args.node)?;
    let (mut ticks_tx, mut ticks_rx) = SpscQueue::<Tick>::with_capacity(args.capacity)?;

    let total = args.ticks;
    let consumed = AtomicU64::new(0);
    let checksum = AtomicU64::new(0);
    let start = Instant::now();

    std::thread::scope(|s| -> io::Result<()> {
        let feed = s.spawn(move || -> io::Result<()> {
            pin_stage(args.pin, 0, "feed");
            let mut source = SyntheticFeed { next_seq: 0, total };
            let backoff = Backoff::new();
            while source.next_seq < total {
                if ring_writer.fill_from(&mut source)? == 0 {
                    backoff.snooze();
                } else {
                    backoff.reset();
                }
            }
            Ok(())
        });

        s.spawn(move || {
            pin_stage(args.pin, 1, "parser");
            let backoff = Backoff::new();
            let mut parsed = 0;
            while parsed < total {
                let (head, tail) = ring_reader.peek();
                let Some(frame) = frame_from(head, tail) else {
                    backoff.snooze();
                    continue;
                };
                retry(Tick::decode(&frame), |tick| ticks_tx.try_push(tick));
                ring_reader.consume(FRAME_LEN);
                parsed += 1;
                backoff.reset();
            }
        });

        let (pool, out) = (&pool, &out);
        s.spawn(move || {
            pin_stage(args.pin, 2, "worker");
            let backoff = Backoff::new();
            let mut done = 0;
            while done < total {
                let Some(tick) = ticks_rx.try_pop() else {
                    backoff.snooze();
                    continue;
                };
                let handle = retry(Enriched::from(tick), |e| pool.acquire(e));
                retry(handle, |h| out.try_enqueue(h));
                done += 1;
                backoff.reset();
            }
            debug!(processed = done, stats = ?pool.stats(), "worker finished");
        });

        for c in 0..args.consumers.max(1) {
            let (consumed, checksum) = (&consumed, &checksum);
            s.spawn(move || {
                pin_stage(args.pin, 3 + c, "consumer");
                let backoff = Backoff::new();
                while consumed.load(Ordering::Acquire) < total {
                    match out.try_dequeue() {
                        Some(enriched) => {
                            debug_assert_eq!(enriched.tick, Tick::synthetic(enriched.tick.seq));
                            checksum.fetch_add(enriched.notional as u64, Ordering::Relaxed);
                            consumed.fetch_add(1, Ordering::AcqRel);
                            backoff.reset();
                        }
                        None => backoff.snooze(),
                    }
                }
            });
        }

        match feed.join() {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "feed thread panicked")),
        }
    })?;

    let elapsed = start.elapsed();
    let expected = (0..total)
        .map(|seq| Enriched::from(Tick::synthetic(seq)).notional as u64)
        .fold(0u64, u64::wrapping_add);
    let checksum = checksum.into_inner();

    info!(
        ticks = total,
        elapsed_ms = elapsed.as_millis() as u64,
        ticks_per_sec = (total as f64 / elapsed.as_secs_f64()) as u64,
        pool_in_use = pool.len(),
        "pipeline drained"
    );
    if checksum != expected {
        return Err(format!("checksum mismatch: got {checksum:#x}, expected {expected:#x}").into());
    }
    info!(checksum = format_args!("{checksum:#x}"), "checksum verified");
    Ok(())
}
