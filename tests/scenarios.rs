//! End-to-end scenarios - one test per primitive, exercised through the
//! public API exactly as a pipeline would use it.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use flash_substrate::{
    AtomicBlockPool, BlockPool, BlockSource, ByteRing, MpmcQueue, PoolOptions, SpscQueue,
    ZeroPolicy,
};

// ============================================================================
// Block Pool
// ============================================================================

#[test]
fn test_pool_round_trip() {
    let pool = BlockPool::<64, 4>::new().unwrap();

    let blocks: Vec<NonNull<u8>> = (0..4).map(|_| pool.acquire().expect("block")).collect();
    let base = blocks[0].as_ptr() as usize;
    for b in &blocks {
        let addr = b.as_ptr() as usize;
        assert_eq!(addr % 64, 0, "block not 64-byte aligned");
        assert!(addr >= base && addr < base + pool.total_memory(), "block outside slab");
    }
    let distinct: HashSet<_> = blocks.iter().map(|b| b.as_ptr() as usize).collect();
    assert_eq!(distinct.len(), 4);

    assert!(pool.acquire().is_none(), "fifth acquire must fail");

    assert!(pool.release(blocks[1]));
    assert_eq!(pool.acquire(), Some(blocks[1]), "LIFO reuse of the released block");

    for b in blocks {
        assert!(pool.release(b));
    }
    assert_eq!(pool.stats().free, 4);
    assert_eq!(pool.stats().in_use, 0);
}

#[test]
fn test_zero_on_release() {
    let pool = BlockPool::<64, 4>::with_options(
        PoolOptions::default().zero_policy(ZeroPolicy::OnRelease),
    )
    .unwrap();

    let block = pool.acquire().unwrap();
    unsafe { std::ptr::write_bytes(block.as_ptr(), 0xAB, 64) };
    assert!(pool.release(block));

    let again = pool.acquire().unwrap();
    assert_eq!(again, block);
    let bytes = unsafe { std::slice::from_raw_parts(again.as_ptr(), 64) };
    assert!(bytes.iter().all(|&b| b == 0), "released block was not zeroed");
}

// ============================================================================
// ABA Resistance
// ============================================================================

#[test]
fn test_epoch_defeats_aba() {
    let pool = AtomicBlockPool::<64, 2>::new().unwrap();
    let barrier = Barrier::new(2);

    // Thread A observes the head, then stalls while thread B recycles it.
    let stale = pool.head();
    let b0 = pool.acquire().unwrap();
    let b0_addr = b0.as_ptr() as usize;
    assert!(pool.release(b0));

    thread::scope(|s| {
        s.spawn(|| {
            let taken = pool.acquire().expect("thread B acquires");
            assert_eq!(taken.as_ptr() as usize, b0_addr);
            assert!(pool.release(taken));
            barrier.wait();
        });
        barrier.wait();
    });

    let now = pool.head();
    assert_eq!(now.index, stale.index, "same block is at the head again");
    assert_ne!(now.epoch, stale.epoch, "epoch must have moved on");
    assert_eq!(now.epoch.wrapping_sub(stale.epoch), 4);
}

// ============================================================================
// Queues
// ============================================================================

#[test]
fn test_spsc_order_and_back_pressure() {
    let (mut tx, mut rx) = SpscQueue::<u32>::with_capacity(4).unwrap();

    for v in 1..=4 {
        let slot = tx.next_write_slot().expect("slot available");
        *slot = v;
        tx.commit_write();
    }
    assert!(tx.next_write_slot().is_none(), "fifth slot must be refused");

    assert_eq!(rx.try_pop(), Some(1));
    assert_eq!(rx.try_pop(), Some(2));

    for v in [5, 6] {
        *tx.next_write_slot().unwrap() = v;
        tx.commit_write();
    }

    let drained: Vec<u32> = std::iter::from_fn(|| rx.try_pop()).collect();
    assert_eq!(drained, vec![3, 4, 5, 6]);
    assert!(rx.next_read_slot().is_none());
}

#[test]
fn test_mpmc_conservation_under_contention() {
    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 1000;

    let queue = Arc::new(MpmcQueue::<u32>::with_capacity(1024).unwrap());
    let done = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for v in p * PER_PRODUCER..(p + 1) * PER_PRODUCER {
                    let mut v = v;
                    while let Err(back) = queue.try_enqueue(v) {
                        v = back;
                        std::hint::spin_loop();
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut out = Vec::new();
                loop {
                    match queue.try_dequeue() {
                        Some(v) => out.push(v),
                        None if done.load(Ordering::Acquire) => {
                            // Producers finished; drain what is left.
                            while let Some(v) = queue.try_dequeue() {
                                out.push(v);
                            }
                            break;
                        }
                        None => std::hint::spin_loop(),
                    }
                }
                out
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    done.store(true, Ordering::Release);

    let streams: Vec<Vec<u32>> = consumers.into_iter().map(|c| c.join().unwrap()).collect();

    let mut all: Vec<u32> = streams.iter().flatten().copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..PRODUCERS * PER_PRODUCER).collect::<Vec<_>>());

    // Each consumer sees any one producer's values in the order they were sent.
    for stream in &streams {
        for p in 0..PRODUCERS {
            let range = p * PER_PRODUCER..(p + 1) * PER_PRODUCER;
            let mine: Vec<u32> = stream.iter().copied().filter(|v| range.contains(v)).collect();
            assert!(mine.windows(2).all(|w| w[0] < w[1]), "producer {p} reordered");
        }
    }
}

// ============================================================================
// Byte Ring
// ============================================================================

#[test]
fn test_byte_ring_wrap() {
    let (mut tx, mut rx) = ByteRing::with_capacity(16, None).unwrap();

    let first: Vec<u8> = (0x00..0x0A).collect();
    assert_eq!(tx.write(&first), 10);

    let mut buf = [0u8; 6];
    assert_eq!(rx.read(&mut buf), 6);
    assert_eq!(buf, [0x00, 0x01, 0x02, 0x03, 0x04, 0x05]);

    let second: Vec<u8> = (0x0A..0x14).collect();
    assert_eq!(tx.write(&second), 10);

    let mut buf = [0u8; 14];
    assert_eq!(rx.read(&mut buf), 14);
    assert_eq!(buf.to_vec(), (0x06..0x14).collect::<Vec<u8>>());

    assert_eq!(rx.read(&mut buf), 0);
}
