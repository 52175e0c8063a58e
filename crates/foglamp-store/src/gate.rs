//! Write coordination and the adaptive purge block-size controller.
//!
//! The engine allows many reader threads but a single writer at a time.
//! Appends and deletes register themselves on the [`WriteGate`]; the purge
//! loop yields to in-flight writers before every delete block so an append
//! batch never stalls behind a long purge cycle.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Time each purge delete block should take.
pub(crate) const TARGET_PURGE_BLOCK_DEL_TIME: Duration = Duration::from_millis(70);
/// Starting number of rows deleted per purge block.
pub(crate) const PURGE_DELETE_BLOCK_SIZE: u64 = 20;
/// Block size is always snapped to this granularity.
pub(crate) const PURGE_BLOCK_SZ_GRANULARITY: u64 = 5;
pub(crate) const MIN_PURGE_DELETE_BLOCK_SIZE: u64 = 20;
pub(crate) const MAX_PURGE_DELETE_BLOCK_SIZE: u64 = 1500;
/// Recalculate the purge block size after every this many blocks.
pub(crate) const RECALC_PURGE_BLOCK_SIZE_NUM_BLOCKS: u32 = 30;

/// Single-writer / many-reader coordination shared between the reading
/// store and the purge loop.
///
/// Writers bump the active count for the duration of their statement and
/// signal the condition variable when the count drains to zero. The purge
/// loop waits on that signal before each delete block, and spins until a
/// full drain once per cycle, after the locator has picked the delete
/// range and immediately before the first delete block.
#[derive(Debug, Default)]
pub(crate) struct WriteGate {
    writers: AtomicI32,
    lock: Mutex<()>,
    drained: Condvar,
}

impl WriteGate {
    /// Register a writer. The guard deregisters on drop and notifies any
    /// waiting purge block when the last writer finishes.
    pub fn begin_write(&self) -> WriteGuard<'_> {
        self.writers.fetch_add(1, Ordering::SeqCst);
        WriteGuard { gate: self }
    }

    /// Block until no writer is active. Used before each purge delete so
    /// an in-flight append completes before the next block starts.
    pub fn wait_writers_drained(&self) {
        let mut guard = self.lock.lock().unwrap();
        while self.writers.load(Ordering::SeqCst) > 0 {
            guard = self.drained.wait(guard).unwrap();
        }
    }

    /// Spin with short naps until no writer is active. Used once per purge
    /// cycle, between the locator's unsent accounting and the delete loop.
    pub fn spin_until_drained(&self) {
        while self.writers.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    #[cfg(test)]
    pub fn active_writers(&self) -> i32 {
        self.writers.load(Ordering::SeqCst)
    }
}

/// RAII registration of one writer on a [`WriteGate`].
#[derive(Debug)]
pub(crate) struct WriteGuard<'a> {
    gate: &'a WriteGate,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.gate.writers.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.gate.lock.lock().unwrap();
            self.gate.drained.notify_all();
        }
    }
}

/// Controller deciding how many rows the next purge delete block covers.
///
/// Isolated behind a trait so tests can feed synthetic durations.
pub trait BlockSizer: Send {
    /// Feed the duration of the last delete block and get the size to use
    /// for the next one.
    fn next_size(&mut self, last: Duration) -> u64;
}

/// The self-tuning controller used in production.
///
/// Aims for [`TARGET_PURGE_BLOCK_DEL_TIME`] per block: short enough that
/// writers interleave, long enough to amortise statement overhead. Every
/// [`RECALC_PURGE_BLOCK_SIZE_NUM_BLOCKS`] blocks the size is rescaled by
/// the ratio of target to the blended average (half long-term, half
/// current window), the ratio clamped to [0.5, 2.0], the size snapped to
/// granularity and clamped to its bounds.
#[derive(Debug)]
pub struct AdaptiveBlockSizer {
    size: u64,
    blocks: u32,
    total: Duration,
    prev_blocks: u32,
    prev_total: Duration,
}

impl Default for AdaptiveBlockSizer {
    fn default() -> Self {
        Self {
            size: PURGE_DELETE_BLOCK_SIZE,
            blocks: 0,
            total: Duration::ZERO,
            prev_blocks: 0,
            prev_total: Duration::ZERO,
        }
    }
}

impl AdaptiveBlockSizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current block size without feeding a new sample.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn recalculate(&mut self) {
        let target = TARGET_PURGE_BLOCK_DEL_TIME.as_micros() as i64;
        let prev_avg = if self.prev_blocks > 0 {
            (self.prev_total.as_micros() / u128::from(self.prev_blocks)) as i64
        } else {
            0
        };
        let curr_avg = ((self.total - self.prev_total).as_micros()
            / u128::from(self.blocks - self.prev_blocks)) as i64;
        // 50% weight for the long-term average, 50% for the current window
        let avg = ((if prev_avg > 0 { prev_avg } else { curr_avg }) * 5 + curr_avg * 5) / 10;
        self.prev_blocks = self.blocks;
        self.prev_total = self.total;

        let deviation = (avg - target).abs();
        tracing::debug!(
            blocks = self.blocks,
            prev_avg_us = prev_avg,
            curr_avg_us = curr_avg,
            avg_us = avg,
            target_us = target,
            deviation_us = deviation,
            "purge block timing"
        );
        if deviation > target / 10 {
            let ratio = (target as f64 / avg as f64).clamp(0.5, 2.0);
            let mut size = (self.size as f64 * ratio) as u64;
            size = size / PURGE_BLOCK_SZ_GRANULARITY * PURGE_BLOCK_SZ_GRANULARITY;
            self.size = size.clamp(MIN_PURGE_DELETE_BLOCK_SIZE, MAX_PURGE_DELETE_BLOCK_SIZE);
            tracing::debug!(size = self.size, "changed purge block size");
        }
    }
}

impl BlockSizer for AdaptiveBlockSizer {
    fn next_size(&mut self, last: Duration) -> u64 {
        self.blocks += 1;
        self.total += last;
        if self.blocks % RECALC_PURGE_BLOCK_SIZE_NUM_BLOCKS == 0 {
            self.recalculate();
        }
        self.size
    }
}
