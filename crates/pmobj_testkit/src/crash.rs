//! Crash simulation for PMObj pools.
//!
//! [`CrashablePool`] wraps an [`InMemoryPool`] and loses power after a set
//! number of persistence operations. Whatever was drained before that point
//! survives; flushed-but-undrained lines may or may not survive, so both
//! images are checked.
//!
//! ## Test Strategy
//!
//! [`CrashRecoveryHarness::sweep`] runs a scenario once per operation
//! boundary, crashing at each one in turn, reopens the pool from every
//! possible durable image and asks a verifier whether recovery produced an
//! acceptable state.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pmobj_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::new(65536);
//! let result = harness.sweep("commit", setup, scenario, verify);
//! assert!(result.passed, "{:?}", result.failures);
//! ```

use pmobj_core::CoreResult;
use pmobj_storage::{InMemoryPool, MemFlags, PersistentMemory, StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Result of a crash recovery sweep.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether every crash point recovered correctly.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Number of crash points exercised.
    pub crash_points: usize,
    /// One message per failing crash point and image.
    pub failures: Vec<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, crash_points: usize) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            crash_points,
            failures: Vec::new(),
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, crash_points: usize, failures: Vec<String>) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            crash_points,
            failures,
        }
    }
}

/// A pool wrapper that can simulate power loss.
///
/// Every `write`, `fill`, `flush` and `drain` counts as one operation. The
/// operation that reaches the crash threshold fails, as does everything
/// after it. With a torn prefix configured, the failing write first makes
/// that many leading bytes durable, modelling a store that was only partly
/// written back.
pub struct CrashablePool {
    inner: InMemoryPool,
    crash_after_ops: AtomicUsize,
    ops: AtomicUsize,
    crashed: AtomicBool,
    torn_prefix: AtomicUsize,
}

impl CrashablePool {
    /// Wraps a pool; no crash is scheduled.
    pub fn new(inner: InMemoryPool) -> Self {
        Self {
            inner,
            crash_after_ops: AtomicUsize::new(usize::MAX),
            ops: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            torn_prefix: AtomicUsize::new(0),
        }
    }

    /// Crashes when the operation count reaches `ops`.
    pub fn crash_after(&self, ops: usize) {
        self.crash_after_ops.store(ops, Ordering::SeqCst);
    }

    /// Makes the crashing write persist its first `bytes` bytes.
    pub fn set_torn_prefix(&self, bytes: usize) {
        self.torn_prefix.store(bytes, Ordering::SeqCst);
    }

    /// Clears the crash schedule and the counters.
    pub fn reset(&self) {
        self.crash_after_ops.store(usize::MAX, Ordering::SeqCst);
        self.ops.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.torn_prefix.store(0, Ordering::SeqCst);
    }

    /// Returns whether the pool has crashed.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Returns the number of operations attempted so far.
    pub fn ops(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    /// Returns the wrapped pool.
    pub fn inner(&self) -> &InMemoryPool {
        &self.inner
    }

    /// Bytes guaranteed durable at the crash.
    pub fn durable_image(&self) -> Vec<u8> {
        self.inner.durable_image()
    }

    /// Durable bytes plus every flushed line that had not been drained.
    pub fn durable_image_with_pending(&self) -> Vec<u8> {
        self.inner.durable_image_with_pending()
    }

    /// Every image a restart might find.
    pub fn possible_images(&self) -> Vec<Vec<u8>> {
        let durable = self.durable_image();
        let pending = self.durable_image_with_pending();
        if durable == pending {
            vec![durable]
        } else {
            vec![durable, pending]
        }
    }

    fn step(&self, what: &str) -> StorageResult<bool> {
        if self.has_crashed() {
            return Err(StorageError::Crashed(format!("{what} after power loss")));
        }
        let current = self.ops.fetch_add(1, Ordering::SeqCst);
        if current >= self.crash_after_ops.load(Ordering::SeqCst) {
            self.crashed.store(true, Ordering::SeqCst);
            return Ok(true);
        }
        Ok(false)
    }

    fn crash_error(what: &str) -> StorageError {
        StorageError::Crashed(format!("simulated power loss during {what}"))
    }
}

impl PersistentMemory for CrashablePool {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u64, data: &[u8], flags: MemFlags) -> StorageResult<()> {
        if self.step("write")? {
            let prefix = self.torn_prefix.load(Ordering::SeqCst).min(data.len());
            if prefix > 0 {
                self.inner.write(offset, &data[..prefix], MemFlags::NONE)?;
            }
            return Err(Self::crash_error("write"));
        }
        self.inner.write(offset, data, flags)
    }

    fn fill(&mut self, offset: u64, value: u8, len: usize, flags: MemFlags) -> StorageResult<()> {
        if self.step("fill")? {
            return Err(Self::crash_error("fill"));
        }
        self.inner.fill(offset, value, len, flags)
    }

    fn flush(&mut self, offset: u64, len: usize) -> StorageResult<()> {
        if self.step("flush")? {
            return Err(Self::crash_error("flush"));
        }
        self.inner.flush(offset, len)
    }

    fn drain(&mut self) -> StorageResult<()> {
        if self.step("drain")? {
            return Err(Self::crash_error("drain"));
        }
        self.inner.drain()
    }
}

/// Test harness that sweeps a crash over every operation of a scenario.
pub struct CrashRecoveryHarness {
    /// Size of the pools created for each run.
    pub pool_size: usize,
    /// Bytes the crashing write leaves durable.
    pub torn_prefix: usize,
    /// Results of the sweeps run so far.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Creates a harness for pools of `pool_size` bytes.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            torn_prefix: 0,
            results: Vec::new(),
        }
    }

    /// Makes every crashing write tear after `bytes` bytes.
    #[must_use]
    pub fn with_torn_prefix(mut self, bytes: usize) -> Self {
        self.torn_prefix = bytes;
        self
    }

    /// Counts the operations a scenario performs when it does not crash.
    pub fn count_ops<S, R>(&self, setup: &S, scenario: &R) -> usize
    where
        S: Fn(&mut InMemoryPool),
        R: Fn(&mut CrashablePool) -> CoreResult<()>,
    {
        let mut pool = InMemoryPool::new(self.pool_size);
        setup(&mut pool);
        let mut crashable = CrashablePool::new(pool);
        let _ = scenario(&mut crashable);
        crashable.ops()
    }

    /// Crashes `scenario` at every operation boundary and verifies recovery.
    ///
    /// `setup` prepares a fresh pool before each run (without crashes).
    /// `verify` receives a pool reopened from each possible durable image
    /// and the crash point, and returns an error message if the state after
    /// its recovery is unacceptable.
    pub fn sweep<S, R, V>(&mut self, description: &str, setup: S, scenario: R, verify: V) -> CrashRecoveryResult
    where
        S: Fn(&mut InMemoryPool),
        R: Fn(&mut CrashablePool) -> CoreResult<()>,
        V: Fn(&mut InMemoryPool, usize) -> Result<(), String>,
    {
        let total = self.count_ops(&setup, &scenario);
        let mut failures = Vec::new();

        for crash_at in 0..=total {
            let mut pool = InMemoryPool::new(self.pool_size);
            setup(&mut pool);
            let mut crashable = CrashablePool::new(pool);
            crashable.crash_after(crash_at);
            crashable.set_torn_prefix(self.torn_prefix);
            let _ = scenario(&mut crashable);

            for (index, image) in crashable.possible_images().into_iter().enumerate() {
                let mut reopened = InMemoryPool::from_image(image);
                if let Err(message) = verify(&mut reopened, crash_at) {
                    failures.push(format!("crash at op {crash_at}, image {index}: {message}"));
                }
            }
        }

        let result = if failures.is_empty() {
            CrashRecoveryResult::pass(description, total + 1)
        } else {
            CrashRecoveryResult::fail(description, total + 1, failures)
        };
        self.results.push(result.clone());
        result
    }

    /// Returns true if every sweep so far passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crashable_pool_normal_operation() {
        let mut pool = CrashablePool::new(InMemoryPool::new(4096));
        pool.write(64, b"hello", MemFlags::NONE).unwrap();
        pool.flush(64, 5).unwrap();
        pool.drain().unwrap();
        assert_eq!(pool.ops(), 3);
        assert!(!pool.has_crashed());
        assert_eq!(&pool.durable_image()[64..69], b"hello");
    }

    #[test]
    fn crashable_pool_crash_on_write() {
        let mut pool = CrashablePool::new(InMemoryPool::new(4096));
        pool.crash_after(1);
        pool.write(64, b"first", MemFlags::NONE).unwrap();
        let err = pool.write(128, b"second", MemFlags::NONE).unwrap_err();
        assert!(err.is_crash());
        assert!(pool.has_crashed());
        assert!(pool.write(192, b"third", MemFlags::NONE).is_err());
        assert_eq!(&pool.durable_image()[64..69], b"first");
        assert!(pool.durable_image()[128..134].iter().all(|&b| b == 0));
    }

    #[test]
    fn crashable_pool_torn_write() {
        let mut pool = CrashablePool::new(InMemoryPool::new(4096));
        pool.crash_after(0);
        pool.set_torn_prefix(3);
        assert!(pool.write(64, b"abcdef", MemFlags::NONE).is_err());
        assert_eq!(&pool.durable_image()[64..70], b"abc\0\0\0");
    }

    #[test]
    fn crashable_pool_pending_lines_are_optional() {
        let mut pool = CrashablePool::new(InMemoryPool::new(4096));
        pool.crash_after(1);
        pool.write(64, b"maybe", MemFlags::NO_DRAIN).unwrap();
        assert!(pool.drain().is_err());
        let images = pool.possible_images();
        assert_eq!(images.len(), 2);
        assert!(images[0][64..69].iter().all(|&b| b == 0));
        assert_eq!(&images[1][64..69], b"maybe");
    }

    #[test]
    fn crashable_pool_reset() {
        let mut pool = CrashablePool::new(InMemoryPool::new(4096));
        pool.crash_after(0);
        assert!(pool.drain().is_err());
        pool.reset();
        assert!(!pool.has_crashed());
        pool.drain().unwrap();
    }

    #[test]
    fn harness_sweep_reports_failures() {
        let mut harness = CrashRecoveryHarness::new(4096);
        let result = harness.sweep(
            "two unordered writes",
            |_| {},
            |pool| {
                pool.write(64, &[1], MemFlags::NONE)?;
                pool.write(128, &[1], MemFlags::NONE)?;
                Ok(())
            },
            |pool, _| {
                let mut a = [0u8; 1];
                let mut b = [0u8; 1];
                pool.read(64, &mut a).map_err(|e| e.to_string())?;
                pool.read(128, &mut b).map_err(|e| e.to_string())?;
                if a == b {
                    Ok(())
                } else {
                    Err("writes are not atomic".into())
                }
            },
        );
        assert!(!result.passed);
        assert_eq!(result.crash_points, 3);
        assert_eq!(result.failures.len(), 1);
        assert!(!harness.all_passed());
    }
}
