//! Bounded worker pool for the two parallel passes.
//!
//! The final build forks across sibling subtrees and the normal calculator
//! splits each node into index ranges. Both run inside a dedicated rayon
//! pool sized by the configured thread count, so the global rayon pool and
//! other datasets are unaffected.
//!
//! # Usage
//!
//! ```ignore
//! let pool = WorkerPool::new(4)?;
//!
//! // Everything inside `install` (par_iter, join, scope) uses the pool.
//! let sums: Vec<u64> = pool.install(|| chunks.par_iter().map(sum).collect());
//! ```

use crate::error::{OctreeError, Result};

/// Fixed-size pool of OS worker threads.
pub struct WorkerPool {
  pool: rayon::ThreadPool,
}

impl WorkerPool {
  /// Create a pool with exactly `num_threads` workers.
  pub fn new(num_threads: usize) -> Result<Self> {
    if num_threads == 0 {
      return Err(OctreeError::config("worker pool needs at least one thread"));
    }
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(num_threads)
      .thread_name(|i| format!("lidar-worker-{i}"))
      .build()
      .map_err(|e| OctreeError::config(format!("failed to start worker pool: {e}")))?;
    Ok(Self { pool })
  }

  /// Run `work` on the pool, blocking until it returns.
  ///
  /// Parallel iterators and `rayon::join` calls inside `work` are scheduled
  /// on this pool's workers.
  pub fn install<F, T>(&self, work: F) -> T
  where
    F: FnOnce() -> T + Send,
    T: Send,
  {
    self.pool.install(work)
  }

  /// Get the number of worker threads.
  pub fn num_threads(&self) -> usize {
    self.pool.current_num_threads()
  }
}

impl std::fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkerPool")
      .field("num_threads", &self.num_threads())
      .finish()
  }
}

// =============================================================================
// Tests
// =============================================================================
