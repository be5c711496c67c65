//! Runtime cache metrics.
//!
//! Feature-gated and runtime-toggled so an interactive session pays nothing
//! when they are off.
//!
//! ```ignore
//! use lidar_octree::metrics::{CacheMetrics, COLLECT_METRICS};
//!
//! // Compile with --features metrics, then toggle at runtime:
//! COLLECT_METRICS.store(false, Ordering::Relaxed);
//!
//! let metrics = runtime.metrics();
//! println!("avg load {:.1} us", metrics.avg_load_timing_us());
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use web_time::Instant;

/// Flip to false to stop collecting without recompiling.
pub static COLLECT_METRICS: AtomicBool = AtomicBool::new(true);

/// Compiled with `metrics` and switched on at runtime.
#[inline]
pub fn is_enabled() -> bool {
  cfg!(feature = "metrics") && COLLECT_METRICS.load(Ordering::Relaxed)
}

const TIMING_WINDOW: usize = 128;

/// The last [`TIMING_WINDOW`] durations, in microseconds.
#[derive(Debug, Clone, Default)]
pub struct TimingWindow {
  samples: VecDeque<u64>,
}

impl TimingWindow {
  pub fn record(&mut self, micros: u64) {
    if self.samples.len() == TIMING_WINDOW {
      self.samples.pop_front();
    }
    self.samples.push_back(micros);
  }

  pub fn len(&self) -> usize {
    self.samples.len()
  }

  pub fn is_empty(&self) -> bool {
    self.samples.is_empty()
  }

  pub fn clear(&mut self) {
    self.samples.clear();
  }

  pub fn latest(&self) -> Option<u64> {
    self.samples.back().copied()
  }

  pub fn mean(&self) -> f64 {
    match self.samples.len() {
      0 => 0.0,
      n => self.samples.iter().sum::<u64>() as f64 / n as f64,
    }
  }

  /// Slowest sample in the window.
  pub fn worst(&self) -> Option<u64> {
    self.samples.iter().max().copied()
  }
}

/// Starts a timer only when metrics are being collected.
#[inline]
pub fn start_timer() -> Option<Instant> {
  is_enabled().then(Instant::now)
}

#[inline]
fn micros(elapsed: Duration) -> u64 {
  elapsed.as_micros().min(u64::MAX as u128) as u64
}

/// Counters and timing history of one runtime cache.
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
  /// Disk read time per loaded child group, in microseconds.
  pub load_timings: TimingWindow,
  /// Whole render pass time, in microseconds.
  pub frame_timings: TimingWindow,

  pub last_frame_us: u64,
  pub total_groups_loaded: u64,
  pub total_points_loaded: u64,
  pub total_groups_evicted: u64,
  pub total_load_failures: u64,
  /// Highest CPU cache usage seen, in bytes.
  pub peak_memory_bytes: usize,
}

impl CacheMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  /// Reset the timing windows; cumulative totals are kept.
  pub fn reset(&mut self) {
    self.load_timings.clear();
    self.frame_timings.clear();
    self.last_frame_us = 0;
  }

  pub fn record_load(&mut self, started: Option<Instant>, num_points: u64) {
    if !is_enabled() {
      return;
    }
    if let Some(started) = started {
      self.load_timings.record(micros(started.elapsed()));
    }
    self.total_groups_loaded += 1;
    self.total_points_loaded += num_points;
  }

  pub fn record_load_failure(&mut self) {
    if is_enabled() {
      self.total_load_failures += 1;
    }
  }

  pub fn record_eviction(&mut self) {
    if is_enabled() {
      self.total_groups_evicted += 1;
    }
  }

  pub fn record_frame(&mut self, started: Option<Instant>, memory_bytes: usize) {
    if !is_enabled() {
      return;
    }
    if let Some(started) = started {
      let us = micros(started.elapsed());
      self.frame_timings.record(us);
      self.last_frame_us = us;
    }
    self.peak_memory_bytes = self.peak_memory_bytes.max(memory_bytes);
  }

  pub fn avg_load_timing_us(&self) -> f64 {
    self.load_timings.mean()
  }

  pub fn avg_frame_timing_us(&self) -> f64 {
    self.frame_timings.mean()
  }

  pub fn peak_memory_mb(&self) -> f64 {
    self.peak_memory_bytes as f64 / 1_048_576.0
  }
}
