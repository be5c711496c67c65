//! Per-frame work limits for the interactive cache.
//!
//! Disk reads and GPU uploads happen synchronously inside the frame update,
//! so the amount of data requested per frame is bounded instead of the
//! latency of each read.

/// Rate limiting configuration for cache refinement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameBudget {
	/// Maximum child groups loaded from disk per frame (0 = unlimited).
	pub max_loads: usize,
	/// Maximum node buffers uploaded to the GPU per frame (0 = unlimited).
	pub max_uploads: usize,
}

impl FrameBudget {
	/// Default budget with reasonable limits.
	pub const DEFAULT: Self = Self {
		max_loads: 8,
		max_uploads: 32,
	};

	/// Unlimited budget for testing or offline rendering.
	pub const UNLIMITED: Self = Self {
		max_loads: 0,
		max_uploads: 0,
	};

	/// Check if more child groups can be loaded.
	#[inline]
	pub fn can_load(&self, performed: usize) -> bool {
		self.max_loads == 0 || performed < self.max_loads
	}

	/// Check if more buffers can be uploaded.
	#[inline]
	pub fn can_upload(&self, performed: usize) -> bool {
		self.max_uploads == 0 || performed < self.max_uploads
	}
}

impl Default for FrameBudget {
	fn default() -> Self {
		Self::DEFAULT
	}
}

/// Statistics from one frame (or one interaction step).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
	/// Nodes drawn this frame.
	pub rendered_nodes: usize,
	/// Points drawn this frame.
	pub rendered_points: usize,
	/// Nodes rejected by the view frustum.
	pub culled_nodes: usize,
	/// Child groups that wanted to load this frame.
	pub requested_groups: usize,
	/// Child groups read from disk.
	pub loaded_groups: usize,
	/// Child groups that failed to read and stayed coarse.
	pub failed_loads: usize,
	/// Requests dropped because nothing evictable freed enough memory.
	pub deferred_for_memory: usize,
	/// Child groups evicted from the CPU cache.
	pub evicted_groups: usize,
	/// Buffers uploaded to the GPU.
	pub uploads: usize,
	/// GPU buffers released to make room.
	pub gpu_evictions: usize,
	/// Nodes drawn straight from CPU memory.
	pub immediate_draws: usize,
}

impl FrameStats {
	/// Total disk traffic in child groups, successful or not.
	#[inline]
	pub fn total_load_attempts(&self) -> usize {
		self.loaded_groups + self.failed_loads
	}

	/// Total GPU-side draws (buffered or immediate).
	#[inline]
	pub fn total_draws(&self) -> usize {
		self.rendered_nodes
	}

	/// Accumulate another step's counters into this one.
	pub fn merge(&mut self, other: &FrameStats) {
		self.rendered_nodes += other.rendered_nodes;
		self.rendered_points += other.rendered_points;
		self.culled_nodes += other.culled_nodes;
		self.requested_groups += other.requested_groups;
		self.loaded_groups += other.loaded_groups;
		self.failed_loads += other.failed_loads;
		self.deferred_for_memory += other.deferred_for_memory;
		self.evicted_groups += other.evicted_groups;
		self.uploads += other.uploads;
		self.gpu_evictions += other.gpu_evictions;
		self.immediate_draws += other.immediate_draws;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_budget() {
		let budget = FrameBudget::default();
		assert_eq!(budget.max_loads, 8);
		assert_eq!(budget.max_uploads, 32);
	}

	#[test]
	fn test_can_load() {
		let budget = FrameBudget {
			max_loads: 3,
			..Default::default()
		};
		assert!(budget.can_load(0));
		assert!(budget.can_load(2));
		assert!(!budget.can_load(3));
	}

	#[test]
	fn test_unlimited_budget_always_allows() {
		let budget = FrameBudget::UNLIMITED;
		assert!(budget.can_load(1000));
		assert!(budget.can_upload(1000));
	}

	#[test]
	fn test_stats_totals() {
		let mut stats = FrameStats {
			loaded_groups: 4,
			failed_loads: 2,
			rendered_nodes: 9,
			..Default::default()
		};
		assert_eq!(stats.total_load_attempts(), 6);
		stats.merge(&FrameStats {
			loaded_groups: 1,
			..Default::default()
		});
		assert_eq!(stats.loaded_groups, 5);
		assert_eq!(stats.total_draws(), 9);
	}
}
