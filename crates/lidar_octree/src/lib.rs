//! lidar_octree - Out-of-core octree engine for massive LiDAR point clouds
//!
//! Turns an unordered stream of colored points into an on-disk octree and
//! serves it back to batch tools and an interactive viewer. Every node holds
//! at most a fixed number of points: leaves hold the data, interior nodes a
//! subsample of their children for level-of-detail rendering.
//!
//! # Pipeline
//!
//! ```text
//!  producer ──▶ PointAccumulator ──▶ TempOctree ──▶ OctreeCreator ──▶ dataset dir
//!  (callback)   (offset, extents)    (temp files)   (bottom-up,       Index / Points
//!                                                    worker pool)     [Offset]
//!
//!  dataset dir ──▶ ProcessOctree ──▶ exporters, NormalCalculator ──▶ [Normals]
//!              └─▶ RuntimeOctree ──▶ renderer, selection, picking
//! ```
//!
//! # Example
//!
//! ```ignore
//! use lidar_octree::{BuildConfig, OctreeCreator, PointAccumulator, ProcessOctree};
//!
//! let config = BuildConfig::default().with_threads(4);
//! let mut accumulator = PointAccumulator::new(&config)?;
//! for (position, color) in source {
//!     accumulator.add_point(position, color)?;
//! }
//! let summary = OctreeCreator::new(config)?.create(accumulator.finish()?, "scan.oct")?;
//!
//! let octree = ProcessOctree::open("scan.oct", 256 << 20)?;
//! let count = octree.process_points(|point| println!("{}", point.position))?;
//! ```

pub mod accumulator;
pub mod codec;
pub mod constants;
pub mod creator;
pub mod dataset;
pub mod error;
pub mod export;
pub mod metrics;
pub mod normals;
pub mod octree;
pub mod plane_fit;
pub mod primitives;
pub mod process;
pub mod runtime;
pub mod temp_octree;
pub mod threading;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used items
pub use accumulator::{Accumulated, OffsetMode, PointAccumulator};
pub use creator::{DatasetSummary, OctreeCreator};
pub use dataset::DatasetPaths;
pub use error::{ErrorKind, OctreeError, Result};
pub use normals::{Neighborhood, NormalCalculator, NormalStats};
pub use octree::{BuildConfig, Cube, DAabb3, FrameBudget, FrameStats, NodeId, OctreeNode, RuntimeConfig};
pub use primitives::Primitive;
pub use process::ProcessOctree;
pub use runtime::{Interactor, NodeState, PointRenderer, Ray, RuntimeOctree, ViewState};
pub use types::{LidarPoint, Normal, PointFormat, Rgba};
