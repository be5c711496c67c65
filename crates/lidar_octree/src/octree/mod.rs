//! Octree building blocks shared by every pass.
//!
//! - [`bounds`]: boxes and cubic node domains, including the boundary rule
//! - [`node`]: node ids and finished-dataset node records
//! - [`config`]: build and cache parameters
//! - [`budget`]: per-frame work limits and statistics for the runtime cache
//!
//! # Octant Layout
//!
//! ```text
//!        6 ─────── 7
//!       /|        /|       bit 0: +X
//!      4 ─────── 5 |       bit 1: +Y
//!      | 2 ──────|─ 3      bit 2: +Z
//!      |/        |/
//!      0 ─────── 1
//! ```

pub mod bounds;
pub mod budget;
pub mod config;
pub mod node;

pub use bounds::{Cube, DAabb3};
pub use budget::{FrameBudget, FrameStats};
pub use config::{BuildConfig, RuntimeConfig};
pub use node::{NodeId, OctreeNode};
