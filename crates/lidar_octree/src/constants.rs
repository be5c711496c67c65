//! Dataset file names, on-disk record sizes, and build defaults.
//!
//! A finished dataset is a directory:
//!
//! ```text
//! dataset/
//!   Index    header + node records (parent before children)
//!   Points   concatenated point records
//!   Normals  optional, one normal per point record
//!   Offset   optional, 3 x f64 subtracted from the input coordinates
//! ```

// =============================================================================
// File names
// =============================================================================

pub const INDEX_FILE_NAME: &str = "Index";
pub const POINTS_FILE_NAME: &str = "Points";
pub const NORMALS_FILE_NAME: &str = "Normals";
pub const OFFSET_FILE_NAME: &str = "Offset";

// =============================================================================
// Record sizes (bytes, little-endian)
// =============================================================================

/// `{ record_size: u32, center: 3 x f64, radius: f64, max_points_per_node: u32 }`
pub const INDEX_HEADER_SIZE: u64 = 4 + 3 * 8 + 8 + 4;

/// `{ children_offset: u64, detail_size: f64, data_offset: u64, num_points: u32 }`
pub const NODE_RECORD_SIZE: u64 = 8 + 8 + 8 + 4;

/// Size of the contiguous block holding all 8 children of an interior node.
pub const CHILD_BLOCK_SIZE: u64 = 8 * NODE_RECORD_SIZE;

/// Color channels stored after the coordinates of every point record.
pub const COLOR_SIZE: u32 = 4;

/// `{ record_size: u32 }`
pub const NORMALS_HEADER_SIZE: u64 = 4;

/// `{ nx, ny, nz: f32 }`
pub const NORMAL_RECORD_SIZE: u32 = 3 * 4;

/// `{ ox, oy, oz: f64 }`
pub const OFFSET_FILE_SIZE: u64 = 3 * 8;

// =============================================================================
// Build defaults
// =============================================================================

pub const DEFAULT_MAX_POINTS_PER_NODE: u32 = 4096;
pub const DEFAULT_TEMP_MAX_POINTS_PER_NODE: u32 = 4096;
pub const DEFAULT_MEMORY_CACHE_BYTES: usize = 512 * 1024 * 1024;
pub const DEFAULT_GPU_CACHE_BYTES: usize = 128 * 1024 * 1024;
pub const DEFAULT_NUM_THREADS: usize = 1;

/// Nodes at or below this radius are never split, however many points they hold.
pub const DEFAULT_MIN_NODE_RADIUS: f64 = 1.0e-3;

/// Points streamed per chunk when a temporary node file is redistributed.
pub const TEMP_SPLIT_CHUNK_POINTS: usize = 64 * 1024;

/// Maximum number of octree levels. Deeper trees indicate a broken domain.
pub const MAX_TREE_DEPTH: u32 = 48;

#[cfg(test)]
#[path = "constants_test.rs"]
mod constants_test;
