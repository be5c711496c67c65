//! Per-point normals by local plane fitting.
//!
//! The calculator walks the tree post-order. For every leaf, the points are
//! split into index ranges on the worker pool and each point gets the normal
//! of a plane fitted to its neighbourhood (phase 1, join). For every interior
//! node, each stored point is looked up by exact position among the already
//! processed children and receives their averaged normal (phase 2, join).
//! A parent point without a match means the subsample no longer comes from
//! its children, which is reported as corruption instead of being refitted.
//!
//! Normals are oriented towards +Z and written to `Normals` at the same
//! record offsets as `Points`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::DVec3;
use rayon::prelude::*;

use crate::dataset::NormalsWriter;
use crate::error::{OctreeError, Result};
use crate::octree::NodeId;
use crate::plane_fit::PlaneFitter;
use crate::process::ProcessOctree;
use crate::threading::WorkerPool;
use crate::types::{LidarPoint, Normal};

/// Which points count as a point's neighbourhood.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Neighborhood {
  /// Every point within this distance.
  Radius(f64),
  /// The `k` nearest points, no farther than `max_radius`.
  Nearest { k: usize, max_radius: f64 },
}

impl Neighborhood {
  pub fn validate(&self) -> Result<()> {
    let ok = match *self {
      Self::Radius(radius) => radius > 0.0 && radius.is_finite(),
      Self::Nearest { k, max_radius } => k >= 3 && max_radius > 0.0,
    };
    if ok {
      Ok(())
    } else {
      Err(OctreeError::config(format!("invalid neighbourhood {self:?}")))
    }
  }
}

/// Counters of a normal computation run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NormalStats {
  pub nodes: usize,
  /// Normals fitted at leaves.
  pub fitted: u64,
  /// Leaf points whose neighbourhood was too small or flat to fit (zero normal).
  pub degenerate: u64,
  /// Normals propagated to interior nodes.
  pub propagated: u64,
}

pub struct NormalCalculator<'a> {
  octree: &'a ProcessOctree,
  neighborhood: Neighborhood,
  pool: WorkerPool,
  degenerate: AtomicU64,
}

impl<'a> NormalCalculator<'a> {
  pub fn new(octree: &'a ProcessOctree, neighborhood: Neighborhood, num_threads: usize) -> Result<Self> {
    neighborhood.validate()?;
    Ok(Self {
      octree,
      neighborhood,
      pool: WorkerPool::new(num_threads)?,
      degenerate: AtomicU64::new(0),
    })
  }

  /// Compute every normal and write the dataset's `Normals` file.
  #[tracing::instrument(skip_all, name = "normals::compute")]
  pub fn compute(&self) -> Result<NormalStats> {
    let skeleton = self.octree.skeleton();
    let mut writer = NormalsWriter::create(self.octree.paths(), skeleton.num_point_records())?;
    let mut stats = NormalStats::default();
    self.degenerate.store(0, Ordering::Relaxed);
    self.subtree(NodeId::ROOT, &mut writer, &mut stats)?;
    writer.finish()?;
    stats.degenerate = self.degenerate.load(Ordering::Relaxed);
    tracing::info!(
      nodes = stats.nodes,
      fitted = stats.fitted,
      propagated = stats.propagated,
      degenerate = stats.degenerate,
      threads = self.pool.num_threads(),
      "normals written"
    );
    Ok(stats)
  }

  fn subtree(&self, id: NodeId, writer: &mut NormalsWriter, stats: &mut NormalStats) -> Result<Vec<Normal>> {
    let node = self.octree.node(id);
    let points = self.octree.node_points(id)?;
    let normals = match node.children() {
      None => {
        stats.fitted += points.len() as u64;
        self.fit_leaf(&points)?
      }
      Some(children) => {
        let mut lookup: HashMap<[u64; 3], DVec3> = HashMap::new();
        for child in children {
          let child_normals = self.subtree(child, writer, stats)?;
          let child_points = self.octree.node_points(child)?;
          for (point, normal) in child_points.iter().zip(child_normals) {
            *lookup.entry(point.position_key()).or_default() += normal.as_dvec3();
          }
        }
        stats.propagated += points.len() as u64;
        self.propagate(id, &points, &lookup)?
      }
    };
    writer.write_node(node, &normals)?;
    stats.nodes += 1;
    Ok(normals)
  }

  /// Phase 1: fit a plane around every leaf point.
  fn fit_leaf(&self, points: &[LidarPoint]) -> Result<Vec<Normal>> {
    self.pool.install(|| {
      points
        .par_iter()
        .with_min_len(64)
        .map(|point| self.fit_normal(point.position))
        .collect()
    })
  }

  /// Phase 2: inherit the averaged normal of the matching child points.
  fn propagate(&self, id: NodeId, points: &[LidarPoint], lookup: &HashMap<[u64; 3], DVec3>) -> Result<Vec<Normal>> {
    self.pool.install(|| {
      points
        .par_iter()
        .with_min_len(256)
        .map(|point| {
          lookup
            .get(&point.position_key())
            .map(|sum| sum.normalize_or_zero().as_vec3())
            .ok_or_else(|| OctreeError::AncestorNotFound {
              node: id,
              position: point.position,
            })
        })
        .collect()
    })
  }

  fn fit_normal(&self, position: DVec3) -> Result<Normal> {
    let mut fitter = PlaneFitter::new();
    match self.neighborhood {
      Neighborhood::Radius(radius) => {
        self
          .octree
          .process_points_in_sphere(position, radius, |p| fitter.add_point(p.position))?;
      }
      Neighborhood::Nearest { k, max_radius } => {
        for neighbor in self.octree.nearest_points(position, k, max_radius)? {
          fitter.add_point(neighbor.point.position);
        }
      }
    }
    match fitter.fit() {
      Some(plane) if plane.eigenvalues[1] > 0.0 => {
        let normal = if plane.normal.z < 0.0 { -plane.normal } else { plane.normal };
        Ok(normal.as_vec3())
      }
      _ => {
        self.degenerate.fetch_add(1, Ordering::Relaxed);
        Ok(Normal::ZERO)
      }
    }
  }
}

#[cfg(test)]
#[path = "normals_test.rs"]
mod normals_test;
