//! Error taxonomy for building and reading datasets.
//!
//! Every variant belongs to one [`ErrorKind`]. Batch tools propagate all of
//! them; the runtime cache downgrades [`ErrorKind::Transient`] failures to a
//! logged warning and keeps rendering the coarser level it already has.

use std::io;
use std::path::PathBuf;

use glam::DVec3;

use crate::octree::NodeId;

pub type Result<T> = std::result::Result<T, OctreeError>;

/// Coarse classification of an [`OctreeError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
  /// Bad parameters or missing files at open time.
  Configuration,
  /// Resource or temp-file failure while building. Aborts the build.
  Build,
  /// Structural damage in a finished dataset.
  Corruption,
  /// Read failure of a point block. Recoverable in the interactive cache.
  Transient,
}

#[derive(Debug, thiserror::Error)]
pub enum OctreeError {
  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("cannot open {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("I/O error while {context}: {source}")]
  Build {
    context: String,
    #[source]
    source: io::Error,
  },

  #[error(
    "temporary node near ({:.3}, {:.3}, {:.3}) is unreadable ({}): {reason}",
    .center.x, .center.y, .center.z, .path.display()
  )]
  CorruptTempNode {
    center: DVec3,
    path: PathBuf,
    reason: String,
  },

  #[error("corrupt index at node {node}: {reason}")]
  CorruptIndex { node: NodeId, reason: String },

  #[error(
    "no child point matches ({:.6}, {:.6}, {:.6}) stored at node {node}",
    .position.x, .position.y, .position.z
  )]
  AncestorNotFound { node: NodeId, position: DVec3 },

  #[error("failed to read {path} for node {node}: {source}")]
  Read {
    path: PathBuf,
    node: NodeId,
    #[source]
    source: io::Error,
  },

  #[error("dataset at {0} has no normals file")]
  MissingNormals(PathBuf),

  #[error("invalid primitive file {path}: {reason}")]
  PrimitiveFile { path: PathBuf, reason: String },
}

impl OctreeError {
  /// Classify this error.
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Config(_) | Self::Open { .. } | Self::MissingNormals(_) | Self::PrimitiveFile { .. } => {
        ErrorKind::Configuration
      }
      Self::Build { .. } | Self::CorruptTempNode { .. } => ErrorKind::Build,
      Self::CorruptIndex { .. } | Self::AncestorNotFound { .. } => ErrorKind::Corruption,
      Self::Read { .. } => ErrorKind::Transient,
    }
  }

  /// Whether the interactive cache may skip the failed node and carry on.
  #[inline]
  pub fn is_recoverable(&self) -> bool {
    self.kind() == ErrorKind::Transient
  }

  pub(crate) fn build(context: impl Into<String>, source: io::Error) -> Self {
    Self::Build {
      context: context.into(),
      source,
    }
  }

  pub(crate) fn config(message: impl Into<String>) -> Self {
    Self::Config(message.into())
  }
}
