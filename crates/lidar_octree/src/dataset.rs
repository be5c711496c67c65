//! Finished dataset on disk: directory layout, index skeleton, block readers.
//!
//! The whole `Index` is small next to `Points` (28 bytes per node against
//! up to `max_points_per_node` records), so readers load it eagerly into a
//! [`Skeleton`] and validate its structure once at open time. Point blocks are
//! read on demand through [`PointReader`].

use std::collections::{HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use glam::DVec3;

use crate::codec::{self, IndexHeader, NodeRecord};
use crate::constants::{
  CHILD_BLOCK_SIZE, INDEX_FILE_NAME, INDEX_HEADER_SIZE, MAX_TREE_DEPTH, NODE_RECORD_SIZE,
  NORMALS_FILE_NAME, NORMALS_HEADER_SIZE, NORMAL_RECORD_SIZE, OFFSET_FILE_NAME, OFFSET_FILE_SIZE,
  POINTS_FILE_NAME,
};
use crate::error::{OctreeError, Result};
use crate::octree::{Cube, NodeId, OctreeNode};
use crate::types::{LidarPoint, Normal, PointFormat};

// =============================================================================
// Layout
// =============================================================================

/// File paths of a dataset directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetPaths {
  root: PathBuf,
}

impl DatasetPaths {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn index(&self) -> PathBuf {
    self.root.join(INDEX_FILE_NAME)
  }

  pub fn points(&self) -> PathBuf {
    self.root.join(POINTS_FILE_NAME)
  }

  pub fn normals(&self) -> PathBuf {
    self.root.join(NORMALS_FILE_NAME)
  }

  pub fn offset(&self) -> PathBuf {
    self.root.join(OFFSET_FILE_NAME)
  }

  pub fn has_normals(&self) -> bool {
    self.normals().is_file()
  }
}

/// Coordinate offset of a dataset, `DVec3::ZERO` when no `Offset` file exists.
pub fn read_offset(paths: &DatasetPaths) -> Result<DVec3> {
  let path = paths.offset();
  let bytes = match fs::read(&path) {
    Ok(bytes) => bytes,
    Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(DVec3::ZERO),
    Err(source) => return Err(OctreeError::Open { path, source }),
  };
  if bytes.len() as u64 != OFFSET_FILE_SIZE {
    return Err(OctreeError::CorruptIndex {
      node: NodeId::ROOT,
      reason: format!("offset file holds {} bytes, expected {OFFSET_FILE_SIZE}", bytes.len()),
    });
  }
  codec::read_dvec3(&mut Cursor::new(bytes)).map_err(|source| OctreeError::Open { path, source })
}

/// Write the `Offset` file. A zero offset removes any stale file instead.
pub fn write_offset(paths: &DatasetPaths, offset: DVec3) -> Result<()> {
  let path = paths.offset();
  if offset == DVec3::ZERO {
    return match fs::remove_file(&path) {
      Err(err) if err.kind() != io::ErrorKind::NotFound => {
        Err(OctreeError::build("removing stale offset file", err))
      }
      _ => Ok(()),
    };
  }
  let mut bytes = Vec::with_capacity(OFFSET_FILE_SIZE as usize);
  codec::write_dvec3(&mut bytes, offset).map_err(|e| OctreeError::build("encoding offset", e))?;
  fs::write(&path, bytes).map_err(|e| OctreeError::build(format!("writing {}", path.display()), e))
}

/// Remove `Normals` and any partial normals file. Rebuilding a dataset
/// invalidates them.
pub fn remove_normals(paths: &DatasetPaths) -> Result<()> {
  let normals = paths.normals();
  for path in [normals.with_extension("partial"), normals] {
    if let Err(err) = fs::remove_file(&path) {
      if err.kind() != io::ErrorKind::NotFound {
        return Err(OctreeError::build(format!("removing stale {}", path.display()), err));
      }
    }
  }
  Ok(())
}

// =============================================================================
// Skeleton
// =============================================================================

/// Validated in-memory copy of the `Index` file.
#[derive(Clone, Debug)]
pub struct Skeleton {
  header: IndexHeader,
  nodes: Vec<OctreeNode>,
  num_point_records: u64,
}

impl Skeleton {
  /// Read and validate `Index` against the size of `Points`.
  pub fn load(paths: &DatasetPaths) -> Result<Self> {
    let index_path = paths.index();
    let bytes = fs::read(&index_path).map_err(|source| OctreeError::Open {
      path: index_path.clone(),
      source,
    })?;
    let points_path = paths.points();
    let points_len = fs::metadata(&points_path)
      .map_err(|source| OctreeError::Open {
        path: points_path,
        source,
      })?
      .len();
    let skeleton = Self::parse(&bytes, |format| points_len / format.record_size() as u64)?;
    tracing::debug!(
      nodes = skeleton.len(),
      depth = skeleton.depth(),
      path = %index_path.display(),
      "loaded octree index"
    );
    Ok(skeleton)
  }

  /// Parse an index image. `point_records` maps the stored format to the
  /// number of records available in the point file.
  pub fn parse(bytes: &[u8], point_records: impl FnOnce(PointFormat) -> u64) -> Result<Self> {
    let corrupt = |node: NodeId, reason: String| OctreeError::CorruptIndex { node, reason };
    let file_len = bytes.len() as u64;
    if file_len < INDEX_HEADER_SIZE + NODE_RECORD_SIZE {
      return Err(corrupt(
        NodeId::ROOT,
        format!("index holds {file_len} bytes, too short for a header and root record"),
      ));
    }
    let mut cursor = Cursor::new(bytes);
    let header = IndexHeader::read_from(&mut cursor).map_err(|e| corrupt(NodeId::ROOT, e.to_string()))?;
    if !(header.radius > 0.0 && header.radius.is_finite()) {
      return Err(corrupt(NodeId::ROOT, format!("invalid root radius {}", header.radius)));
    }
    let num_point_records = point_records(header.point_format);

    let read_record = |cursor: &mut Cursor<&[u8]>, offset: u64, node: NodeId| -> Result<NodeRecord> {
      cursor.set_position(offset);
      NodeRecord::read_from(cursor).map_err(|e| corrupt(node, e.to_string()))
    };

    let root_record = read_record(&mut cursor, INDEX_HEADER_SIZE, NodeId::ROOT)?;
    let mut nodes = vec![OctreeNode {
      domain: Cube::new(header.center, header.radius),
      detail_size: root_record.detail_size,
      data_offset: root_record.data_offset,
      num_points: root_record.num_points,
      level: 0,
      parent: None,
      first_child: None,
    }];
    let mut queue = VecDeque::from([(NodeId::ROOT, INDEX_HEADER_SIZE, root_record)]);
    let mut seen_blocks = HashSet::new();

    while let Some((id, record_offset, record)) = queue.pop_front() {
      let node = nodes[id.index()];
      if record.data_offset.saturating_add(record.num_points as u64) > num_point_records {
        return Err(corrupt(
          id,
          format!(
            "point block [{}, +{}) runs past the {num_point_records} records in the point file",
            record.data_offset, record.num_points
          ),
        ));
      }
      if record.is_leaf() {
        continue;
      }

      let block = record.children_offset;
      if block <= record_offset
        || (block - INDEX_HEADER_SIZE) % NODE_RECORD_SIZE != 0
        || block.saturating_add(CHILD_BLOCK_SIZE) > file_len
      {
        return Err(corrupt(
          id,
          format!("child offset {block} is outside the index ({file_len} bytes) or misaligned"),
        ));
      }
      if !seen_blocks.insert(block) {
        return Err(corrupt(id, format!("child block {block} is shared by two parents")));
      }
      if node.level + 1 > MAX_TREE_DEPTH {
        return Err(corrupt(id, format!("tree deeper than {MAX_TREE_DEPTH} levels")));
      }

      let first_child = NodeId(nodes.len() as u32);
      nodes[id.index()].first_child = Some(first_child);
      for octant in 0..8 {
        let child_id = NodeId(first_child.0 + octant as u32);
        let child_offset = block + octant as u64 * NODE_RECORD_SIZE;
        let child_record = read_record(&mut cursor, child_offset, child_id)?;
        nodes.push(OctreeNode {
          domain: node.domain.child(octant),
          detail_size: child_record.detail_size,
          data_offset: child_record.data_offset,
          num_points: child_record.num_points,
          level: node.level + 1,
          parent: Some(id),
          first_child: None,
        });
        queue.push_back((child_id, child_offset, child_record));
      }
    }

    Ok(Self {
      header,
      nodes,
      num_point_records,
    })
  }

  #[inline]
  pub fn header(&self) -> &IndexHeader {
    &self.header
  }

  #[inline]
  pub fn point_format(&self) -> PointFormat {
    self.header.point_format
  }

  #[inline]
  pub fn domain(&self) -> Cube {
    Cube::new(self.header.center, self.header.radius)
  }

  #[inline]
  pub fn max_points_per_node(&self) -> u32 {
    self.header.max_points_per_node
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  #[inline]
  pub fn node(&self, id: NodeId) -> &OctreeNode {
    &self.nodes[id.index()]
  }

  #[inline]
  pub fn root(&self) -> &OctreeNode {
    &self.nodes[0]
  }

  /// All nodes, indexed by [`NodeId`].
  #[inline]
  pub fn nodes(&self) -> &[OctreeNode] {
    &self.nodes
  }

  /// Ids of all leaf nodes.
  pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
    self
      .nodes
      .iter()
      .enumerate()
      .filter(|(_, node)| node.is_leaf())
      .map(|(i, _)| NodeId(i as u32))
  }

  /// Number of levels below the root.
  pub fn depth(&self) -> u32 {
    self.nodes.iter().map(|node| node.level).max().unwrap_or(0)
  }

  /// Sum of leaf point counts, i.e. the number of distinct input points.
  pub fn num_leaf_points(&self) -> u64 {
    self
      .nodes
      .iter()
      .filter(|node| node.is_leaf())
      .map(|node| node.num_points as u64)
      .sum()
  }

  /// Number of records in the point file.
  #[inline]
  pub fn num_point_records(&self) -> u64 {
    self.num_point_records
  }
}

// =============================================================================
// Block readers
// =============================================================================

/// Reads node point blocks from `Points`.
#[derive(Debug)]
pub struct PointReader {
  file: File,
  path: PathBuf,
  format: PointFormat,
  buffer: Vec<u8>,
}

impl PointReader {
  pub fn open(paths: &DatasetPaths, format: PointFormat) -> Result<Self> {
    let path = paths.points();
    let file = File::open(&path).map_err(|source| OctreeError::Open {
      path: path.clone(),
      source,
    })?;
    Ok(Self {
      file,
      path,
      format,
      buffer: Vec::new(),
    })
  }

  /// Read the points stored at `node`.
  pub fn read_node(&mut self, id: NodeId, node: &OctreeNode) -> Result<Vec<LidarPoint>> {
    let record_size = self.format.record_size() as u64;
    let len = node.num_points as usize * record_size as usize;
    let map_err = |source: io::Error| OctreeError::Read {
      path: self.path.clone(),
      node: id,
      source,
    };
    self.buffer.resize(len, 0);
    self
      .file
      .seek(SeekFrom::Start(node.data_offset * record_size))
      .map_err(map_err)?;
    self.file.read_exact(&mut self.buffer).map_err(map_err)?;
    codec::decode_points(&self.buffer, self.format).map_err(map_err)
  }
}

/// Reads node normal blocks from `Normals`.
#[derive(Debug)]
pub struct NormalsReader {
  file: File,
  path: PathBuf,
  buffer: Vec<u8>,
}

impl NormalsReader {
  /// Open `Normals` and check it holds one record per point record.
  pub fn open(paths: &DatasetPaths, num_point_records: u64) -> Result<Self> {
    let path = paths.normals();
    if !path.is_file() {
      return Err(OctreeError::MissingNormals(paths.root().to_path_buf()));
    }
    let mut file = File::open(&path).map_err(|source| OctreeError::Open {
      path: path.clone(),
      source,
    })?;
    let mut header = [0u8; NORMALS_HEADER_SIZE as usize];
    file
      .read_exact(&mut header)
      .map_err(|source| OctreeError::Open {
        path: path.clone(),
        source,
      })?;
    let record_size = u32::from_le_bytes(header);
    if record_size != NORMAL_RECORD_SIZE {
      return Err(OctreeError::CorruptIndex {
        node: NodeId::ROOT,
        reason: format!("normals record size {record_size}, expected {NORMAL_RECORD_SIZE}"),
      });
    }
    let len = file
      .metadata()
      .map_err(|source| OctreeError::Open {
        path: path.clone(),
        source,
      })?
      .len();
    let expected = NORMALS_HEADER_SIZE + num_point_records * NORMAL_RECORD_SIZE as u64;
    if len != expected {
      return Err(OctreeError::CorruptIndex {
        node: NodeId::ROOT,
        reason: format!(
          "normals file holds {len} bytes, expected {expected} for {num_point_records} point records"
        ),
      });
    }
    Ok(Self {
      file,
      path,
      buffer: Vec::new(),
    })
  }

  /// Read one normal per point stored at `node`.
  pub fn read_node(&mut self, id: NodeId, node: &OctreeNode) -> Result<Vec<Normal>> {
    let map_err = |source: io::Error| OctreeError::Read {
      path: self.path.clone(),
      node: id,
      source,
    };
    let record_size = NORMAL_RECORD_SIZE as u64;
    self.buffer.resize(node.num_points as usize * record_size as usize, 0);
    self
      .file
      .seek(SeekFrom::Start(NORMALS_HEADER_SIZE + node.data_offset * record_size))
      .map_err(map_err)?;
    self.file.read_exact(&mut self.buffer).map_err(map_err)?;
    let mut reader = self.buffer.as_slice();
    (0..node.num_points)
      .map(|_| codec::read_normal(&mut reader).map_err(map_err))
      .collect()
  }
}

/// Writes a `Normals` file next to an existing dataset.
///
/// Output goes to a partial file that is renamed into place by
/// [`NormalsWriter::finish`], so an aborted run never leaves a truncated
/// `Normals` behind.
#[derive(Debug)]
pub struct NormalsWriter {
  file: File,
  partial: PathBuf,
  target: PathBuf,
}

impl NormalsWriter {
  pub fn create(paths: &DatasetPaths, num_point_records: u64) -> Result<Self> {
    let target = paths.normals();
    let partial = target.with_extension("partial");
    let context = || format!("creating {}", partial.display());
    let mut file = OpenOptions::new()
      .create(true)
      .write(true)
      .truncate(true)
      .open(&partial)
      .map_err(|e| OctreeError::build(context(), e))?;
    file
      .write_all(&NORMAL_RECORD_SIZE.to_le_bytes())
      .map_err(|e| OctreeError::build(context(), e))?;
    file
      .set_len(NORMALS_HEADER_SIZE + num_point_records * NORMAL_RECORD_SIZE as u64)
      .map_err(|e| OctreeError::build(context(), e))?;
    Ok(Self {
      file,
      partial,
      target,
    })
  }

  /// Write the normals of `node` at its data offset.
  pub fn write_node(&mut self, node: &OctreeNode, normals: &[Normal]) -> Result<()> {
    debug_assert_eq!(normals.len(), node.num_points as usize);
    let context = || format!("writing {}", self.partial.display());
    let offset = NORMALS_HEADER_SIZE + node.data_offset * NORMAL_RECORD_SIZE as u64;
    self
      .file
      .seek(SeekFrom::Start(offset))
      .map_err(|e| OctreeError::build(context(), e))?;
    let mut writer = BufWriter::new(&mut self.file);
    for normal in normals {
      codec::write_normal(&mut writer, *normal).map_err(|e| OctreeError::build(context(), e))?;
    }
    writer.flush().map_err(|e| OctreeError::build(context(), e))
  }

  /// Flush and move the file into place.
  pub fn finish(self) -> Result<()> {
    self
      .file
      .sync_all()
      .map_err(|e| OctreeError::build("syncing normals", e))?;
    drop(self.file);
    fs::rename(&self.partial, &self.target)
      .map_err(|e| OctreeError::build(format!("renaming {}", self.partial.display()), e))
  }
}

#[cfg(test)]
#[path = "dataset_test.rs"]
mod dataset_test;
