//! Settings file shared by the tools.
//!
//! ```toml
//! [preprocessor]
//! max_points_per_node = 4096
//! memory_cache_mb = 512
//! num_threads = 8
//! point_format = "f32"      # or "f64"
//! offset = "auto"           # "zero", or [x, y, z]
//!
//! [illuminator]
//! radius = 0.25             # or nearest = 12 with max_radius
//!
//! [exporter]
//! las_scale = 0.001
//! ```
//!
//! Every key is optional; command line flags override file values.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use glam::DVec3;
use lidar_octree::constants::{
	DEFAULT_MAX_POINTS_PER_NODE, DEFAULT_MEMORY_CACHE_BYTES, DEFAULT_NUM_THREADS,
};
use lidar_octree::export::DEFAULT_LAS_SCALE;
use lidar_octree::{BuildConfig, Neighborhood, OffsetMode, PointFormat};
use serde::Deserialize;

use crate::mib;

const DEFAULT_CACHE_MB: usize = DEFAULT_MEMORY_CACHE_BYTES / (1024 * 1024);

/// Root of the settings file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
	pub preprocessor: PreprocessorSettings,
	pub illuminator: IlluminatorSettings,
	pub exporter: ExporterSettings,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FormatSetting {
	#[default]
	F32,
	F64,
}

impl From<FormatSetting> for PointFormat {
	fn from(format: FormatSetting) -> Self {
		match format {
			FormatSetting::F32 => PointFormat::F32,
			FormatSetting::F64 => PointFormat::F64,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetName {
	Auto,
	Zero,
}

/// Coordinate offset policy: `"auto"`, `"zero"`, or an explicit `[x, y, z]`.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OffsetSetting {
	Named(OffsetName),
	Fixed([f64; 3]),
}

impl Default for OffsetSetting {
	fn default() -> Self {
		Self::Named(OffsetName::Auto)
	}
}

impl FromStr for OffsetSetting {
	type Err = String;

	/// `auto`, `zero`, or `x,y,z`.
	fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
		match text.trim() {
			"auto" => Ok(Self::Named(OffsetName::Auto)),
			"zero" => Ok(Self::Named(OffsetName::Zero)),
			other => {
				let values: Vec<f64> = other
					.split(',')
					.map(|v| v.trim().parse::<f64>())
					.collect::<std::result::Result<_, _>>()
					.map_err(|e| format!("bad offset {other:?}: {e}"))?;
				let offset: [f64; 3] = values
					.try_into()
					.map_err(|_| format!("offset needs three components, got {other:?}"))?;
				Ok(Self::Fixed(offset))
			}
		}
	}
}

impl From<OffsetSetting> for OffsetMode {
	fn from(setting: OffsetSetting) -> Self {
		match setting {
			OffsetSetting::Named(OffsetName::Auto) => OffsetMode::Auto,
			OffsetSetting::Named(OffsetName::Zero) => OffsetMode::Zero,
			OffsetSetting::Fixed(offset) => OffsetMode::Fixed(DVec3::from_array(offset)),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessorSettings {
	pub max_points_per_node: u32,
	/// Split threshold of the temporary octree; defaults to `max_points_per_node`.
	pub temp_max_points_per_node: Option<u32>,
	pub memory_cache_mb: usize,
	pub num_threads: usize,
	pub point_format: FormatSetting,
	pub offset: OffsetSetting,
	pub temp_dir: Option<PathBuf>,
}

impl Default for PreprocessorSettings {
	fn default() -> Self {
		Self {
			max_points_per_node: DEFAULT_MAX_POINTS_PER_NODE,
			temp_max_points_per_node: None,
			memory_cache_mb: DEFAULT_CACHE_MB,
			num_threads: DEFAULT_NUM_THREADS,
			point_format: FormatSetting::default(),
			offset: OffsetSetting::default(),
			temp_dir: None,
		}
	}
}

impl PreprocessorSettings {
	/// Build parameters, validated.
	pub fn build_config(&self) -> Result<BuildConfig> {
		let mut config = BuildConfig::default()
			.with_max_points(self.max_points_per_node)
			.with_threads(self.num_threads);
		if let Some(temp_max) = self.temp_max_points_per_node {
			config.temp_max_points_per_node = temp_max;
		}
		config.memory_cache_bytes = mib(self.memory_cache_mb);
		config.point_format = self.point_format.into();
		config.temp_dir = self.temp_dir.clone();
		config.validate().context("invalid preprocessor settings")?;
		Ok(config)
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IlluminatorSettings {
	pub memory_cache_mb: usize,
	pub num_threads: usize,
	/// Neighbourhood radius.
	pub radius: Option<f64>,
	/// Neighbourhood size; takes precedence over a bare `radius`.
	pub nearest: Option<usize>,
	/// Search bound for `nearest`; falls back to `radius`, then unbounded.
	pub max_radius: Option<f64>,
}

impl Default for IlluminatorSettings {
	fn default() -> Self {
		Self {
			memory_cache_mb: DEFAULT_CACHE_MB,
			num_threads: DEFAULT_NUM_THREADS,
			radius: None,
			nearest: None,
			max_radius: None,
		}
	}
}

impl IlluminatorSettings {
	pub fn neighborhood(&self) -> Result<Neighborhood> {
		let neighborhood = match (self.nearest, self.radius) {
			(Some(k), radius) => Neighborhood::Nearest {
				k,
				max_radius: self.max_radius.or(radius).unwrap_or(f64::INFINITY),
			},
			(None, Some(radius)) => Neighborhood::Radius(radius),
			(None, None) => anyhow::bail!("a neighbourhood radius or a nearest-point count is required"),
		};
		neighborhood.validate().context("invalid illuminator settings")?;
		Ok(neighborhood)
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExporterSettings {
	pub memory_cache_mb: usize,
	/// Quantisation step of LAS output.
	pub las_scale: f64,
}

impl Default for ExporterSettings {
	fn default() -> Self {
		Self {
			memory_cache_mb: DEFAULT_CACHE_MB,
			las_scale: DEFAULT_LAS_SCALE,
		}
	}
}

impl Settings {
	pub fn parse(content: &str) -> Result<Self> {
		toml::from_str(content).context("failed to parse settings TOML")
	}

	/// Load settings from a TOML file.
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read settings file: {}", path.display()))?;
		Self::parse(&content).with_context(|| format!("in {}", path.display()))
	}

	/// Settings from `path` if given, defaults otherwise.
	pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
		path.map_or_else(|| Ok(Self::default()), Self::load)
	}
}
