// SPDX-License-Identifier: AGPL-3.0-only

//! Global run parameters copied into every partition driver.
//!
//! The leading axis (`dims[0]`) is the decomposition axis; a "row" is one
//! slice across it, holding `dims[1] * dims[2] * dims[3] * site_elems`
//! elements.

use serde::Deserialize;

use super::field::Precision;
use crate::error::{ForgeError, Result};

/// Field content of the lattice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    /// SU(N) gauge links.
    #[default]
    SuN,
    /// U(1) gauge links.
    U1,
    /// Real scalar field.
    Scalar,
}

impl TopologyKind {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::SuN => 0,
            Self::U1 => 1,
            Self::Scalar => 2,
        }
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::SuN),
            1 => Some(Self::U1),
            2 => Some(Self::Scalar),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub kind: TopologyKind,
    /// N of the gauge group.
    pub group: u32,
    /// Axis extents; `dims[0]` is split across partitions.
    pub dims: [u32; 4],
    /// Stored elements per site (e.g. 4 links × N² complex × 2 = 72 for SU(3)).
    pub site_elems: u32,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            kind: TopologyKind::SuN,
            group: 3,
            dims: [8, 8, 8, 8],
            site_elems: 72,
        }
    }
}

/// How the lattice is initialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartType {
    /// Ordered (unit links).
    #[default]
    Cold,
    /// Random configuration from the PRNG.
    Hot,
    /// Resume from per-partition checkpoints.
    Checkpoint,
}

impl StartType {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Cold => 0,
            Self::Hot => 1,
            Self::Checkpoint => 2,
        }
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Cold),
            1 => Some(Self::Hot),
            2 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PrngParams {
    /// Base seed; partition `p` uses `seed + p`.
    pub seed: u64,
    /// Generator selector passed through to kernels.
    pub generator: u32,
    /// Draws discarded after seeding.
    pub skip: u32,
}

impl Default for PrngParams {
    fn default() -> Self {
        Self {
            seed: 42,
            generator: 0,
            skip: 0,
        }
    }
}

/// Optional observables; each enables one extra device buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Measurements {
    pub plaquette_energy: bool,
    pub wilson_loop: bool,
    pub polyakov_loop: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TensorField {
    pub mu: u32,
    pub nu: u32,
    pub flags: u32,
}

/// Global simulation parameters.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunParams {
    pub topology: Topology,
    pub precision: Precision,
    pub start: StartType,
    pub prng: PrngParams,
    /// Thermalization passes.
    pub nav: u32,
    /// Working passes.
    pub iter: u32,
    /// Measure + save every this many working passes (0 = only after the last).
    pub save_interval: u32,
    pub multi_hit: u32,
    pub wilson_r: u32,
    pub wilson_t: u32,
    pub beta: f64,
    pub phi: f64,
    pub omega: f64,
    pub polyakov_level: u32,
    pub tensor: TensorField,
    pub measurements: Measurements,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            precision: Precision::Single,
            start: StartType::Cold,
            prng: PrngParams::default(),
            nav: 10,
            iter: 100,
            save_interval: 10,
            multi_hit: 1,
            wilson_r: 1,
            wilson_t: 1,
            beta: 6.0,
            phi: 0.0,
            omega: 0.0,
            polyakov_level: 0,
            tensor: TensorField::default(),
            measurements: Measurements::default(),
        }
    }
}

impl RunParams {
    /// Extent of the decomposition axis.
    #[must_use]
    pub const fn leading_extent(&self) -> usize {
        self.topology.dims[0] as usize
    }

    /// Sites in one slice across the leading axis.
    #[must_use]
    pub fn row_sites(&self) -> usize {
        self.topology.dims[1..].iter().map(|&d| d as usize).product()
    }

    /// Elements in one row.
    #[must_use]
    pub fn row_elems(&self) -> usize {
        self.row_sites() * self.topology.site_elems as usize
    }

    #[must_use]
    pub fn site_count(&self) -> usize {
        self.leading_extent() * self.row_sites()
    }

    /// Reject parameters no driver can run.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if let Some(axis) = self.topology.dims.iter().position(|&d| d == 0) {
            return Err(ForgeError::Config(format!("lattice axis {axis} has zero extent")));
        }
        if self.topology.site_elems == 0 {
            return Err(ForgeError::Config("site_elems must be positive".into()));
        }
        if self.topology.group == 0 {
            return Err(ForgeError::Config("gauge group N must be positive".into()));
        }
        if self.measurements.wilson_loop && (self.wilson_r == 0 || self.wilson_t == 0) {
            return Err(ForgeError::Config(
                "wilson loop measurement needs positive R and T".into(),
            ));
        }
        Ok(())
    }

    /// Check that `partitions` slices of the leading axis are all non-empty.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Config`] if there are more partitions than rows.
    pub fn validate_decomposition(&self, partitions: usize) -> Result<()> {
        if partitions > self.leading_extent() {
            return Err(ForgeError::Config(format!(
                "{partitions} partitions exceed leading extent {}",
                self.leading_extent()
            )));
        }
        Ok(())
    }
}
