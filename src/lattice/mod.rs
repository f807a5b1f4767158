// SPDX-License-Identifier: AGPL-3.0-only

//! Lattice Monte-Carlo over one or more compute devices.
//!
//! The lattice is cut along its leading axis into partitions, each run by
//! its own driver on a per-device [`crate::gpu::Registry`]. A red-black
//! schedule keeps neighbouring partitions from updating in the same color.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `params` | Topology, start type, PRNG, pass counts, observables |
//! | `field` | Precision-tagged host fields and shadow buffers |
//! | `partition` | Leading-axis decomposition and color sets |
//! | `driver` | Driver trait, registry-backed driver, factory |
//! | `checkpoint` | `.qcg` per-partition checkpoint files |
//! | `multi_gpu` | Red-black orchestrator |

/// `.qcg` checkpoint header and buffer layout.
pub mod checkpoint;
/// Simulation driver trait and the registry-backed lattice driver.
pub mod driver;
/// Host-side fields and shadow buffers with ghost rows.
pub mod field;
/// Red-black domain-decomposition orchestrator.
pub mod multi_gpu;
/// Global run parameters.
pub mod params;
/// Partition layout and pass sets.
pub mod partition;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointLocation};
pub use driver::{
    Counters, DriverFactory, KernelEntries, KernelParams, KernelSet, LatticeDriver,
    LatticeDriverFactory, Phase, SimulationDriver,
};
pub use field::{FieldData, Precision, ShadowBuffer};
pub use multi_gpu::{Decomposition, Orchestrator, Stage};
pub use params::{RunParams, StartType, Topology, TopologyKind};
pub use partition::{DeviceSlot, Partition};
