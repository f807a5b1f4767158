// SPDX-License-Identifier: AGPL-3.0-only

//! latticeforge: multi-device lattice Monte-Carlo infrastructure.
//!
//! ## Modules
//!   - `gpu` — compute resource registry, on-disk program binary cache,
//!     host reference and wgpu backends
//!   - `lattice` — leading-axis domain decomposition, per-partition drivers,
//!     red-black orchestrator, `.qcg` checkpoints
//!   - `config` — JSON run configuration with environment overrides
//!   - `logging` — `tracing` subscriber setup
//!   - `sentinel` — `start.txt` / `finish.txt` run gating
//!
//! ## Binary
//!   - `lattice_run` — configuration → devices → orchestrator → exit code

pub mod config;
pub mod error;
pub mod gpu;
pub mod lattice;
pub mod logging;
pub mod sentinel;
