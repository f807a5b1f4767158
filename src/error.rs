// SPDX-License-Identifier: AGPL-3.0-only

//! Typed errors for device registry, orchestration, and checkpoint I/O.
//!
//! Every variant except [`ForgeError::Checkpoint`] is fatal for a simulation
//! run: the registry never retries, and the `lattice_run` binary exits with
//! the error's diagnostics. Checkpoint validation failures are reported to
//! the caller, which may choose to start fresh instead.

use std::path::PathBuf;

use crate::gpu::Status;
use crate::lattice::checkpoint::CheckpointError;

/// Errors arising from device selection, backend calls, orchestration, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// No platform matched the requested index or vendor filter.
    #[error("platform not found: {0}")]
    PlatformNotFound(String),

    /// No device matched the requested index or vendor filter.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// A registry operation was attempted before `initialize_device`.
    #[error("device not initialized: {0}")]
    NotInitialized(&'static str),

    /// A backend call returned a non-success status.
    #[error("{operation} failed: {status}")]
    Backend {
        operation: &'static str,
        status: Status,
    },

    /// Program compilation failed; `log` is the compiler output.
    #[error("program build failed: {status}\n{log}")]
    Build { status: Status, log: String },

    /// A handle that is zero, out of range, or released.
    #[error("invalid {kind} handle {handle}")]
    InvalidHandle { kind: &'static str, handle: u32 },

    /// Kernel lookup in the active program failed, or no program is active.
    #[error("no kernel '{0}' in the active program")]
    UnknownKernel(String),

    /// A buffer was mapped twice, or unmapped/read while not mapped.
    #[error("buffer {handle}: {reason}")]
    Mapping { handle: u32, reason: &'static str },

    /// Host-side allocation could not be satisfied.
    #[error("host allocation of {bytes} bytes failed")]
    HostAlloc { bytes: usize },

    /// Binary cache directory or file I/O failed.
    #[error("binary cache {}: {source}", path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint load/save failed (the only non-fatal class).
    #[error("checkpoint {}: {source}", path.display())]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: CheckpointError,
    },

    /// Run configuration was rejected.
    #[error("configuration: {0}")]
    Config(String),

    /// Orchestrator operation called out of order.
    #[error("orchestrator is {actual:?}, expected {expected}")]
    Stage {
        actual: crate::lattice::multi_gpu::Stage,
        expected: &'static str,
    },

    /// Generic filesystem failure outside the cache.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ForgeError {
    /// Whether a simulation run can continue after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Checkpoint { .. })
    }

    /// Whether the failure concerns a program or kernel (triggers the
    /// build-log diagnostic dump).
    #[must_use]
    pub const fn is_kernel_related(&self) -> bool {
        match self {
            Self::Build { .. } | Self::UnknownKernel(_) => true,
            Self::Backend { status, .. } => status.is_kernel_related(),
            _ => false,
        }
    }

    pub(crate) fn backend(operation: &'static str, status: Status) -> Self {
        Self::Backend { operation, status }
    }

    pub(crate) fn cache(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Cache {
            path: path.into(),
            source,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ForgeError>;
