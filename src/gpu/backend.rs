// SPDX-License-Identifier: AGPL-3.0-only

//! The seam between the resource registry and a device API.
//!
//! A backend exposes raw operations and reports failures as [`Status`]
//! codes. It keeps no handle tables and no cache: the registry owns both.

use super::adapter::{DeviceInfo, PlatformInfo};
use super::Status;

/// Access pattern of a device allocation, mirrored into backend usage flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Read-only for kernels, initialized by copy from host data.
    Input,
    /// Write-only for kernels.
    Output,
    /// Read-write, initialized by copy, pinned host staging.
    InputOutput,
    /// Small read-only block (uniform / constant memory).
    Constant,
    /// Read-write device-resident storage.
    Global,
    /// Work-group scratch; no device allocation, bound by size only.
    Local,
}

impl BufferKind {
    #[must_use]
    pub const fn has_device_storage(self) -> bool {
        !matches!(self, Self::Local)
    }

    #[must_use]
    pub const fn copies_host_data(self) -> bool {
        matches!(self, Self::Input | Self::InputOutput | Self::Constant)
    }
}

/// Kernel-specific limits reported when a kernel is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelLimits {
    /// Device-reported optimum (maximum) work-group size for this kernel.
    pub work_group_size: usize,
    /// Preferred work-group size multiple (warp / wavefront width).
    pub preferred_multiple: usize,
    /// Local memory used by the kernel, bytes.
    pub local_mem_bytes: u64,
}

/// Source handed to [`ComputeBackend::build_program`].
#[derive(Clone, Copy, Debug)]
pub enum ProgramSource<'a> {
    Text(&'a str),
    /// A cached device binary; `source` is kept for backends that need it.
    Binary { binary: &'a [u8], source: &'a str },
}

/// Successful build: the program plus the compiler log.
pub struct BuildOutput<P> {
    pub program: P,
    pub log: String,
}

/// Failed build: status plus compiler log.
#[derive(Clone, Debug)]
pub struct BuildFailure {
    pub status: Status,
    pub log: String,
}

impl From<Status> for BuildFailure {
    fn from(status: Status) -> Self {
        Self {
            status,
            log: String::new(),
        }
    }
}

/// One resolved kernel argument at launch time.
pub enum KernelArg<'a, B> {
    Buffer(&'a B),
    Scalar(&'a [u8]),
    /// Work-group scratch of the given byte size.
    Local(usize),
}

/// Operations a device API must provide to back a registry.
///
/// One backend value serves one registry; `create_context` is called once,
/// after which every other call receives that context.
pub trait ComputeBackend {
    /// Device + queue pair.
    type Context;
    type Program;
    type Kernel;
    type Buffer;
    /// In-flight device→host transfer.
    type Readback;

    fn platforms(&self) -> Result<Vec<PlatformInfo>, Status>;

    fn devices(&self, platform: usize) -> Result<Vec<DeviceInfo>, Status>;

    /// Create the single context and command queue for the selected device.
    fn create_context(
        &mut self,
        platform: usize,
        device: usize,
        profiling: bool,
    ) -> Result<Self::Context, Status>;

    fn build_program(
        &self,
        ctx: &Self::Context,
        source: ProgramSource<'_>,
        options: &str,
    ) -> Result<BuildOutput<Self::Program>, BuildFailure>;

    /// Compiled binary of `program` for the context's device.
    fn program_binary(&self, ctx: &Self::Context, program: &Self::Program)
        -> Result<Vec<u8>, Status>;

    fn create_kernel(
        &self,
        ctx: &Self::Context,
        program: &Self::Program,
        name: &str,
    ) -> Result<(Self::Kernel, KernelLimits), Status>;

    fn create_buffer(
        &self,
        ctx: &Self::Context,
        kind: BufferKind,
        bytes: usize,
        init: Option<&[u8]>,
    ) -> Result<Self::Buffer, Status>;

    /// Enqueue a host→device copy into `buffer` from offset 0.
    fn write_buffer(&self, ctx: &Self::Context, buffer: &Self::Buffer, data: &[u8])
        -> Result<(), Status>;

    /// Start a device→host copy of the first `len` bytes of `buffer`.
    fn enqueue_read(
        &self,
        ctx: &Self::Context,
        buffer: &Self::Buffer,
        len: usize,
    ) -> Result<Self::Readback, Status>;

    /// Block until `readback` completes and return its bytes.
    fn complete_read(&self, ctx: &Self::Context, readback: Self::Readback)
        -> Result<Vec<u8>, Status>;

    /// Enqueue `kernel` over `global` work items in groups of `local`.
    fn launch(
        &self,
        ctx: &Self::Context,
        kernel: &Self::Kernel,
        args: &[KernelArg<'_, Self::Buffer>],
        dims: usize,
        global: [usize; 3],
        local: [usize; 3],
    ) -> Result<(), Status>;

    /// Block until every queued command on the context has completed.
    fn finish(&self, ctx: &Self::Context) -> Result<(), Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_buffers_have_no_storage() {
        assert!(!BufferKind::Local.has_device_storage());
        assert!(BufferKind::Global.has_device_storage());
    }

    #[test]
    fn copy_flags_follow_kind() {
        assert!(BufferKind::Input.copies_host_data());
        assert!(BufferKind::Constant.copies_host_data());
        assert!(BufferKind::InputOutput.copies_host_data());
        assert!(!BufferKind::Output.copies_host_data());
        assert!(!BufferKind::Global.copies_host_data());
    }
}
