// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel creation, argument binding and launch.
//!
//! Arguments are bound positionally: each `bind_*` call fills the next slot
//! and `rewind_args` resets the cursor so a kernel can be re-bound. Scalars
//! are copied at bind time; buffers are resolved at launch time.

use std::time::Instant;

use bytemuck::Pod;

use super::adapter::pow2_floor;
use super::backend::{ComputeBackend, KernelArg};
use super::handles::{BufferHandle, KernelHandle};
use super::telemetry::{KernelProfile, ProfileStats};
use super::Registry;
use crate::error::{ForgeError, Result};

/// One bound argument slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ArgSlot {
    Buffer(BufferHandle),
    Scalar(Vec<u8>),
    Local(usize),
}

/// Registry-side record of a kernel.
pub struct KernelEntry<K> {
    pub name: String,
    pub dims: usize,
    pub global: [usize; 3],
    pub local: [usize; 3],
    /// Backend-reported maximum work-group size for this kernel.
    pub max_local: usize,
    pub preferred_multiple: usize,
    pub local_mem_bytes: u64,
    pub stats: ProfileStats,
    pub(crate) args: Vec<ArgSlot>,
    pub(crate) cursor: usize,
    pub(crate) kernel: K,
}

impl<K> KernelEntry<K> {
    fn bind(&mut self, slot: ArgSlot) -> usize {
        let index = self.cursor;
        if index < self.args.len() {
            self.args[index] = slot;
        } else {
            self.args.push(slot);
        }
        self.cursor += 1;
        index
    }
}

/// Local size actually submitted: each dimension clamped so the product
/// stays within `cap` (itself rounded down to a power of two).
fn clamp_local(local: [usize; 3], dims: usize, cap: usize) -> [usize; 3] {
    let cap = pow2_floor(cap.max(1));
    let mut out = [1; 3];
    let mut budget = cap;
    for d in 0..dims.min(3) {
        out[d] = local[d].clamp(1, budget.max(1));
        budget /= out[d];
    }
    out
}

impl<B: ComputeBackend> Registry<B> {
    /// Create kernel `name` from the active program.
    ///
    /// The local size defaults to the largest power of two within both the
    /// kernel's reported limit and the registry's effective maximum; a vendor
    /// override replaces it. The global size of the first dimension is
    /// rounded up to a multiple of the local size.
    ///
    /// # Errors
    ///
    /// [`ForgeError::UnknownKernel`] if there is no active program or it has
    /// no such kernel; [`ForgeError::Backend`] if kernel creation fails.
    pub fn init_kernel(
        &mut self,
        name: &str,
        dims: usize,
        global: [usize; 3],
        local: Option<[usize; 3]>,
    ) -> Result<KernelHandle> {
        let ctx = self
            .context
            .as_ref()
            .ok_or(ForgeError::NotInitialized("init_kernel"))?;
        let Some(program) = self.programs.get(self.active_program) else {
            return Err(self.fail(ForgeError::UnknownKernel(name.to_string())));
        };
        let (kernel, limits) = match self.backend.create_kernel(ctx, &program.program, name) {
            Ok(created) => created,
            Err(status) => {
                tracing::error!(kernel = name, status = %status, "kernel creation failed");
                return Err(self.fail(ForgeError::UnknownKernel(name.to_string())));
            }
        };

        let dims = dims.clamp(1, 3);
        let mut local = local.unwrap_or_else(|| {
            let size = pow2_floor(limits.work_group_size.min(self.effective_max_workgroup).max(1));
            [size, 1, 1]
        });
        if let Some(forced) = self
            .selection
            .as_ref()
            .and_then(|s| s.device.vendor.forced_local_size())
        {
            local = [forced, 1, 1];
        }
        let mut global = global;
        for d in 0..dims {
            global[d] = global[d].max(1).div_ceil(local[d].max(1)) * local[d].max(1);
        }

        let handle = self.kernels.insert(KernelEntry {
            name: name.to_string(),
            dims,
            global,
            local,
            max_local: limits.work_group_size,
            preferred_multiple: limits.preferred_multiple,
            local_mem_bytes: limits.local_mem_bytes,
            stats: ProfileStats::default(),
            args: Vec::new(),
            cursor: 0,
            kernel,
        });
        tracing::debug!(
            kernel = name,
            handle = handle.raw(),
            global = ?&global[..dims],
            local = ?&local[..dims],
            "kernel initialized"
        );
        Ok(handle)
    }

    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for null or released handles.
    pub fn kernel(&self, handle: KernelHandle) -> Result<&KernelEntry<B::Kernel>> {
        self.kernels.resolve(handle)
    }

    /// Timing sums of one kernel (empty unless profiling is on).
    ///
    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for null or released handles.
    pub fn kernel_profile(&self, handle: KernelHandle) -> Result<KernelProfile> {
        let entry = self.kernels.resolve(handle)?;
        Ok(KernelProfile {
            name: entry.name.clone(),
            stats: entry.stats,
        })
    }

    /// Bind `buffer` to the next argument slot. Returns the slot index.
    ///
    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for an invalid kernel or buffer.
    pub fn bind_buffer(&mut self, kernel: KernelHandle, buffer: BufferHandle) -> Result<usize> {
        self.buffers.resolve(buffer)?;
        Ok(self.kernels.resolve_mut(kernel)?.bind(ArgSlot::Buffer(buffer)))
    }

    /// Bind a scalar value (copied now) to the next argument slot.
    ///
    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for an invalid kernel.
    pub fn bind_scalar<T: Pod>(&mut self, kernel: KernelHandle, value: T) -> Result<usize> {
        let bytes = bytemuck::bytes_of(&value).to_vec();
        Ok(self.kernels.resolve_mut(kernel)?.bind(ArgSlot::Scalar(bytes)))
    }

    /// Bind `bytes` of work-group scratch to the next argument slot.
    ///
    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for an invalid kernel.
    pub fn bind_local(&mut self, kernel: KernelHandle, bytes: usize) -> Result<usize> {
        Ok(self.kernels.resolve_mut(kernel)?.bind(ArgSlot::Local(bytes)))
    }

    /// Replace the scalar already bound at `index`.
    ///
    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for an invalid kernel;
    /// [`ForgeError::Backend`] with `INVALID_ARG_INDEX` if `index` was never bound.
    pub fn set_scalar<T: Pod>(&mut self, kernel: KernelHandle, index: usize, value: T) -> Result<()> {
        let entry = self.kernels.resolve_mut(kernel)?;
        match entry.args.get_mut(index) {
            Some(slot) => {
                *slot = ArgSlot::Scalar(bytemuck::bytes_of(&value).to_vec());
                Ok(())
            }
            None => Err(ForgeError::backend("set_scalar", super::Status::INVALID_ARG_INDEX)),
        }
    }

    /// Reset the argument cursor to slot 0. Bound values stay until overwritten.
    ///
    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for an invalid kernel.
    pub fn rewind_args(&mut self, kernel: KernelHandle) -> Result<()> {
        self.kernels.resolve_mut(kernel)?.cursor = 0;
        Ok(())
    }

    /// Launch and, with profiling on, wait and record the elapsed time.
    ///
    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for invalid kernel/buffer handles,
    /// [`ForgeError::Backend`] if the launch fails.
    pub fn run(&mut self, kernel: KernelHandle) -> Result<()> {
        self.enqueue(kernel, true)
    }

    /// Launch without waiting (profiling still waits, to time the kernel).
    ///
    /// # Errors
    ///
    /// As [`Self::run`].
    pub fn run_async(&mut self, kernel: KernelHandle) -> Result<()> {
        self.enqueue(kernel, false)
    }

    fn enqueue(&mut self, handle: KernelHandle, wait: bool) -> Result<()> {
        let ctx = self
            .context
            .as_ref()
            .ok_or(ForgeError::NotInitialized("run"))?;
        let entry = self.kernels.resolve(handle)?;
        let local = clamp_local(entry.local, entry.dims, self.effective_max_workgroup);

        let mut args = Vec::with_capacity(entry.args.len());
        for slot in &entry.args {
            args.push(match slot {
                ArgSlot::Buffer(h) => {
                    let buf = self.buffers.resolve(*h)?;
                    if buf.is_mapped() {
                        return Err(ForgeError::Mapping {
                            handle: h.raw(),
                            reason: "buffer is mapped during kernel launch",
                        });
                    }
                    match buf.buffer.as_ref() {
                        Some(b) => KernelArg::Buffer(b),
                        None => KernelArg::Local(buf.bytes),
                    }
                }
                ArgSlot::Scalar(bytes) => KernelArg::Scalar(bytes),
                ArgSlot::Local(n) => KernelArg::Local(*n),
            });
        }

        let started = Instant::now();
        let launched = self
            .backend
            .launch(ctx, &entry.kernel, &args, entry.dims, entry.global, local)
            .and_then(|()| {
                if wait || self.config.profiling {
                    self.backend.finish(ctx)
                } else {
                    Ok(())
                }
            });
        drop(args);
        if let Err(status) = launched {
            tracing::error!(kernel = %entry.name, status = %status, "kernel launch failed");
            return Err(self.fail(ForgeError::backend("run", status)));
        }
        if self.config.profiling {
            let elapsed = started.elapsed();
            if let Some(entry) = self.kernels.get_mut(handle) {
                entry.stats.record(elapsed);
            }
        }
        Ok(())
    }

    /// Block until every queued command has completed.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Backend`] if the queue reports a failure.
    pub fn wait_for_queue_finish(&self) -> Result<()> {
        let ctx = self.ctx("wait_for_queue_finish")?;
        self.backend
            .finish(ctx)
            .map_err(|s| self.fail(ForgeError::backend("finish", s)))
    }
}
