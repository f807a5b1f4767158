// SPDX-License-Identifier: AGPL-3.0-only

//! Device buffers: allocation, transfers, and map/unmap.
//!
//! Mapping hands the host a byte image of the buffer. Read mappings fetch
//! the device contents (blocking, or later via `wait_for_map`); write
//! mappings start zeroed and are uploaded on `unmap`. A buffer can hold at
//! most one mapping, and a mapped buffer cannot be launched on or
//! transferred.

use std::time::Instant;

use bytemuck::Pod;

use super::backend::{BufferKind, ComputeBackend};
use super::handles::BufferHandle;
use super::telemetry::ProfileStats;
use super::Registry;
use crate::error::{ForgeError, Result};

/// Host access requested by [`Registry::map`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
    ReadWrite,
}

impl MapMode {
    const fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

pub(crate) struct Mapping<R> {
    mode: MapMode,
    data: Vec<u8>,
    pending: Option<(R, Instant)>,
}

/// Registry-side record of a buffer.
pub struct BufferEntry<Bf, R> {
    pub kind: BufferKind,
    pub count: usize,
    pub elem_size: usize,
    pub bytes: usize,
    pub name: Option<String>,
    pub host_to_device: ProfileStats,
    pub device_to_host: ProfileStats,
    pub(crate) mapping: Option<Mapping<R>>,
    /// `None` for local scratch.
    pub(crate) buffer: Option<Bf>,
}

impl<Bf, R> BufferEntry<Bf, R> {
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}

/// Zeroed host vector, reporting allocation failure instead of aborting.
fn host_alloc(bytes: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(bytes)
        .map_err(|_| ForgeError::HostAlloc { bytes })?;
    data.resize(bytes, 0);
    Ok(data)
}

/// Copy `bytes` into a vector of `T` (trailing partial elements dropped).
#[must_use]
pub fn pod_from_bytes<T: Pod>(bytes: &[u8]) -> Vec<T> {
    let size = std::mem::size_of::<T>();
    let n = bytes.len() / size;
    let mut out = vec![T::zeroed(); n];
    bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&bytes[..n * size]);
    out
}

fn mapping_error(handle: BufferHandle, reason: &'static str) -> ForgeError {
    ForgeError::Mapping {
        handle: handle.raw(),
        reason,
    }
}

// ── Allocation ───────────────────────────────────────────────────────

impl<B: ComputeBackend> Registry<B> {
    /// Allocate `count` elements of `elem_size` bytes, optionally initialized
    /// from `host` (which must be exactly `count * elem_size` bytes).
    ///
    /// # Errors
    ///
    /// [`ForgeError::HostAlloc`] if the size overflows, or
    /// [`ForgeError::Backend`] if the device allocation fails.
    pub fn alloc_buffer(
        &mut self,
        kind: BufferKind,
        count: usize,
        elem_size: usize,
        host: Option<&[u8]>,
    ) -> Result<BufferHandle> {
        let bytes = count
            .checked_mul(elem_size)
            .ok_or(ForgeError::HostAlloc { bytes: usize::MAX })?;
        if host.is_some_and(|h| h.len() != bytes) {
            return Err(self.fail(ForgeError::backend(
                "alloc_buffer",
                super::Status::INVALID_HOST_PTR,
            )));
        }
        let ctx = self.ctx("alloc_buffer")?;
        let buffer = if kind.has_device_storage() {
            let init = host.filter(|_| kind.copies_host_data());
            let created = self
                .backend
                .create_buffer(ctx, kind, bytes, init)
                .map_err(|s| self.fail(ForgeError::backend("alloc_buffer", s)))?;
            if let (Some(data), None) = (host, init) {
                self.backend
                    .write_buffer(ctx, &created, data)
                    .map_err(|s| self.fail(ForgeError::backend("alloc_buffer", s)))?;
            }
            Some(created)
        } else {
            None
        };
        let handle = self.buffers.insert(BufferEntry {
            kind,
            count,
            elem_size,
            bytes,
            name: None,
            host_to_device: ProfileStats::default(),
            device_to_host: ProfileStats::default(),
            mapping: None,
            buffer,
        });
        tracing::debug!(buffer = handle.raw(), ?kind, bytes, "buffer allocated");
        Ok(handle)
    }

    /// Typed allocation initialized from `data`.
    ///
    /// # Errors
    ///
    /// As [`Self::alloc_buffer`].
    pub fn alloc_slice<T: Pod>(&mut self, kind: BufferKind, data: &[T]) -> Result<BufferHandle> {
        self.alloc_buffer(
            kind,
            data.len(),
            std::mem::size_of::<T>(),
            Some(bytemuck::cast_slice(data)),
        )
    }

    /// Attach a name shown in profile reports.
    ///
    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for invalid handles.
    pub fn name_buffer(&mut self, handle: BufferHandle, name: &str) -> Result<()> {
        self.buffers.resolve_mut(handle)?.name = Some(name.to_string());
        Ok(())
    }

    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for invalid handles.
    pub fn buffer(&self, handle: BufferHandle) -> Result<&BufferEntry<B::Buffer, B::Readback>> {
        self.buffers.resolve(handle)
    }

    /// Release a buffer. Returns `false` (and logs "no buffer") if it was
    /// already released; the handle is never reissued.
    ///
    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for the null handle or one never issued.
    pub fn buffer_kill(&mut self, handle: BufferHandle) -> Result<bool> {
        if handle.is_null() || handle.raw() as usize > self.buffers.issued() {
            return Err(ForgeError::InvalidHandle {
                kind: "buffer",
                handle: handle.raw(),
            });
        }
        match self.buffers.take(handle) {
            Some(entry) => {
                if entry.is_mapped() {
                    tracing::warn!(buffer = handle.raw(), "releasing a mapped buffer");
                }
                tracing::debug!(buffer = handle.raw(), "buffer released");
                Ok(true)
            }
            None => {
                tracing::warn!(buffer = handle.raw(), "no buffer");
                Ok(false)
            }
        }
    }
}

// ── Transfers ────────────────────────────────────────────────────────

impl<B: ComputeBackend> Registry<B> {
    /// Upload `data` to the start of the buffer.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Mapping`] if the buffer is mapped or local,
    /// [`ForgeError::Backend`] if the copy fails.
    pub fn write_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let ctx = self
            .context
            .as_ref()
            .ok_or(ForgeError::NotInitialized("write_buffer"))?;
        let entry = self.buffers.resolve(handle)?;
        if entry.is_mapped() {
            return Err(mapping_error(handle, "buffer is mapped"));
        }
        let buffer = entry
            .buffer
            .as_ref()
            .ok_or_else(|| mapping_error(handle, "local buffer has no storage"))?;
        if data.len() > entry.bytes {
            return Err(self.fail(ForgeError::backend("write_buffer", super::Status::INVALID_VALUE)));
        }
        let started = Instant::now();
        self.backend
            .write_buffer(ctx, buffer, data)
            .and_then(|()| {
                if self.config.profiling {
                    self.backend.finish(ctx)
                } else {
                    Ok(())
                }
            })
            .map_err(|s| self.fail(ForgeError::backend("write_buffer", s)))?;
        if self.config.profiling {
            let elapsed = started.elapsed();
            if let Some(e) = self.buffers.get_mut(handle) {
                e.host_to_device.record(elapsed);
            }
        }
        Ok(())
    }

    /// Download the whole buffer.
    ///
    /// # Errors
    ///
    /// As [`Self::write_buffer`].
    pub fn read_buffer(&mut self, handle: BufferHandle) -> Result<Vec<u8>> {
        let ctx = self
            .context
            .as_ref()
            .ok_or(ForgeError::NotInitialized("read_buffer"))?;
        let entry = self.buffers.resolve(handle)?;
        if entry.is_mapped() {
            return Err(mapping_error(handle, "buffer is mapped"));
        }
        let buffer = entry
            .buffer
            .as_ref()
            .ok_or_else(|| mapping_error(handle, "local buffer has no storage"))?;
        let started = Instant::now();
        let data = self
            .backend
            .enqueue_read(ctx, buffer, entry.bytes)
            .and_then(|rb| self.backend.complete_read(ctx, rb))
            .map_err(|s| self.fail(ForgeError::backend("read_buffer", s)))?;
        if self.config.profiling {
            let elapsed = started.elapsed();
            if let Some(e) = self.buffers.get_mut(handle) {
                e.device_to_host.record(elapsed);
            }
        }
        Ok(data)
    }

    /// Typed upload.
    ///
    /// # Errors
    ///
    /// As [`Self::write_buffer`].
    pub fn write_slice<T: Pod>(&mut self, handle: BufferHandle, data: &[T]) -> Result<()> {
        self.write_buffer(handle, bytemuck::cast_slice(data))
    }

    /// Typed download of the whole buffer.
    ///
    /// # Errors
    ///
    /// As [`Self::read_buffer`].
    pub fn read_vec<T: Pod>(&mut self, handle: BufferHandle) -> Result<Vec<T>> {
        Ok(pod_from_bytes(&self.read_buffer(handle)?))
    }
}

// ── Mapping ──────────────────────────────────────────────────────────

impl<B: ComputeBackend> Registry<B> {
    /// Map a buffer for host access. Non-blocking read mappings complete in
    /// [`Self::wait_for_map`].
    ///
    /// # Errors
    ///
    /// [`ForgeError::Mapping`] if already mapped or local,
    /// [`ForgeError::HostAlloc`] if the host image cannot be allocated,
    /// [`ForgeError::Backend`] if the device read fails.
    pub fn map(&mut self, handle: BufferHandle, mode: MapMode, blocking: bool) -> Result<()> {
        let ctx = self
            .context
            .as_ref()
            .ok_or(ForgeError::NotInitialized("map"))?;
        let entry = self.buffers.resolve(handle)?;
        if entry.is_mapped() {
            return Err(self.fail(mapping_error(handle, "buffer is already mapped")));
        }
        let buffer = entry
            .buffer
            .as_ref()
            .ok_or_else(|| mapping_error(handle, "local buffer has no storage"))?;
        let bytes = entry.bytes;

        let started = Instant::now();
        let mapping = if mode.reads() {
            let readback = self
                .backend
                .enqueue_read(ctx, buffer, bytes)
                .map_err(|s| self.fail(ForgeError::backend("map", s)))?;
            if blocking {
                let data = self
                    .backend
                    .complete_read(ctx, readback)
                    .map_err(|s| self.fail(ForgeError::backend("map", s)))?;
                Mapping {
                    mode,
                    data,
                    pending: None,
                }
            } else {
                Mapping {
                    mode,
                    data: Vec::new(),
                    pending: Some((readback, started)),
                }
            }
        } else {
            Mapping {
                mode,
                data: host_alloc(bytes)?,
                pending: None,
            }
        };
        let profiling = self.config.profiling;
        let entry = self.buffers.resolve_mut(handle)?;
        if profiling && mode.reads() && blocking {
            entry.device_to_host.record(started.elapsed());
        }
        entry.mapping = Some(mapping);
        Ok(())
    }

    /// Complete a non-blocking read mapping. A no-op for ready mappings.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Mapping`] if the buffer is not mapped,
    /// [`ForgeError::Backend`] if the device read fails.
    pub fn wait_for_map(&mut self, handle: BufferHandle) -> Result<()> {
        let ctx = self
            .context
            .as_ref()
            .ok_or(ForgeError::NotInitialized("wait_for_map"))?;
        let entry = self.buffers.resolve_mut(handle)?;
        let mapping = entry
            .mapping
            .as_mut()
            .ok_or_else(|| mapping_error(handle, "buffer is not mapped"))?;
        let Some((readback, started)) = mapping.pending.take() else {
            return Ok(());
        };
        match self.backend.complete_read(ctx, readback) {
            Ok(data) => {
                mapping.data = data;
                if self.config.profiling {
                    entry.device_to_host.record(started.elapsed());
                }
                Ok(())
            }
            Err(s) => {
                entry.mapping = None;
                Err(self.fail(ForgeError::backend("wait_for_map", s)))
            }
        }
    }

    /// Host view of a ready mapping.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Mapping`] if not mapped or still pending.
    pub fn mapped(&self, handle: BufferHandle) -> Result<&[u8]> {
        match &self.buffers.resolve(handle)?.mapping {
            Some(m) if m.pending.is_none() => Ok(m.data.as_slice()),
            Some(_) => Err(mapping_error(handle, "mapping still pending")),
            None => Err(mapping_error(handle, "buffer is not mapped")),
        }
    }

    /// Mutable host view of a ready mapping.
    ///
    /// # Errors
    ///
    /// As [`Self::mapped`].
    pub fn mapped_mut(&mut self, handle: BufferHandle) -> Result<&mut [u8]> {
        match &mut self.buffers.resolve_mut(handle)?.mapping {
            Some(m) if m.pending.is_none() => Ok(m.data.as_mut_slice()),
            Some(_) => Err(mapping_error(handle, "mapping still pending")),
            None => Err(mapping_error(handle, "buffer is not mapped")),
        }
    }

    /// Release a mapping, uploading the host image for write modes.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Mapping`] if not mapped,
    /// [`ForgeError::Backend`] if the upload fails.
    pub fn unmap(&mut self, handle: BufferHandle) -> Result<()> {
        let ctx = self
            .context
            .as_ref()
            .ok_or(ForgeError::NotInitialized("unmap"))?;
        let entry = self.buffers.resolve_mut(handle)?;
        let mut mapping = entry
            .mapping
            .take()
            .ok_or_else(|| mapping_error(handle, "buffer is not mapped"))?;
        if let Some((readback, _)) = mapping.pending.take() {
            // Drain the in-flight read; its data is discarded.
            let _ = self.backend.complete_read(ctx, readback);
        }
        if !mapping.mode.writes() {
            return Ok(());
        }
        let Some(buffer) = entry.buffer.as_ref() else {
            return Ok(());
        };
        let started = Instant::now();
        let written = self.backend.write_buffer(ctx, buffer, &mapping.data);
        if let Err(s) = written {
            return Err(self.fail(ForgeError::backend("unmap", s)));
        }
        if self.config.profiling {
            if let Err(s) = self.backend.finish(ctx) {
                return Err(self.fail(ForgeError::backend("unmap", s)));
            }
            if let Some(e) = self.buffers.get_mut(handle) {
                e.host_to_device.record(started.elapsed());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_from_unaligned_bytes() {
        let src: Vec<u8> = [0u8]
            .iter()
            .copied()
            .chain(1.5f64.to_ne_bytes())
            .chain(2.5f64.to_ne_bytes())
            .collect();
        let values: Vec<f64> = pod_from_bytes(&src[1..]);
        assert_eq!(values, vec![1.5, 2.5]);
    }

    #[test]
    fn host_alloc_is_zeroed() {
        let data = host_alloc(17).unwrap_or_default();
        assert_eq!(data.len(), 17);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn map_mode_access() {
        assert!(MapMode::Read.reads() && !MapMode::Read.writes());
        assert!(MapMode::Write.writes() && !MapMode::Write.reads());
        assert!(MapMode::ReadWrite.reads() && MapMode::ReadWrite.writes());
    }
}
