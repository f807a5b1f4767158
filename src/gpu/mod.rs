// SPDX-License-Identifier: AGPL-3.0-only

//! Compute resource registry with an on-disk program binary cache.
//!
//! A [`Registry`] owns exactly one platform/device selection, one context
//! and command queue, and three grow-only handle tables (programs, kernels,
//! buffers). Every device interaction in the crate goes through it.
//!
//! ```text
//! select_device / auto_select  → bind platform + device
//! initialize_device            → context + queue, workgroup cap
//! create_program               → binary cache lookup, build, persist
//! init_kernel / bind_* / run   → launch with profiling sums
//! alloc_buffer / map / unmap   → device memory + host hand-off
//! finalize                     → release in dependency order
//! ```
//!
//! ## Module structure
//!
//! - `adapter` — platform/device snapshots and selection rules
//! - `backend` — the [`ComputeBackend`] seam
//! - `buffers` — allocation, transfers, map/unmap
//! - `cache` — `program<N>.inf` / `.bin` binary cache
//! - `dispatch` — kernels, argument binding, launch
//! - `handles` — typed 1-based handles and arenas
//! - `host` — in-process reference backend
//! - `programs` — program creation through the cache
//! - `status` — backend status table
//! - `telemetry` — timing sums and reports
//! - `wgpu_backend` — wgpu (Vulkan/Metal/DX12) backend

mod adapter;
mod backend;
mod buffers;
pub mod cache;
mod dispatch;
mod handles;
pub mod host;
mod programs;
mod status;
mod telemetry;
pub mod wgpu_backend;

pub use adapter::{pow2_floor, DeviceInfo, DeviceSelection, PlatformInfo, Vendor};
pub use backend::{
    BufferKind, BuildFailure, BuildOutput, ComputeBackend, KernelArg, KernelLimits, ProgramSource,
};
pub use buffers::{pod_from_bytes, BufferEntry, MapMode};
pub use dispatch::KernelEntry;
pub use handles::{BufferHandle, Handle, KernelHandle, ProgramHandle};
pub use programs::ProgramEntry;
pub use status::Status;
pub use telemetry::{KernelProfile, ProfileReport, ProfileStats, TransferProfile};

use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use serde::Deserialize;

use crate::error::{ForgeError, Result};
use handles::{Arena, BufferTag, KernelTag, ProgramTag};

/// A registry shared by every driver on the same device.
pub type SharedRegistry<B> = Rc<RefCell<Registry<B>>>;

/// Construction-time settings for one registry.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory for the binary cache and diagnostic side files.
    pub work_dir: PathBuf,
    /// Time every launch and transfer.
    pub profiling: bool,
    /// Manual work-group ceiling; 0 = device limit only.
    pub max_workgroup_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            profiling: false,
            max_workgroup_size: 0,
        }
    }
}

/// Platform and device bound by `select_device` / `auto_select`.
#[derive(Clone, Debug)]
pub struct Selection {
    pub platform: PlatformInfo,
    pub device: DeviceInfo,
}

/// Compute resource registry for one device.
///
/// Fields drop in declaration order: kernels, buffers and programs are
/// released before the context (queue), which is released before the backend.
pub struct Registry<B: ComputeBackend> {
    kernels: Arena<KernelTag, KernelEntry<B::Kernel>>,
    buffers: Arena<BufferTag, BufferEntry<B::Buffer, B::Readback>>,
    programs: Arena<ProgramTag, ProgramEntry<B::Program>>,
    context: Option<B::Context>,
    backend: B,
    config: RegistryConfig,
    selection: Option<Selection>,
    effective_max_workgroup: usize,
    active_program: ProgramHandle,
    compilations: usize,
}

// ── Construction and selection ───────────────────────────────────────

impl<B: ComputeBackend> Registry<B> {
    #[must_use]
    pub fn new(backend: B, config: RegistryConfig) -> Self {
        Self {
            kernels: Arena::default(),
            buffers: Arena::default(),
            programs: Arena::default(),
            context: None,
            backend,
            config,
            selection: None,
            effective_max_workgroup: 0,
            active_program: ProgramHandle::NULL,
            compilations: 0,
        }
    }

    /// Wrap in the shared form used by per-partition drivers.
    #[must_use]
    pub fn into_shared(self) -> SharedRegistry<B> {
        Rc::new(RefCell::new(self))
    }

    /// Every platform with its devices, in enumeration order.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Backend`] if enumeration fails.
    pub fn enumerate(&self) -> Result<Vec<(PlatformInfo, Vec<DeviceInfo>)>> {
        let platforms = self
            .backend
            .platforms()
            .map_err(|s| ForgeError::backend("enumerate platforms", s))?;
        platforms
            .into_iter()
            .map(|p| {
                let devices = self
                    .backend
                    .devices(p.index)
                    .map_err(|s| ForgeError::backend("enumerate devices", s))?;
                Ok((p, devices))
            })
            .collect()
    }

    /// Print all platforms and devices to stdout.
    pub fn print_available_devices(&self) {
        match self.enumerate() {
            Ok(inventory) => {
                println!("  Available compute devices:");
                for (platform, devices) in &inventory {
                    println!("    platform [{}] {} ({})", platform.index, platform.name, platform.vendor);
                    for d in devices {
                        println!("      {d}");
                    }
                }
                if inventory.is_empty() {
                    println!("    (none found)");
                }
            }
            Err(e) => println!("  Device enumeration failed: {e}"),
        }
    }

    /// Bind the platform and device at the given 0-based indices.
    ///
    /// # Errors
    ///
    /// [`ForgeError::PlatformNotFound`] / [`ForgeError::DeviceNotFound`] if
    /// either index is out of range.
    pub fn select_device(&mut self, platform_id: usize, device_id: usize) -> Result<&Selection> {
        let platforms = self
            .backend
            .platforms()
            .map_err(|s| ForgeError::backend("enumerate platforms", s))?;
        let p = adapter::select_platform_by_index(&platforms, platform_id)?;
        let devices = self
            .backend
            .devices(p)
            .map_err(|s| ForgeError::backend("enumerate devices", s))?;
        let d = adapter::select_device_by_index(&devices, device_id)?;
        Ok(self.bind_selection(platforms[p].clone(), devices[d].clone()))
    }

    /// Bind the first device matching the vendor filters, dropping filters
    /// that match nothing.
    ///
    /// # Errors
    ///
    /// [`ForgeError::PlatformNotFound`] / [`ForgeError::DeviceNotFound`] if
    /// no device exists at all.
    pub fn auto_select(
        &mut self,
        platform_vendor: Option<&str>,
        device_vendor: Option<&str>,
    ) -> Result<&Selection> {
        let inventory = self.enumerate()?;
        let (p, d) = adapter::auto_select(&inventory, platform_vendor, device_vendor)?;
        let (platform, devices) = inventory
            .into_iter()
            .find(|(pl, _)| pl.index == p)
            .ok_or_else(|| ForgeError::PlatformNotFound(format!("index {p}")))?;
        let device = devices
            .into_iter()
            .find(|dev| dev.index == d)
            .ok_or_else(|| ForgeError::DeviceNotFound(format!("index {d}")))?;
        Ok(self.bind_selection(platform, device))
    }

    /// Apply a configured [`DeviceSelection`].
    ///
    /// # Errors
    ///
    /// As [`Self::select_device`] / [`Self::auto_select`].
    pub fn select(&mut self, selection: &DeviceSelection) -> Result<&Selection> {
        match selection {
            DeviceSelection::Index { platform, device } => self.select_device(*platform, *device),
            DeviceSelection::Vendor {
                platform_vendor,
                device_vendor,
            } => self.auto_select(platform_vendor.as_deref(), device_vendor.as_deref()),
        }
    }

    fn bind_selection(&mut self, platform: PlatformInfo, device: DeviceInfo) -> &Selection {
        tracing::info!(
            platform = %platform.name,
            device = %device.name,
            vendor = %device.vendor_name,
            "compute device selected"
        );
        self.selection.insert(Selection { platform, device })
    }

    /// Create the context and queue, and derive the effective work-group cap.
    ///
    /// # Errors
    ///
    /// [`ForgeError::NotInitialized`] if no device was selected, or
    /// [`ForgeError::Backend`] if context creation fails.
    pub fn initialize_device(&mut self) -> Result<()> {
        let selection = self
            .selection
            .as_ref()
            .ok_or(ForgeError::NotInitialized("initialize_device: no device selected"))?;
        let (p, d) = (selection.platform.index, selection.device.index);
        let mut cap = selection.device.max_workgroup_size.max(1);
        if self.config.max_workgroup_size > 0 {
            cap = cap.min(self.config.max_workgroup_size);
        }
        if let Some(forced) = selection.device.vendor.forced_local_size() {
            cap = cap.min(forced);
        }
        let context = self
            .backend
            .create_context(p, d, self.config.profiling)
            .map_err(|s| ForgeError::backend("create context", s))?;
        self.context = Some(context);
        self.effective_max_workgroup = cap;
        tracing::info!(
            max_workgroup = cap,
            profiling = self.config.profiling,
            "device context and queue created"
        );
        Ok(())
    }
}

// ── Core accessors ───────────────────────────────────────────────────

impl<B: ComputeBackend> Registry<B> {
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    #[must_use]
    pub const fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Device snapshot, once selected.
    #[must_use]
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.selection.as_ref().map(|s| &s.device)
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.context.is_some()
    }

    /// Work-group ceiling after manual cap and vendor override.
    #[must_use]
    pub const fn effective_max_workgroup(&self) -> usize {
        self.effective_max_workgroup
    }

    /// Programs compiled from source (cache misses) so far.
    #[must_use]
    pub const fn compilations(&self) -> usize {
        self.compilations
    }

    fn ctx(&self, operation: &'static str) -> Result<&B::Context> {
        self.context
            .as_ref()
            .ok_or(ForgeError::NotInitialized(operation))
    }
}

// ── Failure diagnostics and shutdown ─────────────────────────────────

impl<B: ComputeBackend> Registry<B> {
    /// Log a failure and, for program/kernel failures, dump the active
    /// program's build log, status and options to side files.
    fn fail(&self, err: ForgeError) -> ForgeError {
        tracing::error!(error = %err, "device operation failed");
        if err.is_kernel_related() {
            let status = match &err {
                ForgeError::Backend { status, .. } | ForgeError::Build { status, .. } => *status,
                _ => Status::INVALID_KERNEL_NAME,
            };
            let (log, options) = match &err {
                ForgeError::Build { log, .. } => (log.clone(), String::new()),
                _ => self
                    .programs
                    .get(self.active_program)
                    .map(|p| (p.build_log.clone(), p.options.clone()))
                    .unwrap_or_default(),
            };
            self.dump_build_diagnostics(status, &log, &options);
        }
        err
    }

    fn dump_build_diagnostics(&self, status: Status, log: &str, options: &str) {
        let dir = &self.config.work_dir;
        let files = [
            ("build_log.txt", log.to_string()),
            ("build_status.txt", format!("{} ({})\n", status, status.0)),
            ("build_options.txt", format!("{options}\n")),
        ];
        for (name, text) in files {
            if let Err(e) = fs::write(dir.join(name), text) {
                tracing::warn!(file = name, error = %e, "could not write build diagnostics");
            }
        }
    }

    /// Profile snapshot of every live kernel and named buffer.
    #[must_use]
    pub fn profile_report(&self) -> ProfileReport {
        ProfileReport {
            device: self
                .device_info()
                .map_or_else(String::new, |d| d.name.clone()),
            kernels: self
                .kernels
                .iter()
                .map(|(_, k)| KernelProfile {
                    name: k.name.clone(),
                    stats: k.stats,
                })
                .collect(),
            transfers: self
                .buffers
                .iter()
                .filter_map(|(h, b)| {
                    (b.host_to_device.count + b.device_to_host.count > 0).then(|| TransferProfile {
                        name: b.name.clone().unwrap_or_else(|| format!("buffer {h}")),
                        host_to_device: b.host_to_device,
                        device_to_host: b.device_to_host,
                    })
                })
                .collect(),
        }
    }

    /// Release every kernel, buffer (ascending handles) and program, then
    /// the queue and context. Returns `code` unchanged.
    pub fn finalize(&mut self, code: i32) -> i32 {
        if self.config.profiling && self.context.is_some() {
            self.profile_report().print();
        }
        if let Some(ctx) = self.context.as_ref() {
            if let Err(s) = self.backend.finish(ctx) {
                tracing::warn!(status = %s, "queue did not drain before release");
            }
        }
        let kernels = self.kernels.drain_live().len();
        let buffers = self.buffers.drain_live();
        for (handle, entry) in &buffers {
            tracing::debug!(
                buffer = handle.raw(),
                name = entry.name.as_deref().unwrap_or(""),
                "buffer released"
            );
        }
        let programs = self.programs.drain_live().len();
        self.active_program = ProgramHandle::NULL;
        self.context = None;
        tracing::info!(
            kernels,
            buffers = buffers.len(),
            programs,
            code,
            "registry finalized"
        );
        code
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::host::{HostBackend, HostPlatform};
    use super::*;

    fn device(index: usize, vendor: &str, max_wg: usize) -> DeviceInfo {
        DeviceInfo {
            index,
            name: format!("{vendor} dev{index}"),
            vendor_name: vendor.into(),
            vendor: Vendor::classify(vendor, 0),
            global_mem_bytes: 1 << 30,
            local_mem_bytes: 1 << 15,
            max_alloc_bytes: 1 << 28,
            max_workgroup_size: max_wg,
            compute_units: 4,
        }
    }

    fn two_platforms() -> HostBackend {
        HostBackend::with_platforms(vec![
            HostPlatform::new("Intel OpenCL", "Intel", vec![device(0, "Intel", 512)]),
            HostPlatform::new(
                "AMD APP",
                "Advanced Micro Devices",
                vec![device(0, "Advanced Micro Devices", 1024), device(1, "Advanced Micro Devices", 256)],
            ),
        ])
    }

    fn config(max_wg: usize) -> RegistryConfig {
        RegistryConfig {
            work_dir: std::env::temp_dir(),
            profiling: false,
            max_workgroup_size: max_wg,
        }
    }

    #[test]
    fn select_by_index() {
        let mut reg = Registry::new(two_platforms(), config(0));
        let sel = reg.select_device(1, 1).unwrap();
        assert_eq!(sel.platform.name, "AMD APP");
        assert_eq!(sel.device.index, 1);
    }

    #[test]
    fn select_out_of_range_fails() {
        let mut reg = Registry::new(two_platforms(), config(0));
        assert!(matches!(
            reg.select_device(2, 0),
            Err(ForgeError::PlatformNotFound(_))
        ));
        assert!(matches!(
            reg.select_device(0, 1),
            Err(ForgeError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn auto_select_by_vendor() {
        let mut reg = Registry::new(two_platforms(), config(0));
        let sel = reg.auto_select(None, Some("advanced micro")).unwrap();
        assert_eq!(sel.platform.index, 1);
        assert_eq!(sel.device.index, 0);
    }

    #[test]
    fn initialize_requires_selection() {
        let mut reg = Registry::new(two_platforms(), config(0));
        assert!(matches!(
            reg.initialize_device(),
            Err(ForgeError::NotInitialized(_))
        ));
    }

    #[test]
    fn workgroup_cap_and_vendor_override() {
        let mut reg = Registry::new(two_platforms(), config(128));
        reg.select_device(0, 0).unwrap();
        reg.initialize_device().unwrap();
        assert_eq!(reg.effective_max_workgroup(), 128);

        let mut amd = Registry::new(two_platforms(), config(0));
        amd.select_device(1, 0).unwrap();
        amd.initialize_device().unwrap();
        assert_eq!(amd.effective_max_workgroup(), 64);
    }

    #[test]
    fn finalize_passes_code_through() {
        let mut reg = Registry::new(two_platforms(), config(0));
        reg.select_device(0, 0).unwrap();
        reg.initialize_device().unwrap();
        assert_eq!(reg.finalize(3), 3);
        assert!(!reg.is_initialized());
    }
}
