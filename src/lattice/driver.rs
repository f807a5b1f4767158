// SPDX-License-Identifier: AGPL-3.0-only

//! Per-partition simulation drivers.
//!
//! The orchestrator sequences drivers through [`SimulationDriver`] and never
//! touches device state directly. [`LatticeDriver`] is the registry-backed
//! implementation: one lattice buffer (with ghost rows when its device is
//! shared), measurement and energy buffers, optional observable buffers, and
//! four model kernels taken from a [`KernelSet`].
//!
//! # Kernel ABI
//!
//! Every model kernel receives the same argument list:
//!
//! | Index | Argument |
//! |-------|----------|
//! | 0 | lattice (`(rows + ghosts) × row_elems`) |
//! | 1 | measurement (one partial sum per real row) |
//! | 2 | energy (one slot per working pass) |
//! | 3 | [`KernelParams`] |
//! | 4.. | enabled optional buffers: plaquette energy, Wilson loop, Polyakov loop |

use std::fs;
use std::path::PathBuf;

use bytemuck::{Pod, Zeroable};
use serde::Deserialize;

use super::checkpoint::{Checkpoint, CheckpointError, CheckpointHeader, CheckpointLocation};
use super::field::{FieldData, ShadowBuffer};
use super::params::{RunParams, StartType};
use super::partition::Partition;
use crate::error::{ForgeError, Result};
use crate::gpu::{
    BufferHandle, BufferKind, ComputeBackend, KernelHandle, MapMode, ProgramHandle,
    SharedRegistry,
};

/// Passes completed by one driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub therm_done: u32,
    pub iter_done: u32,
}

/// Which counter an update advances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Thermalizing,
    Working,
}

impl Phase {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Thermalizing => 0,
            Self::Working => 1,
        }
    }
}

/// Operations the orchestrator drives on each partition.
///
/// Transfers are split into an issue step and a wait step so a whole color
/// can be issued before the orchestrator blocks on any of it.
pub trait SimulationDriver {
    /// Cold/hot start via the init kernel, or checkpoint restore. A failed
    /// restore leaves the driver uninitialized rather than erroring.
    ///
    /// # Errors
    ///
    /// Fatal registry errors.
    fn init_lattice(&mut self) -> Result<()>;

    fn is_initialized(&self) -> bool;

    fn counters(&self) -> Counters;

    /// Stage `shadow` (ghost rows included) for upload.
    ///
    /// # Errors
    ///
    /// Mapping or size errors.
    fn upload_partition(&mut self, shadow: &ShadowBuffer) -> Result<()>;

    /// Complete a staged upload. No-op when nothing is staged.
    ///
    /// # Errors
    ///
    /// Backend transfer errors.
    fn wait_for_table_write(&mut self) -> Result<()>;

    /// Launch one update sweep and advance the counter for `phase`.
    ///
    /// # Errors
    ///
    /// Launch errors.
    fn update(&mut self, phase: Phase) -> Result<()>;

    /// # Errors
    ///
    /// Queue errors.
    fn wait_for_kernels(&mut self) -> Result<()>;

    /// Launch the reunitarization sweep.
    ///
    /// # Errors
    ///
    /// Launch errors.
    fn orthogonalize(&mut self) -> Result<()>;

    /// # Errors
    ///
    /// Queue errors.
    fn wait_for_queue(&mut self) -> Result<()>;

    /// Start reading the partition back to the host.
    ///
    /// # Errors
    ///
    /// Mapping errors.
    fn download_partition(&mut self) -> Result<()>;

    /// Complete a download into `shadow`. No-op when none is in flight.
    ///
    /// # Errors
    ///
    /// Backend transfer or size errors.
    fn wait_for_table_read(&mut self, shadow: &mut ShadowBuffer) -> Result<()>;

    /// # Errors
    ///
    /// Launch or transfer errors.
    fn measure(&mut self) -> Result<()>;

    /// # Errors
    ///
    /// [`ForgeError::Checkpoint`] on I/O failure, registry errors otherwise.
    fn save_state(&mut self) -> Result<()>;

    /// # Errors
    ///
    /// [`ForgeError::Checkpoint`] if the file is missing or invalid.
    fn load_state(&mut self) -> Result<()>;

    /// Release driver-owned device resources.
    ///
    /// # Errors
    ///
    /// Registry errors.
    fn finalize(&mut self) -> Result<()>;
}

/// Creates one driver per partition.
pub trait DriverFactory {
    type Driver: SimulationDriver;

    /// # Errors
    ///
    /// Registry or configuration errors.
    fn create(&mut self, partition: &Partition, params: &RunParams) -> Result<Self::Driver>;

    /// Release shared resources; returns `code` unchanged.
    fn finalize(&mut self, code: i32) -> i32;
}

// ── Kernel set ───────────────────────────────────────────────────────

/// Entry point names of the model kernels.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KernelEntries {
    pub init: String,
    pub update: String,
    pub orthogonalize: String,
    pub measure: String,
}

impl Default for KernelEntries {
    fn default() -> Self {
        Self {
            init: "lattice_init".into(),
            update: "lattice_update".into(),
            orthogonalize: "lattice_orthogonalize".into(),
            measure: "lattice_measure".into(),
        }
    }
}

/// Program source, build options and entry points for the model.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KernelSet {
    /// File read by [`Self::load_source`] when `source` is empty.
    pub source_path: Option<PathBuf>,
    #[serde(skip)]
    pub source: String,
    pub options: String,
    pub entries: KernelEntries,
}

impl KernelSet {
    #[must_use]
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    /// Read `source_path` into `source` unless already set.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Config`] if neither is set, [`ForgeError::Io`] if the
    /// file cannot be read.
    pub fn load_source(&mut self) -> Result<()> {
        if !self.source.is_empty() {
            return Ok(());
        }
        let path = self
            .source_path
            .as_ref()
            .ok_or_else(|| ForgeError::Config("kernel set has no source".into()))?;
        self.source = fs::read_to_string(path)?;
        Ok(())
    }
}

/// Parameter block passed to every model kernel (argument 3).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct KernelParams {
    /// Real rows in this partition.
    pub rows: u32,
    pub row_elems: u32,
    pub site_elems: u32,
    /// First global row owned by this partition.
    pub first_row: u32,
    /// Extent of the leading axis.
    pub total_rows: u32,
    /// 1 if the buffer carries ghost rows.
    pub ghost: u32,
    pub phase: u32,
    /// Pass counter for `phase` (or measurement index for the measure kernel).
    pub step: u32,
    pub start: u32,
    pub seed_lo: u32,
    pub seed_hi: u32,
    pub beta: f32,
}

const PARAMS_ARG: usize = 3;

// ── LatticeDriver ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
struct DriverKernels {
    init: KernelHandle,
    update: KernelHandle,
    orthogonalize: KernelHandle,
    measure: KernelHandle,
}

#[derive(Clone, Copy, Debug, Default)]
struct OptionalBuffers {
    plaquette_energy: Option<BufferHandle>,
    wilson_loop: Option<BufferHandle>,
    polyakov_loop: Option<BufferHandle>,
}

impl OptionalBuffers {
    fn handles(self) -> [Option<BufferHandle>; 3] {
        [self.plaquette_energy, self.wilson_loop, self.polyakov_loop]
    }
}

/// Registry-backed driver for one partition.
pub struct LatticeDriver<B: ComputeBackend> {
    registry: SharedRegistry<B>,
    partition: Partition,
    params: RunParams,
    location: CheckpointLocation,
    seed: u64,
    /// Start type recorded in checkpoints (the original one after a restore).
    start: u32,
    kernels: DriverKernels,
    lattice: BufferHandle,
    measurement: BufferHandle,
    energy: BufferHandle,
    optional: OptionalBuffers,
    counters: Counters,
    initialized: bool,
    prng_counter: u64,
    measurements_taken: u32,
    upload_pending: bool,
    download_pending: bool,
    history: Vec<f64>,
}

impl<B: ComputeBackend> LatticeDriver<B> {
    /// Allocate buffers and kernels for `partition` on `registry`, using the
    /// already built `program`.
    ///
    /// # Errors
    ///
    /// Registry allocation or kernel lookup errors.
    pub fn new(
        registry: SharedRegistry<B>,
        program: ProgramHandle,
        entries: &KernelEntries,
        partition: Partition,
        params: RunParams,
        location: CheckpointLocation,
        seed: u64,
    ) -> Result<Self> {
        let elem = params.precision.elem_size();
        let sites = partition.rows * params.row_sites();
        let (kernels, lattice, measurement, energy, optional) = {
            let mut reg = registry.borrow_mut();
            let lattice = reg.alloc_buffer(BufferKind::InputOutput, partition.buffer_elems(), elem, None)?;
            reg.name_buffer(lattice, &format!("lattice p{}", partition.index))?;
            let measurement = reg.alloc_buffer(BufferKind::Global, partition.rows, elem, None)?;
            reg.name_buffer(measurement, &format!("measurement p{}", partition.index))?;
            let energy =
                reg.alloc_buffer(BufferKind::Global, params.iter.max(1) as usize, elem, None)?;
            let m = params.measurements;
            let mut optional = OptionalBuffers::default();
            if m.plaquette_energy {
                optional.plaquette_energy =
                    Some(reg.alloc_buffer(BufferKind::Global, partition.rows, elem, None)?);
            }
            if m.wilson_loop {
                let count = (params.wilson_r * params.wilson_t) as usize;
                optional.wilson_loop = Some(reg.alloc_buffer(BufferKind::Global, count, elem, None)?);
            }
            if m.polyakov_loop {
                optional.polyakov_loop =
                    Some(reg.alloc_buffer(BufferKind::Global, params.row_sites(), elem, None)?);
            }

            reg.set_active_program(program)?;
            let mut init = |name: &str| -> Result<KernelHandle> {
                let k = reg.init_kernel(name, 1, [sites, 1, 1], None)?;
                for buf in [lattice, measurement, energy] {
                    reg.bind_buffer(k, buf)?;
                }
                reg.bind_scalar(k, KernelParams::default())?;
                for buf in optional.handles().into_iter().flatten() {
                    reg.bind_buffer(k, buf)?;
                }
                Ok(k)
            };
            let kernels = DriverKernels {
                init: init(&entries.init)?,
                update: init(&entries.update)?,
                orthogonalize: init(&entries.orthogonalize)?,
                measure: init(&entries.measure)?,
            };
            (kernels, lattice, measurement, energy, optional)
        };
        tracing::debug!(
            partition = partition.index,
            device = partition.device,
            rows = partition.rows,
            ghosts = partition.ghost_rows(),
            "driver created"
        );
        Ok(Self {
            registry,
            partition,
            start: params.start.code(),
            params,
            location,
            seed,
            kernels,
            lattice,
            measurement,
            energy,
            optional,
            counters: Counters::default(),
            initialized: false,
            prng_counter: 0,
            measurements_taken: 0,
            upload_pending: false,
            download_pending: false,
            history: Vec::new(),
        })
    }

    #[must_use]
    pub const fn partition(&self) -> &Partition {
        &self.partition
    }

    #[must_use]
    pub const fn registry(&self) -> &SharedRegistry<B> {
        &self.registry
    }

    /// Device buffer holding this partition's lattice.
    #[must_use]
    pub const fn lattice_buffer(&self) -> BufferHandle {
        self.lattice
    }

    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Mean measured value per site, one entry per [`SimulationDriver::measure`].
    #[must_use]
    pub fn history(&self) -> &[f64] {
        &self.history
    }

    /// Real rows of the lattice, ghosts stripped.
    ///
    /// # Errors
    ///
    /// Registry transfer errors.
    pub fn read_lattice(&self) -> Result<FieldData> {
        let bytes = self.registry.borrow_mut().read_buffer(self.lattice)?;
        Ok(FieldData::from_bytes(
            self.params.precision,
            &bytes[self.real_range()],
        ))
    }

    fn row_bytes(&self) -> usize {
        self.partition.row_elems * self.params.precision.elem_size()
    }

    fn real_range(&self) -> std::ops::Range<usize> {
        let start = self.partition.ghost_rows() / 2 * self.row_bytes();
        start..start + self.partition.rows * self.row_bytes()
    }

    fn domain_dims(&self) -> [u32; 4] {
        let d = self.params.topology.dims;
        [u32::try_from(self.partition.rows).unwrap_or(u32::MAX), d[1], d[2], d[3]]
    }

    fn kernel_params(&self, phase: Phase, step: u32) -> KernelParams {
        let to_u32 = |v: usize| u32::try_from(v).unwrap_or(u32::MAX);
        KernelParams {
            rows: to_u32(self.partition.rows),
            row_elems: to_u32(self.partition.row_elems),
            site_elems: self.params.topology.site_elems,
            first_row: to_u32(self.partition.first_row),
            total_rows: self.params.topology.dims[0],
            ghost: u32::from(!self.partition.sole_occupant),
            phase: phase.code(),
            step,
            start: self.params.start.code(),
            seed_lo: self.seed as u32,
            seed_hi: (self.seed >> 32) as u32,
            beta: self.params.beta as f32,
        }
    }

    fn launch(&self, kernel: KernelHandle, params: KernelParams, wait: bool) -> Result<()> {
        let mut reg = self.registry.borrow_mut();
        reg.set_scalar(kernel, PARAMS_ARG, params)?;
        if wait {
            reg.run(kernel)
        } else {
            reg.run_async(kernel)
        }
    }

    fn sites(&self) -> u64 {
        (self.partition.rows * self.params.row_sites()) as u64
    }

    fn read_field(&self, buffer: BufferHandle) -> Result<FieldData> {
        let bytes = self.registry.borrow_mut().read_buffer(buffer)?;
        Ok(FieldData::from_bytes(self.params.precision, &bytes))
    }

    /// Write `data` into `buffer` if the element counts agree.
    fn restore_field(&self, buffer: BufferHandle, data: &FieldData, what: &str) -> Result<()> {
        let mut reg = self.registry.borrow_mut();
        if reg.buffer(buffer)?.count != data.len() {
            tracing::warn!(
                partition = self.partition.index,
                buffer = what,
                saved = data.len(),
                "checkpoint buffer size differs; left unrestored"
            );
            return Ok(());
        }
        reg.write_buffer(buffer, data.as_bytes())
    }

    fn checkpoint(&self) -> Result<Checkpoint> {
        let p = &self.params;
        let header = CheckpointHeader {
            initialized: self.initialized,
            start: self.start,
            seed: self.seed,
            generator: p.prng.generator,
            skip: p.prng.skip,
            counter: self.prng_counter,
            nav: p.nav,
            iter: p.iter,
            therm_done: self.counters.therm_done,
            iter_done: self.counters.iter_done,
            multi_hit: p.multi_hit,
            wilson_r: p.wilson_r,
            wilson_t: p.wilson_t,
            precision: p.precision,
            beta: p.beta,
            phi: p.phi,
            omega: p.omega,
            polyakov_level: p.polyakov_level,
            tensor: [p.tensor.mu, p.tensor.nu, p.tensor.flags],
            kind: p.topology.kind.code(),
            group: p.topology.group,
            full_dims: p.topology.dims,
            domain_dims: self.domain_dims(),
        };
        let optional = |h: Option<BufferHandle>| h.map(|b| self.read_field(b)).transpose();
        Ok(Checkpoint {
            header,
            measurement: self.read_field(self.measurement)?,
            energy: self.read_field(self.energy)?,
            plaquette_energy: optional(self.optional.plaquette_energy)?,
            wilson_loop: optional(self.optional.wilson_loop)?,
            polyakov_loop: optional(self.optional.polyakov_loop)?,
            lattice: self.read_lattice()?,
        })
    }

    fn validate(&self, ckpt: &Checkpoint) -> std::result::Result<(), CheckpointError> {
        ckpt.check_domain(self.domain_dims())?;
        if ckpt.header.precision != self.params.precision {
            return Err(CheckpointError::BadPrecision(ckpt.header.precision.tag()));
        }
        if ckpt.lattice.len() != self.partition.rows * self.partition.row_elems {
            return Err(CheckpointError::Truncated);
        }
        Ok(())
    }
}

impl<B: ComputeBackend> SimulationDriver for LatticeDriver<B> {
    fn init_lattice(&mut self) -> Result<()> {
        if self.params.start == StartType::Checkpoint {
            return match self.load_state() {
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(
                        partition = self.partition.index,
                        error = %e,
                        "checkpoint not restored; partition stays uninitialized"
                    );
                    Ok(())
                }
                other => other,
            };
        }
        self.launch(
            self.kernels.init,
            self.kernel_params(Phase::Thermalizing, 0),
            true,
        )?;
        self.initialized = true;
        self.counters = Counters::default();
        if self.params.start == StartType::Hot {
            self.prng_counter += self.sites();
        }
        tracing::debug!(
            partition = self.partition.index,
            start = ?self.params.start,
            "lattice initialized"
        );
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn counters(&self) -> Counters {
        self.counters
    }

    fn upload_partition(&mut self, shadow: &ShadowBuffer) -> Result<()> {
        let mut reg = self.registry.borrow_mut();
        let src = shadow.data().as_bytes();
        let expected = reg.buffer(self.lattice)?.bytes;
        if src.len() != expected {
            return Err(ForgeError::Config(format!(
                "partition {} shadow holds {} bytes, device buffer {expected}",
                self.partition.index,
                src.len()
            )));
        }
        reg.map(self.lattice, MapMode::Write, true)?;
        reg.mapped_mut(self.lattice)?.copy_from_slice(src);
        self.upload_pending = true;
        Ok(())
    }

    fn wait_for_table_write(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.upload_pending) {
            return Ok(());
        }
        self.registry.borrow_mut().unmap(self.lattice)
    }

    fn update(&mut self, phase: Phase) -> Result<()> {
        let step = match phase {
            Phase::Thermalizing => self.counters.therm_done,
            Phase::Working => self.counters.iter_done,
        };
        self.launch(self.kernels.update, self.kernel_params(phase, step), false)?;
        match phase {
            Phase::Thermalizing => self.counters.therm_done += 1,
            Phase::Working => self.counters.iter_done += 1,
        }
        self.prng_counter += self.sites() * u64::from(self.params.multi_hit.max(1));
        Ok(())
    }

    fn wait_for_kernels(&mut self) -> Result<()> {
        self.registry.borrow().wait_for_queue_finish()
    }

    fn orthogonalize(&mut self) -> Result<()> {
        let params = self.kernel_params(Phase::Working, self.counters.iter_done);
        self.launch(self.kernels.orthogonalize, params, false)
    }

    fn wait_for_queue(&mut self) -> Result<()> {
        self.registry.borrow().wait_for_queue_finish()
    }

    fn download_partition(&mut self) -> Result<()> {
        self.registry
            .borrow_mut()
            .map(self.lattice, MapMode::Read, false)?;
        self.download_pending = true;
        Ok(())
    }

    fn wait_for_table_read(&mut self, shadow: &mut ShadowBuffer) -> Result<()> {
        if !std::mem::take(&mut self.download_pending) {
            return Ok(());
        }
        let mut reg = self.registry.borrow_mut();
        reg.wait_for_map(self.lattice)?;
        let copied = {
            let data = reg.mapped(self.lattice)?;
            let dst = shadow.data_mut().as_bytes_mut();
            if dst.len() == data.len() {
                dst.copy_from_slice(data);
                Ok(())
            } else {
                Err(ForgeError::Config(format!(
                    "partition {} shadow holds {} bytes, device buffer {}",
                    self.partition.index,
                    dst.len(),
                    data.len()
                )))
            }
        };
        reg.unmap(self.lattice)?;
        copied
    }

    fn measure(&mut self) -> Result<()> {
        let params = self.kernel_params(Phase::Working, self.measurements_taken);
        self.launch(self.kernels.measure, params, true)?;
        let sums = self.read_field(self.measurement)?;
        let total: f64 = (0..sums.len()).filter_map(|i| sums.get(i)).sum();
        let value = total / self.sites().max(1) as f64;
        self.history.push(value);
        self.measurements_taken += 1;
        tracing::info!(
            partition = self.partition.index,
            pass = self.counters.iter_done,
            value,
            "measurement"
        );
        Ok(())
    }

    fn save_state(&mut self) -> Result<()> {
        let path = self.location.path_for(self.partition.index);
        let ckpt = self.checkpoint()?;
        fs::create_dir_all(&self.location.dir)
            .map_err(CheckpointError::from)
            .and_then(|()| ckpt.save(&path))
            .map_err(|source| ForgeError::Checkpoint {
                path: path.clone(),
                source,
            })?;
        tracing::info!(
            partition = self.partition.index,
            path = %path.display(),
            therm_done = self.counters.therm_done,
            iter_done = self.counters.iter_done,
            "checkpoint saved"
        );
        Ok(())
    }

    fn load_state(&mut self) -> Result<()> {
        let path = self.location.path_for(self.partition.index);
        let ckpt = Checkpoint::load(&path)
            .and_then(|c| self.validate(&c).map(|()| c))
            .map_err(|source| ForgeError::Checkpoint {
                path: path.clone(),
                source,
            })?;

        let mut image = vec![0u8; self.partition.buffer_elems() * self.params.precision.elem_size()];
        image[self.real_range()].copy_from_slice(ckpt.lattice.as_bytes());
        self.registry.borrow_mut().write_buffer(self.lattice, &image)?;
        self.restore_field(self.measurement, &ckpt.measurement, "measurement")?;
        self.restore_field(self.energy, &ckpt.energy, "energy")?;
        let saved = [
            ckpt.plaquette_energy.as_ref(),
            ckpt.wilson_loop.as_ref(),
            ckpt.polyakov_loop.as_ref(),
        ];
        for (handle, data) in self.optional.handles().into_iter().zip(saved) {
            if let (Some(h), Some(d)) = (handle, data) {
                self.restore_field(h, d, "observable")?;
            }
        }

        let h = &ckpt.header;
        self.initialized = h.initialized;
        self.counters = Counters {
            therm_done: h.therm_done,
            iter_done: h.iter_done,
        };
        self.seed = h.seed;
        self.start = h.start;
        self.prng_counter = h.counter;
        tracing::info!(
            partition = self.partition.index,
            path = %path.display(),
            initialized = h.initialized,
            therm_done = h.therm_done,
            iter_done = h.iter_done,
            "checkpoint loaded"
        );
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let mut reg = self.registry.borrow_mut();
        let handles = [Some(self.lattice), Some(self.measurement), Some(self.energy)]
            .into_iter()
            .chain(self.optional.handles())
            .flatten();
        for h in handles {
            reg.buffer_kill(h)?;
        }
        Ok(())
    }
}

// ── Factory ──────────────────────────────────────────────────────────

/// Builds [`LatticeDriver`]s on per-device registries. Drivers on the same
/// device share that device's registry and program.
pub struct LatticeDriverFactory<B: ComputeBackend> {
    registries: Vec<SharedRegistry<B>>,
    programs: Vec<Option<ProgramHandle>>,
    kernels: KernelSet,
    location: CheckpointLocation,
}

impl<B: ComputeBackend> LatticeDriverFactory<B> {
    /// `registries[d]` must already be selected and initialized.
    #[must_use]
    pub fn new(
        registries: Vec<SharedRegistry<B>>,
        kernels: KernelSet,
        location: CheckpointLocation,
    ) -> Self {
        let programs = vec![None; registries.len()];
        Self {
            registries,
            programs,
            kernels,
            location,
        }
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.registries.len()
    }

    #[must_use]
    pub fn registry(&self, device: usize) -> Option<&SharedRegistry<B>> {
        self.registries.get(device)
    }

    fn program(&mut self, device: usize) -> Result<ProgramHandle> {
        if let Some(Some(handle)) = self.programs.get(device) {
            return Ok(*handle);
        }
        let registry = self
            .registries
            .get(device)
            .ok_or_else(|| ForgeError::Config(format!("no registry for device {device}")))?;
        let handle = registry
            .borrow_mut()
            .create_program(&self.kernels.source, &self.kernels.options)?;
        self.programs[device] = Some(handle);
        Ok(handle)
    }
}

impl<B: ComputeBackend> DriverFactory for LatticeDriverFactory<B> {
    type Driver = LatticeDriver<B>;

    fn create(&mut self, partition: &Partition, params: &RunParams) -> Result<Self::Driver> {
        let program = self.program(partition.device)?;
        let registry = self.registries[partition.device].clone();
        let seed = params.prng.seed.wrapping_add(partition.index as u64);
        LatticeDriver::new(
            registry,
            program,
            &self.kernels.entries,
            partition.clone(),
            params.clone(),
            self.location.clone(),
            seed,
        )
    }

    fn finalize(&mut self, code: i32) -> i32 {
        for registry in &self.registries {
            registry.borrow_mut().finalize(code);
        }
        code
    }
}
