// SPDX-License-Identifier: AGPL-3.0-only

//! In-process reference backend.
//!
//! Kernels are Rust closures registered by name in a [`HostKernelLibrary`].
//! A program "source" declares which of them it provides with
//! `__kernel void <name>(` lines; building fails if a declared kernel is not
//! registered or the source contains `#error`. The program binary is a small
//! text image listing the entry points, so binary-cache round trips can be
//! exercised without a GPU.

use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;

use bytemuck::Pod;

use super::adapter::{DeviceInfo, PlatformInfo, Vendor};
use super::backend::{
    BufferKind, BuildFailure, BuildOutput, ComputeBackend, KernelArg, KernelLimits, ProgramSource,
};
use super::Status;

const BINARY_MAGIC: &str = "HOSTBIN1";

/// Host kernel body. Receives the launch geometry and resolved arguments.
pub type HostKernelFn = Rc<dyn Fn(&mut HostInvocation<'_>) -> Result<(), Status>>;

/// Named host kernels shared by every backend built from it.
#[derive(Clone, Default)]
pub struct HostKernelLibrary {
    kernels: HashMap<String, HostKernelFn>,
}

impl HostKernelLibrary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `body` under `name`, replacing any previous kernel.
    #[must_use]
    pub fn with(
        mut self,
        name: &str,
        body: impl Fn(&mut HostInvocation<'_>) -> Result<(), Status> + 'static,
    ) -> Self {
        self.kernels.insert(name.to_string(), Rc::new(body));
        self
    }

    fn get(&self, name: &str) -> Option<&HostKernelFn> {
        self.kernels.get(name)
    }
}

/// A platform exposed by the host backend.
#[derive(Clone, Debug)]
pub struct HostPlatform {
    pub name: String,
    pub vendor: String,
    pub devices: Vec<DeviceInfo>,
}

impl HostPlatform {
    #[must_use]
    pub fn new(name: &str, vendor: &str, devices: Vec<DeviceInfo>) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
            devices,
        }
    }
}

/// Snapshot of a host "device" with the given index and name.
#[must_use]
pub fn host_device(index: usize, name: &str) -> DeviceInfo {
    let units = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    DeviceInfo {
        index,
        name: name.into(),
        vendor_name: "latticeforge".into(),
        vendor: Vendor::Other,
        global_mem_bytes: 4 << 30,
        local_mem_bytes: 64 << 10,
        max_alloc_bytes: 1 << 30,
        max_workgroup_size: 256,
        compute_units: u32::try_from(units).unwrap_or(u32::MAX),
    }
}

/// Reference backend executing kernels on the calling thread.
#[derive(Clone)]
pub struct HostBackend {
    platforms: Vec<HostPlatform>,
    library: HostKernelLibrary,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::with_devices(1)
    }
}

impl HostBackend {
    /// One platform holding `count` identical host devices.
    #[must_use]
    pub fn with_devices(count: usize) -> Self {
        let devices = (0..count)
            .map(|i| host_device(i, &format!("Host CPU {i}")))
            .collect();
        Self::with_platforms(vec![HostPlatform::new(
            "Host Reference",
            "latticeforge",
            devices,
        )])
    }

    #[must_use]
    pub fn with_platforms(platforms: Vec<HostPlatform>) -> Self {
        Self {
            platforms,
            library: HostKernelLibrary::default(),
        }
    }

    #[must_use]
    pub fn with_library(mut self, library: HostKernelLibrary) -> Self {
        self.library = library;
        self
    }

    fn device(&self, platform: usize, device: usize) -> Result<&DeviceInfo, Status> {
        self.platforms
            .get(platform)
            .ok_or(Status::INVALID_PLATFORM)?
            .devices
            .get(device)
            .ok_or(Status::DEVICE_NOT_FOUND)
    }

    fn compile(&self, source: &str) -> Result<Vec<String>, BuildFailure> {
        if let Some(line) = source.lines().find(|l| l.trim_start().starts_with("#error")) {
            return Err(BuildFailure {
                status: Status::BUILD_PROGRAM_FAILURE,
                log: format!("error: {}\n", line.trim()),
            });
        }
        let entries = declared_kernels(source);
        let missing: Vec<&String> = entries
            .iter()
            .filter(|name| self.library.get(name).is_none())
            .collect();
        if !missing.is_empty() {
            let log = missing.iter().fold(String::new(), |mut acc, name| {
                acc.push_str(&format!("error: undefined kernel '{name}'\n"));
                acc
            });
            return Err(BuildFailure {
                status: Status::BUILD_PROGRAM_FAILURE,
                log,
            });
        }
        Ok(entries)
    }
}

/// Names declared with `__kernel void <name>(` in `source`.
fn declared_kernels(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find("__kernel") {
        rest = &rest[pos + "__kernel".len()..];
        let decl = rest.trim_start();
        let Some(after_void) = decl.strip_prefix("void") else {
            continue;
        };
        let name: String = after_void
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Context for one host device.
#[derive(Debug)]
pub struct HostContext {
    pub device: DeviceInfo,
    pub profiling: bool,
}

/// Built host program.
#[derive(Clone, Debug)]
pub struct HostProgram {
    pub entries: Vec<String>,
    pub options: String,
}

impl HostProgram {
    fn to_binary(&self) -> Vec<u8> {
        let mut text = format!("{BINARY_MAGIC}\n{}\n", self.options);
        for e in &self.entries {
            text.push_str(e);
            text.push('\n');
        }
        text.into_bytes()
    }

    fn from_binary(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        let mut lines = text.lines();
        if lines.next()? != BINARY_MAGIC {
            return None;
        }
        let options = lines.next()?.to_string();
        let entries = lines.filter(|l| !l.is_empty()).map(String::from).collect();
        Some(Self { entries, options })
    }
}

/// Host kernel bound to its body.
#[derive(Clone)]
pub struct HostKernel {
    pub name: String,
    body: HostKernelFn,
}

/// Backing store, kept in `u64` words so any scalar view is aligned.
#[derive(Debug)]
pub struct HostStorage {
    words: Vec<u64>,
    len: usize,
}

impl HostStorage {
    fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(8)],
            len,
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }
}

/// Host buffer (shared so a kernel sees writes made through other handles).
pub type HostBuffer = Rc<RefCell<HostStorage>>;

enum HostArg<'a> {
    Buffer(RefMut<'a, HostStorage>),
    Scalar(&'a [u8]),
    Local(usize),
}

/// Arguments and geometry visible to a host kernel body.
pub struct HostInvocation<'a> {
    pub dims: usize,
    pub global: [usize; 3],
    pub local: [usize; 3],
    args: Vec<HostArg<'a>>,
}

impl HostInvocation<'_> {
    /// Total work items across all dimensions.
    #[must_use]
    pub fn work_items(&self) -> usize {
        self.global[..self.dims.max(1)].iter().product()
    }

    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Typed view of the buffer argument at `index`.
    ///
    /// # Errors
    ///
    /// [`Status::INVALID_ARG_INDEX`] if the slot is not a buffer, or
    /// [`Status::INVALID_ARG_SIZE`] if its size is not a multiple of `T`.
    pub fn buffer<T: Pod>(&mut self, index: usize) -> Result<&mut [T], Status> {
        match self.args.get_mut(index) {
            Some(HostArg::Buffer(storage)) => bytemuck::try_cast_slice_mut(storage.bytes_mut())
                .map_err(|_| Status::INVALID_ARG_SIZE),
            _ => Err(Status::INVALID_ARG_INDEX),
        }
    }

    /// Two distinct buffer arguments at once.
    ///
    /// # Errors
    ///
    /// As [`Self::buffer`], plus [`Status::INVALID_ARG_INDEX`] if `a == b`.
    pub fn buffer_pair<T: Pod>(
        &mut self,
        a: usize,
        b: usize,
    ) -> Result<(&mut [T], &mut [T]), Status> {
        if a == b || a.max(b) >= self.args.len() {
            return Err(Status::INVALID_ARG_INDEX);
        }
        let (lo, hi) = (a.min(b), a.max(b));
        let (head, tail) = self.args.split_at_mut(hi);
        let (HostArg::Buffer(x), HostArg::Buffer(y)) = (&mut head[lo], &mut tail[0]) else {
            return Err(Status::INVALID_ARG_INDEX);
        };
        let x: &mut [T] =
            bytemuck::try_cast_slice_mut(x.bytes_mut()).map_err(|_| Status::INVALID_ARG_SIZE)?;
        let y: &mut [T] =
            bytemuck::try_cast_slice_mut(y.bytes_mut()).map_err(|_| Status::INVALID_ARG_SIZE)?;
        Ok(if a < b { (x, y) } else { (y, x) })
    }

    /// Scalar argument at `index`, read by value.
    ///
    /// # Errors
    ///
    /// [`Status::INVALID_ARG_INDEX`] / [`Status::INVALID_ARG_SIZE`].
    pub fn scalar<T: Pod>(&self, index: usize) -> Result<T, Status> {
        match self.args.get(index) {
            Some(HostArg::Scalar(bytes)) if bytes.len() == std::mem::size_of::<T>() => {
                Ok(bytemuck::pod_read_unaligned(bytes))
            }
            Some(HostArg::Scalar(_)) => Err(Status::INVALID_ARG_SIZE),
            _ => Err(Status::INVALID_ARG_INDEX),
        }
    }

    /// Byte size of the local-scratch argument at `index`.
    ///
    /// # Errors
    ///
    /// [`Status::INVALID_ARG_INDEX`] if the slot is not local scratch.
    pub fn local_bytes(&self, index: usize) -> Result<usize, Status> {
        match self.args.get(index) {
            Some(HostArg::Local(n)) => Ok(*n),
            _ => Err(Status::INVALID_ARG_INDEX),
        }
    }
}

impl ComputeBackend for HostBackend {
    type Context = HostContext;
    type Program = HostProgram;
    type Kernel = HostKernel;
    type Buffer = HostBuffer;
    type Readback = Vec<u8>;

    fn platforms(&self) -> Result<Vec<PlatformInfo>, Status> {
        Ok(self
            .platforms
            .iter()
            .enumerate()
            .map(|(index, p)| PlatformInfo {
                index,
                name: p.name.clone(),
                vendor: p.vendor.clone(),
            })
            .collect())
    }

    fn devices(&self, platform: usize) -> Result<Vec<DeviceInfo>, Status> {
        self.platforms
            .get(platform)
            .map(|p| p.devices.clone())
            .ok_or(Status::INVALID_PLATFORM)
    }

    fn create_context(
        &mut self,
        platform: usize,
        device: usize,
        profiling: bool,
    ) -> Result<HostContext, Status> {
        Ok(HostContext {
            device: self.device(platform, device)?.clone(),
            profiling,
        })
    }

    fn build_program(
        &self,
        _ctx: &HostContext,
        source: ProgramSource<'_>,
        options: &str,
    ) -> Result<BuildOutput<HostProgram>, BuildFailure> {
        let program = match source {
            ProgramSource::Text(text) => HostProgram {
                entries: self.compile(text)?,
                options: options.to_string(),
            },
            ProgramSource::Binary { binary, .. } => {
                let program = HostProgram::from_binary(binary).ok_or(BuildFailure {
                    status: Status::INVALID_BINARY,
                    log: "error: unrecognized host binary image\n".into(),
                })?;
                if let Some(name) = program.entries.iter().find(|n| self.library.get(n).is_none()) {
                    return Err(BuildFailure {
                        status: Status::INVALID_BINARY,
                        log: format!("error: binary references undefined kernel '{name}'\n"),
                    });
                }
                program
            }
        };
        Ok(BuildOutput {
            log: format!("{} kernel(s) built\n", program.entries.len()),
            program,
        })
    }

    fn program_binary(&self, _ctx: &HostContext, program: &HostProgram) -> Result<Vec<u8>, Status> {
        Ok(program.to_binary())
    }

    fn create_kernel(
        &self,
        ctx: &HostContext,
        program: &HostProgram,
        name: &str,
    ) -> Result<(HostKernel, KernelLimits), Status> {
        if !program.entries.iter().any(|e| e == name) {
            return Err(Status::INVALID_KERNEL_NAME);
        }
        let body = self.library.get(name).ok_or(Status::INVALID_KERNEL_NAME)?;
        let limits = KernelLimits {
            work_group_size: ctx.device.max_workgroup_size,
            preferred_multiple: ctx.device.vendor.forced_local_size().unwrap_or(32),
            local_mem_bytes: 0,
        };
        Ok((
            HostKernel {
                name: name.to_string(),
                body: Rc::clone(body),
            },
            limits,
        ))
    }

    fn create_buffer(
        &self,
        ctx: &HostContext,
        _kind: BufferKind,
        bytes: usize,
        init: Option<&[u8]>,
    ) -> Result<HostBuffer, Status> {
        if bytes as u64 > ctx.device.max_alloc_bytes {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        let mut storage = HostStorage::zeroed(bytes);
        if let Some(data) = init {
            if data.len() != bytes {
                return Err(Status::INVALID_HOST_PTR);
            }
            storage.bytes_mut().copy_from_slice(data);
        }
        Ok(Rc::new(RefCell::new(storage)))
    }

    fn write_buffer(&self, _ctx: &HostContext, buffer: &HostBuffer, data: &[u8]) -> Result<(), Status> {
        let mut storage = buffer.try_borrow_mut().map_err(|_| Status::INVALID_MEM_OBJECT)?;
        let dst = storage
            .bytes_mut()
            .get_mut(..data.len())
            .ok_or(Status::INVALID_VALUE)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn enqueue_read(&self, _ctx: &HostContext, buffer: &HostBuffer, len: usize) -> Result<Vec<u8>, Status> {
        let storage = buffer.try_borrow().map_err(|_| Status::INVALID_MEM_OBJECT)?;
        storage
            .bytes()
            .get(..len)
            .map(<[u8]>::to_vec)
            .ok_or(Status::INVALID_VALUE)
    }

    fn complete_read(&self, _ctx: &HostContext, readback: Vec<u8>) -> Result<Vec<u8>, Status> {
        Ok(readback)
    }

    fn launch(
        &self,
        _ctx: &HostContext,
        kernel: &HostKernel,
        args: &[KernelArg<'_, HostBuffer>],
        dims: usize,
        global: [usize; 3],
        local: [usize; 3],
    ) -> Result<(), Status> {
        if !(1..=3).contains(&dims) {
            return Err(Status::INVALID_WORK_DIMENSION);
        }
        let mut resolved = Vec::with_capacity(args.len());
        for arg in args {
            resolved.push(match arg {
                // The same buffer bound twice cannot be borrowed twice.
                KernelArg::Buffer(b) => {
                    HostArg::Buffer(b.try_borrow_mut().map_err(|_| Status::INVALID_KERNEL_ARGS)?)
                }
                KernelArg::Scalar(bytes) => HostArg::Scalar(bytes),
                KernelArg::Local(n) => HostArg::Local(*n),
            });
        }
        let mut invocation = HostInvocation {
            dims,
            global,
            local,
            args: resolved,
        };
        (kernel.body)(&mut invocation)
    }

    fn finish(&self, _ctx: &HostContext) -> Result<(), Status> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn scale_library() -> HostKernelLibrary {
        HostKernelLibrary::new().with("scale", |inv| {
            let factor: f32 = inv.scalar(1)?;
            for x in inv.buffer::<f32>(0)? {
                *x *= factor;
            }
            Ok(())
        })
    }

    fn context(backend: &mut HostBackend) -> HostContext {
        backend.create_context(0, 0, false).unwrap()
    }

    #[test]
    fn declared_kernel_scan() {
        let src = "__kernel void a(__global float* x) {}\n__kernel  void b_2 () {}\n__kernel void a() {}";
        assert_eq!(declared_kernels(src), vec!["a".to_string(), "b_2".to_string()]);
    }

    #[test]
    fn build_rejects_unregistered_kernels() {
        let mut backend = HostBackend::default().with_library(scale_library());
        let ctx = context(&mut backend);
        let err = backend
            .build_program(&ctx, ProgramSource::Text("__kernel void missing() {}"), "")
            .err()
            .unwrap();
        assert_eq!(err.status, Status::BUILD_PROGRAM_FAILURE);
        assert!(err.log.contains("missing"));
    }

    #[test]
    fn build_rejects_error_directive() {
        let mut backend = HostBackend::default().with_library(scale_library());
        let ctx = context(&mut backend);
        let err = backend
            .build_program(&ctx, ProgramSource::Text("#error broken\n__kernel void scale() {}"), "")
            .err()
            .unwrap();
        assert!(err.log.contains("#error broken"));
    }

    #[test]
    fn binary_image_round_trip() {
        let program = HostProgram {
            entries: vec!["scale".into(), "shift".into()],
            options: "-DSITE=4".into(),
        };
        let back = HostProgram::from_binary(&program.to_binary()).unwrap();
        assert_eq!(back.entries, program.entries);
        assert_eq!(back.options, program.options);
        assert!(HostProgram::from_binary(b"garbage").is_none());
    }

    #[test]
    fn launch_runs_closure() {
        let mut backend = HostBackend::default().with_library(scale_library());
        let ctx = context(&mut backend);
        let program = backend
            .build_program(&ctx, ProgramSource::Text("__kernel void scale() {}"), "")
            .map_err(|f| f.status)
            .unwrap()
            .program;
        let (kernel, limits) = backend.create_kernel(&ctx, &program, "scale").unwrap();
        assert_eq!(limits.work_group_size, 256);
        let data: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
        let buf = backend
            .create_buffer(&ctx, BufferKind::InputOutput, 16, Some(bytemuck::cast_slice(&data)))
            .unwrap();
        let factor = 2.5f32.to_ne_bytes();
        backend
            .launch(
                &ctx,
                &kernel,
                &[KernelArg::Buffer(&buf), KernelArg::Scalar(&factor)],
                1,
                [4, 1, 1],
                [4, 1, 1],
            )
            .unwrap();
        let out = backend.enqueue_read(&ctx, &buf, 16).unwrap();
        let values: &[f32] = bytemuck::cast_slice(&out);
        assert_eq!(values, &[2.5, 5.0, 7.5, 10.0]);
    }

    #[test]
    fn aliased_buffer_arguments_rejected() {
        let library = HostKernelLibrary::new().with("pair", |inv| {
            let (a, b) = inv.buffer_pair::<u32>(0, 1)?;
            b.copy_from_slice(a);
            Ok(())
        });
        let mut backend = HostBackend::default().with_library(library);
        let ctx = context(&mut backend);
        let program = HostProgram {
            entries: vec!["pair".into()],
            options: String::new(),
        };
        let (kernel, _) = backend.create_kernel(&ctx, &program, "pair").unwrap();
        let buf = backend.create_buffer(&ctx, BufferKind::Global, 8, None).unwrap();
        let status = backend
            .launch(
                &ctx,
                &kernel,
                &[KernelArg::Buffer(&buf), KernelArg::Buffer(&buf)],
                1,
                [2, 1, 1],
                [1, 1, 1],
            )
            .unwrap_err();
        assert_eq!(status, Status::INVALID_KERNEL_ARGS);
    }
}
