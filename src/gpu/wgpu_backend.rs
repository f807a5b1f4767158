// SPDX-License-Identifier: AGPL-3.0-only

//! wgpu backend (Vulkan, Metal, DX12, GL).
//!
//! Mapping onto the registry model:
//!
//! | Registry | wgpu |
//! |----------|------|
//! | platform | backend family (`Vulkan`, `Metal`, …) |
//! | device | adapter within that family |
//! | context | `Device` + `Queue` |
//! | program | WGSL `ShaderModule` (+ `PipelineCache` when supported) |
//! | kernel | compute entry point, one pipeline per local size |
//! | scalar argument | 16-byte-padded uniform buffer |
//! | local argument | no binding (workgroup memory is static in WGSL) |
//!
//! Arguments bind at `@group(0) @binding(i)` where `i` is the argument slot.
//! Kernels that declare `override WORKGROUP_SIZE: u32` get the registry's
//! local size; otherwise the literal `@workgroup_size` is used.
//!
//! Program binaries are `WGPC` + pipeline-cache data on adapters with
//! `PIPELINE_CACHE`, else `WGSL` + the source text.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc::Receiver;

use super::adapter::{DeviceInfo, PlatformInfo, Vendor};
use super::backend::{
    BufferKind, BuildFailure, BuildOutput, ComputeBackend, KernelArg, KernelLimits, ProgramSource,
};
use super::Status;

const CACHE_MAGIC: &[u8; 4] = b"WGPC";
const SOURCE_MAGIC: &[u8; 4] = b"WGSL";
const WORKGROUP_OVERRIDE: &str = "WORKGROUP_SIZE";

/// Split workgroup count into (x, y, 1) for 2D dispatch when x > 65535.
/// Shaders must linearize via `gid.x + gid.y * num_workgroups.x * WG_SIZE`.
#[must_use]
pub fn split_workgroups(total: u32) -> (u32, u32, u32) {
    if total <= 65535 {
        (total, 1, 1)
    } else {
        let y = total.div_ceil(65535);
        let x = total.div_ceil(y);
        (x, y, 1)
    }
}

/// Parse a backend family list such as `"vulkan"` or `"vulkan,metal"`.
#[must_use]
pub fn parse_backends(text: &str) -> Option<wgpu::Backends> {
    let mut out = wgpu::Backends::empty();
    for part in text.split(',').map(|p| p.trim().to_ascii_lowercase()) {
        out |= match part.as_str() {
            "vulkan" | "vk" => wgpu::Backends::VULKAN,
            "metal" | "mtl" => wgpu::Backends::METAL,
            "dx12" | "d3d12" => wgpu::Backends::DX12,
            "gl" | "gles" | "opengl" => wgpu::Backends::GL,
            "primary" => wgpu::Backends::PRIMARY,
            "all" => wgpu::Backends::all(),
            _ => return None,
        };
    }
    (!out.is_empty()).then_some(out)
}

/// Entry points declared with `@compute` in a WGSL source.
fn compute_entry_points(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find("@compute") {
        rest = &rest[pos + "@compute".len()..];
        let Some(fn_pos) = rest.find("fn ") else {
            break;
        };
        let name: String = rest[fn_pos + 3..]
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() {
            names.push(name);
        }
    }
    names
}

/// Literal `@workgroup_size(x[, y[, z]])` attached to `entry`, if any.
fn fixed_workgroup_size(source: &str, entry: &str) -> Option<[u32; 3]> {
    let decl = source.find(&format!("fn {entry}("))?;
    let head = &source[..decl];
    let attr = head.rfind("@workgroup_size(")?;
    let args = &head[attr + "@workgroup_size(".len()..];
    let args = &args[..args.find(')')?];
    let mut size = [1u32; 3];
    for (slot, value) in size.iter_mut().zip(args.split(',')) {
        *slot = value.trim().trim_end_matches('u').parse().ok()?;
    }
    Some(size)
}

/// Context: device, queue, and what the adapter supports.
pub struct WgpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub info: DeviceInfo,
    pub has_f64: bool,
    pub has_pipeline_cache: bool,
}

pub struct WgpuProgram {
    source: Rc<str>,
    module: Rc<wgpu::ShaderModule>,
    cache: Option<Rc<wgpu::PipelineCache>>,
    entries: Vec<String>,
}

pub struct WgpuKernel {
    entry: String,
    module: Rc<wgpu::ShaderModule>,
    cache: Option<Rc<wgpu::PipelineCache>>,
    overridable: bool,
    fixed: Option<[u32; 3]>,
    pipelines: RefCell<HashMap<[u32; 3], Rc<wgpu::ComputePipeline>>>,
}

pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

pub struct WgpuReadback {
    staging: wgpu::Buffer,
    len: usize,
    rx: Receiver<Result<(), wgpu::BufferAsyncError>>,
}

/// Backend over every adapter wgpu can see for the chosen families.
pub struct WgpuBackend {
    runtime: tokio::runtime::Runtime,
    adapters: Vec<wgpu::Adapter>,
    families: Vec<wgpu::Backend>,
}

impl WgpuBackend {
    /// Enumerate adapters for `backends`.
    ///
    /// # Errors
    ///
    /// [`crate::error::ForgeError::Io`] if the blocking runtime cannot start.
    pub fn new(backends: wgpu::Backends) -> crate::error::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });
        let adapters = instance.enumerate_adapters(backends);
        let mut families = Vec::new();
        for a in &adapters {
            let backend = a.get_info().backend;
            if !families.contains(&backend) {
                families.push(backend);
            }
        }
        tracing::debug!(adapters = adapters.len(), families = families.len(), "wgpu adapters enumerated");
        Ok(Self {
            runtime,
            adapters,
            families,
        })
    }

    fn family_adapters(&self, platform: usize) -> Result<Vec<&wgpu::Adapter>, Status> {
        let family = *self.families.get(platform).ok_or(Status::INVALID_PLATFORM)?;
        Ok(self
            .adapters
            .iter()
            .filter(|a| a.get_info().backend == family)
            .collect())
    }

    fn describe(index: usize, adapter: &wgpu::Adapter) -> DeviceInfo {
        let info = adapter.get_info();
        let limits = adapter.limits();
        let vendor = Vendor::classify(&info.driver, info.vendor);
        let vendor_name = match vendor {
            Vendor::Nvidia => "NVIDIA".to_string(),
            Vendor::Amd => "AMD".to_string(),
            Vendor::Intel => "Intel".to_string(),
            Vendor::Apple => "Apple".to_string(),
            Vendor::Other => format!("{:#06x} {}", info.vendor, info.driver),
        };
        DeviceInfo {
            index,
            name: info.name,
            vendor_name,
            vendor,
            global_mem_bytes: limits.max_buffer_size,
            local_mem_bytes: u64::from(limits.max_compute_workgroup_storage_size),
            max_alloc_bytes: limits.max_buffer_size,
            max_workgroup_size: limits.max_compute_invocations_per_workgroup as usize,
            compute_units: 0,
        }
    }

    /// Run `f` inside validation + out-of-memory error scopes.
    fn scoped<T>(
        &self,
        device: &wgpu::Device,
        fail: Status,
        f: impl FnOnce() -> T,
    ) -> Result<T, (Status, String)> {
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = self.runtime.block_on(device.pop_error_scope());
        let oom = self.runtime.block_on(device.pop_error_scope());
        if let Some(e) = oom {
            return Err((Status::MEM_OBJECT_ALLOCATION_FAILURE, e.to_string()));
        }
        if let Some(e) = validation {
            return Err((fail, e.to_string()));
        }
        Ok(value)
    }

    fn pipeline(
        &self,
        ctx: &WgpuContext,
        kernel: &WgpuKernel,
        local: [u32; 3],
    ) -> Result<Rc<wgpu::ComputePipeline>, Status> {
        let key = if kernel.overridable { local } else { [0; 3] };
        if let Some(p) = kernel.pipelines.borrow().get(&key) {
            return Ok(Rc::clone(p));
        }
        let mut constants = HashMap::new();
        if kernel.overridable {
            constants.insert(WORKGROUP_OVERRIDE.to_string(), f64::from(local[0]));
        }
        let pipeline = self
            .scoped(&ctx.device, Status::INVALID_KERNEL, || {
                ctx.device
                    .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(&kernel.entry),
                        layout: None,
                        module: &kernel.module,
                        entry_point: &kernel.entry,
                        compilation_options: wgpu::PipelineCompilationOptions {
                            constants: &constants,
                            ..Default::default()
                        },
                        cache: kernel.cache.as_deref(),
                    })
            })
            .map_err(|(status, msg)| {
                tracing::error!(kernel = %kernel.entry, error = %msg, "pipeline creation failed");
                status
            })?;
        let pipeline = Rc::new(pipeline);
        kernel
            .pipelines
            .borrow_mut()
            .insert(key, Rc::clone(&pipeline));
        Ok(pipeline)
    }

    fn create_module(
        &self,
        ctx: &WgpuContext,
        source: &str,
    ) -> Result<wgpu::ShaderModule, BuildFailure> {
        self.scoped(&ctx.device, Status::BUILD_PROGRAM_FAILURE, || {
            ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("program"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        })
        .map_err(|(status, log)| BuildFailure { status, log })
    }

    fn create_cache(&self, ctx: &WgpuContext, data: Option<&[u8]>) -> Option<wgpu::PipelineCache> {
        if !ctx.has_pipeline_cache {
            return None;
        }
        // SAFETY: `data` was produced by `PipelineCache::get_data` for a
        // device with the same name and platform (the binary cache key), and
        // `fallback` discards data the driver does not accept.
        let cache = unsafe {
            ctx.device
                .create_pipeline_cache(&wgpu::PipelineCacheDescriptor {
                    label: Some("program_cache"),
                    data,
                    fallback: true,
                })
        };
        Some(cache)
    }
}

fn align4(n: usize) -> usize {
    n.div_ceil(4) * 4
}

impl ComputeBackend for WgpuBackend {
    type Context = WgpuContext;
    type Program = WgpuProgram;
    type Kernel = WgpuKernel;
    type Buffer = WgpuBuffer;
    type Readback = WgpuReadback;

    fn platforms(&self) -> Result<Vec<PlatformInfo>, Status> {
        Ok(self
            .families
            .iter()
            .enumerate()
            .map(|(index, family)| PlatformInfo {
                index,
                name: format!("{family:?}"),
                vendor: format!("wgpu {family:?}"),
            })
            .collect())
    }

    fn devices(&self, platform: usize) -> Result<Vec<DeviceInfo>, Status> {
        Ok(self
            .family_adapters(platform)?
            .into_iter()
            .enumerate()
            .map(|(i, a)| Self::describe(i, a))
            .collect())
    }

    fn create_context(
        &mut self,
        platform: usize,
        device: usize,
        profiling: bool,
    ) -> Result<WgpuContext, Status> {
        let adapter = *self
            .family_adapters(platform)?
            .get(device)
            .ok_or(Status::DEVICE_NOT_FOUND)?;
        let available = adapter.features();
        let mut features = wgpu::Features::empty();
        for wanted in [wgpu::Features::SHADER_F64, wgpu::Features::PIPELINE_CACHE] {
            if available.contains(wanted) {
                features |= wanted;
            }
        }
        if profiling && available.contains(wgpu::Features::TIMESTAMP_QUERY) {
            features |= wgpu::Features::TIMESTAMP_QUERY;
        }
        let info = Self::describe(device, adapter);
        let (dev, queue) = self
            .runtime
            .block_on(adapter.request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("latticeforge"),
                    required_features: features,
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            ))
            .map_err(|e| {
                tracing::error!(device = %info.name, error = %e, "device request failed");
                Status::DEVICE_NOT_AVAILABLE
            })?;
        dev.on_uncaptured_error(Box::new(|e| {
            tracing::error!(error = %e, "uncaptured wgpu error");
        }));
        Ok(WgpuContext {
            device: dev,
            queue,
            has_f64: features.contains(wgpu::Features::SHADER_F64),
            has_pipeline_cache: features.contains(wgpu::Features::PIPELINE_CACHE),
            info,
        })
    }

    fn build_program(
        &self,
        ctx: &WgpuContext,
        source: ProgramSource<'_>,
        _options: &str,
    ) -> Result<BuildOutput<WgpuProgram>, BuildFailure> {
        let (text, cache_data): (Rc<str>, Option<&[u8]>) = match source {
            ProgramSource::Text(text) => (Rc::from(text), None),
            ProgramSource::Binary { binary, source } => {
                if let Some(data) = binary.strip_prefix(CACHE_MAGIC.as_slice()) {
                    if !ctx.has_pipeline_cache {
                        return Err(Status::INVALID_BINARY.into());
                    }
                    (Rc::from(source), Some(data))
                } else if let Some(wgsl) = binary.strip_prefix(SOURCE_MAGIC.as_slice()) {
                    let wgsl = std::str::from_utf8(wgsl).map_err(|_| BuildFailure::from(Status::INVALID_BINARY))?;
                    (Rc::from(wgsl), None)
                } else {
                    return Err(Status::INVALID_BINARY.into());
                }
            }
        };
        let entries = compute_entry_points(&text);
        if entries.is_empty() {
            return Err(BuildFailure {
                status: Status::BUILD_PROGRAM_FAILURE,
                log: "no @compute entry points\n".into(),
            });
        }
        let module = Rc::new(self.create_module(ctx, &text)?);
        let cache = self.create_cache(ctx, cache_data).map(Rc::new);
        let mut log = String::new();
        if cache.is_some() && cache_data.is_none() {
            // Compile every entry once so the cache holds their pipelines.
            for entry in &entries {
                let fixed = fixed_workgroup_size(&text, entry);
                let kernel = WgpuKernel {
                    entry: entry.clone(),
                    module: Rc::clone(&module),
                    cache: cache.clone(),
                    overridable: fixed.is_none() && text.contains(WORKGROUP_OVERRIDE),
                    fixed,
                    pipelines: RefCell::default(),
                };
                let size = kernel.fixed.unwrap_or([64, 1, 1]);
                if let Err(status) = self.pipeline(ctx, &kernel, size) {
                    return Err(BuildFailure {
                        status,
                        log: format!("entry point '{entry}' failed to compile\n"),
                    });
                }
            }
            log.push_str("pipeline cache populated\n");
        }
        log.push_str(&format!("{} entry point(s): {}\n", entries.len(), entries.join(", ")));
        Ok(BuildOutput {
            program: WgpuProgram {
                source: text,
                module,
                cache,
                entries,
            },
            log,
        })
    }

    fn program_binary(&self, _ctx: &WgpuContext, program: &WgpuProgram) -> Result<Vec<u8>, Status> {
        let (magic, body) = match program.cache.as_ref().and_then(|c| c.get_data()) {
            Some(data) => (CACHE_MAGIC, data),
            None => (SOURCE_MAGIC, program.source.as_bytes().to_vec()),
        };
        let mut out = Vec::with_capacity(magic.len() + body.len());
        out.extend_from_slice(magic);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn create_kernel(
        &self,
        ctx: &WgpuContext,
        program: &WgpuProgram,
        name: &str,
    ) -> Result<(WgpuKernel, KernelLimits), Status> {
        if !program.entries.iter().any(|e| e == name) {
            return Err(Status::INVALID_KERNEL_NAME);
        }
        let fixed = fixed_workgroup_size(&program.source, name);
        let overridable = fixed.is_none() && program.source.contains(WORKGROUP_OVERRIDE);
        let work_group_size = match fixed {
            Some(size) => (size[0] * size[1] * size[2]) as usize,
            None => ctx.info.max_workgroup_size,
        };
        let limits = KernelLimits {
            work_group_size,
            preferred_multiple: ctx.info.vendor.forced_local_size().unwrap_or(32),
            local_mem_bytes: 0,
        };
        Ok((
            WgpuKernel {
                entry: name.to_string(),
                module: Rc::clone(&program.module),
                cache: program.cache.clone(),
                overridable,
                fixed,
                pipelines: RefCell::default(),
            },
            limits,
        ))
    }

    fn create_buffer(
        &self,
        ctx: &WgpuContext,
        kind: BufferKind,
        bytes: usize,
        init: Option<&[u8]>,
    ) -> Result<WgpuBuffer, Status> {
        use wgpu::util::DeviceExt;
        let usage = match kind {
            BufferKind::Constant => wgpu::BufferUsages::UNIFORM,
            _ => wgpu::BufferUsages::STORAGE,
        } | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        let size = align4(bytes.max(4));
        if size as u64 > ctx.info.max_alloc_bytes {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        let buffer = self
            .scoped(&ctx.device, Status::MEM_OBJECT_ALLOCATION_FAILURE, || match init {
                Some(data) => {
                    let mut padded = data.to_vec();
                    padded.resize(size, 0);
                    ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("buffer"),
                        contents: &padded,
                        usage,
                    })
                }
                None => ctx.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("buffer"),
                    size: size as u64,
                    usage,
                    mapped_at_creation: false,
                }),
            })
            .map_err(|(status, _)| status)?;
        Ok(WgpuBuffer {
            buffer,
            size: size as u64,
        })
    }

    fn write_buffer(&self, ctx: &WgpuContext, buffer: &WgpuBuffer, data: &[u8]) -> Result<(), Status> {
        if align4(data.len()) as u64 > buffer.size {
            return Err(Status::INVALID_VALUE);
        }
        if data.len() % 4 == 0 {
            ctx.queue.write_buffer(&buffer.buffer, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(align4(data.len()), 0);
            ctx.queue.write_buffer(&buffer.buffer, 0, &padded);
        }
        Ok(())
    }

    fn enqueue_read(
        &self,
        ctx: &WgpuContext,
        buffer: &WgpuBuffer,
        len: usize,
    ) -> Result<WgpuReadback, Status> {
        let size = align4(len.max(4)) as u64;
        if size > buffer.size {
            return Err(Status::INVALID_VALUE);
        }
        let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, size);
        ctx.queue.submit(std::iter::once(encoder.finish()));
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        ctx.device.poll(wgpu::Maintain::Poll);
        Ok(WgpuReadback { staging, len, rx })
    }

    fn complete_read(&self, ctx: &WgpuContext, readback: WgpuReadback) -> Result<Vec<u8>, Status> {
        ctx.device.poll(wgpu::Maintain::Wait);
        readback
            .rx
            .recv()
            .map_err(|_| Status::MAP_FAILURE)?
            .map_err(|e| {
                tracing::error!(error = %e, "readback mapping failed");
                Status::MAP_FAILURE
            })?;
        let view = readback.staging.slice(..).get_mapped_range();
        let data = view[..readback.len].to_vec();
        drop(view);
        readback.staging.unmap();
        Ok(data)
    }

    fn launch(
        &self,
        ctx: &WgpuContext,
        kernel: &WgpuKernel,
        args: &[KernelArg<'_, WgpuBuffer>],
        dims: usize,
        global: [usize; 3],
        local: [usize; 3],
    ) -> Result<(), Status> {
        use wgpu::util::DeviceExt;
        if !(1..=3).contains(&dims) {
            return Err(Status::INVALID_WORK_DIMENSION);
        }
        let to_u32 = |n: usize| u32::try_from(n).map_err(|_| Status::INVALID_GLOBAL_WORK_SIZE);
        let requested = [to_u32(local[0])?, to_u32(local[1])?, to_u32(local[2])?];
        let group = kernel.fixed.unwrap_or(requested);
        let pipeline = self.pipeline(ctx, kernel, group)?;

        let uniforms: Vec<(u32, wgpu::Buffer)> = args
            .iter()
            .enumerate()
            .filter_map(|(i, arg)| match arg {
                KernelArg::Scalar(bytes) => {
                    let mut padded = bytes.to_vec();
                    padded.resize(bytes.len().div_ceil(16).max(1) * 16, 0);
                    let buf = ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("scalar"),
                        contents: &padded,
                        usage: wgpu::BufferUsages::UNIFORM,
                    });
                    Some((i as u32, buf))
                }
                _ => None,
            })
            .collect();
        let mut entries: Vec<wgpu::BindGroupEntry> = args
            .iter()
            .enumerate()
            .filter_map(|(i, arg)| match arg {
                KernelArg::Buffer(b) => Some(wgpu::BindGroupEntry {
                    binding: i as u32,
                    resource: b.buffer.as_entire_binding(),
                }),
                _ => None,
            })
            .collect();
        entries.extend(uniforms.iter().map(|(binding, buf)| wgpu::BindGroupEntry {
            binding: *binding,
            resource: buf.as_entire_binding(),
        }));

        let mut workgroups = [1u32; 3];
        for d in 0..dims {
            workgroups[d] = to_u32(global[d].div_ceil(group[d].max(1) as usize))?;
        }
        let (wx, wy, wz) = if dims == 1 {
            split_workgroups(workgroups[0])
        } else {
            (workgroups[0], workgroups[1], workgroups[2])
        };

        self.scoped(&ctx.device, Status::INVALID_KERNEL_ARGS, || {
            let bind_group = (!entries.is_empty()).then(|| {
                ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("kernel_args"),
                    layout: &pipeline.get_bind_group_layout(0),
                    entries: &entries,
                })
            });
            let mut encoder = ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some(&kernel.entry),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("kernel"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline);
                if let Some(bg) = &bind_group {
                    pass.set_bind_group(0, bg, &[]);
                }
                pass.dispatch_workgroups(wx, wy, wz);
            }
            ctx.queue.submit(std::iter::once(encoder.finish()));
        })
        .map_err(|(status, msg)| {
            tracing::error!(kernel = %kernel.entry, error = %msg, "dispatch rejected");
            status
        })
    }

    fn finish(&self, ctx: &WgpuContext) -> Result<(), Status> {
        ctx.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    const SHADER: &str = r"
override WORKGROUP_SIZE: u32 = 64u;
@group(0) @binding(0) var<storage, read_write> data: array<f32>;
@group(0) @binding(1) var<uniform> factor: f32;

@compute @workgroup_size(WORKGROUP_SIZE)
fn scale(@builtin(global_invocation_id) gid: vec3<u32>) {
    if gid.x < arrayLength(&data) {
        data[gid.x] = data[gid.x] * factor;
    }
}

@compute @workgroup_size(8, 8)
fn tile(@builtin(global_invocation_id) gid: vec3<u32>) {}
";

    #[test]
    fn workgroup_split() {
        assert_eq!(split_workgroups(1), (1, 1, 1));
        assert_eq!(split_workgroups(65535), (65535, 1, 1));
        let (x, y, _) = split_workgroups(100_000);
        assert!(x <= 65535 && x * y >= 100_000);
    }

    #[test]
    fn entry_point_scan() {
        assert_eq!(compute_entry_points(SHADER), vec!["scale", "tile"]);
        assert_eq!(fixed_workgroup_size(SHADER, "tile"), Some([8, 8, 1]));
        assert_eq!(fixed_workgroup_size(SHADER, "scale"), None);
    }

    #[test]
    fn backend_names() {
        assert_eq!(parse_backends("vulkan"), Some(wgpu::Backends::VULKAN));
        assert_eq!(
            parse_backends("Vulkan, metal"),
            Some(wgpu::Backends::VULKAN | wgpu::Backends::METAL)
        );
        assert_eq!(parse_backends("cuda"), None);
    }

    #[test]
    #[ignore = "requires GPU"]
    fn scale_kernel_on_first_adapter() {
        use crate::gpu::{BufferKind, Registry, RegistryConfig};
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = WgpuBackend::new(wgpu::Backends::PRIMARY).expect("wgpu");
        let mut reg = Registry::new(
            backend,
            RegistryConfig {
                work_dir: dir.path().to_path_buf(),
                ..RegistryConfig::default()
            },
        );
        reg.auto_select(None, None).expect("device");
        reg.initialize_device().expect("context");
        reg.create_program(SHADER, "").expect("program");
        let k = reg.init_kernel("scale", 1, [1024, 1, 1], None).expect("kernel");
        let data: Vec<f32> = (0..1024).map(|i| i as f32).collect();
        let buf = reg.alloc_slice(BufferKind::InputOutput, &data).expect("buffer");
        reg.bind_buffer(k, buf).expect("bind");
        reg.bind_scalar(k, 2.0f32).expect("bind");
        reg.run(k).expect("run");
        let out: Vec<f32> = reg.read_vec(buf).expect("read");
        assert!((out[10] - 20.0).abs() < 1e-6);
        assert_eq!(reg.finalize(0), 0);
    }
}
