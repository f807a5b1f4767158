// SPDX-License-Identifier: AGPL-3.0-only

//! Red-black lattice Monte-Carlo run over one or more GPUs.
//!
//! Usage:
//!   lattice_run [CONFIG.json]      run (default config: `lattice.json`)
//!   lattice_run --list-devices     print wgpu platforms and adapters
//!
//! Environment:
//!   - `LATTICEFORGE_LOG`          — tracing directives (falls back to `RUST_LOG`)
//!   - `LATTICEFORGE_WORK_DIR`     — binary cache and build-log directory
//!   - `LATTICEFORGE_PROFILING`    — per-kernel timing report at shutdown
//!   - `LATTICEFORGE_WGPU_BACKEND` — `vulkan`, `metal`, `dx12`, `gl`
//!
//! The exit code is 0 on success and 1 on a fatal error; `finish.txt` is
//! written either way when a sentinel directory is configured.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use latticeforge::config::RunConfig;
use latticeforge::error::{ForgeError, Result};
use latticeforge::gpu::wgpu_backend::{parse_backends, WgpuBackend};
use latticeforge::gpu::{Registry, RegistryConfig, SharedRegistry};
use latticeforge::lattice::{LatticeDriverFactory, Orchestrator};
use latticeforge::{logging, sentinel};

fn backends(config: &RunConfig) -> Result<wgpu::Backends> {
    match config.wgpu_backend.as_deref() {
        None => Ok(wgpu::Backends::PRIMARY),
        Some(name) => parse_backends(name)
            .ok_or_else(|| ForgeError::Config(format!("unknown wgpu backend {name:?}"))),
    }
}

fn open_devices(config: &RunConfig, count: usize) -> Result<Vec<SharedRegistry<WgpuBackend>>> {
    let backends = backends(config)?;
    let mut registries = Vec::with_capacity(count);
    for slot in 0..count {
        let mut registry = Registry::new(WgpuBackend::new(backends)?, config.registry.clone());
        let selected = registry.select(&config.device_selection(slot))?;
        println!("  Device {slot}: {}", selected.device);
        registry.initialize_device()?;
        registries.push(registry.into_shared());
    }
    Ok(registries)
}

fn run(config: RunConfig) -> Result<i32> {
    let (partitions, devices) = config.decomposition.resolved();
    config.params.validate()?;
    config.params.validate_decomposition(partitions)?;

    let mut kernels = config.kernels.clone();
    kernels.load_source()?;
    let registries = open_devices(&config, devices)?;
    let factory = LatticeDriverFactory::new(registries, kernels, config.checkpoint.clone());
    let mut orchestrator = Orchestrator::new(factory, config.params.clone(), config.decomposition);

    let t0 = Instant::now();
    let outcome = orchestrator
        .prepare()
        .and_then(|()| orchestrator.init())
        .and_then(|()| orchestrator.simulate());
    let code = match outcome {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("  FATAL: {e}");
            1
        }
    };
    println!("  Wall time: {:.1}s", t0.elapsed().as_secs_f64());
    Ok(orchestrator.finalize(code))
}

fn list_devices(config: &RunConfig) -> Result<()> {
    let registry = Registry::new(WgpuBackend::new(backends(config)?)?, RegistryConfig::default());
    registry.print_available_devices();
    Ok(())
}

fn main() -> ExitCode {
    logging::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let list_only = args.iter().any(|a| a == "--list-devices");
    let path = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .map_or_else(|| PathBuf::from("lattice.json"), PathBuf::from);

    let config = if list_only && !path.exists() {
        let mut config = RunConfig::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    } else {
        match RunConfig::load(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("  cannot load {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        }
    };

    if list_only {
        return match list_devices(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("  {e}");
                ExitCode::FAILURE
            }
        };
    }

    println!("═══════════════════════════════════════════════════════════");
    println!("  latticeforge: red-black lattice run");
    println!("═══════════════════════════════════════════════════════════");
    println!("  Config: {}", path.display());
    let (p, d) = config.decomposition.resolved();
    println!(
        "  Lattice {:?} × {} elems/site, {p} partitions on {d} devices",
        config.params.topology.dims, config.params.topology.site_elems
    );
    println!(
        "  Passes: {} thermalization + {} working (save every {})",
        config.params.nav, config.params.iter, config.params.save_interval
    );
    println!();

    let gate = config.sentinel.dir.clone();
    if let Some(dir) = &gate {
        sentinel::wait_until_clear(dir, Duration::from_secs(config.sentinel.poll_secs.max(1)));
        if let Err(e) = sentinel::mark_started(dir) {
            tracing::warn!(error = %e, "could not write start sentinel");
        }
    }

    let code = run(config).unwrap_or_else(|e| {
        eprintln!("  FATAL: {e}");
        1
    });

    if let Some(dir) = &gate {
        if let Err(e) = sentinel::mark_finished(dir, code) {
            tracing::warn!(error = %e, "could not write finish sentinel");
        }
    }
    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(u8::try_from(code).unwrap_or(1))
    }
}
