// SPDX-License-Identifier: AGPL-3.0-only

//! Checkpoint save/restore through the orchestrator on the host backend.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::Path;

use latticeforge::error::ForgeError;
use latticeforge::gpu::host::{HostBackend, HostKernelLibrary};
use latticeforge::gpu::{Registry, RegistryConfig, SharedRegistry};
use latticeforge::lattice::partition::decompose;
use latticeforge::lattice::{
    CheckpointError, CheckpointLocation, Decomposition, DriverFactory, FieldData, KernelParams,
    KernelSet, LatticeDriverFactory, Orchestrator, RunParams, SimulationDriver, StartType,
};

const MODEL: &str = "\
__kernel void lattice_init(__global float* lattice) {}
__kernel void lattice_update(__global float* lattice) {}
__kernel void lattice_orthogonalize(__global float* lattice) {}
__kernel void lattice_measure(__global float* lattice) {}
";

fn real_rows(p: &KernelParams) -> std::ops::Range<usize> {
    let off = (p.ghost * p.row_elems) as usize;
    off..off + (p.rows * p.row_elems) as usize
}

/// Init numbers the lattice globally from 1; every update adds 1 to each
/// real element.
fn model() -> HostKernelLibrary {
    HostKernelLibrary::new()
        .with("lattice_init", |inv| {
            let p: KernelParams = inv.scalar(3)?;
            let base = p.first_row * p.row_elems;
            let lattice = inv.buffer::<f32>(0)?;
            for (i, v) in lattice[real_rows(&p)].iter_mut().enumerate() {
                *v = (base + i as u32 + 1) as f32;
            }
            Ok(())
        })
        .with("lattice_update", |inv| {
            let p: KernelParams = inv.scalar(3)?;
            for v in &mut inv.buffer::<f32>(0)?[real_rows(&p)] {
                *v += 1.0;
            }
            Ok(())
        })
        .with("lattice_orthogonalize", |_| Ok(()))
        .with("lattice_measure", |inv| {
            let p: KernelParams = inv.scalar(3)?;
            let re = p.row_elems as usize;
            let (lattice, measurement) = inv.buffer_pair::<f32>(0, 1)?;
            let real = &lattice[real_rows(&p)];
            for (r, slot) in measurement.iter_mut().enumerate() {
                *slot = real[r * re..(r + 1) * re].iter().sum();
            }
            let total: f32 = measurement.iter().sum();
            let energy = inv.buffer::<f32>(2)?;
            let n = energy.len();
            energy[p.step as usize % n] = total;
            Ok(())
        })
}

fn params(start: StartType, iter: u32) -> RunParams {
    let mut p = RunParams {
        start,
        nav: 1,
        iter,
        save_interval: 1,
        ..RunParams::default()
    };
    p.topology.dims = [8, 1, 1, 1];
    p.topology.site_elems = 2;
    p
}

fn factory(dir: &Path) -> LatticeDriverFactory<HostBackend> {
    let config = RegistryConfig {
        work_dir: dir.to_path_buf(),
        ..RegistryConfig::default()
    };
    let mut reg = Registry::new(HostBackend::default().with_library(model()), config);
    reg.select_device(0, 0).unwrap();
    reg.initialize_device().unwrap();
    let registries: Vec<SharedRegistry<HostBackend>> = vec![reg.into_shared()];
    LatticeDriverFactory::new(
        registries,
        KernelSet::from_source(MODEL),
        CheckpointLocation {
            dir: dir.join("ckpt"),
            prefix: "ring".into(),
        },
    )
}

fn run(
    dir: &Path,
    partitions: usize,
    params: RunParams,
) -> Orchestrator<LatticeDriverFactory<HostBackend>> {
    let mut orch = Orchestrator::new(factory(dir), params, Decomposition::new(partitions, 1));
    orch.prepare().unwrap();
    orch.init().unwrap();
    orch.simulate().unwrap();
    orch
}

fn ckpt_path(dir: &Path, p: usize) -> std::path::PathBuf {
    dir.join("ckpt").join(format!("ring_p{p:03}.qcg"))
}

#[test]
fn restored_run_saves_identical_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = run(dir.path(), 2, params(StartType::Hot, 2));
    let lattices: Vec<FieldData> = first
        .drivers()
        .iter()
        .map(|d| d.read_lattice().unwrap())
        .collect();
    let saved: Vec<Vec<u8>> = (0..2)
        .map(|p| fs::read(ckpt_path(dir.path(), p)).unwrap())
        .collect();
    first.finalize(0);

    let mut second = run(dir.path(), 2, params(StartType::Checkpoint, 2));
    for (p, driver) in second.drivers().iter().enumerate() {
        assert!(driver.is_initialized());
        let c = driver.counters();
        assert_eq!((c.therm_done, c.iter_done), (1, 2));
        assert_eq!(driver.read_lattice().unwrap(), lattices[p]);
        // nothing left to run, so nothing was measured
        assert!(driver.history().is_empty());
    }
    for p in 0..2 {
        second.save_state(p).unwrap();
        assert_eq!(fs::read(ckpt_path(dir.path(), p)).unwrap(), saved[p]);
    }
}

#[test]
fn missing_file_leaves_partition_uninitialized() {
    let dir = tempfile::tempdir().unwrap();
    run(dir.path(), 3, params(StartType::Cold, 2)).finalize(0);
    fs::remove_file(ckpt_path(dir.path(), 1)).unwrap();

    let orch = run(dir.path(), 3, params(StartType::Checkpoint, 4));
    let drivers = orch.drivers();
    assert!(!drivers[1].is_initialized());
    assert_eq!(drivers[1].counters().iter_done, 0);
    assert!(!ckpt_path(dir.path(), 1).exists());

    for p in [0, 2] {
        assert_eq!(drivers[p].counters().iter_done, 4);
    }
    // rows 0..3 numbered 1..=6, updated once per pass over 5 passes
    assert_eq!(
        drivers[0].read_lattice().unwrap(),
        FieldData::Single(vec![6.0, 7.0, 8.0, 9.0, 10.0, 11.0])
    );
    assert_eq!(drivers[0].history(), &[15.0, 17.0]);
}

#[test]
fn corrupt_magic_is_reported_as_recoverable() {
    let dir = tempfile::tempdir().unwrap();
    run(dir.path(), 1, params(StartType::Cold, 1)).finalize(0);
    let path = ckpt_path(dir.path(), 0);
    let mut bytes = fs::read(&path).unwrap();
    bytes[..4].copy_from_slice(b"JUNK");
    fs::write(&path, bytes).unwrap();

    let run_params = params(StartType::Checkpoint, 1);
    let (parts, _) = decompose(1, 1, 8, run_params.row_elems()).unwrap();
    let mut factory = factory(dir.path());
    let mut driver = factory.create(&parts[0], &run_params).unwrap();

    let err = driver.load_state().unwrap_err();
    assert!(!err.is_fatal());
    assert!(matches!(
        err,
        ForgeError::Checkpoint {
            source: CheckpointError::BadMagic(_),
            ..
        }
    ));

    driver.init_lattice().unwrap();
    assert!(!driver.is_initialized());
}

#[test]
fn oversized_lattice_count_leaves_run_going() {
    let dir = tempfile::tempdir().unwrap();
    run(dir.path(), 2, params(StartType::Cold, 1)).finalize(0);
    let path = ckpt_path(dir.path(), 1);
    let mut bytes = fs::read(&path).unwrap();
    bytes[44 * 4..45 * 4].copy_from_slice(&u32::MAX.to_le_bytes());
    fs::write(&path, bytes).unwrap();

    let orch = run(dir.path(), 2, params(StartType::Checkpoint, 3));
    assert!(orch.drivers()[0].is_initialized());
    assert!(!orch.drivers()[1].is_initialized());
    assert_eq!(orch.drivers()[0].counters().iter_done, 3);
}

#[test]
fn shape_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    run(dir.path(), 2, params(StartType::Cold, 1)).finalize(0);

    // same files, different cut: partition 0 now owns 3 rows instead of 4
    let mut orch = Orchestrator::new(
        factory(dir.path()),
        params(StartType::Checkpoint, 1),
        Decomposition::new(3, 1),
    );
    orch.prepare().unwrap();
    orch.init().unwrap();
    assert!(!orch.drivers()[0].is_initialized());
    assert!(!orch.drivers()[1].is_initialized());
    assert!(!orch.drivers()[2].is_initialized());
    orch.simulate().unwrap();
}
