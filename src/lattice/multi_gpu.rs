// SPDX-License-Identifier: AGPL-3.0-only

//! Red-black domain decomposition across compute devices.
//!
//! The lattice is cut along its leading axis into P partitions placed on D
//! devices in contiguous blocks. Partitions sharing a device carry ghost
//! rows that the host refreshes from orchestrator-owned shadow copies before
//! every update; a partition alone on its device needs no exchange.
//!
//! # Pass structure
//!
//! ```text
//! device 0: p0 p1     red pass 0   → p0, p2
//! device 1: p2 p3     black pass 0 → p1, p3
//!
//! per color: copy_boundaries → wait_for_table_write → update
//!            → wait_for_kernels → orthogonalize → wait_for_queue
//!            → wait_for_table_read
//! ```
//!
//! A color is issued to every device before the host blocks on any of them,
//! so devices run concurrently within a color.

use serde::Deserialize;

use super::driver::{DriverFactory, Phase, SimulationDriver};
use super::field::ShadowBuffer;
use super::params::RunParams;
use super::partition::{decompose, pass_counts, pass_set, DeviceSlot, Partition};
use crate::error::{ForgeError, Result};

/// Orchestrator lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Uninitialized,
    Prepared,
    Initialized,
    Thermalizing,
    Working,
    Finalized,
}

/// Requested partition and device counts; 0 means 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Decomposition {
    pub partitions: usize,
    pub devices: usize,
}

impl Decomposition {
    #[must_use]
    pub const fn new(partitions: usize, devices: usize) -> Self {
        Self {
            partitions,
            devices,
        }
    }

    /// Counts with zeros replaced by 1.
    #[must_use]
    pub const fn resolved(self) -> (usize, usize) {
        let p = if self.partitions == 0 { 1 } else { self.partitions };
        let d = if self.devices == 0 { 1 } else { self.devices };
        (p, d)
    }
}

/// Drives one driver per partition through the checkerboard schedule.
pub struct Orchestrator<F: DriverFactory> {
    factory: F,
    params: RunParams,
    requested: Decomposition,
    stage: Stage,
    partitions: Vec<Partition>,
    slots: Vec<DeviceSlot>,
    drivers: Vec<F::Driver>,
    /// One per partition when any device is shared, otherwise empty.
    shadows: Vec<ShadowBuffer>,
}

impl<F: DriverFactory> Orchestrator<F> {
    #[must_use]
    pub fn new(factory: F, params: RunParams, requested: Decomposition) -> Self {
        Self {
            factory,
            params,
            requested,
            stage: Stage::Uninitialized,
            partitions: Vec::new(),
            slots: Vec::new(),
            drivers: Vec::new(),
            shadows: Vec::new(),
        }
    }

    fn expect_stage(&self, allowed: &[Stage], expected: &'static str) -> Result<()> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(ForgeError::Stage {
                actual: self.stage,
                expected,
            })
        }
    }

    /// Resolve counts and compute the partition layout.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Stage`] unless uninitialized; [`ForgeError::Config`] for
    /// invalid parameters or counts.
    pub fn prepare(&mut self) -> Result<()> {
        self.expect_stage(&[Stage::Uninitialized], "Uninitialized")?;
        let (partitions, devices) = self.requested.resolved();
        self.params.validate()?;
        self.params.validate_decomposition(partitions)?;
        let (parts, slots) = decompose(
            partitions,
            devices,
            self.params.leading_extent(),
            self.params.row_elems(),
        )?;
        self.partitions = parts;
        self.slots = slots;
        self.stage = Stage::Prepared;
        tracing::info!(
            partitions,
            devices,
            rows = ?self.partitions.iter().map(|p| p.rows).collect::<Vec<_>>(),
            "lattice decomposed"
        );
        Ok(())
    }

    /// Create and initialize one driver per partition, then fill the
    /// shadows from the devices.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Stage`] unless prepared; factory and driver errors.
    pub fn init(&mut self) -> Result<()> {
        self.expect_stage(&[Stage::Prepared], "Prepared")?;
        let mut drivers = Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            drivers.push(self.factory.create(partition, &self.params)?);
        }
        self.drivers = drivers;

        let shared = self.slots.iter().any(|s| s.partitions.len() > 1);
        if shared {
            self.shadows = self
                .partitions
                .iter()
                .map(|p| {
                    ShadowBuffer::new(
                        self.params.precision,
                        p.rows,
                        p.row_elems,
                        !p.sole_occupant,
                    )
                })
                .collect();
        }

        for driver in &mut self.drivers {
            driver.init_lattice()?;
        }
        if shared {
            for driver in self.drivers.iter_mut().filter(|d| d.is_initialized()) {
                driver.download_partition()?;
            }
            for (driver, shadow) in self.drivers.iter_mut().zip(&mut self.shadows) {
                driver.wait_for_table_read(shadow)?;
            }
        }
        let ready = self.drivers.iter().filter(|d| d.is_initialized()).count();
        tracing::info!(
            drivers = self.drivers.len(),
            initialized = ready,
            shadows = self.shadows.len(),
            "orchestrator initialized"
        );
        self.stage = Stage::Initialized;
        Ok(())
    }

    /// Partition sets of every red pass, then every black pass.
    #[must_use]
    pub fn color_sets(&self) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
        let (red, black) = pass_counts(&self.slots);
        (
            (0..red).map(|k| pass_set(&self.slots, false, k)).collect(),
            (0..black).map(|k| pass_set(&self.slots, true, k)).collect(),
        )
    }

    /// Run the remaining thermalization and working passes.
    ///
    /// Remaining passes are measured from the smallest counters among
    /// initialized drivers; drivers already at the target, and uninitialized
    /// ones, sit out. Working passes measure and checkpoint every
    /// `save_interval` passes and after the last.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Stage`] unless initialized; any fatal driver error.
    pub fn simulate(&mut self) -> Result<()> {
        self.expect_stage(
            &[Stage::Initialized, Stage::Thermalizing, Stage::Working],
            "Initialized",
        )?;
        let Some(start) = self
            .drivers
            .iter()
            .filter(|d| d.is_initialized())
            .map(SimulationDriver::counters)
            .reduce(|a, b| super::driver::Counters {
                therm_done: a.therm_done.min(b.therm_done),
                iter_done: a.iter_done.min(b.iter_done),
            })
        else {
            tracing::warn!("no initialized partition; nothing to simulate");
            return Ok(());
        };

        let nav = self.params.nav;
        let iter = self.params.iter;
        tracing::info!(
            thermalization = nav.saturating_sub(start.therm_done),
            working = iter.saturating_sub(start.iter_done),
            "simulation starting"
        );

        self.stage = Stage::Thermalizing;
        for _ in start.therm_done..nav {
            self.sweep(Phase::Thermalizing, nav)?;
        }

        self.stage = Stage::Working;
        for _ in start.iter_done..iter {
            let updated = self.sweep(Phase::Working, iter)?;
            for p in updated {
                self.measure(p)?;
                let done = self.drivers[p].counters().iter_done;
                if self.checkpoint_due(done) {
                    self.save_state(p)?;
                }
            }
        }
        tracing::info!("simulation complete");
        Ok(())
    }

    fn checkpoint_due(&self, done: u32) -> bool {
        let interval = self.params.save_interval;
        done == self.params.iter || (interval > 0 && done % interval == 0)
    }

    fn needs_pass(&self, p: usize, phase: Phase, target: u32) -> bool {
        let driver = &self.drivers[p];
        if !driver.is_initialized() {
            return false;
        }
        let c = driver.counters();
        match phase {
            Phase::Thermalizing => c.therm_done < target,
            Phase::Working => c.iter_done < target,
        }
    }

    /// One red-black sweep. Returns the partitions that were updated.
    fn sweep(&mut self, phase: Phase, target: u32) -> Result<Vec<usize>> {
        let (red, black) = self.color_sets();
        let mut updated = Vec::new();
        for set in red.into_iter().chain(black) {
            let active: Vec<usize> = set
                .into_iter()
                .filter(|&p| self.needs_pass(p, phase, target))
                .collect();
            if active.is_empty() {
                continue;
            }
            self.run_color(&active, phase)?;
            updated.extend(active);
        }
        updated.sort_unstable();
        Ok(updated)
    }

    fn run_color(&mut self, set: &[usize], phase: Phase) -> Result<()> {
        tracing::debug!(?set, ?phase, "color pass");
        for &p in set {
            self.copy_boundaries(p)?;
        }
        for &p in set {
            self.drivers[p].wait_for_table_write()?;
        }
        for &p in set {
            self.drivers[p].update(phase)?;
        }
        for &p in set {
            self.drivers[p].wait_for_kernels()?;
        }
        for &p in set {
            self.drivers[p].orthogonalize()?;
        }
        let shadows = !self.shadows.is_empty();
        for &p in set {
            self.drivers[p].wait_for_queue()?;
            if shadows {
                self.drivers[p].download_partition()?;
            }
        }
        if shadows {
            for &p in set {
                self.drivers[p].wait_for_table_read(&mut self.shadows[p])?;
            }
        }
        Ok(())
    }

    fn check_partition(&self, p: usize) -> Result<()> {
        if p < self.drivers.len() {
            Ok(())
        } else {
            Err(ForgeError::Config(format!(
                "partition {p} out of range (have {})",
                self.drivers.len()
            )))
        }
    }

    /// Refresh `p`'s ghost rows from its ring neighbours' shadows and stage
    /// the shadow for upload. Returns `false` (touching nothing) for a sole
    /// occupant.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Config`] for an unknown partition; driver upload errors.
    pub fn copy_boundaries(&mut self, p: usize) -> Result<bool> {
        self.check_partition(p)?;
        if self.shadows.is_empty() || self.partitions[p].sole_occupant {
            return Ok(false);
        }
        let n = self.partitions.len();
        let prev = &self.shadows[(p + n - 1) % n];
        let low = prev.row(prev.last_real()).to_vec();
        let next = &self.shadows[(p + 1) % n];
        let high = next.row(next.first_real()).to_vec();

        let shadow = &mut self.shadows[p];
        if let Some(row) = shadow.low_ghost() {
            shadow.set_row(row, &low);
        }
        if let Some(row) = shadow.high_ghost() {
            shadow.set_row(row, &high);
        }
        self.drivers[p].upload_partition(&self.shadows[p])?;
        Ok(true)
    }

    /// # Errors
    ///
    /// [`ForgeError::Config`] for an unknown partition; driver errors.
    pub fn measure(&mut self, p: usize) -> Result<()> {
        self.check_partition(p)?;
        self.drivers[p].measure()
    }

    /// # Errors
    ///
    /// [`ForgeError::Config`] for an unknown partition; driver errors.
    pub fn save_state(&mut self, p: usize) -> Result<()> {
        self.check_partition(p)?;
        self.drivers[p].save_state()
    }

    /// Finalize every driver, then the factory. Returns `code` unchanged.
    pub fn finalize(&mut self, code: i32) -> i32 {
        if self.stage == Stage::Finalized {
            return code;
        }
        for (p, driver) in self.drivers.iter_mut().enumerate() {
            if let Err(e) = driver.finalize() {
                tracing::warn!(partition = p, error = %e, "driver finalize failed");
            }
        }
        self.drivers.clear();
        self.shadows.clear();
        let code = self.factory.finalize(code);
        self.stage = Stage::Finalized;
        code
    }

    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    #[must_use]
    pub const fn params(&self) -> &RunParams {
        &self.params
    }

    #[must_use]
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    #[must_use]
    pub fn slots(&self) -> &[DeviceSlot] {
        &self.slots
    }

    #[must_use]
    pub fn drivers(&self) -> &[F::Driver] {
        &self.drivers
    }

    /// Host copy of partition `p`, when any device is shared.
    #[must_use]
    pub fn shadow(&self, p: usize) -> Option<&ShadowBuffer> {
        self.shadows.get(p)
    }

    #[must_use]
    pub const fn factory(&self) -> &F {
        &self.factory
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::lattice::driver::Counters;

    type Log = Rc<RefCell<Vec<(usize, &'static str)>>>;

    struct MockDriver {
        index: usize,
        log: Log,
        initialized: bool,
        counters: Counters,
    }

    impl MockDriver {
        fn record(&self, event: &'static str) {
            self.log.borrow_mut().push((self.index, event));
        }
    }

    impl SimulationDriver for MockDriver {
        fn init_lattice(&mut self) -> Result<()> {
            self.record("init");
            Ok(())
        }
        fn is_initialized(&self) -> bool {
            self.initialized
        }
        fn counters(&self) -> Counters {
            self.counters
        }
        fn upload_partition(&mut self, _: &ShadowBuffer) -> Result<()> {
            self.record("upload");
            Ok(())
        }
        fn wait_for_table_write(&mut self) -> Result<()> {
            self.record("write");
            Ok(())
        }
        fn update(&mut self, phase: Phase) -> Result<()> {
            match phase {
                Phase::Thermalizing => self.counters.therm_done += 1,
                Phase::Working => self.counters.iter_done += 1,
            }
            self.record("update");
            Ok(())
        }
        fn wait_for_kernels(&mut self) -> Result<()> {
            self.record("kernels");
            Ok(())
        }
        fn orthogonalize(&mut self) -> Result<()> {
            self.record("ortho");
            Ok(())
        }
        fn wait_for_queue(&mut self) -> Result<()> {
            self.record("queue");
            Ok(())
        }
        fn download_partition(&mut self) -> Result<()> {
            self.record("download");
            Ok(())
        }
        fn wait_for_table_read(&mut self, _: &mut ShadowBuffer) -> Result<()> {
            self.record("read");
            Ok(())
        }
        fn measure(&mut self) -> Result<()> {
            self.record("measure");
            Ok(())
        }
        fn save_state(&mut self) -> Result<()> {
            self.record("save");
            Ok(())
        }
        fn load_state(&mut self) -> Result<()> {
            Ok(())
        }
        fn finalize(&mut self) -> Result<()> {
            self.record("finalize");
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockFactory {
        log: Log,
        uninitialized: Vec<usize>,
        preset: Counters,
        finalized: Option<i32>,
    }

    impl DriverFactory for MockFactory {
        type Driver = MockDriver;

        fn create(&mut self, partition: &Partition, _: &RunParams) -> Result<MockDriver> {
            Ok(MockDriver {
                index: partition.index,
                log: self.log.clone(),
                initialized: !self.uninitialized.contains(&partition.index),
                counters: self.preset,
            })
        }

        fn finalize(&mut self, code: i32) -> i32 {
            self.finalized = Some(code);
            code
        }
    }

    fn params(nav: u32, iter: u32, save_interval: u32) -> RunParams {
        let mut p = RunParams {
            nav,
            iter,
            save_interval,
            ..RunParams::default()
        };
        p.topology.dims = [8, 2, 2, 2];
        p.topology.site_elems = 1;
        p
    }

    fn ready(factory: MockFactory, params: RunParams, d: Decomposition) -> Orchestrator<MockFactory> {
        let mut orch = Orchestrator::new(factory, params, d);
        orch.prepare().unwrap();
        orch.init().unwrap();
        orch
    }

    fn count(log: &Log, event: &str) -> usize {
        log.borrow().iter().filter(|(_, e)| *e == event).count()
    }

    #[test]
    fn zero_counts_resolve_to_one() {
        assert_eq!(Decomposition::default().resolved(), (1, 1));
        let orch = ready(MockFactory::default(), params(1, 1, 0), Decomposition::default());
        assert_eq!(orch.partitions().len(), 1);
        assert!(orch.partitions()[0].sole_occupant);
    }

    #[test]
    fn single_partition_never_exchanges() {
        let factory = MockFactory::default();
        let log = factory.log.clone();
        let mut orch = ready(factory, params(2, 3, 2), Decomposition::new(1, 1));
        assert!(orch.shadow(0).is_none());
        assert!(!orch.copy_boundaries(0).unwrap());
        orch.simulate().unwrap();
        assert_eq!(count(&log, "upload"), 0);
        assert_eq!(count(&log, "download"), 0);
        assert_eq!(count(&log, "update"), 5);
        assert_eq!(count(&log, "measure"), 3);
        // after working passes 2 and 3
        assert_eq!(count(&log, "save"), 2);
    }

    #[test]
    fn every_working_pass_is_measured() {
        let factory = MockFactory::default();
        let log = factory.log.clone();
        let mut orch = ready(factory, params(0, 7, 3), Decomposition::new(1, 1));
        orch.simulate().unwrap();
        assert_eq!(count(&log, "measure"), 7);
        // after passes 3, 6 and the last
        assert_eq!(count(&log, "save"), 3);
        let order: Vec<&str> = log
            .borrow()
            .iter()
            .map(|&(_, e)| e)
            .filter(|e| matches!(*e, "measure" | "save"))
            .collect();
        assert_eq!(&order[..4], ["measure", "measure", "measure", "save"]);
    }

    #[test]
    fn two_devices_four_partitions_color_order() {
        let factory = MockFactory::default();
        let log = factory.log.clone();
        let mut orch = ready(factory, params(1, 0, 0), Decomposition::new(4, 2));
        let (red, black) = orch.color_sets();
        assert_eq!(red, vec![vec![0, 2]]);
        assert_eq!(black, vec![vec![1, 3]]);
        assert!(orch.shadow(3).unwrap().has_ghosts());

        log.borrow_mut().clear();
        orch.simulate().unwrap();
        let expected: Vec<(usize, &str)> = [0, 2]
            .iter()
            .map(|&p| (p, "upload"))
            .chain([(0, "write"), (2, "write")])
            .chain([(0, "update"), (2, "update")])
            .chain([(0, "kernels"), (2, "kernels")])
            .chain([(0, "ortho"), (2, "ortho")])
            .chain([(0, "queue"), (0, "download"), (2, "queue"), (2, "download")])
            .chain([(0, "read"), (2, "read")])
            .collect();
        assert_eq!(&log.borrow()[..expected.len()], expected.as_slice());
        assert_eq!(log.borrow()[expected.len()], (1, "upload"));
        assert_eq!(count(&log, "update"), 4);
    }

    #[test]
    fn uninitialized_partitions_sit_out() {
        let factory = MockFactory {
            uninitialized: vec![1],
            ..MockFactory::default()
        };
        let mut orch = ready(factory, params(2, 2, 1), Decomposition::new(4, 2));
        orch.simulate().unwrap();
        let c: Vec<Counters> = orch.drivers().iter().map(|d| d.counters).collect();
        assert_eq!(c[1], Counters::default());
        for p in [0, 2, 3] {
            assert_eq!(c[p], Counters { therm_done: 2, iter_done: 2 });
        }
        assert!(!orch.drivers[1].log.borrow().iter().any(|&(p, e)| p == 1 && e == "update"));
    }

    #[test]
    fn resumes_from_smallest_counters() {
        let factory = MockFactory {
            preset: Counters {
                therm_done: 3,
                iter_done: 4,
            },
            ..MockFactory::default()
        };
        let log = factory.log.clone();
        let mut orch = ready(factory, params(3, 5, 10), Decomposition::new(2, 1));
        orch.simulate().unwrap();
        assert_eq!(count(&log, "update"), 2);
        assert_eq!(count(&log, "measure"), 2);
        assert_eq!(orch.stage(), Stage::Working);
    }

    #[test]
    fn out_of_order_calls_rejected() {
        let mut orch = Orchestrator::new(
            MockFactory::default(),
            params(1, 1, 1),
            Decomposition::new(2, 1),
        );
        assert!(matches!(
            orch.simulate(),
            Err(ForgeError::Stage {
                actual: Stage::Uninitialized,
                ..
            })
        ));
        orch.prepare().unwrap();
        assert!(orch.prepare().is_err());
        orch.init().unwrap();
        assert!(orch.copy_boundaries(5).is_err());
    }

    #[test]
    fn finalize_passes_code_through_once() {
        let factory = MockFactory::default();
        let log = factory.log.clone();
        let mut orch = ready(factory, params(0, 0, 0), Decomposition::new(2, 2));
        assert_eq!(orch.finalize(3), 3);
        assert_eq!(orch.factory().finalized, Some(3));
        assert_eq!(count(&log, "finalize"), 2);
        assert_eq!(orch.finalize(4), 4);
        assert_eq!(count(&log, "finalize"), 2);
        assert_eq!(orch.stage(), Stage::Finalized);
    }
}
