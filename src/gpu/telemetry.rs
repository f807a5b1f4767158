// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel and transfer timing telemetry.
//!
//! Only running sums are kept (Σt, Σt², n); mean and standard deviation are
//! derived on demand. Times are in seconds.

use std::time::Duration;

/// Running timing sums for one kernel or one transfer direction.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProfileStats {
    pub sum: f64,
    pub sum_sq: f64,
    pub count: u64,
}

impl ProfileStats {
    pub fn record(&mut self, elapsed: Duration) {
        let t = elapsed.as_secs_f64();
        self.sum += t;
        self.sum_sq += t * t;
        self.count += 1;
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Sample standard deviation (0 for fewer than two samples).
    #[must_use]
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        let var = (self.sum_sq - self.sum * self.sum / n) / (n - 1.0);
        var.max(0.0).sqrt()
    }
}

/// Per-kernel row of a profile report.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelProfile {
    pub name: String,
    pub stats: ProfileStats,
}

/// Per-buffer row of a profile report.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferProfile {
    pub name: String,
    pub host_to_device: ProfileStats,
    pub device_to_host: ProfileStats,
}

/// Snapshot of all timing sums held by a registry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProfileReport {
    pub device: String,
    pub kernels: Vec<KernelProfile>,
    pub transfers: Vec<TransferProfile>,
}

impl ProfileReport {
    /// Print a formatted table to stdout.
    pub fn print(&self) {
        println!("  Profile: {}", self.device);
        println!(
            "  {:<28} {:>8} {:>12} {:>12} {:>12}",
            "kernel", "calls", "mean (ms)", "σ (ms)", "total (s)"
        );
        for k in &self.kernels {
            println!(
                "  {:<28} {:>8} {:>12.4} {:>12.4} {:>12.3}",
                k.name,
                k.stats.count,
                k.stats.mean() * 1e3,
                k.stats.std_dev() * 1e3,
                k.stats.sum
            );
        }
        if self.transfers.is_empty() {
            return;
        }
        println!(
            "  {:<28} {:>8} {:>12} {:>8} {:>12}",
            "buffer", "h→d", "mean (ms)", "d→h", "mean (ms)"
        );
        for t in &self.transfers {
            println!(
                "  {:<28} {:>8} {:>12.4} {:>8} {:>12.4}",
                t.name,
                t.host_to_device.count,
                t.host_to_device.mean() * 1e3,
                t.device_to_host.count,
                t.device_to_host.mean() * 1e3
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats_are_zero() {
        let s = ProfileStats::default();
        assert!(s.mean().abs() < f64::EPSILON);
        assert!(s.std_dev().abs() < f64::EPSILON);
    }

    #[test]
    fn mean_and_std_dev() {
        let mut s = ProfileStats::default();
        for ms in [1, 2, 3, 4] {
            s.record(Duration::from_millis(ms));
        }
        assert_eq!(s.count, 4);
        assert!((s.mean() - 0.0025).abs() < 1e-12);
        // sample σ of {1,2,3,4} ms = 1.29099 ms
        assert!((s.std_dev() - 0.001_290_994).abs() < 1e-8);
    }

    #[test]
    fn constant_samples_have_zero_spread() {
        let mut s = ProfileStats::default();
        for _ in 0..10 {
            s.record(Duration::from_micros(250));
        }
        assert!(s.std_dev() < 1e-9);
    }

    #[test]
    fn print_report_no_panic() {
        let mut stats = ProfileStats::default();
        stats.record(Duration::from_millis(2));
        let report = ProfileReport {
            device: "Host CPU".into(),
            kernels: vec![KernelProfile {
                name: "update".into(),
                stats,
            }],
            transfers: vec![TransferProfile {
                name: "lattice".into(),
                host_to_device: stats,
                device_to_host: ProfileStats::default(),
            }],
        };
        report.print();
    }
}
