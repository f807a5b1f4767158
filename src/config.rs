// SPDX-License-Identifier: AGPL-3.0-only

//! Run configuration.
//!
//! One JSON document describes a run; every section is optional and falls
//! back to its defaults. A few deployment knobs can be overridden from the
//! environment so the same file runs on different nodes:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `LATTICEFORGE_WORK_DIR` | `registry.work_dir` (binary cache, build logs) |
//! | `LATTICEFORGE_PROFILING` | `registry.profiling` (`1`/`true`/`yes`) |
//! | `LATTICEFORGE_WGPU_BACKEND` | `wgpu_backend` (`vulkan`, `metal`, `dx12`, `gl`) |

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ForgeError, Result};
use crate::gpu::{DeviceSelection, RegistryConfig};
use crate::lattice::{CheckpointLocation, Decomposition, KernelSet, RunParams};

pub const WORK_DIR_ENV: &str = "LATTICEFORGE_WORK_DIR";
pub const PROFILING_ENV: &str = "LATTICEFORGE_PROFILING";
pub const BACKEND_ENV: &str = "LATTICEFORGE_WGPU_BACKEND";

/// Start/finish sentinel settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Directory holding `start.txt` / `finish.txt`; `None` disables gating.
    pub dir: Option<PathBuf>,
    /// Poll delay while `finish.txt` is present.
    pub poll_secs: u64,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            dir: None,
            poll_secs: 5,
        }
    }
}

/// Everything `lattice_run` needs.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub params: RunParams,
    pub decomposition: Decomposition,
    /// Selection per device slot; slots beyond the list take device `slot`
    /// of the first platform.
    pub devices: Vec<DeviceSelection>,
    pub registry: RegistryConfig,
    pub kernels: KernelSet,
    pub checkpoint: CheckpointLocation,
    pub sentinel: SentinelConfig,
    /// wgpu backend families, comma separated; `None` = primary backends.
    pub wgpu_backend: Option<String>,
}

impl RunConfig {
    /// Parse a JSON document.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Config`] with the parser message.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ForgeError::Config(e.to_string()))
    }

    /// Read and parse `path`, then apply environment overrides. A relative
    /// kernel source path is resolved against the file's directory.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Io`] if unreadable, [`ForgeError::Config`] if invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&text)?;
        if let (Some(src), Some(base)) = (config.kernels.source_path.as_mut(), path.parent()) {
            if src.is_relative() {
                *src = base.join(&*src);
            }
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from `lookup` (the process environment in
    /// [`Self::load`]).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(WORK_DIR_ENV).filter(|d| !d.trim().is_empty()) {
            self.registry.work_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup(PROFILING_ENV) {
            self.registry.profiling = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(backend) = lookup(BACKEND_ENV).filter(|b| !b.trim().is_empty()) {
            self.wgpu_backend = Some(backend);
        }
    }

    /// Selection for device slot `index`.
    #[must_use]
    pub fn device_selection(&self, index: usize) -> DeviceSelection {
        self.devices
            .get(index)
            .cloned()
            .unwrap_or(DeviceSelection::Index {
                platform: 0,
                device: index,
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lattice::StartType;

    const SAMPLE: &str = r#"{
        "params": { "nav": 4, "iter": 8, "start": "hot", "topology": { "dims": [8, 4, 4, 4], "site_elems": 2 } },
        "decomposition": { "partitions": 4, "devices": 2 },
        "devices": [ { "index": { "platform": 0, "device": 1 } } ],
        "registry": { "work_dir": "/tmp/forge", "max_workgroup_size": 128 },
        "kernels": { "source_path": "model.wgsl", "options": "-DBETA" },
        "checkpoint": { "dir": "ckpt", "prefix": "run7" },
        "sentinel": { "dir": "/tmp/gate" }
    }"#;

    #[test]
    fn parses_every_section() {
        let cfg = RunConfig::from_json(SAMPLE).unwrap();
        assert_eq!(cfg.params.nav, 4);
        assert_eq!(cfg.params.start, StartType::Hot);
        assert_eq!(cfg.params.topology.dims, [8, 4, 4, 4]);
        assert_eq!(cfg.decomposition, Decomposition::new(4, 2));
        assert_eq!(
            cfg.device_selection(0),
            DeviceSelection::Index {
                platform: 0,
                device: 1
            }
        );
        assert_eq!(
            cfg.device_selection(1),
            DeviceSelection::Index {
                platform: 0,
                device: 1
            }
        );
        assert_eq!(cfg.registry.max_workgroup_size, 128);
        assert!(!cfg.registry.profiling);
        assert_eq!(cfg.kernels.options, "-DBETA");
        assert_eq!(cfg.checkpoint.prefix, "run7");
        assert_eq!(cfg.sentinel.poll_secs, 5);
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let cfg = RunConfig::from_json("{}").unwrap();
        assert_eq!(cfg, RunConfig::default());
    }

    #[test]
    fn env_overrides() {
        let mut cfg = RunConfig::from_json(SAMPLE).unwrap();
        cfg.apply_env(|key| match key {
            WORK_DIR_ENV => Some("/scratch/cache".into()),
            PROFILING_ENV => Some("Yes".into()),
            BACKEND_ENV => Some("vulkan".into()),
            _ => None,
        });
        assert_eq!(cfg.registry.work_dir, PathBuf::from("/scratch/cache"));
        assert!(cfg.registry.profiling);
        assert_eq!(cfg.wgpu_backend.as_deref(), Some("vulkan"));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            RunConfig::from_json("{ \"params\": 3 }"),
            Err(ForgeError::Config(_))
        ));
    }

    #[test]
    fn load_resolves_kernel_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = RunConfig::load(&path).unwrap();
        assert_eq!(
            cfg.kernels.source_path.as_deref(),
            Some(dir.path().join("model.wgsl").as_path())
        );
    }
}
