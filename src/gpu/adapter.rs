// SPDX-License-Identifier: AGPL-3.0-only

//! Platform and device discovery, and the selection rules applied to them.
//!
//! Selection is pure over the enumerated lists so the rules are testable
//! without hardware: explicit indices must be in range, vendor filters are
//! case-insensitive substring matches, and auto-selection drops a filter
//! that matches nothing.

use serde::Deserialize;

use crate::error::{ForgeError, Result};

/// Device vendor, for vendor-specific workgroup quirks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other,
}

impl Vendor {
    /// Classify a vendor string or PCI vendor id as reported by a driver.
    #[must_use]
    pub fn classify(name: &str, pci_id: u32) -> Self {
        let lower = name.to_ascii_lowercase();
        match pci_id {
            0x10de => return Self::Nvidia,
            0x1002 | 0x1022 => return Self::Amd,
            0x8086 => return Self::Intel,
            0x106b => return Self::Apple,
            _ => {}
        }
        if lower.contains("nvidia") {
            Self::Nvidia
        } else if lower.contains("intel") {
            Self::Intel
        } else if lower.contains("amd")
            || lower.contains("advanced micro")
            || lower.contains("ati technologies")
        {
            Self::Amd
        } else if lower.contains("apple") {
            Self::Apple
        } else {
            Self::Other
        }
    }

    /// Fixed local size this vendor requires, if any.
    #[must_use]
    pub const fn forced_local_size(self) -> Option<usize> {
        match self {
            Self::Amd => Some(64),
            _ => None,
        }
    }
}

/// One compute platform (vendor runtime).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Enumeration index (stable within a single run).
    pub index: usize,
    pub name: String,
    pub vendor: String,
}

/// Immutable snapshot of a device, captured at selection time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Enumeration index within its platform.
    pub index: usize,
    pub name: String,
    /// Vendor string as reported by the driver.
    pub vendor_name: String,
    pub vendor: Vendor,
    pub global_mem_bytes: u64,
    pub local_mem_bytes: u64,
    pub max_alloc_bytes: u64,
    pub max_workgroup_size: usize,
    pub compute_units: u32,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} ({}, {} MiB, wg≤{}, {} CU)",
            self.index,
            self.name,
            self.vendor_name,
            self.global_mem_bytes / (1024 * 1024),
            self.max_workgroup_size,
            self.compute_units
        )
    }
}

/// How a registry picks its platform and device.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelection {
    /// Explicit 0-based indices.
    Index { platform: usize, device: usize },
    /// Case-insensitive vendor substrings; `None` accepts any vendor.
    Vendor {
        #[serde(default)]
        platform_vendor: Option<String>,
        #[serde(default)]
        device_vendor: Option<String>,
    },
}

impl Default for DeviceSelection {
    fn default() -> Self {
        Self::Vendor {
            platform_vendor: None,
            device_vendor: None,
        }
    }
}

/// Check an explicit platform index against the enumeration.
///
/// # Errors
///
/// [`ForgeError::PlatformNotFound`] if `index` is out of range.
pub fn select_platform_by_index(platforms: &[PlatformInfo], index: usize) -> Result<usize> {
    if index < platforms.len() {
        Ok(index)
    } else {
        Err(ForgeError::PlatformNotFound(format!(
            "index {index} requested, {} available",
            platforms.len()
        )))
    }
}

/// Check an explicit device index against the enumeration.
///
/// # Errors
///
/// [`ForgeError::DeviceNotFound`] if `index` is out of range.
pub fn select_device_by_index(devices: &[DeviceInfo], index: usize) -> Result<usize> {
    if index < devices.len() {
        Ok(index)
    } else {
        Err(ForgeError::DeviceNotFound(format!(
            "index {index} requested, {} available",
            devices.len()
        )))
    }
}

fn vendor_matches(reported: &str, filter: Option<&str>) -> bool {
    filter.map_or(true, |f| {
        reported
            .to_ascii_lowercase()
            .contains(&f.trim().to_ascii_lowercase())
    })
}

/// Devices whose vendor matches `filter`, in enumeration order.
#[must_use]
pub fn filter_devices<'a>(devices: &'a [DeviceInfo], filter: Option<&str>) -> Vec<&'a DeviceInfo> {
    devices
        .iter()
        .filter(|d| vendor_matches(&d.vendor_name, filter))
        .collect()
}

/// Auto-select over `(platform, its devices)` pairs.
///
/// Tries the filters as given, then with the device filter dropped, then
/// with both dropped. Returns `(platform_index, device_index)`.
///
/// # Errors
///
/// [`ForgeError::PlatformNotFound`] when there are no platforms at all,
/// [`ForgeError::DeviceNotFound`] when no platform exposes any device.
pub fn auto_select(
    inventory: &[(PlatformInfo, Vec<DeviceInfo>)],
    platform_vendor: Option<&str>,
    device_vendor: Option<&str>,
) -> Result<(usize, usize)> {
    if inventory.is_empty() {
        return Err(ForgeError::PlatformNotFound("no compute platforms".into()));
    }
    let attempts = [
        (platform_vendor, device_vendor),
        (platform_vendor, None),
        (None, device_vendor),
        (None, None),
    ];
    for (pv, dv) in attempts {
        for (platform, devices) in inventory {
            let platform_ok =
                vendor_matches(&platform.vendor, pv) || vendor_matches(&platform.name, pv);
            if !platform_ok {
                continue;
            }
            if let Some(dev) = filter_devices(devices, dv).first() {
                if pv != platform_vendor || dv != device_vendor {
                    tracing::warn!(
                        platform_vendor = ?platform_vendor,
                        device_vendor = ?device_vendor,
                        "vendor filter matched nothing, falling back to any vendor"
                    );
                }
                return Ok((platform.index, dev.index));
            }
        }
    }
    Err(ForgeError::DeviceNotFound("no device on any platform".into()))
}

/// Largest power of two ≤ `n` (0 for 0).
#[must_use]
pub const fn pow2_floor(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - n.leading_zeros())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn device(index: usize, vendor: &str) -> DeviceInfo {
        DeviceInfo {
            index,
            name: format!("dev{index}"),
            vendor_name: vendor.into(),
            vendor: Vendor::classify(vendor, 0),
            global_mem_bytes: 1 << 30,
            local_mem_bytes: 1 << 15,
            max_alloc_bytes: 1 << 28,
            max_workgroup_size: 1024,
            compute_units: 8,
        }
    }

    fn platform(index: usize, vendor: &str) -> PlatformInfo {
        PlatformInfo {
            index,
            name: format!("{vendor} platform"),
            vendor: vendor.into(),
        }
    }

    #[test]
    fn vendor_classification() {
        assert_eq!(Vendor::classify("NVIDIA Corporation", 0), Vendor::Nvidia);
        assert_eq!(Vendor::classify("Advanced Micro Devices, Inc.", 0), Vendor::Amd);
        assert_eq!(Vendor::classify("", 0x8086), Vendor::Intel);
        assert_eq!(Vendor::classify("Intel Corporation", 0), Vendor::Intel);
        assert_eq!(Vendor::classify("Mesa", 0), Vendor::Other);
        assert_eq!(Vendor::Amd.forced_local_size(), Some(64));
        assert_eq!(Vendor::Nvidia.forced_local_size(), None);
    }

    #[test]
    fn explicit_index_out_of_range() {
        let platforms = vec![platform(0, "NVIDIA")];
        assert!(select_platform_by_index(&platforms, 0).is_ok());
        assert!(matches!(
            select_platform_by_index(&platforms, 1),
            Err(ForgeError::PlatformNotFound(_))
        ));
        let devices = vec![device(0, "NVIDIA")];
        assert!(matches!(
            select_device_by_index(&devices, 3),
            Err(ForgeError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn auto_select_honours_filters() {
        let inv = vec![
            (platform(0, "Intel"), vec![device(0, "Intel")]),
            (platform(1, "AMD"), vec![device(0, "AMD"), device(1, "AMD")]),
        ];
        assert_eq!(auto_select(&inv, Some("amd"), None).unwrap(), (1, 0));
        assert_eq!(auto_select(&inv, None, Some("intel")).unwrap(), (0, 0));
    }

    #[test]
    fn auto_select_falls_back_to_any_vendor() {
        let inv = vec![(platform(0, "Intel"), vec![device(0, "Intel")])];
        assert_eq!(auto_select(&inv, Some("nvidia"), Some("nvidia")).unwrap(), (0, 0));
    }

    #[test]
    fn auto_select_without_devices_fails() {
        let inv = vec![(platform(0, "Intel"), vec![])];
        assert!(matches!(
            auto_select(&inv, None, None),
            Err(ForgeError::DeviceNotFound(_))
        ));
        assert!(matches!(
            auto_select(&[], None, None),
            Err(ForgeError::PlatformNotFound(_))
        ));
    }

    #[test]
    fn pow2_floor_values() {
        assert_eq!(pow2_floor(0), 0);
        assert_eq!(pow2_floor(1), 1);
        assert_eq!(pow2_floor(255), 128);
        assert_eq!(pow2_floor(256), 256);
        assert_eq!(pow2_floor(1000), 512);
    }
}
