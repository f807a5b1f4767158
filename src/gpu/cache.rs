// SPDX-License-Identifier: AGPL-3.0-only

//! On-disk cache of compiled program binaries.
//!
//! Each cached build is a pair of sibling files in the work directory:
//!
//! ```text
//! program<N>.inf   NUMBER=, MD5=, DEVICE=, PLATFORM=, [OPTIONS=], DATE=
//! program<N>.bin   raw device binary
//! ```
//!
//! `N` runs densely from 1. A scan walks the `.inf` files in ascending order;
//! an entry built for the same device, platform and options but from a
//! different source digest is stale and is evicted by deleting its pair and
//! renaming the highest-numbered pair into the freed slot. The `.bin` is
//! always written before its `.inf`, so a present `.inf` implies a complete
//! binary.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{ForgeError, Result};

/// Hex digest of a program source, used only as an opaque cache key.
#[must_use]
pub fn source_digest(source: &str) -> String {
    let hash = Sha256::digest(source.as_bytes());
    hash.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// Identity of one build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKey {
    pub digest: String,
    pub device: String,
    pub platform: String,
    pub options: String,
}

impl CacheKey {
    fn same_target(&self, record: &CacheRecord) -> bool {
        self.device == record.device
            && self.platform == record.platform
            && self.options == record.options
    }
}

/// Parsed contents of a `.inf` file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRecord {
    pub number: usize,
    pub digest: String,
    pub device: String,
    pub platform: String,
    pub options: String,
    pub date: String,
}

impl CacheRecord {
    fn new(number: usize, key: &CacheKey) -> Self {
        Self {
            number,
            digest: key.digest.clone(),
            device: key.device.clone(),
            platform: key.platform.clone(),
            options: key.options.clone(),
            date: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    /// Parse `KEY=VALUE` lines. Unknown keys are ignored; `OPTIONS` may be
    /// absent (empty options).
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut number = None;
        let mut digest = None;
        let mut device = None;
        let mut platform = None;
        let mut options = String::new();
        let mut date = String::new();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim_end_matches('\r');
            match key.trim() {
                "NUMBER" => number = value.trim().parse().ok(),
                "MD5" => digest = Some(value.trim().to_string()),
                "DEVICE" => device = Some(value.to_string()),
                "PLATFORM" => platform = Some(value.to_string()),
                "OPTIONS" => options = value.to_string(),
                "DATE" => date = value.to_string(),
                _ => {}
            }
        }
        Some(Self {
            number: number?,
            digest: digest?,
            device: device?,
            platform: platform?,
            options,
            date,
        })
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!(
            "NUMBER={}\nMD5={}\nDEVICE={}\nPLATFORM={}\n",
            self.number, self.digest, self.device, self.platform
        );
        if !self.options.is_empty() {
            out.push_str(&format!("OPTIONS={}\n", self.options));
        }
        out.push_str(&format!("DATE={}\n", self.date));
        out
    }
}

/// Outcome of scanning the cache for a key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheScan {
    /// Slot holding a matching build, after compaction.
    pub hit: Option<usize>,
    /// Number of stale pairs removed.
    pub evicted: usize,
    /// Highest slot number after compaction.
    pub max: usize,
}

/// Binary cache rooted at a directory.
#[derive(Clone, Debug)]
pub struct BinaryCache {
    dir: PathBuf,
}

impl BinaryCache {
    /// Open (creating if needed) a cache directory.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Cache`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| ForgeError::cache(&dir, e))?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn inf_path(&self, slot: usize) -> PathBuf {
        self.dir.join(format!("program{slot}.inf"))
    }

    #[must_use]
    pub fn bin_path(&self, slot: usize) -> PathBuf {
        self.dir.join(format!("program{slot}.bin"))
    }

    /// Highest `N` such that `program1.inf ..= programN.inf` all exist.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        let mut n = 0;
        while self.inf_path(n + 1).is_file() {
            n += 1;
        }
        n
    }

    /// Read and parse the metadata in `slot`; `None` if unreadable.
    #[must_use]
    pub fn record(&self, slot: usize) -> Option<CacheRecord> {
        let text = fs::read_to_string(self.inf_path(slot)).ok()?;
        CacheRecord::parse(&text)
    }

    /// Scan all slots for `key`, evicting stale entries on the way.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Cache`] if an eviction cannot delete or rename files.
    pub fn scan(&self, key: &CacheKey) -> Result<CacheScan> {
        let mut scan = CacheScan {
            max: self.slot_count(),
            ..CacheScan::default()
        };
        let mut slot = 1;
        while slot <= scan.max {
            let stale = match self.record(slot) {
                None => true,
                Some(rec) => key.same_target(&rec) && rec.digest != key.digest,
            };
            if stale {
                tracing::warn!(slot, dir = %self.dir.display(), "evicting stale cached binary");
                scan.max = self.evict(slot, scan.max)?;
                scan.evicted += 1;
                continue;
            }
            if scan.hit.is_none() {
                if let Some(rec) = self.record(slot) {
                    if key.same_target(&rec) && rec.digest == key.digest {
                        scan.hit = Some(slot);
                    }
                }
            }
            slot += 1;
        }
        Ok(scan)
    }

    /// Delete `slot` and move `max` into it. Returns the new maximum.
    fn evict(&self, slot: usize, max: usize) -> Result<usize> {
        remove_if_present(&self.inf_path(slot))?;
        remove_if_present(&self.bin_path(slot))?;
        if slot < max {
            rename(&self.bin_path(max), &self.bin_path(slot))?;
            let moved = self.record(max);
            rename(&self.inf_path(max), &self.inf_path(slot))?;
            if let Some(mut rec) = moved {
                rec.number = slot;
                write(&self.inf_path(slot), rec.render().as_bytes())?;
            }
        }
        Ok(max.saturating_sub(1))
    }

    /// Load the binary stored in `slot`.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Cache`] if the `.bin` file cannot be read.
    pub fn load_binary(&self, slot: usize) -> Result<Vec<u8>> {
        let path = self.bin_path(slot);
        fs::read(&path).map_err(|e| ForgeError::cache(path, e))
    }

    /// Append a new pair after the current maximum. Returns its slot.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Cache`] on write failure.
    pub fn store(&self, key: &CacheKey, binary: &[u8]) -> Result<usize> {
        let slot = self.slot_count() + 1;
        self.write_slot(slot, key, binary)?;
        Ok(slot)
    }

    /// Overwrite the pair in `slot`.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Cache`] on write failure.
    pub fn write_slot(&self, slot: usize, key: &CacheKey, binary: &[u8]) -> Result<()> {
        write(&self.bin_path(slot), binary)?;
        write(
            &self.inf_path(slot),
            CacheRecord::new(slot, key).render().as_bytes(),
        )
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ForgeError::cache(path, e)),
    }
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ForgeError::cache(from, e)),
    }
}

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|e| ForgeError::cache(path, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(digest: &str) -> CacheKey {
        CacheKey {
            digest: digest.into(),
            device: "Host CPU".into(),
            platform: "Host".into(),
            options: "-DNC=3".into(),
        }
    }

    #[test]
    fn digest_is_stable_hex() {
        let a = source_digest("__kernel void f() {}");
        assert_eq!(a.len(), 64);
        assert_eq!(a, source_digest("__kernel void f() {}"));
        assert_ne!(a, source_digest("__kernel void g() {}"));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn record_render_parse() {
        let rec = CacheRecord::new(3, &key("abc"));
        let parsed = CacheRecord::parse(&rec.render()).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn options_line_omitted_when_empty() {
        let mut k = key("abc");
        k.options.clear();
        let text = CacheRecord::new(1, &k).render();
        assert!(!text.contains("OPTIONS"));
        assert_eq!(CacheRecord::parse(&text).unwrap().options, "");
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(CacheRecord::parse("NUMBER=1\nMD5=x\n").is_none());
    }

    #[test]
    fn store_then_scan_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BinaryCache::open(dir.path()).unwrap();
        let k = key("d1");
        assert_eq!(cache.store(&k, b"bin1").unwrap(), 1);
        let scan = cache.scan(&k).unwrap();
        assert_eq!(scan.hit, Some(1));
        assert_eq!(scan.evicted, 0);
        assert_eq!(cache.load_binary(1).unwrap(), b"bin1");
    }

    #[test]
    fn stale_entry_is_replaced_by_highest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BinaryCache::open(dir.path()).unwrap();
        cache.store(&key("old"), b"old").unwrap();
        let mut other = key("keep");
        other.device = "Other GPU".into();
        cache.store(&other, b"keep").unwrap();
        cache.store(&other.clone(), b"keep2").unwrap();

        let scan = cache.scan(&key("new")).unwrap();
        assert_eq!(scan.evicted, 1);
        assert_eq!(scan.max, 2);
        assert_eq!(scan.hit, None);
        assert_eq!(cache.slot_count(), 2);
        assert_eq!(cache.load_binary(1).unwrap(), b"keep2");
        assert_eq!(cache.record(1).unwrap().number, 1);
        assert!(!cache.inf_path(3).exists());
        assert!(!cache.bin_path(3).exists());
    }

    #[test]
    fn different_options_are_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BinaryCache::open(dir.path()).unwrap();
        let mut k = key("d1");
        cache.store(&k, b"a").unwrap();
        k.options = "-DNC=2".into();
        k.digest = "d2".into();
        let scan = cache.scan(&k).unwrap();
        assert_eq!(scan.evicted, 0);
        assert_eq!(scan.hit, None);
    }

    #[test]
    fn unparseable_metadata_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BinaryCache::open(dir.path()).unwrap();
        fs::write(cache.inf_path(1), "garbage").unwrap();
        fs::write(cache.bin_path(1), "x").unwrap();
        let scan = cache.scan(&key("d")).unwrap();
        assert_eq!(scan.evicted, 1);
        assert_eq!(cache.slot_count(), 0);
    }
}
