// SPDX-License-Identifier: AGPL-3.0-only

//! Program creation through the on-disk binary cache.
//!
//! Lookup key: source digest + device name + platform name + build options.
//! A hit builds from the cached binary; a miss compiles from source and
//! appends the resulting binary. A cached binary the backend rejects is
//! rebuilt from source and its slot rewritten.

use super::backend::{ComputeBackend, ProgramSource};
use super::cache::{source_digest, BinaryCache, CacheKey};
use super::handles::ProgramHandle;
use super::Registry;
use crate::error::{ForgeError, Result};

/// Registry-side record of a built program.
pub struct ProgramEntry<P> {
    pub source: String,
    pub options: String,
    pub digest: String,
    pub build_log: String,
    pub device: String,
    pub platform: String,
    /// Build date of the binary, as recorded in its cache slot.
    pub built: String,
    /// Cache slot holding this program's binary.
    pub slot: usize,
    /// Built from a cached binary rather than compiled.
    pub from_cache: bool,
    pub(crate) program: P,
}

impl<B: ComputeBackend> Registry<B> {
    /// Build `source` with `options` for the selected device and make it the
    /// active program.
    ///
    /// # Errors
    ///
    /// [`ForgeError::NotInitialized`] before `initialize_device`,
    /// [`ForgeError::Build`] on compile failure (diagnostics are dumped to
    /// the work directory), [`ForgeError::Cache`] on cache I/O failure.
    pub fn create_program(&mut self, source: &str, options: &str) -> Result<ProgramHandle> {
        let ctx = self
            .context
            .as_ref()
            .ok_or(ForgeError::NotInitialized("create_program"))?;
        let selection = self
            .selection
            .as_ref()
            .ok_or(ForgeError::NotInitialized("create_program: no device selected"))?;
        let key = CacheKey {
            digest: source_digest(source),
            device: selection.device.name.clone(),
            platform: selection.platform.name.clone(),
            options: options.to_string(),
        };
        let cache = BinaryCache::open(&self.config.work_dir)?;
        let scan = cache.scan(&key)?;
        if scan.evicted > 0 {
            tracing::info!(evicted = scan.evicted, slots = scan.max, "binary cache compacted");
        }

        let cached = match scan.hit {
            Some(slot) => {
                let binary = cache.load_binary(slot)?;
                match self
                    .backend
                    .build_program(ctx, ProgramSource::Binary { binary: &binary, source }, options)
                {
                    Ok(out) => Some((out, slot)),
                    Err(failure) => {
                        tracing::warn!(
                            slot,
                            status = %failure.status,
                            "cached binary rejected, rebuilding from source"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let (output, slot, from_cache) = match cached {
            Some((out, slot)) => (out, slot, true),
            None => {
                tracing::info!(
                    digest = &key.digest[..12],
                    options,
                    "compiling program from source"
                );
                self.compilations += 1;
                let out = match self
                    .backend
                    .build_program(ctx, ProgramSource::Text(source), options)
                {
                    Ok(out) => out,
                    Err(failure) => {
                        tracing::error!(status = %failure.status, "program build failed");
                        self.dump_build_diagnostics(failure.status, &failure.log, options);
                        return Err(ForgeError::Build {
                            status: failure.status,
                            log: failure.log,
                        });
                    }
                };
                let binary = self
                    .backend
                    .program_binary(ctx, &out.program)
                    .map_err(|s| self.fail(ForgeError::backend("program binary", s)))?;
                let slot = match scan.hit {
                    Some(slot) => {
                        cache.write_slot(slot, &key, &binary)?;
                        slot
                    }
                    None => cache.store(&key, &binary)?,
                };
                (out, slot, false)
            }
        };

        let built = cache.record(slot).map_or_else(
            || chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            |r| r.date,
        );
        let handle = self.programs.insert(ProgramEntry {
            source: source.to_string(),
            options: options.to_string(),
            digest: key.digest,
            build_log: output.log,
            device: key.device,
            platform: key.platform,
            built,
            slot,
            from_cache,
            program: output.program,
        });
        self.active_program = handle;
        tracing::info!(program = handle.raw(), slot, from_cache, "program ready");
        Ok(handle)
    }

    /// Make `handle` the program subsequent `init_kernel` calls use.
    ///
    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for null or released handles.
    pub fn set_active_program(&mut self, handle: ProgramHandle) -> Result<()> {
        self.programs.resolve(handle)?;
        self.active_program = handle;
        Ok(())
    }

    #[must_use]
    pub const fn active_program(&self) -> ProgramHandle {
        self.active_program
    }

    /// # Errors
    ///
    /// [`ForgeError::InvalidHandle`] for null or released handles.
    pub fn program(&self, handle: ProgramHandle) -> Result<&ProgramEntry<B::Program>> {
        self.programs.resolve(handle)
    }
}
