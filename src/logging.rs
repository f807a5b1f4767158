// SPDX-License-Identifier: AGPL-3.0-only

//! `tracing` subscriber setup.
//!
//! Filter directives come from `LATTICEFORGE_LOG`, then `RUST_LOG`, then
//! default to `info`.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "LATTICEFORGE_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

/// Pick the filter from explicit directives, falling back to `RUST_LOG` and
/// then [`DEFAULT_DIRECTIVE`]. Unparseable directives are skipped.
#[must_use]
pub fn resolve_filter(directives: Option<&str>) -> EnvFilter {
    if let Some(d) = directives.filter(|d| !d.trim().is_empty()) {
        match EnvFilter::try_new(d) {
            Ok(filter) => return filter,
            Err(e) => eprintln!("ignoring invalid {LOG_ENV} directives {d:?}: {e}"),
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global fmt subscriber. Returns `false` if one was already
/// installed (tests, embedding applications).
pub fn init_tracing() -> bool {
    let directives = std::env::var(LOG_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(resolve_filter(directives.as_deref()))
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_directives_win() {
        let filter = resolve_filter(Some("latticeforge=debug"));
        assert!(filter.to_string().contains("latticeforge=debug"));
    }

    #[test]
    fn second_install_reports_false() {
        let _ = init_tracing();
        assert!(!init_tracing());
    }
}
