// SPDX-License-Identifier: AGPL-3.0-only

//! Run gating through `start.txt` / `finish.txt`.
//!
//! A run waits while `finish.txt` from a previous run is present, writes
//! `start.txt` when it begins and rewrites `finish.txt` on shutdown. An
//! external scheduler clears `finish.txt` to release the next run.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::Result;

pub const START_FILE: &str = "start.txt";
pub const FINISH_FILE: &str = "finish.txt";

/// Block, polling every `delay`, until `dir/finish.txt` is gone. Returns
/// the number of polls that found it present.
pub fn wait_until_clear(dir: &Path, delay: Duration) -> usize {
    let finish = dir.join(FINISH_FILE);
    let mut polls = 0;
    while finish.exists() {
        if polls == 0 {
            tracing::info!(path = %finish.display(), "waiting for finish sentinel to clear");
        }
        polls += 1;
        thread::sleep(delay);
    }
    polls
}

fn stamp(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    let now = chrono::Local::now().to_rfc3339();
    fs::write(&path, format!("{now}\n{body}"))?;
    Ok(path)
}

/// Write `dir/start.txt` with the current time and process id.
///
/// # Errors
///
/// [`crate::error::ForgeError::Io`] if the file cannot be written.
pub fn mark_started(dir: &Path) -> Result<PathBuf> {
    stamp(dir, START_FILE, &format!("pid={}\n", std::process::id()))
}

/// Write `dir/finish.txt` with the current time and exit code.
///
/// # Errors
///
/// [`crate::error::ForgeError::Io`] if the file cannot be written.
pub fn mark_finished(dir: &Path, code: i32) -> Result<PathBuf> {
    stamp(dir, FINISH_FILE, &format!("exit={code}\n"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn clear_directory_does_not_wait() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(wait_until_clear(dir.path(), Duration::from_millis(1)), 0);
    }

    #[test]
    fn waits_until_finish_removed() {
        let dir = tempfile::tempdir().unwrap();
        let finish = mark_finished(dir.path(), 0).unwrap();
        let remover = {
            let finish = finish.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                fs::remove_file(finish).unwrap();
            })
        };
        let polls = wait_until_clear(dir.path(), Duration::from_millis(5));
        remover.join().unwrap();
        assert!(polls >= 1);
        assert!(!finish.exists());
    }

    #[test]
    fn stamps_carry_details() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("gate");
        let start = mark_started(&nested).unwrap();
        assert!(fs::read_to_string(start).unwrap().contains("pid="));
        let finish = mark_finished(&nested, 3).unwrap();
        assert!(fs::read_to_string(finish).unwrap().ends_with("exit=3\n"));
    }
}
