//! Base-machine snapshot cache
//!
//! Fast-forwarding a pristine machine to its first host-I/O suspension
//! point is expensive and depends only on the loaded program, so the result
//! is persisted to disk under a content-addressed name and reloaded on the
//! next startup.
//!
//! Cache layout: `<cache_dir>/<program-hash>.bin`. Writes go through a
//! sibling `.wip` file followed by an atomic rename, so a crash mid-write
//! can never leave a partial snapshot under its canonical name.
//!
//! Failure policy: I/O errors before the rename are fatal to startup; a
//! snapshot that fails to deserialize is treated as a miss and recomputed
//! (the machine contract guarantees a failed load leaves it unchanged).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use lib_machine::Machine;

use crate::ValidatorResult;

/// Unknown cache files untouched for this long are swept on startup.
const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Extension suffix for in-progress snapshot writes.
const WIP_SUFFIX: &str = ".wip";

/// Content-addressed on-disk cache of prewarmed machine snapshots.
pub struct BaseMachineCache {
    dir: PathBuf,
}

impl BaseMachineCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Canonical snapshot path for the program loaded into `machine`.
    pub fn snapshot_path(&self, machine: &dyn Machine) -> PathBuf {
        self.dir.join(format!("{}.bin", machine.hash()))
    }

    /// Bring `machine` to its first host-I/O point, from cache if possible.
    ///
    /// On a hit the snapshot's mtime is refreshed so the stale sweep never
    /// collects a live entry. On a miss (or a corrupt snapshot) the machine
    /// is stepped forward and the fresh snapshot is persisted atomically.
    pub fn prepare(&self, machine: &mut dyn Machine) -> ValidatorResult<()> {
        let hash = machine.hash();
        let expected_name = format!("{}.bin", hash);
        fs::create_dir_all(&self.dir)?;

        let mut found_in_cache = false;
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            if dirent.file_name().to_string_lossy() == expected_name {
                found_in_cache = true;
            } else if is_stale(&dirent.metadata()?) {
                tracing::info!(
                    "removing stale machine cache file {:?}",
                    dirent.file_name()
                );
                fs::remove_file(dirent.path())?;
            } else {
                tracing::info!(
                    "keeping unknown machine cache file {:?}",
                    dirent.file_name()
                );
            }
        }

        let snapshot = self.dir.join(&expected_name);
        if found_in_cache {
            // Refresh mtime so the stale sweep keeps skipping this file.
            match touch(&snapshot) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    found_in_cache = false;
                }
                Err(err) => return Err(err.into()),
            }
        }

        if found_in_cache {
            tracing::info!("found cached base machine, hash {}", hash);
            match machine.deserialize_and_replace_state(&snapshot) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    // The machine is untouched on failure, so recomputing
                    // from here is sound.
                    tracing::info!(
                        "failed to load base machine snapshot, re-executing: {}",
                        err
                    );
                }
            }
        } else {
            tracing::info!("no cached base machine for hash {}", hash);
        }

        machine.step_until_host_io()?;

        tracing::info!("saving base machine snapshot, hash {}", hash);
        let wip = wip_path(&snapshot);
        machine.serialize_state(&wip)?;
        fs::rename(&wip, &snapshot)?;

        Ok(())
    }
}

fn wip_path(snapshot: &Path) -> PathBuf {
    let mut name = snapshot.as_os_str().to_owned();
    name.push(WIP_SUFFIX);
    PathBuf::from(name)
}

fn is_stale(metadata: &fs::Metadata) -> bool {
    match metadata.modified() {
        Ok(mtime) => SystemTime::now()
            .duration_since(mtime)
            .map(|age| age > STALE_AFTER)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn touch(path: &Path) -> std::io::Result<()> {
    let file = fs::File::options().write(true).open(path)?;
    file.set_modified(SystemTime::now())
}
