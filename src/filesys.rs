// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! File system access.

use std::{
    ffi::OsString,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    process,
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use log::{debug, warn};
use walkdir::WalkDir;

/// Recursively collect all files below `root` whose extension is one of
/// `extensions` (without the dot, compared case-insensitively).
/// Unreadable entries are logged and skipped. The result is sorted.
pub fn find_files(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry below {}: {e}", root.display());
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| has_extension(path, extensions))
        .collect();
    files.sort();
    files
}

/// If `path` has one of the given extensions.
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

/// Appends `suffix` to the full file name of `path`.
fn with_name_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Temporary sibling of `output` a writer fills before `commit`.
/// Keeps the extension so ffmpeg selects the right muxer.
///
/// `out/P-00001.avif` becomes `out/.P-00001.partial.avif`.
pub fn partial_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!(".{stem}.partial.{}", ext.to_string_lossy()),
        None => format!(".{stem}.partial"),
    };
    output.with_file_name(name)
}

/// Atomically move a finished partial file into place.
///
/// # Errors
/// Fails if the rename fails.
pub fn commit(partial: &Path, output: &Path) -> Result<()> {
    fs::rename(partial, output).with_context(|| {
        format!(
            "Unable to move {} into place at {}",
            partial.display(),
            output.display()
        )
    })
}

/// Create the parent directory of `path` if it does not exist.
///
/// # Errors
/// Fails if the directory can not be created.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Unable to create directory {}", parent.display()))?;
    }
    Ok(())
}

/// Path `source` is moved to when archived: its position relative to
/// `root` mirrored below `archive_dir`. Sources outside `root` keep only
/// their file name.
pub fn archive_path(source: &Path, root: &Path, archive_dir: &Path) -> PathBuf {
    match source.strip_prefix(root) {
        Ok(rel) => archive_dir.join(rel),
        Err(_) => archive_dir.join(source.file_name().unwrap_or_default()),
    }
}

/// Move `source` into the archive tree.
///
/// # Errors
/// Fails if the archive directory can not be created or the move fails.
pub fn archive(source: &Path, root: &Path, archive_dir: &Path) -> Result<PathBuf> {
    let target = archive_path(source, root, archive_dir);
    ensure_parent(&target)?;
    fs::rename(source, &target).with_context(|| {
        format!("Unable to archive {} to {}", source.display(), target.display())
    })?;
    Ok(target)
}

#[derive(Debug)]
/// Exclusive right to produce one output file.
///
/// Held as a `{output}.lock` file created with `create_new`, so two
/// workers racing for the same output can not both win.
/// The lock file is removed when the claim is dropped.
pub struct Claim {
    /// Path of the lock file.
    lock: PathBuf,
}

impl Claim {
    /// Try to claim `output`, creating its directory if needed.
    /// Returns `Ok(None)` if a live claim is held elsewhere. Claims older
    /// than `stale_after` are taken over.
    ///
    /// Taking over happens under a second `{output}.lock.takeover` claim and
    /// re-checks the age of the lock, so of several workers finding the same
    /// stale lock only one replaces it.
    ///
    /// # Errors
    /// Fails on file system errors other than the lock already existing.
    pub fn acquire(output: &Path, stale_after: Duration) -> Result<Option<Self>> {
        ensure_parent(output)?;
        let lock = with_name_suffix(output, ".lock");
        if let Some(claim) = Self::create(&lock)? {
            return Ok(Some(claim));
        }
        if !Self::is_stale(&lock, stale_after) {
            return Ok(None);
        }
        let takeover = with_name_suffix(output, ".lock.takeover");
        let Some(_takeover) = Self::create(&takeover)? else {
            if Self::is_stale(&takeover, stale_after) {
                warn!("Removing abandoned takeover {}", takeover.display());
                let _ = fs::remove_file(&takeover);
            }
            return Ok(None);
        };
        // The lock may have been replaced since it was found stale.
        if !Self::is_stale(&lock, stale_after) {
            return Ok(None);
        }
        warn!("Taking over stale claim {}", lock.display());
        match fs::remove_file(&lock) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Unable to remove stale claim {}", lock.display()));
            }
        }
        Self::create(&lock)
    }

    /// Create `lock` exclusively. `Ok(None)` if it already exists.
    fn create(lock: &Path) -> Result<Option<Self>> {
        match OpenOptions::new().write(true).create_new(true).open(lock) {
            Ok(mut file) => {
                // Owner pid is informational only.
                let _ = writeln!(file, "{}", process::id());
                Ok(Some(Self {
                    lock: lock.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Unable to create claim {}", lock.display())),
        }
    }

    /// If the lock at `lock` was last touched longer than `stale_after` ago.
    fn is_stale(lock: &Path, stale_after: Duration) -> bool {
        fs::metadata(lock)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > stale_after)
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock) {
            debug!("Unable to release claim {}: {e}", self.lock.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_files_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/one.MOV"), b"").unwrap();
        fs::write(dir.path().join("a/two.mp4"), b"").unwrap();
        fs::write(dir.path().join("a/notes.txt"), b"").unwrap();
        let found = find_files(dir.path(), &["mov", "mp4"]);
        assert_eq!(
            found,
            vec![dir.path().join("a/b/one.MOV"), dir.path().join("a/two.mp4")]
        );
    }

    #[test]
    fn partial_keeps_extension() {
        assert_eq!(
            partial_path(Path::new("out/P-00001.avif")),
            Path::new("out/.P-00001.partial.avif")
        );
    }

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("P-00001.png");
        let first = Claim::acquire(&output, Duration::from_secs(3600)).unwrap();
        assert!(first.is_some());
        assert!(Claim::acquire(&output, Duration::from_secs(3600)).unwrap().is_none());
        drop(first);
        assert!(!dir.path().join("P-00001.png.lock").exists());
        assert!(Claim::acquire(&output, Duration::from_secs(3600)).unwrap().is_some());
    }

    /// Backdate the lock of `output` by `age`.
    fn age_lock(output: &Path, age: Duration) {
        fs::File::options()
            .write(true)
            .open(with_name_suffix(output, ".lock"))
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
    }

    #[test]
    fn stale_claim_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("P-00001.png");
        let held = Claim::acquire(&output, Duration::from_secs(3600)).unwrap();
        std::mem::forget(held);
        age_lock(&output, Duration::from_secs(7200));
        let taken = Claim::acquire(&output, Duration::from_secs(3600)).unwrap();
        assert!(taken.is_some());
        assert!(!dir.path().join("P-00001.png.lock.takeover").exists());
        // The replacement is fresh again.
        assert!(Claim::acquire(&output, Duration::from_secs(3600)).unwrap().is_none());
    }

    #[test]
    fn stale_claim_has_one_successor() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("P-00001.png");
        std::mem::forget(Claim::acquire(&output, Duration::from_secs(3600)).unwrap());
        age_lock(&output, Duration::from_secs(7200));

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let barrier = barrier.clone();
                let output = output.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    Claim::acquire(&output, Duration::from_secs(3600)).unwrap()
                })
            })
            .collect();
        let claims: Vec<Option<Claim>> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(claims.iter().filter(|c| c.is_some()).count(), 1);
    }

    #[test]
    fn claim_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("M/P/camera_01/P-00000.avif");
        let claim = Claim::acquire(&output, Duration::from_secs(3600)).unwrap();
        assert!(claim.is_some());
        assert!(dir.path().join("M/P/camera_01/P-00000.avif.lock").exists());
    }

    #[test]
    fn archive_mirrors_relative_path() {
        assert_eq!(
            archive_path(Path::new("/f/M/P/c/x.png"), Path::new("/f"), Path::new("/trash")),
            Path::new("/trash/M/P/c/x.png")
        );
    }
}
