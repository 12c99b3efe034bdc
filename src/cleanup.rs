// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Removal of partial writes and verification of extracted output.
//!
//! Partial files are found by size alone. A truncated file above the
//! threshold is never caught, an intact file below it is always flagged.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::ValueEnum;
use log::{debug, error, info, warn};

use crate::{
    filesys::find_files,
    paths::{SourceVideo, StillFormat},
};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "lower")]
/// What to do with files below the size threshold.
pub enum CleanMode {
    /// Delete them.
    Delete,
    /// Only log them.
    Preview,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
/// Result of a cleanup pass.
pub struct CleanReport {
    /// Files of the cleaned extension looked at.
    pub examined: usize,
    /// Files smaller than the threshold.
    pub partial: Vec<PathBuf>,
    /// Of those, the ones deleted.
    pub removed: usize,
}

/// Flag every `extension` file below `root` smaller than `threshold` bytes.
/// A file of exactly `threshold` bytes is kept.
///
/// # Errors
/// Fails if a flagged file can not be deleted.
pub fn clean_partials(
    root: &Path,
    extension: &str,
    threshold: u64,
    mode: CleanMode,
) -> Result<CleanReport> {
    let mut report = CleanReport::default();
    for path in find_files(root, &[extension]) {
        report.examined += 1;
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("Unable to stat {}: {e}", path.display());
                continue;
            }
        };
        if size >= threshold {
            debug!("File {} is not below the threshold", path.display());
            continue;
        }
        match mode {
            CleanMode::Preview => info!("Found partial file: {} ({size} bytes)", path.display()),
            CleanMode::Delete => {
                info!("Deleting {} ({size} bytes)", path.display());
                fs::remove_file(&path)
                    .with_context(|| format!("Unable to delete {}", path.display()))?;
                report.removed += 1;
            }
        }
        report.partial.push(path);
    }
    info!(
        "{} of {} {extension} files below {threshold} bytes, {} deleted.",
        report.partial.len(),
        report.examined,
        report.removed
    );
    Ok(report)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// Number of stills per format in a tree.
pub struct Tally {
    /// PNG files, frames still waiting for conversion.
    pub png: usize,
    /// AVIF files.
    pub avif: usize,
}

/// Count the stills below `root`.
pub fn tally(root: &Path) -> Tally {
    Tally {
        png: find_files(root, &[StillFormat::Png.extension()]).len(),
        avif: find_files(root, &[StillFormat::Avif.extension()]).len(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// State of the frames extracted from one recording.
pub enum Verification {
    /// AVIF output exists and no PNG is waiting for conversion.
    Complete {
        /// Number of AVIF frames.
        frames: usize,
    },
    /// The frame directory does not exist.
    MissingFrameDir(PathBuf),
    /// The frame directory holds no AVIF output.
    NoAvif(PathBuf),
    /// PNG frames without a matching AVIF.
    Unconverted(Vec<PathBuf>),
}

/// Check the frames of `video` below `frames_root`: the frame directory
/// must hold AVIF output and every PNG must have a matching AVIF.
pub fn verify_source(video: &SourceVideo, frames_root: &Path) -> Verification {
    let dir = video.frame_dir(frames_root);
    if !dir.is_dir() {
        error!("Frames path not found: {}", dir.display());
        return Verification::MissingFrameDir(dir);
    }
    let avifs = find_files(&dir, &[StillFormat::Avif.extension()]);
    if avifs.is_empty() {
        warn!("No AVIF files found for {} in {}", video.camera, dir.display());
        return Verification::NoAvif(dir);
    }
    let converted: HashSet<PathBuf> = avifs.iter().map(|p| p.with_extension("")).collect();
    let unconverted: Vec<PathBuf> = find_files(&dir, &[StillFormat::Png.extension()])
        .into_iter()
        .filter(|png| !converted.contains(&png.with_extension("")))
        .collect();
    if !unconverted.is_empty() {
        for png in &unconverted {
            error!("Missing corresponding AVIF for {}", png.display());
        }
        return Verification::Unconverted(unconverted);
    }
    info!("All frames verified for {}", video.path.display());
    Verification::Complete {
        frames: avifs.len(),
    }
}
