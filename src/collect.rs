// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Gathering of one frame per camera for modeling.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::{Pattern, glob};
use log::{info, warn};

use crate::{
    constants::FRAME_INDEX_WIDTH,
    converter::Converter,
    paths::{StillFormat, pad_frame_number},
    pool::{BatchSummary, Unit, WorkerPool},
};

/// Directory name of camera `number`: `camera_07`.
pub fn camera_dir_name(number: u32) -> String {
    format!("camera_{number:02}")
}

/// AVIF frames numbered `frame` anywhere below `camera_dir`.
///
/// # Errors
/// Fails if the search pattern is invalid.
pub fn find_frame(camera_dir: &Path, frame: u64) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/**/*-{}.{}",
        Pattern::escape(&camera_dir.to_string_lossy()),
        pad_frame_number(frame, FRAME_INDEX_WIDTH),
        StillFormat::Avif.extension()
    );
    let mut found: Vec<PathBuf> = glob(&pattern)
        .with_context(|| format!("Invalid search pattern {pattern}"))?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Skipping unreadable entry: {e}");
                None
            }
        })
        .collect();
    found.sort();
    Ok(found)
}

/// Where a collected frame of `camera` ends up: its name prefixed with the camera.
pub fn collected_path(out_dir: &Path, camera: &str, frame: &Path) -> PathBuf {
    let stem = frame
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    out_dir.join(format!("{camera}_{stem}.{}", StillFormat::Png.extension()))
}

#[derive(Debug)]
/// One frame to collect.
struct Job {
    /// AVIF frame in the dataset.
    source: PathBuf,
    /// PNG written to the output directory.
    output: PathBuf,
}

impl AsRef<Path> for Job {
    fn as_ref(&self) -> &Path {
        &self.source
    }
}

/// For every camera directory below `pose_dir`, convert its AVIF frames
/// numbered `frame` to PNG in `out_dir`, prefixed with the camera name.
/// Sources are disposed of according to the converter's policy.
///
/// # Errors
/// Fails if a search pattern is invalid.
pub fn collect_frames(
    pose_dir: &Path,
    cameras: &[u32],
    frame: u64,
    out_dir: &Path,
    converter: &Converter,
    pool: &WorkerPool,
) -> Result<BatchSummary> {
    let mut work: Vec<Job> = Vec::new();
    for &number in cameras {
        let camera = camera_dir_name(number);
        let camera_dir = pose_dir.join(&camera);
        if !camera_dir.is_dir() {
            warn!("Camera folder not found: {}", camera_dir.display());
            continue;
        }
        for source in find_frame(&camera_dir, frame)? {
            let output = collected_path(out_dir, &camera, &source);
            work.push(Job { source, output });
        }
    }
    info!(
        "Collecting {} frames numbered {frame} into {}",
        work.len(),
        out_dir.display()
    );
    Ok(pool.run(&work, |Job { source, output }| {
        if output.exists() {
            return Ok(Unit::Skipped);
        }
        converter.transcode(source, StillFormat::Png, output)?;
        converter.dispose(source)?;
        info!("Processed frame: {}", output.display());
        Ok(Unit::Done)
    }))
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::{
        converter::SourcePolicy,
        ffmpeg::fake,
        pool::CancelToken,
    };

    #[test]
    fn camera_names_are_padded() {
        assert_eq!(camera_dir_name(7), "camera_07");
        assert_eq!(camera_dir_name(87), "camera_87");
    }

    #[test]
    fn finds_frame_by_padded_number() {
        let dir = tempfile::tempdir().unwrap();
        let cam = dir.path().join("camera_03");
        fs::create_dir_all(cam.join("take2")).unwrap();
        fs::write(cam.join("EXP_eye-00012.avif"), b"").unwrap();
        fs::write(cam.join("take2/EXP_eye-00012.avif"), b"").unwrap();
        fs::write(cam.join("EXP_eye-00120.avif"), b"").unwrap();
        fs::write(cam.join("EXP_eye-00012.png"), b"").unwrap();
        assert_eq!(
            find_frame(&cam, 12).unwrap(),
            vec![cam.join("EXP_eye-00012.avif"), cam.join("take2/EXP_eye-00012.avif")]
        );
    }

    #[test]
    fn collected_name_carries_camera() {
        assert_eq!(
            collected_path(
                Path::new("/out"),
                "camera_03",
                Path::new("/f/camera_03/EXP_eye-00012.avif")
            ),
            Path::new("/out/camera_03_EXP_eye-00012.png")
        );
    }

    #[test]
    fn collects_each_camera_once() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = dir.path().join("decoded.png");
        RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])).save(&fixture).unwrap();
        // AVIF stills are decoded by ffmpeg to PNG on stdout.
        let ffmpeg = fake::ffmpeg(
            dir.path(),
            &format!("cat '{}'", fixture.display()),
            "exit 1",
            Duration::from_secs(30),
        );
        let pose = dir.path().join("M/EXP_eye");
        for camera in ["camera_01", "camera_02"] {
            fs::create_dir_all(pose.join(camera)).unwrap();
            fs::write(pose.join(camera).join("EXP_eye-00012.avif"), b"avif").unwrap();
        }
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("camera_02_EXP_eye-00012.png"), b"earlier run").unwrap();

        let converter = Converter::new(ffmpeg, SourcePolicy::Delete, true, CancelToken::new());
        let pool = WorkerPool::new(Some(2), CancelToken::new()).unwrap();
        let summary = collect_frames(&pose, &[1, 2, 3], 12, &out, &converter, &pool).unwrap();
        assert_eq!((summary.succeeded, summary.skipped, summary.failed), (1, 1, 0));

        let collected = image::open(out.join("camera_01_EXP_eye-00012.png")).unwrap();
        assert_eq!(collected.to_rgb8().get_pixel(0, 0).0, [1, 2, 3]);
        assert!(!pose.join("camera_01/EXP_eye-00012.avif").exists());
        assert!(pose.join("camera_02/EXP_eye-00012.avif").exists());
        assert_eq!(fs::read(out.join("camera_02_EXP_eye-00012.png")).unwrap(), b"earlier run");
    }
}
