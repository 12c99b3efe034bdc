// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Dataset naming conventions.
//!
//! Sources live at `{root}/{model}/{pose}/{camera}-{suffix}.{mov|mp4}`,
//! extracted frames at `{frames}/{model}/{pose}/{camera}/{pose}-{index:05}.{png|avif}`.
//! Paths that do not have that shape are rejected with a [`PathError`].

use std::{
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use clap::ValueEnum;
use regex::Regex;
use thiserror::Error;

use crate::constants::FRAME_INDEX_WIDTH;

/// `{camera}-{suffix}.{mov|mp4}`
static SOURCE_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<camera>[^-]+)-(?P<suffix>.+)\.(?P<ext>(?i:mov|mp4))$")
        .expect("source file pattern is valid")
});

/// `{pose}-{index}.{png|avif}`
static FRAME_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<pose>.+)-(?P<index>\d+)\.(?P<ext>(?i:png|avif))$")
        .expect("frame file pattern is valid")
});

/// `camera_{number}` anywhere in a path component.
static CAMERA_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"camera_(?P<number>\d+)").expect("camera pattern is valid"));

/// Calibration stills: `{number}-{rest}`, e.g. `001-RX0_9990253_C0008.04030868`.
static CALIBRATION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<number>\d+)-").expect("calibration pattern is valid"));

/// Capture stills: `camera_{number}_{rest}`, e.g. `camera_01_M4_EXP_eye_neutral-00003`.
static CAPTURE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^camera_(?P<number>\d+)_").expect("capture pattern is valid")
});

#[derive(Debug, Error, PartialEq, Eq)]
/// A path did not follow the dataset naming convention.
pub enum PathError {
    #[error("{} is not inside {}", .path.display(), .root.display())]
    /// Path is not below the expected root directory.
    OutsideRoot {
        /// Offending path.
        path: PathBuf,
        /// Root it was expected under.
        root: PathBuf,
    },
    #[error("{} does not match {{model}}/{{pose}}/{{camera}}-{{suffix}}.(mov|mp4)", .0.display())]
    /// Path is not a source video.
    NotASourceVideo(PathBuf),
    #[error("{} does not match {{camera}}/{{pose}}-{{index}}.(png|avif)", .0.display())]
    /// Path is not an extracted frame.
    NotAFrameImage(PathBuf),
    #[error("no camera_NN token in {}", .0.display())]
    /// No camera number could be found.
    NoCameraNumber(PathBuf),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[value(rename_all = "lower")]
/// Still image formats the pipeline reads and writes.
pub enum StillFormat {
    /// Lossless PNG.
    Png,
    /// Lossy AVIF, the terminal dataset format.
    Avif,
}

impl StillFormat {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            StillFormat::Png => "png",
            StillFormat::Avif => "avif",
        }
    }

    /// Format of `path` judged by its extension, case-insensitive.
    pub fn of_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some(StillFormat::Png),
            "avif" => Some(StillFormat::Avif),
            _ => None,
        }
    }
}

/// Zero-pad `index` to `width` decimal digits.
/// Indices with more digits than `width` are written in full.
pub fn pad_frame_number(index: u64, width: usize) -> String {
    format!("{index:0>width$}")
}

/// Frames tree mirroring `source_root`: `LA-data` becomes `LA-data-frames`.
pub fn default_frames_root(source_root: &Path) -> PathBuf {
    let mut name = source_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str("-frames");
    source_root.with_file_name(name)
}

/// Splits `rel` into UTF-8 component strings.
fn components(rel: &Path) -> Option<Vec<&str>> {
    rel.components().map(|c| c.as_os_str().to_str()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A recording located by the naming convention.
pub struct SourceVideo {
    /// Full path of the video file.
    pub path: PathBuf,
    /// Capture subject, e.g. `Model1`.
    pub model: String,
    /// Pose or expression, e.g. `EXP_jaw003`.
    pub pose: String,
    /// Camera token, e.g. `camera_50`.
    pub camera: String,
    /// Take identifier after the camera token, e.g. `0014`.
    pub suffix: String,
}

impl SourceVideo {
    /// Parse a source path below `root`.
    ///
    /// # Errors
    /// Returns a [`PathError`] if `path` is not `{root}/{model}/{pose}/{camera}-{suffix}.{mov|mp4}`.
    pub fn parse(root: &Path, path: &Path) -> Result<Self, PathError> {
        let rel = path.strip_prefix(root).map_err(|_| PathError::OutsideRoot {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        })?;
        let not_source = || PathError::NotASourceVideo(path.to_path_buf());
        let parts = components(rel).ok_or_else(not_source)?;
        let [model, pose, file] = parts.as_slice() else {
            return Err(not_source());
        };
        let caps = SOURCE_FILE.captures(file).ok_or_else(not_source)?;
        Ok(Self {
            path: path.to_path_buf(),
            model: (*model).to_string(),
            pose: (*pose).to_string(),
            camera: caps["camera"].to_string(),
            suffix: caps["suffix"].to_string(),
        })
    }

    /// Directory frames of this video are written to.
    pub fn frame_dir(&self, frames_root: &Path) -> PathBuf {
        frames_root
            .join(&self.model)
            .join(&self.pose)
            .join(&self.camera)
    }

    /// Output path of frame `index` in `format`.
    pub fn frame_path(&self, frames_root: &Path, index: u64, format: StillFormat) -> PathBuf {
        self.frame_dir(frames_root).join(format!(
            "{}-{}.{}",
            self.pose,
            pad_frame_number(index, FRAME_INDEX_WIDTH),
            format.extension()
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An extracted still located by the naming convention.
pub struct FrameImage {
    /// Full path of the image.
    pub path: PathBuf,
    /// Name of the directory holding the frame, normally the camera token.
    pub camera_dir: String,
    /// Pose the frame belongs to.
    pub pose: String,
    /// Frame index within the source video.
    pub index: u64,
    /// Image format.
    pub format: StillFormat,
}

impl FrameImage {
    /// Parse a frame path.
    ///
    /// # Errors
    /// Returns a [`PathError`] if `path` is not `.../{camera}/{pose}-{index}.{png|avif}`.
    pub fn parse(path: &Path) -> Result<Self, PathError> {
        let not_frame = || PathError::NotAFrameImage(path.to_path_buf());
        let file = path
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(not_frame)?;
        let camera_dir = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|f| f.to_str())
            .ok_or_else(not_frame)?;
        let caps = FRAME_FILE.captures(file).ok_or_else(not_frame)?;
        let index = caps["index"].parse().map_err(|_| not_frame())?;
        let format = StillFormat::of_path(path).ok_or_else(not_frame)?;
        Ok(Self {
            path: path.to_path_buf(),
            camera_dir: camera_dir.to_string(),
            pose: caps["pose"].to_string(),
            index,
            format,
        })
    }
}

/// Camera number from the first path component containing `camera_NN`.
///
/// # Errors
/// Returns [`PathError::NoCameraNumber`] if no component carries one.
pub fn camera_number(path: &Path) -> Result<u32, PathError> {
    path.components()
        .filter_map(|c| c.as_os_str().to_str())
        .find_map(|c| CAMERA_TOKEN.captures(c)?["number"].parse().ok())
        .ok_or_else(|| PathError::NoCameraNumber(path.to_path_buf()))
}

/// Locate the recording a frame was extracted from.
///
/// Looks in `{source_root}/{model}/{pose}` for a `.mp4` or `.mov`
/// whose name starts with `{camera}-`. Frames are either laid out as
/// `{model}/{pose}/{camera}/{file}` or flat as `{model}/{pose}/{camera}-{file}`.
///
/// # Errors
/// Returns a [`PathError`] if `frame` has neither layout below `frames_root`.
pub fn find_source_for_frame(
    frame: &Path,
    frames_root: &Path,
    source_root: &Path,
) -> Result<Option<PathBuf>, PathError> {
    let rel = frame
        .strip_prefix(frames_root)
        .map_err(|_| PathError::OutsideRoot {
            path: frame.to_path_buf(),
            root: frames_root.to_path_buf(),
        })?;
    let not_frame = || PathError::NotAFrameImage(frame.to_path_buf());
    let parts = components(rel).ok_or_else(not_frame)?;
    let (model, pose, camera) = match parts.as_slice() {
        [model, pose, camera, _file] => (*model, *pose, *camera),
        [model, pose, file] => {
            let camera = CAMERA_TOKEN.find(file).ok_or_else(not_frame)?;
            (*model, *pose, camera.as_str())
        }
        _ => return Err(not_frame()),
    };
    let prefix = format!("{camera}-");
    let Ok(entries) = fs::read_dir(source_root.join(model).join(pose)) else {
        return Ok(None);
    };
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|f| f.to_str())
                .is_some_and(|f| f.starts_with(&prefix) && SOURCE_FILE.is_match(f))
        })
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

#[derive(Debug, Default, PartialEq, Eq)]
/// Calibration stills paired with capture stills of the same camera.
pub struct ViewPairing {
    /// `(calibration, capture)` name pairs.
    pub pairs: Vec<(String, String)>,
    /// Calibration stills without a capture of the same camera.
    pub unpaired: Vec<String>,
}

/// Pair calibration stills (`NNN-...`) with capture stills (`camera_NN_...`)
/// sharing a camera number. Both lists are paired in the given order.
pub fn pair_views_by_camera(calibration: &[String], capture: &[String]) -> ViewPairing {
    let number = |re: &Regex, name: &str| -> Option<u32> { re.captures(name)?["number"].parse().ok() };
    let mut pairing = ViewPairing::default();
    for cal in calibration {
        let cal_number = number(&CALIBRATION_NAME, cal);
        let matches: Vec<&String> = capture
            .iter()
            .filter(|cap| cal_number.is_some() && number(&CAPTURE_NAME, cap) == cal_number)
            .collect();
        if matches.is_empty() {
            pairing.unpaired.push(cal.clone());
        }
        for cap in matches {
            pairing.pairs.push((cal.clone(), cap.clone()));
        }
    }
    pairing
}
