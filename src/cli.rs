// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! cli - Command line interface tooling.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use crate::{
    constants::{
        AVIF_QUALITY, AVIF_SPEED, COLORSPACE, FFMPEG_EXECUTABLE,
        FFMPEG_TIMEOUT_SECS, FFPROBE_EXECUTABLE, MATCH_THRESHOLD, MAX_FRAMES,
        PARTIAL_SIZE_THRESHOLD,
    },
    converter::SourcePolicy,
    extractor::{ExtractConfig, ExtractMode},
    ffmpeg::Ffmpeg,
    logging::LogConfig,
    paths::StillFormat,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
/// Command line argument handler.
pub struct Args {
    #[command(subcommand)]
    /// Tool to run.
    pub task: Task,
    #[arg(
        long,
        global = true,
        help = "Log file, appended to. Defaults to <task>.log in the working directory."
    )]
    /// Log file, appended to.
    log_file: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = LogLevel::Info,
        help = "Most verbose log level written."
    )]
    /// Most verbose log level written.
    log_level: LogLevel,
    #[arg(
        short,
        long,
        global = true,
        value_parser = clap::value_parser!(u16).range(1..=512),
        help = "Number of worker threads. Defaults to one per CPU."
    )]
    /// Number of worker threads.
    jobs: Option<u16>,
    #[arg(
        long,
        global = true,
        default_value_t = FFMPEG_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds a single ffmpeg call may run, or a frame stream may stall, before it is killed."
    )]
    /// Seconds a single ffmpeg call may run.
    timeout_secs: u64,
    #[arg(long, global = true, default_value = FFMPEG_EXECUTABLE, help = "ffmpeg executable.")]
    /// ffmpeg executable.
    ffmpeg: PathBuf,
    #[arg(long, global = true, default_value = FFPROBE_EXECUTABLE, help = "ffprobe executable.")]
    /// ffprobe executable.
    ffprobe: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "lower")]
/// Log verbosity.
pub enum LogLevel {
    /// Nothing.
    Off,
    /// Failures only.
    Error,
    /// Failures and suspicious input.
    Warn,
    /// Progress.
    Info,
    /// Every file touched.
    Debug,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
        }
    }
}

#[derive(Subcommand, Debug)]
/// Tools of the pipeline.
pub enum Task {
    /// Extract the frames of every recording below a source tree.
    Extract {
        /// Root of the source tree ({model}/{pose}/{camera}-{suffix}.mp4|mov).
        source_root: PathBuf,
        #[arg(long, help = "Root of the frames tree. Defaults to <source_root>-frames.")]
        /// Root of the frames tree.
        frames_root: Option<PathBuf>,
        #[command(flatten)]
        /// Extraction settings.
        options: ExtractOptions,
    },
    /// Extract a single frame of one recording.
    Single {
        /// Recording to read.
        video: PathBuf,
        /// Zero based frame index.
        index: u64,
        #[arg(
            short,
            long,
            help = "Output image. Derived from the recording's place below --source-root if omitted."
        )]
        /// Output image.
        output: Option<PathBuf>,
        #[arg(long, help = "Root of the source tree holding the recording.")]
        /// Root of the source tree holding the recording.
        source_root: Option<PathBuf>,
        #[arg(long, help = "Root of the frames tree. Defaults to <source_root>-frames.")]
        /// Root of the frames tree.
        frames_root: Option<PathBuf>,
        #[command(flatten)]
        /// Extraction settings.
        options: ExtractOptions,
    },
    /// Re-extract every frame left behind as PNG in the frames tree.
    Refill {
        /// Root of the frames tree.
        frames_root: PathBuf,
        /// Root of the source tree.
        source_root: PathBuf,
        #[command(flatten)]
        /// Extraction settings.
        options: ExtractOptions,
    },
    /// Convert every still of one format below a folder to another.
    Convert {
        /// Folder searched recursively.
        folder: PathBuf,
        #[arg(long, value_enum, default_value_t = StillFormat::Png, help = "Format converted from.")]
        /// Format converted from.
        from: StillFormat,
        #[arg(long, value_enum, default_value_t = StillFormat::Avif, help = "Format converted to.")]
        /// Format converted to.
        to: StillFormat,
        #[arg(
            short = 'y',
            long,
            help = "Convert again if the target already exists.",
            default_value_t = false
        )]
        /// Convert again if the target already exists.
        overwrite: bool,
        #[command(flatten)]
        /// Encoder settings.
        encoder: EncoderOptions,
        #[command(flatten)]
        /// What happens to converted sources.
        disposal: DisposalOptions,
    },
    /// Find (and delete) stills smaller than a size threshold.
    Clean {
        /// Folder searched recursively.
        folder: PathBuf,
        #[arg(default_value_t = PARTIAL_SIZE_THRESHOLD)]
        /// Files smaller than this many bytes are partial.
        threshold: u64,
        #[arg(long, default_value = "avif", help = "Extension of the files examined.")]
        /// Extension of the files examined.
        extension: String,
        #[arg(long, help = "Only list partial files, delete nothing.", default_value_t = false)]
        /// Only list partial files.
        preview: bool,
    },
    /// Check that every recording below a source tree has converted frames.
    Verify {
        /// Root of the source tree.
        source_root: PathBuf,
        #[arg(long, help = "Root of the frames tree. Defaults to <source_root>-frames.")]
        /// Root of the frames tree.
        frames_root: Option<PathBuf>,
    },
    /// Count PNG and AVIF stills below a folder.
    Count {
        /// Folder searched recursively.
        folder: PathBuf,
    },
    /// Write a pose,frame_id list for every recording below a folder.
    FrameList {
        /// Folder searched recursively for recordings.
        folder: PathBuf,
        #[arg(short, long, default_value = "frame_list.csv", help = "CSV file written.")]
        /// CSV file written.
        output: PathBuf,
        #[arg(
            long,
            default_value_t = 1,
            value_parser = clap::value_parser!(u64).range(1..),
            help = "Take every n-th frame."
        )]
        /// Take every n-th frame.
        skip: u64,
    },
    /// Report frames whose numbering a camera offset table says is wrong.
    Offsets {
        /// Frames tree searched recursively.
        folder: PathBuf,
        #[arg(long, help = "Offset table file. Defaults to the built in table.")]
        /// Offset table file.
        table: Option<PathBuf>,
        #[arg(
            long,
            help = "Leave out rejected table entries instead of refusing to run.",
            default_value_t = false
        )]
        /// Leave out rejected table entries.
        skip_invalid: bool,
    },
    /// Map the stills of one folder to their best match in another.
    Match {
        /// First set of stills.
        folder1: PathBuf,
        /// Second set of stills, compared rotated 90° clockwise.
        folder2: PathBuf,
        #[arg(short, long, default_value = "matches.csv", help = "CSV file written.")]
        /// CSV file written.
        output: PathBuf,
        #[arg(
            long,
            default_value_t = MATCH_THRESHOLD,
            help = "Matches a pair needs to exceed to count."
        )]
        /// Matches a pair needs to exceed.
        threshold: usize,
    },
    /// Gather one frame number of every camera as PNG.
    Collect {
        /// Pose folder holding camera_NN folders.
        pose_dir: PathBuf,
        /// Frame number collected.
        frame: u64,
        /// Folder the PNGs are written to.
        out_dir: PathBuf,
        #[arg(
            long,
            value_delimiter = ',',
            value_parser = clap::value_parser!(u32).range(1..=99),
            help = "Camera numbers collected. Defaults to all cameras."
        )]
        /// Camera numbers collected.
        cameras: Vec<u32>,
        #[arg(
            long,
            value_enum,
            default_value_t = Disposal::Keep,
            help = "What happens to collected AVIF frames."
        )]
        /// What happens to collected AVIF frames.
        source_policy: Disposal,
        #[arg(long, help = "Archive tree for --source-policy archive.")]
        /// Archive tree.
        archive_dir: Option<PathBuf>,
    },
    /// Pair calibration stills with capture stills of the same camera.
    Pair {
        /// Folder of calibration stills named NNN-...
        calibration_dir: PathBuf,
        /// Folder of capture stills named camera_NN_...
        capture_dir: PathBuf,
    },
}

impl Task {
    /// Name of the task, as typed on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            Task::Extract { .. } => "extract",
            Task::Single { .. } => "single",
            Task::Refill { .. } => "refill",
            Task::Convert { .. } => "convert",
            Task::Clean { .. } => "clean",
            Task::Verify { .. } => "verify",
            Task::Count { .. } => "count",
            Task::FrameList { .. } => "frame-list",
            Task::Offsets { .. } => "offsets",
            Task::Match { .. } => "match",
            Task::Collect { .. } => "collect",
            Task::Pair { .. } => "pair",
        }
    }

    /// If the task rotates frames when `--rotate` is not given.
    /// `single` and `refill` patch frames of a rotated dataset.
    pub fn rotates_by_default(&self) -> bool {
        match self {
            Task::Extract { options, .. } => options.mode.rotates_by_default(),
            Task::Single { .. } | Task::Refill { .. } => true,
            _ => false,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
/// Settings shared by the extracting tasks.
pub struct ExtractOptions {
    #[arg(
        short,
        long,
        value_enum,
        default_value_t = ExtractMode::PerFrame,
        help = "One ffmpeg call per frame, or one call streaming all frames."
    )]
    /// Extraction strategy.
    pub mode: ExtractMode,
    #[arg(short, long, value_enum, default_value_t = StillFormat::Avif, help = "Format frames are stored in.")]
    /// Format frames are stored in.
    pub format: StillFormat,
    #[arg(
        long,
        help = "Rotate frames 90° clockwise (true/false). Sequential extraction, single and refill rotate by default."
    )]
    /// Rotate frames 90° clockwise.
    pub rotate: Option<bool>,
    #[arg(long, default_value = COLORSPACE, help = "Colorspace frames are normalized to.")]
    /// Colorspace frames are normalized to.
    pub colorspace: String,
    #[arg(long, help = "Keep the source colorspace.", default_value_t = false)]
    /// Keep the source colorspace.
    pub keep_colorspace: bool,
    #[arg(long, default_value_t = MAX_FRAMES, help = "Highest frame index tried in per-frame mode.")]
    /// Highest frame index tried in per-frame mode.
    pub max_frames: u64,
    #[command(flatten)]
    /// Encoder settings.
    pub encoder: EncoderOptions,
}

impl ExtractOptions {
    /// Turn the options into extraction settings. Frames are rotated when
    /// `--rotate` says so, otherwise when `rotate_by_default` is set.
    pub fn to_extract_config(&self, rotate_by_default: bool) -> ExtractConfig {
        ExtractConfig {
            mode: self.mode,
            format: self.format,
            rotate: self.rotate.unwrap_or(rotate_by_default),
            colorspace: (!self.keep_colorspace).then(|| self.colorspace.clone()),
            max_frames: self.max_frames,
        }
    }
}

#[derive(clap::Args, Debug, Clone, Copy)]
/// AVIF encoder settings.
pub struct EncoderOptions {
    #[arg(
        long,
        default_value_t = AVIF_QUALITY,
        value_parser = clap::value_parser!(u8).range(1..=100),
        help = "AVIF quality, 100 is best."
    )]
    /// AVIF quality.
    pub quality: u8,
    #[arg(
        long,
        default_value_t = AVIF_SPEED,
        value_parser = clap::value_parser!(u8).range(1..=10),
        help = "AVIF encoder speed, 1 is slowest."
    )]
    /// AVIF encoder speed.
    pub speed: u8,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "lower")]
/// What happens to a source once its conversion is in place.
pub enum Disposal {
    /// Remove it.
    Delete,
    /// Move it into the archive tree.
    Archive,
    /// Leave it.
    Keep,
}

#[derive(clap::Args, Debug, Clone)]
/// Disposal of converted sources.
pub struct DisposalOptions {
    #[arg(
        long,
        value_enum,
        default_value_t = Disposal::Delete,
        help = "What happens to converted sources."
    )]
    /// What happens to converted sources.
    pub source_policy: Disposal,
    #[arg(long, help = "Archive tree for --source-policy archive.")]
    /// Archive tree.
    pub archive_dir: Option<PathBuf>,
}

impl DisposalOptions {
    /// Policy for sources below `root`.
    ///
    /// # Errors
    /// Fails if archiving is requested without an archive tree.
    pub fn to_source_policy(&self, root: &Path) -> Result<SourcePolicy> {
        to_source_policy(self.source_policy, self.archive_dir.as_deref(), root)
    }
}

/// Policy for sources below `root`.
///
/// # Errors
/// Fails if archiving is requested without an archive tree.
pub fn to_source_policy(
    disposal: Disposal,
    archive_dir: Option<&Path>,
    root: &Path,
) -> Result<SourcePolicy> {
    Ok(match (disposal, archive_dir) {
        (Disposal::Delete, _) => SourcePolicy::Delete,
        (Disposal::Keep, _) => SourcePolicy::Keep,
        (Disposal::Archive, Some(dir)) => SourcePolicy::Archive {
            root: root.to_path_buf(),
            dir: dir.to_path_buf(),
        },
        (Disposal::Archive, None) => bail!("--source-policy archive needs --archive-dir."),
    })
}

impl Args {
    /// Use command line arguments to construct the ffmpeg wrapper.
    pub fn to_ffmpeg(&self) -> Ffmpeg {
        Ffmpeg::new(
            self.ffmpeg.clone(),
            self.ffprobe.clone(),
            Duration::from_secs(self.timeout_secs),
        )
    }

    /// Logging settings, defaulting the file to `<task>.log`.
    pub fn to_log_config(&self) -> LogConfig {
        LogConfig {
            file: Some(
                self.log_file
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(format!("{}.log", self.task.name()))),
            ),
            level: self.log_level.into(),
        }
    }

    /// Worker thread count, `None` for one per CPU.
    pub fn jobs(&self) -> Option<usize> {
        self.jobs.map(usize::from)
    }
}
