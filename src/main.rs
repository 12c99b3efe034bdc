// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! framesmith - Video to still image dataset pipeline.
//! Extracts the frames of multi camera recordings, converts them between
//! PNG and AVIF and keeps the resulting frames tree tidy.
//! NOTE: No effort has been undertaken to make this work on Windows. Probably wont. 🤷

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::missing_docs_in_private_items,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::pedantic,
    clippy::redundant_clone,
    clippy::needless_pass_by_value
)]
#![allow(clippy::cast_lossless)]

use std::{
    fs,
    path::{Path, PathBuf},
    time,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, error, info, warn};

use cli::{Args, Task};
use utils::format_duration;

use crate::{
    cleanup::{CleanMode, Verification, clean_partials, tally, verify_source},
    cli::to_source_policy,
    collect::collect_frames,
    constants::{CAMERA_COUNT, CAMERA_UPDATE_TABLE},
    converter::{Converter, SourcePolicy},
    extractor::{ExtractConfig, Extractor, VIDEO_EXTENSIONS},
    ffmpeg::Ffmpeg,
    filesys::find_files,
    frame_list::{count_tree, write_frame_list},
    matcher::match_folders,
    offsets::CorrectionTable,
    paths::{SourceVideo, StillFormat, default_frames_root, pair_views_by_camera},
    pool::{CancelToken, WorkerPool},
};

mod cleanup;
mod cli;
mod collect;
mod constants;
mod converter;
mod extractor;
mod ffmpeg;
mod filesys;
mod frame_list;
mod logging;
mod matcher;
mod offsets;
mod paths;
mod pool;
mod utils;

/// Times the execution of `code` and
/// logs the measured time.
macro_rules! timed_block {
    ($name:expr, $code:block) => {
        info!("Starting {}", $name);
        let start = std::time::Instant::now();
        $code
        info!(
            "Finished {} after: {}",
            $name,
            format_duration(start.elapsed())
        );
    };
}

/// Fail unless `path` is an existing directory.
fn ensure_dir(path: &Path) -> Result<()> {
    if !path.is_dir() {
        bail!("Input folder {} does not exist.", path.display());
    }
    Ok(())
}

/// Names of the files directly inside `dir`, sorted.
fn file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .with_context(|| format!("Unable to read {}", dir.display()))?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    Ok(names)
}

/// Extractor writing frames with `config`. Stills it converts keep their source.
fn build_extractor(
    ffmpeg: &Ffmpeg,
    config: ExtractConfig,
    quality: u8,
    speed: u8,
    cancel: &CancelToken,
) -> Result<Extractor> {
    let converter = Converter::new(ffmpeg.clone(), SourcePolicy::Keep, true, cancel.clone())
        .with_avif_settings(quality, speed)?;
    Ok(Extractor::new(ffmpeg.clone(), converter, config, cancel.clone()))
}

/// Output of the `single` task: given explicitly or derived from the
/// recording's place below the source tree.
fn single_output(
    video: &Path,
    index: u64,
    output: Option<&Path>,
    source_root: Option<&Path>,
    frames_root: Option<&Path>,
    format: StillFormat,
) -> Result<PathBuf> {
    if let Some(output) = output {
        return Ok(output.to_path_buf());
    }
    let Some(source_root) = source_root else {
        bail!("Either --output or --source-root is required.");
    };
    let source = SourceVideo::parse(source_root, video)?;
    let frames_root = frames_root.map_or_else(|| default_frames_root(source_root), Path::to_path_buf);
    Ok(source.frame_path(&frames_root, index, format))
}

/// Read in command line args and execute program function as requested.
#[allow(clippy::too_many_lines)]
fn execute_args(args: &Args) -> Result<()> {
    let cancel = CancelToken::new();
    cancel.cancel_on_ctrlc()?;
    let pool = WorkerPool::new(args.jobs(), cancel.clone())?;
    let ffmpeg = args.to_ffmpeg();
    info!("Running {} on {} worker threads.", args.task.name(), pool.threads());
    let rotate_by_default = args.task.rotates_by_default();

    match &args.task {
        Task::Extract {
            source_root,
            frames_root,
            options,
        } => {
            ensure_dir(source_root)?;
            ffmpeg.ensure_available()?;
            let frames_root = frames_root.clone().unwrap_or_else(|| default_frames_root(source_root));
            let extractor = build_extractor(
                &ffmpeg,
                options.to_extract_config(rotate_by_default),
                options.encoder.quality,
                options.encoder.speed,
                &cancel,
            )?;
            timed_block!("frame extraction", {
                extractor
                    .extract_tree(source_root, &frames_root, &pool)
                    .log("Extraction");
            });
        }
        Task::Single {
            video,
            index,
            output,
            source_root,
            frames_root,
            options,
        } => {
            if !video.is_file() {
                bail!("Video {} does not exist.", video.display());
            }
            ffmpeg.ensure_available()?;
            let output = single_output(
                video,
                *index,
                output.as_deref(),
                source_root.as_deref(),
                frames_root.as_deref(),
                options.format,
            )?;
            let extractor = build_extractor(
                &ffmpeg,
                options.to_extract_config(rotate_by_default),
                options.encoder.quality,
                options.encoder.speed,
                &cancel,
            )?;
            extractor.extract_single(video, *index, &output)?;
        }
        Task::Refill {
            frames_root,
            source_root,
            options,
        } => {
            ensure_dir(frames_root)?;
            ensure_dir(source_root)?;
            ffmpeg.ensure_available()?;
            let extractor = build_extractor(
                &ffmpeg,
                options.to_extract_config(rotate_by_default),
                options.encoder.quality,
                options.encoder.speed,
                &cancel,
            )?;
            timed_block!("straggler refill", {
                extractor
                    .refill_stragglers(frames_root, source_root, &pool)
                    .log("Refill");
            });
        }
        Task::Convert {
            folder,
            from,
            to,
            overwrite,
            encoder,
            disposal,
        } => {
            ensure_dir(folder)?;
            if from == to {
                bail!("Nothing to do converting {} to itself.", from.extension());
            }
            let converter = Converter::new(
                ffmpeg,
                disposal.to_source_policy(folder)?,
                !overwrite,
                cancel.clone(),
            )
            .with_avif_settings(encoder.quality, encoder.speed)?;
            info!("Converted sources: {:?}", converter.policy());
            timed_block!("conversion", {
                converter.convert_tree(folder, *from, *to, &pool).log("Conversion");
            });
        }
        Task::Clean {
            folder,
            threshold,
            extension,
            preview,
        } => {
            ensure_dir(folder)?;
            let mode = if *preview { CleanMode::Preview } else { CleanMode::Delete };
            clean_partials(folder, extension, *threshold, mode)?;
        }
        Task::Verify {
            source_root,
            frames_root,
        } => {
            ensure_dir(source_root)?;
            let frames_root = frames_root.clone().unwrap_or_else(|| default_frames_root(source_root));
            let (mut complete, mut frames, mut missing, mut unconverted) = (0, 0, 0, 0);
            for path in find_files(source_root, &VIDEO_EXTENSIONS) {
                let video = match SourceVideo::parse(source_root, &path) {
                    Ok(video) => video,
                    Err(e) => {
                        warn!("Skipping {}: {e}", path.display());
                        continue;
                    }
                };
                match verify_source(&video, &frames_root) {
                    Verification::Complete { frames: count } => {
                        complete += 1;
                        frames += count;
                    }
                    Verification::MissingFrameDir(dir) | Verification::NoAvif(dir) => {
                        debug!("Nothing converted in {}", dir.display());
                        missing += 1;
                    }
                    Verification::Unconverted(pngs) => unconverted += pngs.len(),
                }
            }
            info!(
                "{complete} recordings complete with {frames} frames, {missing} without frames, {unconverted} frames unconverted."
            );
        }
        Task::Count { folder } => {
            ensure_dir(folder)?;
            let counts = tally(folder);
            info!("Total number of PNG files: {}", counts.png);
            info!("Total number of AVIF files: {}", counts.avif);
        }
        Task::FrameList {
            folder,
            output,
            skip,
        } => {
            ensure_dir(folder)?;
            ffmpeg.ensure_available()?;
            timed_block!("frame counting", {
                let (counts, summary) = count_tree(folder, &ffmpeg, &pool);
                summary.log("Frame count");
                write_frame_list(output, folder, &counts, *skip)?;
            });
        }
        Task::Offsets {
            folder,
            table,
            skip_invalid,
        } => {
            ensure_dir(folder)?;
            let text = match table {
                Some(path) => fs::read_to_string(path)
                    .with_context(|| format!("Unable to read table {}", path.display()))?,
                None => CAMERA_UPDATE_TABLE.to_string(),
            };
            let table = CorrectionTable::load(&text, *skip_invalid)?;
            info!("Correction table holds {} cameras.", table.cameras().count());
            let frames = find_files(
                folder,
                &[StillFormat::Avif.extension(), StillFormat::Png.extension()],
            );
            let affected = table.report(&frames);
            let total: usize = affected.values().map(Vec::len).sum();
            info!("{total} frames in {} cameras need renumbering.", affected.len());
        }
        Task::Match {
            folder1,
            folder2,
            output,
            threshold,
        } => {
            ensure_dir(folder1)?;
            ensure_dir(folder2)?;
            timed_block!("matching", {
                let matches = match_folders(folder1, folder2, output, *threshold, &pool)?;
                info!("{} stills matched.", matches.len());
            });
        }
        Task::Collect {
            pose_dir,
            frame,
            out_dir,
            cameras,
            source_policy,
            archive_dir,
        } => {
            ensure_dir(pose_dir)?;
            fs::create_dir_all(out_dir)
                .with_context(|| format!("Unable to create {}", out_dir.display()))?;
            let cameras: Vec<u32> = if cameras.is_empty() {
                (1..=CAMERA_COUNT).collect()
            } else {
                cameras.clone()
            };
            let policy = to_source_policy(*source_policy, archive_dir.as_deref(), pose_dir)?;
            let converter = Converter::new(ffmpeg, policy, true, cancel.clone());
            collect_frames(pose_dir, &cameras, *frame, out_dir, &converter, &pool)?.log("Collection");
        }
        Task::Pair {
            calibration_dir,
            capture_dir,
        } => {
            ensure_dir(calibration_dir)?;
            ensure_dir(capture_dir)?;
            let pairing = pair_views_by_camera(&file_names(calibration_dir)?, &file_names(capture_dir)?);
            for (calibration, capture) in &pairing.pairs {
                info!("{calibration} <-> {capture}");
            }
            for calibration in &pairing.unpaired {
                warn!("No capture for {calibration}");
            }
            info!(
                "{} pairs, {} calibration stills unpaired.",
                pairing.pairs.len(),
                pairing.unpaired.len()
            );
        }
    }
    if cancel.is_cancelled() {
        bail!("Interrupted.");
    }
    Ok(())
}

fn main() -> Result<()> {
    let main_start = time::Instant::now();
    let args = Args::parse();
    logging::init(&args.to_log_config())?;

    if let Err(e) = execute_args(&args) {
        error!("{e:#}");
        return Err(e);
    }

    info!(
        "Total execution time: {}",
        format_duration(main_start.elapsed())
    );
    Ok(())
}
