// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Extraction of still frames from recordings.
//!
//! Two strategies:
//! - per frame: one ffmpeg invocation per frame index. Slow, but every
//!   frame is resumable on its own and a failing frame ends only its video.
//! - sequential: one ffmpeg decoding the whole stream into raw RGB which is
//!   rotated and encoded here. Fast, restarts decode from frame zero.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use image::{RgbImage, imageops};
use log::{debug, info, warn};

use crate::{
    constants::{CLAIM_STALE_SECS, PROGRESS_LOG_INTERVAL},
    converter::Converter,
    ffmpeg::{Ffmpeg, FrameOutcome},
    filesys::{self, Claim, find_files},
    paths::{FrameImage, SourceVideo, StillFormat, find_source_for_frame},
    pool::{BatchSummary, CancelToken, Unit, WorkerPool},
};

/// Extensions of recordings picked up below a source root.
pub const VIDEO_EXTENSIONS: [&str; 2] = ["mov", "mp4"];

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "lower")]
/// Extraction strategy.
pub enum ExtractMode {
    #[value(name = "per-frame")]
    /// One ffmpeg call per frame index, stopping at end of stream.
    PerFrame,
    #[value(name = "sequential")]
    /// One ffmpeg call streaming every frame.
    Sequential,
}

impl ExtractMode {
    /// If frames are rotated when no explicit choice was made.
    pub fn rotates_by_default(self) -> bool {
        matches!(self, ExtractMode::Sequential)
    }
}

#[derive(Debug, Clone)]
/// Settings of an extraction run.
pub struct ExtractConfig {
    /// Extraction strategy.
    pub mode: ExtractMode,
    /// Format frames are stored in.
    pub format: StillFormat,
    /// Rotate frames 90° clockwise.
    pub rotate: bool,
    /// Colorspace frames are normalized to. `None` keeps the source's.
    pub colorspace: Option<String>,
    /// Highest frame index tried in per frame mode.
    pub max_frames: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// What happened to the frames of one video.
pub struct ExtractReport {
    /// Frames written by this run.
    pub written: u64,
    /// Frames left alone because their output already existed or was claimed.
    pub skipped: u64,
}

impl ExtractReport {
    /// Pool bookkeeping for this report.
    fn unit(self) -> Unit {
        if self.written > 0 { Unit::Done } else { Unit::Skipped }
    }
}

#[derive(Debug, Clone)]
/// Writes the frames of recordings into the frames tree.
pub struct Extractor {
    /// External decoder.
    ffmpeg: Ffmpeg,
    /// Encodes frames that are not written by ffmpeg directly.
    converter: Converter,
    /// Run settings.
    config: ExtractConfig,
    /// Stops extraction between frames when raised.
    cancel: CancelToken,
}

impl Extractor {
    /// New extractor.
    pub fn new(ffmpeg: Ffmpeg, converter: Converter, config: ExtractConfig, cancel: CancelToken) -> Self {
        Self {
            ffmpeg,
            converter,
            config,
            cancel,
        }
    }

    /// Longest a claim may be held before another worker takes it over.
    fn stale_after() -> Duration {
        Duration::from_secs(CLAIM_STALE_SECS)
    }

    /// Write frame `index` of `video` to `output` with a single ffmpeg call.
    /// ffmpeg writes a PNG which is converted when `output` is AVIF.
    ///
    /// # Errors
    /// Fails if ffmpeg can not be started or writing the output fails.
    /// Decoder failures and end of stream are reported through [`FrameOutcome`].
    pub fn extract_one(&self, video: &Path, index: u64, output: &Path) -> Result<FrameOutcome> {
        filesys::ensure_parent(output)?;
        let partial = filesys::partial_path(&output.with_extension(StillFormat::Png.extension()));
        let outcome = self.ffmpeg.extract_frame(
            video,
            index,
            self.config.colorspace.as_deref(),
            self.config.rotate,
            &partial,
            &self.cancel,
        )?;
        if outcome != FrameOutcome::Extracted {
            let _ = fs::remove_file(&partial);
            return Ok(outcome);
        }
        match StillFormat::of_path(output) {
            Some(StillFormat::Avif) => {
                let converted = self.converter.transcode(&partial, StillFormat::Avif, output);
                let _ = fs::remove_file(&partial);
                converted?;
            }
            _ => filesys::commit(&partial, output)?,
        }
        Ok(FrameOutcome::Extracted)
    }

    /// Extract every frame of `video` below `frames_root` using the configured mode.
    ///
    /// # Errors
    /// Fails on decoder errors, cancellation or file system errors.
    pub fn extract_video(&self, video: &SourceVideo, frames_root: &Path) -> Result<ExtractReport> {
        info!(
            "Extracting frames from {} to {}",
            video.path.display(),
            video.frame_dir(frames_root).display()
        );
        fs::create_dir_all(video.frame_dir(frames_root)).with_context(|| {
            format!(
                "Unable to create directory {}",
                video.frame_dir(frames_root).display()
            )
        })?;
        let report = match self.config.mode {
            ExtractMode::PerFrame => self.per_frame(video, frames_root)?,
            ExtractMode::Sequential => self.sequential(video, frames_root)?,
        };
        info!(
            "Wrote {} frames ({} skipped) from {} {} {} take {}",
            report.written, report.skipped, video.model, video.pose, video.camera, video.suffix
        );
        Ok(report)
    }

    /// Per frame strategy. Stops at the first end of stream.
    fn per_frame(&self, video: &SourceVideo, frames_root: &Path) -> Result<ExtractReport> {
        let mut report = ExtractReport::default();
        for index in 0..self.config.max_frames {
            if self.cancel.is_cancelled() {
                bail!("Extraction of {} cancelled at frame {index}.", video.path.display());
            }
            let output = video.frame_path(frames_root, index, self.config.format);
            if output.exists() {
                report.skipped += 1;
                continue;
            }
            let Some(_claim) = Claim::acquire(&output, Self::stale_after())? else {
                debug!("{} is claimed by another worker.", output.display());
                report.skipped += 1;
                continue;
            };
            if output.exists() {
                report.skipped += 1;
                continue;
            }
            match self.extract_one(&video.path, index, &output)? {
                FrameOutcome::Extracted => {
                    report.written += 1;
                    debug!("Extracted {}", output.display());
                    if index % PROGRESS_LOG_INTERVAL == 0 {
                        info!("{}: frame {index}", video.path.display());
                    }
                }
                FrameOutcome::EndOfStream => {
                    debug!("End of stream at frame {index} of {}", video.path.display());
                    return Ok(report);
                }
                FrameOutcome::DecoderError(diagnostics) => bail!(
                    "Decoder error at frame {index} of {}: {diagnostics}",
                    video.path.display()
                ),
                FrameOutcome::Cancelled => {
                    bail!("Extraction of {} cancelled at frame {index}.", video.path.display())
                }
            }
        }
        warn!(
            "Stopped {} at the frame limit of {} before the end of stream.",
            video.path.display(),
            self.config.max_frames
        );
        Ok(report)
    }

    /// Sequential strategy. Every frame is decoded, existing outputs are skipped.
    /// A stream without a single frame is an error.
    fn sequential(&self, video: &SourceVideo, frames_root: &Path) -> Result<ExtractReport> {
        let (width, height) = self.ffmpeg.probe_dimensions(&video.path, &self.cancel)?;
        // Returning early drops `frames`, which stops the decoder.
        let mut frames = self.ffmpeg.raw_frames(
            &video.path,
            width,
            height,
            self.config.colorspace.as_deref(),
            &self.cancel,
        )?;
        let mut report = ExtractReport::default();
        let mut index: u64 = 0;
        while let Some(raw) = frames
            .next_frame()
            .with_context(|| format!("Reading frame {index} of {}", video.path.display()))?
        {
            if self.cancel.is_cancelled() {
                bail!("Extraction of {} cancelled at frame {index}.", video.path.display());
            }
            let output = video.frame_path(frames_root, index, self.config.format);
            self.write_raw_frame(raw, width, height, &output, &mut report)?;
            if index % PROGRESS_LOG_INTERVAL == 0 {
                info!("{}: frame {index}", video.path.display());
            }
            index += 1;
        }
        frames
            .finish()
            .with_context(|| format!("Decoding {} after {index} frames", video.path.display()))?;
        if index == 0 {
            bail!("ffmpeg decoded no frames from {}", video.path.display());
        }
        Ok(report)
    }

    /// Rotate and store one decoded frame unless its output exists.
    fn write_raw_frame(
        &self,
        raw: Vec<u8>,
        width: u32,
        height: u32,
        output: &Path,
        report: &mut ExtractReport,
    ) -> Result<()> {
        if output.exists() {
            report.skipped += 1;
            return Ok(());
        }
        let Some(_claim) = Claim::acquire(output, Self::stale_after())? else {
            report.skipped += 1;
            return Ok(());
        };
        let frame = RgbImage::from_raw(width, height, raw)
            .context("Decoded frame does not match the probed dimensions.")?;
        let frame = if self.config.rotate {
            imageops::rotate90(&frame)
        } else {
            frame
        };
        self.converter.write_still(&frame, self.config.format, output)?;
        report.written += 1;
        debug!("Wrote {}", output.display());
        Ok(())
    }

    /// Extract every recording below `source_root` into `frames_root` on the worker pool.
    pub fn extract_tree(&self, source_root: &Path, frames_root: &Path, pool: &WorkerPool) -> BatchSummary {
        let videos = find_files(source_root, &VIDEO_EXTENSIONS);
        info!("Found {} videos in {}", videos.len(), source_root.display());
        if videos.is_empty() {
            warn!("No videos found in {}", source_root.display());
        }
        pool.run(&videos, |path| {
            let video = SourceVideo::parse(source_root, path)?;
            Ok(self.extract_video(&video, frames_root)?.unit())
        })
    }

    /// Extract one frame of `video` to `output`.
    ///
    /// # Errors
    /// Fails unless the frame was written.
    pub fn extract_single(&self, video: &Path, index: u64, output: &Path) -> Result<()> {
        match self.extract_one(video, index, output)? {
            FrameOutcome::Extracted => {
                info!("Wrote frame {index} of {} to {}", video.display(), output.display());
                Ok(())
            }
            FrameOutcome::EndOfStream => bail!("{} has no frame {index}.", video.display()),
            FrameOutcome::DecoderError(diagnostics) => {
                bail!("Failed to retrieve frame {index} of {}: {diagnostics}", video.display())
            }
            FrameOutcome::Cancelled => bail!("Cancelled."),
        }
    }

    /// Re-extract the frame behind one leftover PNG and replace it with a fresh output.
    fn refill_one(&self, png: &Path, frames_root: &Path, source_root: &Path) -> Result<Unit> {
        let frame = FrameImage::parse(png)?;
        let video = find_source_for_frame(&frame.path, frames_root, source_root)?
            .with_context(|| format!("No source video found for {}", png.display()))?;
        info!(
            "Refilling frame {} of {} {} from {}",
            frame.index,
            frame.camera_dir,
            frame.pose,
            video.display()
        );
        let output = frame.path.with_extension(self.config.format.extension());
        let Some(_claim) = Claim::acquire(&output, Self::stale_after())? else {
            return Ok(Unit::Skipped);
        };
        self.extract_single(&video, frame.index, &output)?;
        if self.config.format != frame.format {
            fs::remove_file(&frame.path)
                .with_context(|| format!("Unable to remove {}", png.display()))?;
        }
        Ok(Unit::Done)
    }

    /// Every PNG left in the frames tree is a frame whose conversion never
    /// finished. Re-extract each from its recording and replace it.
    pub fn refill_stragglers(
        &self,
        frames_root: &Path,
        source_root: &Path,
        pool: &WorkerPool,
    ) -> BatchSummary {
        let stragglers: Vec<PathBuf> = find_files(frames_root, &[StillFormat::Png.extension()]);
        info!("Found {} PNG files in {}", stragglers.len(), frames_root.display());
        pool.run(&stragglers, |png| self.refill_one(png, frames_root, source_root))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use image::Rgb;

    use super::*;
    use crate::{converter::SourcePolicy, ffmpeg::fake};

    fn extractor_with(ffmpeg: Ffmpeg, mode: ExtractMode, format: StillFormat) -> Extractor {
        let cancel = CancelToken::new();
        let converter = Converter::new(ffmpeg.clone(), SourcePolicy::Delete, true, cancel.clone())
            .with_avif_settings(80, 10)
            .unwrap();
        Extractor::new(
            ffmpeg,
            converter,
            ExtractConfig {
                mode,
                format,
                rotate: mode.rotates_by_default(),
                colorspace: None,
                max_frames: 10,
            },
            cancel,
        )
    }

    fn extractor(mode: ExtractMode, format: StillFormat) -> Extractor {
        let ffmpeg = Ffmpeg::new("ffmpeg".into(), "ffprobe".into(), Duration::from_secs(60));
        extractor_with(ffmpeg, mode, format)
    }

    /// ffmpeg stand-in copying `fixture` to its output for frame
    /// indices below `frames` and reporting an empty output otherwise.
    fn frame_copying_ffmpeg(dir: &Path, fixture: &Path, frames: u64) -> Ffmpeg {
        let script = format!(
            r#"for arg; do
  out="$arg"
  case "$arg" in *"eq(n,"*) index=${{arg#*eq\(n,}}; index=${{index%%\)*}} ;; esac
done
if [ "$index" -lt {frames} ]; then
  cp '{}' "$out"
else
  echo "Output file is empty, nothing was encoded" >&2
fi"#,
            fixture.display()
        );
        fake::ffmpeg(dir, &script, "echo 2x1", Duration::from_secs(30))
    }

    /// Source tree with one recording and the video parsed from it.
    fn source_video(root: &Path) -> SourceVideo {
        let path = root.join("M/EXP_a/camera_01-take.mp4");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        SourceVideo::parse(root, &path).unwrap()
    }

    fn fixture(dir: &Path) -> PathBuf {
        let path = dir.join("fixture.png");
        RgbImage::from_pixel(4, 4, Rgb([9, 8, 7])).save(&path).unwrap();
        path
    }

    #[test]
    fn sequential_rotates_by_default() {
        assert!(ExtractMode::Sequential.rotates_by_default());
        assert!(!ExtractMode::PerFrame.rotates_by_default());
    }

    #[test]
    fn raw_frame_is_rotated_clockwise() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("cam/P-00000.png");
        // 2x1 frame: red, then blue.
        let raw = vec![255, 0, 0, 0, 0, 255];
        let mut report = ExtractReport::default();
        extractor(ExtractMode::Sequential, StillFormat::Png)
            .write_raw_frame(raw, 2, 1, &output, &mut report)
            .unwrap();
        assert_eq!(report, ExtractReport { written: 1, skipped: 0 });
        let written = image::open(&output).unwrap().to_rgb8();
        assert_eq!(written.dimensions(), (1, 2));
        assert_eq!(written.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(written.get_pixel(0, 1).0, [0, 0, 255]);
    }

    #[test]
    fn existing_raw_frame_output_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("P-00000.png");
        fs::write(&output, b"kept").unwrap();
        let mut report = ExtractReport::default();
        extractor(ExtractMode::Sequential, StillFormat::Png)
            .write_raw_frame(vec![0; 3], 1, 1, &output, &mut report)
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(fs::read(&output).unwrap(), b"kept");
    }

    #[test]
    fn mismatched_raw_frame_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = ExtractReport::default();
        assert!(
            extractor(ExtractMode::Sequential, StillFormat::Png)
                .write_raw_frame(vec![0; 5], 2, 1, &dir.path().join("x.png"), &mut report)
                .is_err()
        );
    }

    #[test]
    fn report_without_writes_is_skipped() {
        assert_eq!(ExtractReport::default().unit(), Unit::Skipped);
        assert_eq!(ExtractReport { written: 1, skipped: 4 }.unit(), Unit::Done);
    }

    #[test]
    fn per_frame_stops_at_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = frame_copying_ffmpeg(dir.path(), &fixture(dir.path()), 3);
        let video = source_video(&dir.path().join("sources"));
        let frames_root = dir.path().join("frames");
        let extractor = extractor_with(ffmpeg, ExtractMode::PerFrame, StillFormat::Png);

        let report = extractor.extract_video(&video, &frames_root).unwrap();
        assert_eq!(report, ExtractReport { written: 3, skipped: 0 });
        let cam = frames_root.join("M/EXP_a/camera_01");
        assert!(cam.join("EXP_a-00002.png").exists());
        assert!(!cam.join("EXP_a-00003.png").exists());
        assert!(!cam.join("EXP_a-00000.png.lock").exists());

        let report = extractor.extract_video(&video, &frames_root).unwrap();
        assert_eq!(report, ExtractReport { written: 0, skipped: 3 });
    }

    #[test]
    fn sequential_writes_every_decoded_frame() {
        let dir = tempfile::tempdir().unwrap();
        // Two 2x1 frames: red and blue, then green and black.
        let ffmpeg = fake::ffmpeg(
            dir.path(),
            r"printf '\377\000\000\000\000\377\000\377\000\000\000\000'",
            "echo 2x1",
            Duration::from_secs(30),
        );
        let video = source_video(&dir.path().join("sources"));
        let frames_root = dir.path().join("frames");
        let extractor = extractor_with(ffmpeg, ExtractMode::Sequential, StillFormat::Png);

        let report = extractor.extract_video(&video, &frames_root).unwrap();
        assert_eq!(report, ExtractReport { written: 2, skipped: 0 });
        let cam = frames_root.join("M/EXP_a/camera_01");
        let first = image::open(cam.join("EXP_a-00000.png")).unwrap().to_rgb8();
        assert_eq!(first.dimensions(), (1, 2));
        assert_eq!(first.get_pixel(0, 1).0, [0, 0, 255]);
        let second = image::open(cam.join("EXP_a-00001.png")).unwrap().to_rgb8();
        assert_eq!(second.get_pixel(0, 0).0, [0, 255, 0]);

        let report = extractor.extract_video(&video, &frames_root).unwrap();
        assert_eq!(report, ExtractReport { written: 0, skipped: 2 });
    }

    #[test]
    fn sequential_without_frames_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake::ffmpeg(dir.path(), "exit 0", "echo 2x1", Duration::from_secs(30));
        let video = source_video(&dir.path().join("sources"));
        let err = extractor_with(ffmpeg, ExtractMode::Sequential, StillFormat::Png)
            .extract_video(&video, &dir.path().join("frames"))
            .unwrap_err();
        assert!(err.to_string().contains("no frames"), "{err}");
    }

    #[test]
    fn stalled_sequential_decoder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake::ffmpeg(dir.path(), "exec sleep 30", "echo 2x1", Duration::from_secs(1));
        let video = source_video(&dir.path().join("sources"));
        let start = Instant::now();
        let result = extractor_with(ffmpeg, ExtractMode::Sequential, StillFormat::Png)
            .extract_video(&video, &dir.path().join("frames"));
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn refill_replaces_leftover_png() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = frame_copying_ffmpeg(dir.path(), &fixture(dir.path()), 10);
        let source_root = dir.path().join("sources");
        source_video(&source_root);
        let frames_root = dir.path().join("frames");
        let cam = frames_root.join("M/EXP_a/camera_01");
        fs::create_dir_all(&cam).unwrap();
        fs::write(cam.join("EXP_a-00004.png"), b"half written").unwrap();
        fs::write(cam.join("EXP_a-00003.avif"), b"kept").unwrap();

        let pool = WorkerPool::new(Some(1), CancelToken::new()).unwrap();
        let summary = extractor_with(ffmpeg, ExtractMode::PerFrame, StillFormat::Avif)
            .refill_stragglers(&frames_root, &source_root, &pool);
        assert_eq!((summary.succeeded, summary.failed), (1, 0));
        assert!(!cam.join("EXP_a-00004.png").exists());
        assert!(fs::metadata(cam.join("EXP_a-00004.avif")).unwrap().len() > 0);
        assert_eq!(fs::read(cam.join("EXP_a-00003.avif")).unwrap(), b"kept");
    }

    #[test]
    fn refill_without_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = frame_copying_ffmpeg(dir.path(), &fixture(dir.path()), 10);
        let cam = dir.path().join("frames/M/EXP_a/camera_01");
        fs::create_dir_all(&cam).unwrap();
        fs::write(cam.join("EXP_a-00004.png"), b"half written").unwrap();
        fs::create_dir_all(dir.path().join("sources")).unwrap();

        let pool = WorkerPool::new(Some(1), CancelToken::new()).unwrap();
        let summary = extractor_with(ffmpeg, ExtractMode::PerFrame, StillFormat::Avif)
            .refill_stragglers(&dir.path().join("frames"), &dir.path().join("sources"), &pool);
        assert_eq!(summary.failed, 1);
        assert!(cam.join("EXP_a-00004.png").exists());
    }
}
