// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Conversion of extracted stills between PNG and AVIF.

use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use image::{
    DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat, Rgb, RgbImage,
    codecs::avif::AvifEncoder,
};
use log::{debug, error, info};

use crate::{
    constants::{AVIF_QUALITY, AVIF_SPEED, CLAIM_STALE_SECS},
    ffmpeg::Ffmpeg,
    filesys::{self, Claim, find_files},
    paths::StillFormat,
    pool::{BatchSummary, CancelToken, Unit, WorkerPool},
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// What happens to a source image once its conversion is in place.
pub enum SourcePolicy {
    /// Remove the source.
    Delete,
    /// Move the source into `dir`, mirroring its position below `root`.
    Archive {
        /// Tree the sources live in.
        root: PathBuf,
        /// Tree the sources are moved to.
        dir: PathBuf,
    },
    /// Leave the source where it is.
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of converting one image that did not fail.
pub enum ConvertOutcome {
    /// The converted image was written to the contained path.
    Converted(PathBuf),
    /// The target already existed and was left alone.
    AlreadyConverted(PathBuf),
    /// The source does not exist. Nothing was done.
    SourceMissing,
    /// Another worker holds the claim on the target.
    Busy,
}

impl ConvertOutcome {
    /// Pool bookkeeping for this outcome.
    pub fn unit(&self) -> Unit {
        match self {
            ConvertOutcome::Converted(_) => Unit::Done,
            _ => Unit::Skipped,
        }
    }
}

/// Composite an image carrying an alpha channel over opaque white.
/// Images without alpha are only converted to 8 bit RGB.
pub fn flatten_alpha(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = u32::from(a);
        let over_white = |c: u8| {
            let mixed = (u32::from(c) * alpha + 255 * (255 - alpha) + 127) / 255;
            #[allow(clippy::cast_possible_truncation)]
            let mixed = mixed as u8;
            mixed
        };
        Rgb([over_white(r), over_white(g), over_white(b)])
    })
}

#[derive(Debug, Clone)]
/// Decodes, flattens and re-encodes stills.
pub struct Converter {
    /// Used to decode formats the `image` crate can only encode.
    ffmpeg: Ffmpeg,
    /// AVIF encoder quality (1-100).
    quality: u8,
    /// AVIF encoder speed (1-10).
    speed: u8,
    /// Disposal of sources after a successful conversion.
    policy: SourcePolicy,
    /// Leave targets that already exist untouched.
    skip_existing: bool,
    /// Stops decoding when raised.
    cancel: CancelToken,
}

impl Converter {
    /// Converter using the default encoder settings.
    pub fn new(ffmpeg: Ffmpeg, policy: SourcePolicy, skip_existing: bool, cancel: CancelToken) -> Self {
        Self {
            ffmpeg,
            quality: AVIF_QUALITY,
            speed: AVIF_SPEED,
            policy,
            skip_existing,
            cancel,
        }
    }

    /// Override the AVIF encoder settings.
    ///
    /// # Errors
    /// Fails if `quality` is not in 1..=100 or `speed` not in 1..=10.
    pub fn with_avif_settings(mut self, quality: u8, speed: u8) -> Result<Self> {
        if !(1..=100).contains(&quality) {
            bail!("AVIF quality ({quality}) must be between 1 and 100.");
        }
        if !(1..=10).contains(&speed) {
            bail!("AVIF speed ({speed}) must be between 1 and 10.");
        }
        self.quality = quality;
        self.speed = speed;
        Ok(self)
    }

    /// How sources are disposed of.
    pub fn policy(&self) -> &SourcePolicy {
        &self.policy
    }

    /// Decode a still. AVIF is decoded through ffmpeg.
    ///
    /// # Errors
    /// Fails if the file can not be read or decoded.
    pub fn load(&self, path: &Path) -> Result<DynamicImage> {
        match StillFormat::of_path(path) {
            Some(StillFormat::Avif) => {
                let png = self.ffmpeg.decode_to_png(path, &self.cancel)?;
                image::load_from_memory_with_format(&png, ImageFormat::Png)
                    .with_context(|| format!("Unable to decode {}", path.display()))
            }
            _ => image::open(path).with_context(|| format!("Unable to decode {}", path.display())),
        }
    }

    /// Encode `image` in `format` at `output`.
    /// The image is written to a partial file first and moved into place.
    ///
    /// # Errors
    /// Fails if encoding or any file operation fails.
    pub fn write_still(&self, image: &RgbImage, format: StillFormat, output: &Path) -> Result<()> {
        filesys::ensure_parent(output)?;
        let partial = filesys::partial_path(output);
        let written = match format {
            StillFormat::Png => image
                .save_with_format(&partial, ImageFormat::Png)
                .context("Unable to encode PNG"),
            StillFormat::Avif => self.encode_avif(image, &partial),
        };
        if let Err(e) = written {
            let _ = fs::remove_file(&partial);
            return Err(e).with_context(|| format!("Unable to write {}", output.display()));
        }
        filesys::commit(&partial, output)
    }

    /// AVIF encode `image` into a new file at `path`.
    fn encode_avif(&self, image: &RgbImage, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Unable to create {}", path.display()))?;
        AvifEncoder::new_with_speed_quality(BufWriter::new(file), self.speed, self.quality)
            .write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                ExtendedColorType::Rgb8,
            )
            .context("Unable to encode AVIF")
    }

    /// Decode `source`, flatten transparency and write it as `format` at `output`.
    /// The source is not touched.
    ///
    /// # Errors
    /// Fails if decoding or encoding fails.
    pub fn transcode(&self, source: &Path, format: StillFormat, output: &Path) -> Result<()> {
        let image = self.load(source)?;
        self.write_still(&flatten_alpha(&image), format, output)
    }

    /// Apply the source policy to a converted source.
    ///
    /// # Errors
    /// Fails if the source can not be removed or moved.
    pub fn dispose(&self, source: &Path) -> Result<()> {
        match &self.policy {
            SourcePolicy::Delete => fs::remove_file(source)
                .with_context(|| format!("Unable to remove {}", source.display())),
            SourcePolicy::Archive { root, dir } => {
                let target = filesys::archive(source, root, dir)?;
                debug!("Archived {} to {}", source.display(), target.display());
                Ok(())
            }
            SourcePolicy::Keep => Ok(()),
        }
    }

    /// Convert `source` into a sibling with the extension of `target`,
    /// then dispose of the source according to the policy.
    ///
    /// A missing source is logged and reported as [`ConvertOutcome::SourceMissing`],
    /// so re-running a finished conversion is a no-op. A target that already
    /// exists may be a truncated leftover, so its source is never disposed of.
    ///
    /// # Errors
    /// Fails if decoding, encoding or disposing of the source fails.
    pub fn convert(&self, source: &Path, target: StillFormat) -> Result<ConvertOutcome> {
        if !source.is_file() {
            error!("Image not found: {}", source.display());
            return Ok(ConvertOutcome::SourceMissing);
        }
        let output = source.with_extension(target.extension());
        if output == source {
            bail!("{} is already {}", source.display(), target.extension());
        }
        if self.skip_existing && output.exists() {
            debug!("{} exists, keeping {}", output.display(), source.display());
            return Ok(ConvertOutcome::AlreadyConverted(output));
        }
        let Some(_claim) = Claim::acquire(&output, Duration::from_secs(CLAIM_STALE_SECS))? else {
            debug!("{} is claimed by another worker.", output.display());
            return Ok(ConvertOutcome::Busy);
        };
        // Another worker may have finished the conversion and released its
        // claim before this one was acquired.
        if !source.is_file() {
            return Ok(ConvertOutcome::SourceMissing);
        }
        debug!("Converting {} to {}", source.display(), target.extension());
        self.transcode(source, target, &output)?;
        self.dispose(source)?;
        Ok(ConvertOutcome::Converted(output))
    }

    /// Convert every `from` still below `root` to `to` on the worker pool.
    pub fn convert_tree(
        &self,
        root: &Path,
        from: StillFormat,
        to: StillFormat,
        pool: &WorkerPool,
    ) -> BatchSummary {
        let files = find_files(root, &[from.extension()]);
        info!(
            "Converting {} {} files to {} in {}",
            files.len(),
            from.extension(),
            to.extension(),
            root.display()
        );
        pool.run(&files, |file| {
            let outcome = self.convert(file, to)?;
            match &outcome {
                ConvertOutcome::Converted(output) => debug!("Wrote {}", output.display()),
                ConvertOutcome::AlreadyConverted(output) => {
                    debug!("{} already exists", output.display());
                }
                ConvertOutcome::SourceMissing | ConvertOutcome::Busy => {}
            }
            Ok(outcome.unit())
        })
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};

    use super::*;

    fn converter(policy: SourcePolicy) -> Converter {
        Converter::new(
            Ffmpeg::new("ffmpeg".into(), "ffprobe".into(), Duration::from_secs(60)),
            policy,
            true,
            CancelToken::new(),
        )
    }

    #[test]
    fn transparent_pixel_becomes_white() {
        let mut rgba = RgbaImage::from_pixel(2, 1, Rgba([10, 20, 30, 255]));
        rgba.put_pixel(1, 0, Rgba([0, 0, 0, 0]));
        let flat = flatten_alpha(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(flat.get_pixel(0, 0), &Rgb([10, 20, 30]));
        assert_eq!(flat.get_pixel(1, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn half_transparent_black_is_grey() {
        let rgba = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 128]));
        let flat = flatten_alpha(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(flat.get_pixel(0, 0), &Rgb([127, 127, 127]));
    }

    #[test]
    fn grey_alpha_is_flattened() {
        let la = image::GrayAlphaImage::from_pixel(1, 1, image::LumaA([0, 0]));
        let flat = flatten_alpha(&DynamicImage::ImageLumaA8(la));
        assert_eq!(flat.get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn missing_source_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = converter(SourcePolicy::Delete)
            .convert(&dir.path().join("gone.png"), StillFormat::Avif)
            .unwrap();
        assert_eq!(outcome, ConvertOutcome::SourceMissing);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn png_to_avif_deletes_source_and_reruns_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("P-00000.png");
        let mut rgba = RgbaImage::from_pixel(16, 16, Rgba([200, 10, 10, 255]));
        rgba.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        rgba.save(&source).unwrap();

        let conv = converter(SourcePolicy::Delete);
        let outcome = conv.convert(&source, StillFormat::Avif).unwrap();
        let target = dir.path().join("P-00000.avif");
        assert_eq!(outcome, ConvertOutcome::Converted(target.clone()));
        assert!(!source.exists());
        assert!(fs::metadata(&target).unwrap().len() > 0);
        assert!(!dir.path().join("P-00000.avif.lock").exists());

        assert_eq!(
            conv.convert(&source, StillFormat::Avif).unwrap(),
            ConvertOutcome::SourceMissing
        );
    }

    #[test]
    fn archive_policy_moves_source() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("frames");
        let trash = dir.path().join("trash");
        let source = root.join("M/P/camera_01/P-00003.png");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])).save(&source).unwrap();

        let conv = converter(SourcePolicy::Archive {
            root: root.clone(),
            dir: trash.clone(),
        })
        .with_avif_settings(80, 10)
        .unwrap();
        assert_eq!(
            conv.convert(&source, StillFormat::Avif).unwrap(),
            ConvertOutcome::Converted(root.join("M/P/camera_01/P-00003.avif"))
        );
        assert!(!source.exists());
        assert!(trash.join("M/P/camera_01/P-00003.png").exists());
    }

    #[test]
    fn existing_target_keeps_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("P-00000.png");
        RgbImage::from_pixel(16, 16, Rgb([200, 10, 10])).save(&source).unwrap();
        // Truncated leftover of an interrupted run.
        let target = dir.path().join("P-00000.avif");
        fs::write(&target, b"truncated").unwrap();

        assert_eq!(
            converter(SourcePolicy::Delete).convert(&source, StillFormat::Avif).unwrap(),
            ConvertOutcome::AlreadyConverted(target.clone())
        );
        assert!(source.exists());
        assert_eq!(fs::read(&target).unwrap(), b"truncated");
    }

    #[test]
    fn convert_tree_converts_every_png() {
        let dir = tempfile::tempdir().unwrap();
        let cam = dir.path().join("M/P/camera_01");
        fs::create_dir_all(&cam).unwrap();
        for i in 0..3 {
            RgbImage::from_pixel(4, 4, Rgb([i, 2, 3]))
                .save(cam.join(format!("P-0000{i}.png")))
                .unwrap();
        }
        fs::write(cam.join("P-00002.avif"), b"leftover").unwrap();

        let pool = WorkerPool::new(Some(2), CancelToken::new()).unwrap();
        let summary = converter(SourcePolicy::Delete)
            .with_avif_settings(80, 10)
            .unwrap()
            .convert_tree(dir.path(), StillFormat::Png, StillFormat::Avif, &pool);
        assert_eq!((summary.succeeded, summary.skipped, summary.failed), (2, 1, 0));
        assert!(!cam.join("P-00000.png").exists());
        assert!(!cam.join("P-00001.png").exists());
        assert!(cam.join("P-00002.png").exists());
        assert!(fs::metadata(cam.join("P-00001.avif")).unwrap().len() > 0);
    }

    #[test]
    fn same_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.png");
        RgbImage::new(1, 1).save(&source).unwrap();
        assert!(converter(SourcePolicy::Keep).convert(&source, StillFormat::Png).is_err());
    }

    #[test]
    fn avif_settings_are_validated() {
        assert!(converter(SourcePolicy::Keep).with_avif_settings(0, 6).is_err());
        assert!(converter(SourcePolicy::Keep).with_avif_settings(80, 11).is_err());
        assert!(converter(SourcePolicy::Keep).with_avif_settings(80, 4).is_ok());
    }
}
