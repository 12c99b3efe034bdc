// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Rough matching of two sets of stills by keypoint descriptors.
//!
//! Every still of the first set is compared with every still of the second
//! set rotated 90° clockwise. No indexing and no early exit, so only fit
//! for small manual curation runs.

use std::{
    fs,
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};
use image::{GrayImage, imageops};
use imageproc::{corners::corners_fast9, filter::gaussian_blur_f32};
use log::{debug, info};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;

use crate::{
    constants::features::{
        DESCRIPTOR_BITS, FAST_THRESHOLD, MAX_FEATURES, PATCH_RADIUS, PATTERN_SEED,
        SMOOTHING_SIGMA,
    },
    pool::WorkerPool,
};

/// Number of `u64` words holding one descriptor.
const DESCRIPTOR_WORDS: usize = DESCRIPTOR_BITS / 64;

/// Binary descriptor of one keypoint.
pub type Descriptor = [u64; DESCRIPTOR_WORDS];

/// Number of differing bits between two descriptors.
fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Index of the descriptor in `candidates` closest to `query`.
/// The first of several equally close candidates wins.
fn nearest(query: &Descriptor, candidates: &[Descriptor]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| hamming(query, c))
        .map(|(i, _)| i)
}

/// Number of cross checked matches: pairs that are each other's nearest neighbour.
pub fn count_matches(first: &[Descriptor], second: &[Descriptor]) -> usize {
    first
        .iter()
        .enumerate()
        .filter(|(i, a)| {
            nearest(a, second)
                .and_then(|j| nearest(&second[j], first))
                .is_some_and(|back| back == *i)
        })
        .count()
}

#[derive(Debug, Clone, Copy)]
/// Offsets of the two pixels compared for one descriptor bit.
struct IntensityTest {
    /// First pixel, relative to the keypoint.
    a: (i32, i32),
    /// Second pixel, relative to the keypoint.
    b: (i32, i32),
}

#[derive(Debug, Clone)]
/// FAST keypoints described by BRIEF style intensity tests.
pub struct FeatureMatcher {
    /// Tests producing the descriptor bits, in bit order.
    pattern: Vec<IntensityTest>,
    /// Most keypoints kept per image.
    max_features: usize,
    /// FAST-9 threshold.
    fast_threshold: u8,
    /// Keypoints closer than this to the border are dropped.
    patch_radius: u32,
}

impl Default for FeatureMatcher {
    fn default() -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        #[allow(clippy::cast_possible_wrap)]
        let r = PATCH_RADIUS as i32;
        let mut offset = || (rng.gen_range(-r..=r), rng.gen_range(-r..=r));
        let pattern = (0..DESCRIPTOR_BITS)
            .map(|_| IntensityTest {
                a: offset(),
                b: offset(),
            })
            .collect();
        Self {
            pattern,
            max_features: MAX_FEATURES,
            fast_threshold: FAST_THRESHOLD,
            patch_radius: PATCH_RADIUS,
        }
    }
}

impl FeatureMatcher {
    /// Descriptors of the strongest keypoints of `image`.
    pub fn describe(&self, image: &GrayImage) -> Vec<Descriptor> {
        let (width, height) = image.dimensions();
        let r = self.patch_radius;
        if width <= 2 * r || height <= 2 * r {
            return Vec::new();
        }
        let mut corners: Vec<_> = corners_fast9(image, self.fast_threshold)
            .into_iter()
            .filter(|c| c.x >= r && c.y >= r && c.x < width - r && c.y < height - r)
            .collect();
        corners.sort_by(|a, b| b.score.total_cmp(&a.score));
        corners.truncate(self.max_features);

        let smooth = gaussian_blur_f32(image, SMOOTHING_SIGMA);
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        let sample = |x: u32, y: u32, (dx, dy): (i32, i32)| {
            smooth.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32).0[0]
        };
        corners
            .iter()
            .map(|c| {
                let mut descriptor = [0u64; DESCRIPTOR_WORDS];
                for (bit, test) in self.pattern.iter().enumerate() {
                    if sample(c.x, c.y, test.a) < sample(c.x, c.y, test.b) {
                        descriptor[bit / 64] |= 1 << (bit % 64);
                    }
                }
                descriptor
            })
            .collect()
    }
}

/// Decode every image directly inside `folder` as grayscale, sorted by name.
/// Files that are not decodable images are skipped.
///
/// # Errors
/// Fails if the folder can not be read.
pub fn load_folder(folder: &Path) -> Result<Vec<(String, GrayImage)>> {
    let mut names: Vec<String> = fs::read_dir(folder)
        .with_context(|| format!("Unable to read {}", folder.display()))?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    Ok(names
        .into_iter()
        .filter_map(|name| match image::open(folder.join(&name)) {
            Ok(img) => Some((name, img.to_luma8())),
            Err(e) => {
                debug!("Skipping {name}: {e}");
                None
            }
        })
        .collect())
}

/// For every still in `first` the best matching still in `second` with
/// strictly more than `threshold` matches. Stills without one are left out.
pub fn best_matches(
    matcher: &FeatureMatcher,
    first: &[(String, GrayImage)],
    second: &[(String, GrayImage)],
    threshold: usize,
    pool: &WorkerPool,
) -> Vec<(String, String)> {
    pool.install(|| {
        let first: Vec<(&String, Vec<Descriptor>)> = first
            .par_iter()
            .map(|(name, img)| (name, matcher.describe(img)))
            .collect();
        let second: Vec<(&String, Vec<Descriptor>)> = second
            .par_iter()
            .map(|(name, img)| (name, matcher.describe(&imageops::rotate90(img))))
            .collect();
        first
            .par_iter()
            .filter_map(|(name, descriptors)| {
                let mut best: Option<(&String, usize)> = None;
                for (candidate, other) in &second {
                    let count = count_matches(descriptors, other);
                    debug!("{name} ~ {candidate}: {count} matches");
                    if count > threshold && best.is_none_or(|(_, b)| count > b) {
                        best = Some((*candidate, count));
                    }
                }
                best.map(|(candidate, _)| ((*name).clone(), candidate.clone()))
            })
            .collect()
    })
}

/// Quote a CSV field if needed.
fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Write the two column mapping table.
///
/// # Errors
/// Fails if the file can not be written.
pub fn write_matches_csv(path: &Path, matches: &[(String, String)]) -> Result<()> {
    let file =
        fs::File::create(path).with_context(|| format!("Unable to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "Folder1 Image,Matching Folder2 Image")?;
    for (first, second) in matches {
        writeln!(out, "{},{}", csv_field(first), csv_field(second))?;
    }
    out.flush()?;
    info!("Matches saved to {}", path.display());
    Ok(())
}

/// Match the stills of `folder1` against those of `folder2` and write the
/// mapping to `output`.
///
/// # Errors
/// Fails if a folder can not be read or the table can not be written.
pub fn match_folders(
    folder1: &Path,
    folder2: &Path,
    output: &Path,
    threshold: usize,
    pool: &WorkerPool,
) -> Result<Vec<(String, String)>> {
    let first = load_folder(folder1)?;
    let second = load_folder(folder2)?;
    info!(
        "Comparing {} stills against {} stills.",
        first.len(),
        second.len()
    );
    let matches = best_matches(&FeatureMatcher::default(), &first, &second, threshold, pool);
    write_matches_csv(output, &matches)?;
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::pool::CancelToken;

    /// Random 8x8 pixel blocks of dark and light, rich in corners.
    fn blocks(seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let cells: Vec<u8> = (0..20 * 20)
            .map(|_| if rng.gen_bool(0.5) { 230 } else { 20 })
            .collect();
        GrayImage::from_fn(160, 160, |x, y| Luma([cells[(y / 8 * 20 + x / 8) as usize]]))
    }

    #[test]
    fn pattern_is_deterministic() {
        let a = FeatureMatcher::default();
        let b = FeatureMatcher::default();
        let img = blocks(1);
        assert_eq!(a.describe(&img), b.describe(&img));
    }

    #[test]
    fn flat_image_has_no_features() {
        let flat = GrayImage::from_pixel(160, 160, Luma([128]));
        assert!(FeatureMatcher::default().describe(&flat).is_empty());
        assert!(FeatureMatcher::default().describe(&GrayImage::new(8, 8)).is_empty());
    }

    #[test]
    fn image_matches_itself() {
        let matcher = FeatureMatcher::default();
        let descriptors = matcher.describe(&blocks(7));
        assert!(descriptors.len() > 50);
        assert!(count_matches(&descriptors, &descriptors) > 50);
        assert_eq!(count_matches(&descriptors, &[]), 0);
    }

    #[test]
    fn second_set_is_compared_rotated() {
        let pool = WorkerPool::new(Some(2), CancelToken::new()).unwrap();
        let original = blocks(3);
        let first = vec![
            ("a.png".to_string(), original.clone()),
            ("flat.png".to_string(), GrayImage::from_pixel(160, 160, Luma([10]))),
        ];
        let second = vec![
            ("a_ccw.png".to_string(), imageops::rotate270(&original)),
            ("flat.png".to_string(), GrayImage::from_pixel(160, 160, Luma([10]))),
        ];
        let matches = best_matches(&FeatureMatcher::default(), &first, &second, 50, &pool);
        assert_eq!(matches, vec![("a.png".to_string(), "a_ccw.png".to_string())]);
    }

    #[test]
    fn writes_csv_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matches.csv");
        write_matches_csv(&path, &[("a,1.png".to_string(), "b.png".to_string())]).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "Folder1 Image,Matching Folder2 Image\n\"a,1.png\",b.png\n"
        );
    }
}
