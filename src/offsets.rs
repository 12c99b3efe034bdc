// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Frame offset correction table.
//!
//! Some cameras were recorded with shifted frame numbering. For each such
//! camera the table lists pairs of inclusive frame ranges: the range as
//! numbered on disk and the range it should have been. Only detection of
//! affected frames is implemented. Renumbering needs confirmation of what a
//! "new range" means for entries whose old and new spans differ in length.
//!
//! Table text, one camera per line, `#` starts a comment:
//! ```text
//! 12: (91, 194), (92, 195)
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::{Result, bail};
use log::{debug, error, info, warn};
use regex::Regex;
use thiserror::Error;

use crate::paths::{FrameImage, camera_number};

/// `camera: rest`
static TABLE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<camera>\d+)\s*:\s*(?P<ranges>.*)$").expect("table line pattern is valid")
});

/// One parenthesised group.
static GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((?P<body>[^()]*)\)").expect("group pattern is valid"));

/// `lo, hi`
static PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<lo>\d+)\s*,\s*(?P<hi>\d+)\s*$").expect("pair pattern is valid")
});

/// `n`
static BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\s*$").expect("bare pattern is valid"));

/// `a-b`, `a+b`, ...
static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\d+\s*[-+*/]\s*\d+\s*$").expect("expression pattern is valid")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// A table entry that can not be used without a human correcting it.
pub enum TableError {
    #[error("line {line}: {text:?} is not `camera: (lo, hi), ...`")]
    /// The line is not a camera entry.
    Syntax {
        /// 1-based line number.
        line: usize,
        /// Offending text.
        text: String,
    },
    #[error("camera {camera}: ({text}) is a single frame, not a range")]
    /// A group holds one number instead of a pair.
    BareInteger {
        /// Camera of the entry.
        camera: u32,
        /// Group contents.
        text: String,
    },
    #[error("camera {camera}: ({text}) is an expression, not a range")]
    /// A group holds arithmetic instead of a pair.
    Expression {
        /// Camera of the entry.
        camera: u32,
        /// Group contents.
        text: String,
    },
    #[error("camera {camera}: ({text}) is not a range")]
    /// A group holds something else.
    Malformed {
        /// Camera of the entry.
        camera: u32,
        /// Group contents.
        text: String,
    },
    #[error("camera {camera}: range ({first}, {last}) ends before it starts")]
    /// Range bounds are reversed.
    Reversed {
        /// Camera of the entry.
        camera: u32,
        /// Lower bound as written.
        first: u64,
        /// Upper bound as written.
        last: u64,
    },
    #[error("camera {camera}: {count} ranges can not be paired into old and new")]
    /// Ranges must come in old/new pairs.
    Unpaired {
        /// Camera of the entry.
        camera: u32,
        /// Number of ranges found.
        count: usize,
    },
    #[error("camera {camera} is listed more than once")]
    /// Camera appears on two lines.
    Duplicate {
        /// Camera of the entry.
        camera: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Inclusive range of frame numbers.
pub struct FrameRange {
    /// First frame in the range.
    pub first: u64,
    /// Last frame in the range.
    pub last: u64,
}

impl FrameRange {
    /// If `frame` lies within the range, bounds included.
    pub fn contains(self, frame: u64) -> bool {
        (self.first..=self.last).contains(&frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Frames numbered `old` on disk that belong at `new`.
pub struct RangeMapping {
    /// Range as currently numbered.
    pub old: FrameRange,
    /// Range the frames should carry.
    pub new: FrameRange,
}

impl RangeMapping {
    /// If `frame` as numbered on disk is affected by this mapping.
    pub fn contains(&self, frame: u64) -> bool {
        self.old.contains(frame)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
/// Validated correction table.
pub struct CorrectionTable {
    /// Mappings per camera number.
    entries: BTreeMap<u32, Vec<RangeMapping>>,
}

/// Parse the groups of one entry into old/new mappings.
fn parse_entry(camera: u32, ranges: &str) -> Result<Vec<RangeMapping>, TableError> {
    let leftover = GROUP.replace_all(ranges, "");
    if leftover.chars().any(|c| !(c == ',' || c.is_whitespace())) {
        return Err(TableError::Malformed {
            camera,
            text: ranges.trim().to_string(),
        });
    }
    let mut parsed = Vec::new();
    for caps in GROUP.captures_iter(ranges) {
        let body = &caps["body"];
        let text = body.trim().to_string();
        let Some(pair) = PAIR.captures(body) else {
            return Err(if BARE.is_match(body) {
                TableError::BareInteger { camera, text }
            } else if EXPRESSION.is_match(body) {
                TableError::Expression { camera, text }
            } else {
                TableError::Malformed { camera, text }
            });
        };
        let bound = |name: &str| {
            pair[name].parse::<u64>().map_err(|_| TableError::Malformed {
                camera,
                text: text.clone(),
            })
        };
        let (first, last) = (bound("lo")?, bound("hi")?);
        if first > last {
            return Err(TableError::Reversed { camera, first, last });
        }
        parsed.push(FrameRange { first, last });
    }
    if parsed.is_empty() || parsed.len() % 2 != 0 {
        return Err(TableError::Unpaired {
            camera,
            count: parsed.len(),
        });
    }
    Ok(parsed
        .chunks_exact(2)
        .map(|pair| RangeMapping {
            old: pair[0],
            new: pair[1],
        })
        .collect())
}

impl CorrectionTable {
    /// Parse table text. Valid entries are returned in the table, every
    /// rejected entry as an error. Rejected entries are never guessed at.
    pub fn parse(text: &str) -> (Self, Vec<TableError>) {
        let mut table = Self::default();
        let mut errors = Vec::new();
        let mut seen = BTreeSet::new();
        for (number, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let Some(caps) = TABLE_LINE.captures(line) else {
                errors.push(TableError::Syntax {
                    line: number + 1,
                    text: line.to_string(),
                });
                continue;
            };
            let Ok(camera) = caps["camera"].parse::<u32>() else {
                errors.push(TableError::Syntax {
                    line: number + 1,
                    text: line.to_string(),
                });
                continue;
            };
            if !seen.insert(camera) {
                table.entries.remove(&camera);
                errors.push(TableError::Duplicate { camera });
                continue;
            }
            match parse_entry(camera, &caps["ranges"]) {
                Ok(mappings) => {
                    table.entries.insert(camera, mappings);
                }
                Err(e) => errors.push(e),
            }
        }
        (table, errors)
    }

    /// Parse table text and refuse to continue on any rejected entry unless
    /// `skip_invalid` is set, in which case rejected cameras are left out.
    ///
    /// # Errors
    /// Fails if any entry was rejected and `skip_invalid` is not set.
    pub fn load(text: &str, skip_invalid: bool) -> Result<Self> {
        let (table, errors) = Self::parse(text);
        for e in &errors {
            error!("Correction table: {e}");
        }
        if !errors.is_empty() {
            if !skip_invalid {
                bail!(
                    "{} correction table entries need a human confirmed correction.",
                    errors.len()
                );
            }
            warn!("Continuing without {} rejected entries.", errors.len());
        }
        for (camera, mappings) in &table.entries {
            for m in mappings {
                debug!(
                    "Camera {camera}: frames {}-{} belong at {}-{}",
                    m.old.first, m.old.last, m.new.first, m.new.last
                );
            }
        }
        Ok(table)
    }

    /// Cameras with a valid entry.
    pub fn cameras(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    /// Mappings of `camera`. Unknown cameras are logged and need no correction.
    pub fn lookup(&self, camera: u32) -> Option<&[RangeMapping]> {
        let entry = self.entries.get(&camera).map(Vec::as_slice);
        if entry.is_none() {
            warn!("Camera number {camera} not found in update table");
        }
        entry
    }

    /// If `frame` of `camera` lies in any old range of the camera's entry.
    pub fn is_affected(&self, camera: u32, frame: u64) -> bool {
        self.entries
            .get(&camera)
            .is_some_and(|mappings| mappings.iter().any(|m| m.contains(frame)))
    }

    /// Group the frames among `frames` that need renumbering by camera and
    /// log them. Frames of cameras without an entry are ignored, frames
    /// without a camera or frame number are logged and skipped.
    pub fn report(&self, frames: &[PathBuf]) -> BTreeMap<u32, Vec<String>> {
        let mut affected: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        let mut unknown = BTreeSet::new();
        for path in frames {
            let (camera, frame) = match frame_key(path) {
                Ok(key) => key,
                Err(e) => {
                    warn!("Skipping {}: {e}", path.display());
                    continue;
                }
            };
            if !self.entries.contains_key(&camera) {
                unknown.insert(camera);
                continue;
            }
            let names = affected.entry(camera).or_default();
            if self.is_affected(camera, frame) {
                names.push(
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                );
            }
        }
        for camera in unknown {
            // Logs the miss once per camera.
            let _ = self.lookup(camera);
        }
        for (camera, names) in &mut affected {
            names.sort();
            info!("Camera number: {camera}, {} frames affected", names.len());
            for name in names.iter() {
                info!("Frame: {name}");
            }
        }
        affected
    }
}

/// Camera and frame number of a frame path.
fn frame_key(path: &Path) -> Result<(u32, u64)> {
    let camera = camera_number(path)?;
    let frame = FrameImage::parse(path)?;
    Ok((camera, frame.index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CAMERA_UPDATE_TABLE;

    #[test]
    fn patterns_compile() {
        LazyLock::force(&TABLE_LINE);
        LazyLock::force(&GROUP);
        LazyLock::force(&PAIR);
        LazyLock::force(&BARE);
        LazyLock::force(&EXPRESSION);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let (table, errors) = CorrectionTable::parse("12: (91, 194), (92, 195)");
        assert!(errors.is_empty());
        assert!(table.is_affected(12, 100));
        assert!(table.is_affected(12, 91));
        assert!(table.is_affected(12, 194));
        assert!(!table.is_affected(12, 90));
        assert!(!table.is_affected(12, 195));
    }

    #[test]
    fn builtin_table_rejects_malformed_cameras() {
        let (table, errors) = CorrectionTable::parse(CAMERA_UPDATE_TABLE);
        assert_eq!(
            errors,
            vec![
                TableError::Expression {
                    camera: 45,
                    text: "115-164".to_string()
                },
                TableError::BareInteger {
                    camera: 64,
                    text: "91".to_string()
                },
            ]
        );
        assert_eq!(table.cameras().count(), 16);
        assert!(table.lookup(45).is_none());
        assert!(table.lookup(64).is_none());
        assert_eq!(
            table.lookup(85).unwrap(),
            &[
                RangeMapping {
                    old: FrameRange { first: 7, last: 138 },
                    new: FrameRange { first: 35, last: 166 },
                },
                RangeMapping {
                    old: FrameRange { first: 139, last: 156 },
                    new: FrameRange { first: 178, last: 195 },
                },
            ]
        );
    }

    #[test]
    fn load_refuses_rejected_entries() {
        assert!(CorrectionTable::load(CAMERA_UPDATE_TABLE, false).is_err());
        let table = CorrectionTable::load(CAMERA_UPDATE_TABLE, true).unwrap();
        assert!(table.lookup(12).is_some());
    }

    #[test]
    fn rejects_structural_problems() {
        let (table, errors) = CorrectionTable::parse(
            "# header\n1: (5, 3), (6, 9)\n2: (1, 2)\n3 (1, 2), (3, 4)\n4: (1, 2), (3, 4)\n4: (1, 2), (3, 4)\n5: (1, 2) x (3, 4)\n",
        );
        assert_eq!(
            errors,
            vec![
                TableError::Reversed {
                    camera: 1,
                    first: 5,
                    last: 3
                },
                TableError::Unpaired { camera: 2, count: 1 },
                TableError::Syntax {
                    line: 4,
                    text: "3 (1, 2), (3, 4)".to_string()
                },
                TableError::Duplicate { camera: 4 },
                TableError::Malformed {
                    camera: 5,
                    text: "(1, 2) x (3, 4)".to_string()
                },
            ]
        );
        assert_eq!(table.cameras().count(), 0);
    }

    #[test]
    fn report_groups_affected_frames_by_camera() {
        let (table, _) = CorrectionTable::parse("12: (91, 194), (92, 195)\n65: (3, 19), (7, 23)");
        let frames: Vec<PathBuf> = [
            "/f/M/P/camera_12/P-00100.avif",
            "/f/M/P/camera_12/P-00090.avif",
            "/f/M/P/camera_65/P-00003.avif",
            "/f/M/P/camera_65/P-00002.avif",
            "/f/M/P/camera_01/P-00100.avif",
            "/f/M/P/camera_12/notaframe.avif",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();
        let report = table.report(&frames);
        assert_eq!(report.len(), 2);
        assert_eq!(report[&12], vec!["P-00100.avif".to_string()]);
        assert_eq!(report[&65], vec!["P-00003.avif".to_string()]);
    }
}
