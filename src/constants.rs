// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Global constants.

// === Configuration Constants ===

/// Name of the ffmpeg executable, resolved through `PATH`.
/// Default: "ffmpeg"
pub const FFMPEG_EXECUTABLE: &str = "ffmpeg";

/// Name of the ffprobe executable, resolved through `PATH`.
/// Default: "ffprobe"
pub const FFPROBE_EXECUTABLE: &str = "ffprobe";

/// Width frame indices are zero-padded to in output file names.
/// Lexicographic order of the names matches numeric order
/// for all indices below `10^FRAME_INDEX_WIDTH`.
/// Default: 5
pub const FRAME_INDEX_WIDTH: usize = 5;

/// Upper bound on frame indices probed in per-frame extraction.
/// Extraction normally ends earlier at end of stream.
/// Default: 150000
pub const MAX_FRAMES: u64 = 150_000;

/// Colorspace frames are normalized to when extracted.
/// Default: "bt709"
pub const COLORSPACE: &str = "bt709";

/// AVIF encoder quality (1-100).
/// Default: 100
pub const AVIF_QUALITY: u8 = 100;

/// AVIF encoder speed (1-10). Lower is slower and smaller.
/// Default: 6
pub const AVIF_SPEED: u8 = 6;

/// Files of the cleaned extension smaller than this many bytes
/// are considered partial writes.
/// Default: 22000
pub const PARTIAL_SIZE_THRESHOLD: u64 = 22_000;

/// Log an info line every this many frames during extraction.
/// Default: 100
pub const PROGRESS_LOG_INTERVAL: u64 = 100;

/// Seconds a single ffmpeg invocation may run before it is killed.
/// Default: 600
pub const FFMPEG_TIMEOUT_SECS: u64 = 600;

/// Seconds after which an abandoned claim file is considered stale
/// and may be taken over by another worker.
/// Default: 3600
pub const CLAIM_STALE_SECS: u64 = 3600;

/// Lines of ffmpeg stderr kept for diagnostics.
/// Default: 20
pub const STDERR_TAIL_LINES: usize = 20;

/// Minimum number of cross checked descriptor matches
/// for two stills to be considered the same view.
/// Default: 50
pub const MATCH_THRESHOLD: usize = 50;

/// Highest camera number searched when collecting modeling frames.
/// Default: 87
pub const CAMERA_COUNT: u32 = 87;

/// Keypoint detection and description settings for the similarity matcher.
pub mod features {
    /// Most keypoints kept per image, strongest first.
    pub const MAX_FEATURES: usize = 500;
    /// FAST-9 intensity threshold.
    pub const FAST_THRESHOLD: u8 = 20;
    /// Half side length of the square patch sampled around a keypoint.
    pub const PATCH_RADIUS: u32 = 15;
    /// Sigma of the smoothing applied before sampling intensity tests.
    pub const SMOOTHING_SIGMA: f32 = 2.0;
    /// Number of intensity tests (bits) in a descriptor.
    pub const DESCRIPTOR_BITS: usize = 256;
    /// Seed of the intensity test pattern. Changing it invalidates
    /// any comparison against previously computed match counts.
    pub const PATTERN_SEED: u64 = 0x0b5e_55ed;
}

/// Frame offset correction table as received from the capture vendor.
///
/// One camera per line: `camera: (old lo, old hi), (new lo, new hi), ...`.
/// Entries for cameras 45 and 64 are malformed in the source data and
/// are rejected at load time until a corrected table is supplied.
pub const CAMERA_UPDATE_TABLE: &str = "\
12: (91, 194), (92, 195)
18: (177, 194), (178, 195)
19: (23, 194), (24, 195)
30: (141, 192), (144, 195)
38: (91, 194), (92, 195)
40: (10, 151), (21, 162)
41: (89, 192), (92, 195)
45: (99, 148), (115-164), (149, 166), (178, 195)
50: (15, 189), (21, 195)
55: (132, 183), (144, 195)
59: (12, 186), (21, 195)
64: (91), (92), (144, 188), (151, 195)
65: (3, 19), (7, 23)
70: (28, 188), (35, 195)
74: (14, 188), (21, 195)
83: (147, 191), (151, 195)
85: (7, 138), (35, 166), (139, 156), (178, 195)
89: (28, 188), (35, 195)
";
