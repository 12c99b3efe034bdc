// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Frame counts of recordings and the frame list derived from them.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result, anyhow, bail};
use log::info;

use crate::{
    extractor::VIDEO_EXTENSIONS,
    ffmpeg::Ffmpeg,
    filesys::find_files,
    paths::SourceVideo,
    pool::{BatchSummary, Unit, WorkerPool},
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Number of frames in one recording.
pub struct FrameCount {
    /// The recording.
    pub video: PathBuf,
    /// Frames in its first video stream.
    pub frames: u64,
}

/// Count the frames of every recording below `root`, sorted by path.
/// Recordings that can not be counted are logged and left out.
pub fn count_tree(root: &Path, ffmpeg: &Ffmpeg, pool: &WorkerPool) -> (Vec<FrameCount>, BatchSummary) {
    let videos = find_files(root, &VIDEO_EXTENSIONS);
    info!("Found {} video files to process.", videos.len());
    let counts = Mutex::new(Vec::with_capacity(videos.len()));
    let summary = pool.run(&videos, |video| {
        let frames = ffmpeg.count_frames(video, pool.cancel_token())?;
        if frames == 0 {
            bail!("Could not determine frame count");
        }
        info!("File: {} | Frames: {frames}", video.display());
        counts
            .lock()
            .map_err(|_| anyhow!("Frame count list poisoned."))?
            .push(FrameCount {
                video: video.clone(),
                frames,
            });
        Ok(Unit::Done)
    });
    let mut counts = counts.into_inner().unwrap_or_default();
    counts.sort_by(|a, b| a.video.cmp(&b.video));
    (counts, summary)
}

/// Pose a recording belongs to: from the naming convention when it
/// applies, otherwise the name of the directory holding it.
pub fn pose_of(root: &Path, video: &Path) -> String {
    SourceVideo::parse(root, video).map_or_else(
        |_| {
            video
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        },
        |v| v.pose,
    )
}

/// Frame ids `0..total` taking every `skip`th frame.
pub fn frame_ids(total: u64, skip: u64) -> impl Iterator<Item = u64> {
    #[allow(clippy::cast_possible_truncation)]
    (0..total).step_by(skip.max(1) as usize)
}

/// Write `pose,frame_id` rows for every counted recording.
/// Returns the number of rows written.
///
/// # Errors
/// Fails if the file can not be written.
pub fn write_frame_list(path: &Path, root: &Path, counts: &[FrameCount], skip: u64) -> Result<usize> {
    let file = File::create(path).with_context(|| format!("Unable to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "pose,frame_id")?;
    let mut rows = 0;
    for count in counts {
        let pose = pose_of(root, &count.video);
        for id in frame_ids(count.frames, skip) {
            writeln!(out, "{pose},{id}")?;
            rows += 1;
        }
    }
    out.flush()?;
    info!("Wrote {rows} rows to {}", path.display());
    Ok(rows)
}
