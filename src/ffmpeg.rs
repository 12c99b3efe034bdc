// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Invocation of the external ffmpeg and ffprobe tools.

use std::{
    collections::VecDeque,
    ffi::OsString,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, ExitStatus, Stdio},
    sync::{
        Arc, LazyLock, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use log::debug;
use regex::Regex;

use crate::{constants::STDERR_TAIL_LINES, pool::CancelToken};

/// How often a running child is polled for exit, timeout and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Diagnostics ffmpeg prints when a frame selection produced no output
/// because the stream ended before the selected frame.
const END_OF_STREAM_MARKERS: [&str; 3] = [
    "Output file is empty, nothing was encoded",
    "nothing was encoded",
    "does not contain any stream",
];

/// Last `frame=` counter in an ffmpeg progress report.
static FRAME_COUNTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").expect("frame counter pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a child process ended.
pub enum Ending {
    /// The child exited by itself.
    Exited(ExitStatus),
    /// The child was killed after exceeding its deadline.
    TimedOut,
    /// The child was killed because the batch was cancelled.
    Cancelled,
}

#[derive(Debug)]
/// Result of one finished invocation.
pub struct ProcessOutput {
    /// How the process ended.
    pub ending: Ending,
    /// Last lines written to stderr.
    pub stderr_tail: Vec<String>,
    /// Everything written to stdout, when captured.
    pub stdout: Vec<u8>,
}

impl ProcessOutput {
    /// If the process exited with status zero.
    pub fn success(&self) -> bool {
        matches!(self.ending, Ending::Exited(status) if status.success())
    }

    /// stderr tail joined into one line for error messages.
    pub fn stderr_summary(&self) -> String {
        if self.stderr_tail.is_empty() {
            "<no stderr>".to_string()
        } else {
            self.stderr_tail.join(" | ")
        }
    }

    /// If stderr carries a diagnostic that means "no frame at that index".
    fn reports_end_of_stream(&self) -> bool {
        self.stderr_tail
            .iter()
            .any(|line| END_OF_STREAM_MARKERS.iter().any(|m| line.contains(m)))
    }

    /// Turn anything but a clean exit into an error.
    ///
    /// # Errors
    /// Fails unless the process exited with status zero.
    pub fn ensure_success(self, what: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        match self.ending {
            Ending::Exited(status) => {
                bail!("{what} exited with {status}: {}", self.stderr_summary())
            }
            Ending::TimedOut => bail!("{what} timed out: {}", self.stderr_summary()),
            Ending::Cancelled => bail!("{what} cancelled."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of asking ffmpeg for one frame.
pub enum FrameOutcome {
    /// The frame was written.
    Extracted,
    /// The video has no frame at the requested index.
    EndOfStream,
    /// ffmpeg failed for another reason. Carries its diagnostics.
    DecoderError(String),
    /// The batch was cancelled while ffmpeg was running.
    Cancelled,
}

/// Tell end of stream apart from genuine decoder errors.
///
/// A clean exit that wrote nothing, or any exit whose diagnostics say
/// nothing was encoded, is end of stream. A clean exit that produced the
/// file is a success. Everything else is a decoder error.
pub fn classify_frame_result(output: &ProcessOutput, produced: bool) -> FrameOutcome {
    match output.ending {
        Ending::Cancelled => FrameOutcome::Cancelled,
        Ending::TimedOut => {
            FrameOutcome::DecoderError(format!("timed out: {}", output.stderr_summary()))
        }
        Ending::Exited(status) if status.success() && produced => FrameOutcome::Extracted,
        Ending::Exited(status) if status.success() => FrameOutcome::EndOfStream,
        Ending::Exited(_) if output.reports_end_of_stream() => FrameOutcome::EndOfStream,
        Ending::Exited(status) => {
            FrameOutcome::DecoderError(format!("{status}: {}", output.stderr_summary()))
        }
    }
}

/// Collect the last `STDERR_TAIL_LINES` non-empty lines of a stream.
/// Progress reports separated by carriage returns are split too.
fn spawn_stderr_collector(stderr: impl Read + Send + 'static) -> JoinHandle<Vec<String>> {
    thread::spawn(move || {
        let mut lines = VecDeque::new();
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                break;
            }
            for part in line.split('\r').map(str::trim).filter(|p| !p.is_empty()) {
                lines.push_back(part.to_string());
                if lines.len() > STDERR_TAIL_LINES {
                    lines.pop_front();
                }
            }
        }
        lines.into_iter().collect()
    })
}

/// Read everything from a stream on a separate thread.
fn spawn_stdout_collector(mut stdout: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    })
}

/// Wait for `child`, killing it on timeout or cancellation.
fn wait_with_deadline(child: &mut Child, timeout: Duration, cancel: &CancelToken) -> Result<Ending> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("Unable to poll child process.")? {
            return Ok(Ending::Exited(status));
        }
        let ending = if cancel.is_cancelled() {
            Ending::Cancelled
        } else if Instant::now() >= deadline {
            Ending::TimedOut
        } else {
            thread::sleep(POLL_INTERVAL);
            continue;
        };
        let _ = child.kill();
        let _ = child.wait();
        return Ok(ending);
    }
}

/// Read into `buf` until it is full or the stream ends.
/// Returns the number of bytes read.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        let n = reader.read(&mut buf[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    Ok(got)
}

#[derive(Debug, Clone)]
/// Locations of and limits for the external tools.
pub struct Ffmpeg {
    /// ffmpeg executable.
    ffmpeg: PathBuf,
    /// ffprobe executable.
    ffprobe: PathBuf,
    /// Longest a single invocation may run.
    timeout: Duration,
}

impl Ffmpeg {
    /// Tools at the given paths with a per call deadline.
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf, timeout: Duration) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            timeout,
        }
    }

    /// Check that ffmpeg can be executed.
    ///
    /// # Errors
    /// Fails if ffmpeg is missing or returns non-zero on `-version`.
    pub fn ensure_available(&self) -> Result<()> {
        let out = Command::new(&self.ffmpeg)
            .arg("-version")
            .output()
            .with_context(|| format!("Unable to run {} -version", self.ffmpeg.display()))?;
        if !out.status.success() {
            bail!("ffmpeg exists but returned non-zero on -version");
        }
        Ok(())
    }

    /// Run `program` with `args` to completion, honouring the deadline and `cancel`.
    fn run(
        &self,
        program: &Path,
        args: &[OsString],
        capture_stdout: bool,
        cancel: &CancelToken,
    ) -> Result<ProcessOutput> {
        debug!("Running {} {:?}", program.display(), args);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(if capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Unable to start {}", program.display()))?;

        let stderr = child.stderr.take().map(spawn_stderr_collector);
        let stdout = child.stdout.take().map(spawn_stdout_collector);
        let ending = wait_with_deadline(&mut child, self.timeout, cancel)?;
        Ok(ProcessOutput {
            ending,
            stderr_tail: stderr.and_then(|h| h.join().ok()).unwrap_or_default(),
            stdout: stdout.and_then(|h| h.join().ok()).unwrap_or_default(),
        })
    }

    /// Video filter chain shared by both extraction modes.
    fn filter_chain(select: Option<u64>, colorspace: Option<&str>, rotate: bool) -> Option<String> {
        let mut filters = Vec::new();
        if let Some(index) = select {
            filters.push(format!("select='eq(n,{index})'"));
        }
        if let Some(space) = colorspace {
            filters.push(format!("colorspace=all={space}"));
        }
        if rotate {
            filters.push("transpose=clock".to_string());
        }
        (!filters.is_empty()).then(|| filters.join(","))
    }

    /// Write frame `index` of `video` as a PNG at `output`.
    ///
    /// # Errors
    /// Fails only if ffmpeg can not be started. Decoder failures
    /// are reported through [`FrameOutcome`].
    pub fn extract_frame(
        &self,
        video: &Path,
        index: u64,
        colorspace: Option<&str>,
        rotate: bool,
        output: &Path,
        cancel: &CancelToken,
    ) -> Result<FrameOutcome> {
        let mut args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-loglevel".into(),
            "warning".into(),
            "-i".into(),
            video.into(),
        ];
        if let Some(filters) = Self::filter_chain(Some(index), colorspace, rotate) {
            args.extend(["-vf".into(), filters.into()]);
        }
        args.extend(
            [
                "-vsync", "vfr", "-frames:v", "1", "-pix_fmt", "rgb24", "-update", "1", "-y",
            ]
            .map(OsString::from),
        );
        args.push(output.into());

        let result = self.run(&self.ffmpeg, &args, false, cancel)?;
        let produced = output.metadata().is_ok_and(|m| m.len() > 0);
        Ok(classify_frame_result(&result, produced))
    }

    /// Width and height of the first video stream.
    ///
    /// # Errors
    /// Fails if ffprobe fails or prints something unexpected.
    pub fn probe_dimensions(&self, video: &Path, cancel: &CancelToken) -> Result<(u32, u32)> {
        let args: Vec<OsString> = vec![
            "-v".into(),
            "error".into(),
            "-select_streams".into(),
            "v:0".into(),
            "-show_entries".into(),
            "stream=width,height".into(),
            "-of".into(),
            "csv=s=x:p=0".into(),
            video.into(),
        ];
        let out = self
            .run(&self.ffprobe, &args, true, cancel)?
            .ensure_success("ffprobe")?;
        let text = String::from_utf8_lossy(&out.stdout);
        let line = text.lines().next().unwrap_or_default().trim();
        let (width, height) = line
            .split_once('x')
            .with_context(|| format!("Unexpected ffprobe output {line:?}"))?;
        Ok((
            width.parse().context("Invalid width from ffprobe")?,
            height.parse().context("Invalid height from ffprobe")?,
        ))
    }

    /// Number of frames in the first video stream, counted by remuxing it
    /// to the null muxer and reading the final progress report.
    ///
    /// # Errors
    /// Fails if ffmpeg fails or reports no frame counter.
    pub fn count_frames(&self, video: &Path, cancel: &CancelToken) -> Result<u64> {
        let args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-stats".into(),
            "-i".into(),
            video.into(),
            "-map".into(),
            "0:v:0".into(),
            "-c".into(),
            "copy".into(),
            "-f".into(),
            "null".into(),
            "-".into(),
        ];
        let out = self
            .run(&self.ffmpeg, &args, false, cancel)?
            .ensure_success("ffmpeg")?;
        parse_frame_counter(&out.stderr_tail)
            .with_context(|| format!("No frame count reported for {}", video.display()))
    }

    /// Decode any still ffmpeg understands into PNG bytes.
    ///
    /// # Errors
    /// Fails if ffmpeg fails or produces no output.
    pub fn decode_to_png(&self, image: &Path, cancel: &CancelToken) -> Result<Vec<u8>> {
        let args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            image.into(),
            "-frames:v".into(),
            "1".into(),
            "-f".into(),
            "image2pipe".into(),
            "-c:v".into(),
            "png".into(),
            "pipe:1".into(),
        ];
        let out = self
            .run(&self.ffmpeg, &args, true, cancel)?
            .ensure_success("ffmpeg")?;
        if out.stdout.is_empty() {
            bail!("ffmpeg decoded nothing from {}", image.display());
        }
        Ok(out.stdout)
    }

    /// Start decoding every frame of `video` as packed RGB.
    ///
    /// The decoder is killed once no frame was read for the call deadline
    /// or when `cancel` is raised. [`RawFrames::finish`] reports either.
    ///
    /// # Errors
    /// Fails if ffmpeg can not be started.
    pub fn raw_frames(
        &self,
        video: &Path,
        width: u32,
        height: u32,
        colorspace: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<RawFrames> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-nostdin", "-loglevel", "error", "-i"])
            .arg(video);
        if let Some(filters) = Self::filter_chain(None, colorspace, false) {
            cmd.arg("-vf").arg(filters);
        }
        debug!("Streaming {} from {}", video.display(), self.ffmpeg.display());
        let mut child = cmd
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Unable to start {}", self.ffmpeg.display()))?;
        let stderr = child.stderr.take().map(spawn_stderr_collector);
        let stdout = child.stdout.take().context("ffmpeg stdout missing")?;
        let child = Arc::new(Mutex::new(child));
        let watchdog = Watchdog::spawn(Arc::clone(&child), self.timeout, cancel.clone());
        Ok(RawFrames {
            child,
            stdout,
            stderr,
            watchdog,
            timeout: self.timeout,
            frame_bytes: width as usize * height as usize * 3,
        })
    }
}

/// Final frame counter in ffmpeg progress output.
fn parse_frame_counter(stderr: &[String]) -> Option<u64> {
    stderr
        .iter()
        .rev()
        .find_map(|line| FRAME_COUNTER.captures_iter(line).last()?[1].parse().ok())
}

#[derive(Debug)]
/// Kills a streaming child that stopped making progress or whose batch
/// was cancelled.
struct Watchdog {
    /// When watching started.
    started: Instant,
    /// Milliseconds after `started` the child last made progress.
    progress: Arc<AtomicU64>,
    /// Raised once the reader is done with the child.
    done: Arc<AtomicBool>,
    /// The watching thread. Yields why it killed the child, if it did.
    handle: Option<JoinHandle<Option<Ending>>>,
}

impl Watchdog {
    /// Watch `child` until stopped.
    fn spawn(child: Arc<Mutex<Child>>, idle_timeout: Duration, cancel: CancelToken) -> Self {
        let started = Instant::now();
        let progress = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let handle = {
            let progress = Arc::clone(&progress);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                loop {
                    if done.load(Ordering::SeqCst) {
                        return None;
                    }
                    let last = Duration::from_millis(progress.load(Ordering::SeqCst));
                    let ending = if cancel.is_cancelled() {
                        Ending::Cancelled
                    } else if started.elapsed().saturating_sub(last) >= idle_timeout {
                        Ending::TimedOut
                    } else {
                        thread::sleep(POLL_INTERVAL);
                        continue;
                    };
                    let Ok(mut child) = child.lock() else {
                        return None;
                    };
                    if matches!(child.try_wait(), Ok(Some(_))) {
                        return None;
                    }
                    let _ = child.kill();
                    return Some(ending);
                }
            })
        };
        Self {
            started,
            progress,
            done,
            handle: Some(handle),
        }
    }

    /// Restart the idle deadline.
    fn touch(&self) {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.progress.store(elapsed, Ordering::SeqCst);
    }

    /// Stop watching. Returns why the child was killed, if it was.
    fn stop(&mut self) -> Option<Ending> {
        self.done.store(true, Ordering::SeqCst);
        self.handle.take().and_then(|h| h.join().ok()).flatten()
    }
}

#[derive(Debug)]
/// A running ffmpeg decoding a video into packed RGB frames on stdout.
/// Dropping it stops the decoder.
pub struct RawFrames {
    /// The decoder process, shared with the watchdog.
    child: Arc<Mutex<Child>>,
    /// Its stdout.
    stdout: ChildStdout,
    /// Collector of its diagnostics.
    stderr: Option<JoinHandle<Vec<String>>>,
    /// Kills the decoder when it stalls.
    watchdog: Watchdog,
    /// Longest wait for a frame.
    timeout: Duration,
    /// Size of one frame in bytes.
    frame_bytes: usize,
}

impl RawFrames {
    /// Next frame, or `None` once the stream is exhausted or the
    /// decoder was killed.
    ///
    /// # Errors
    /// Fails on read errors or a truncated final frame.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.frame_bytes];
        let got = read_exact_or_eof(&mut self.stdout, &mut buf)?;
        match got {
            0 => Ok(None),
            n if n == self.frame_bytes => {
                self.watchdog.touch();
                Ok(Some(buf))
            }
            n => bail!("Truncated frame: read {n} of {} bytes", self.frame_bytes),
        }
    }

    /// Wait for the decoder and check how it ended.
    ///
    /// # Errors
    /// Fails if ffmpeg exited non-zero, stalled past the deadline or was cancelled.
    pub fn finish(mut self) -> Result<()> {
        // The watchdog keeps running so a decoder that never exits is still killed.
        let status = loop {
            let polled = self
                .child
                .lock()
                .map_err(|_| anyhow!("ffmpeg handle poisoned"))?
                .try_wait()
                .context("Unable to poll ffmpeg.")?;
            match polled {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };
        let killed = self.watchdog.stop();
        let tail = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        match killed {
            Some(Ending::TimedOut) => bail!(
                "ffmpeg produced no frame for {}s and was killed",
                self.timeout.as_secs()
            ),
            Some(Ending::Cancelled) => bail!("ffmpeg was cancelled"),
            _ if !status.success() => bail!("ffmpeg exited with {status}: {}", tail.join(" | ")),
            _ => Ok(()),
        }
    }
}

impl Drop for RawFrames {
    fn drop(&mut self) {
        self.watchdog.stop();
        if let Ok(mut child) = self.child.lock() {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}


#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    #[test]
    fn patterns_compile() {
        LazyLock::force(&FRAME_COUNTER);
    }

    fn output(code: i32, stderr: &[&str]) -> ProcessOutput {
        ProcessOutput {
            ending: Ending::Exited(ExitStatus::from_raw(code << 8)),
            stderr_tail: stderr.iter().map(ToString::to_string).collect(),
            stdout: Vec::new(),
        }
    }

    #[test]
    fn clean_exit_with_file_is_extracted() {
        assert_eq!(classify_frame_result(&output(0, &[]), true), FrameOutcome::Extracted);
    }

    #[test]
    fn clean_exit_without_file_is_end_of_stream() {
        assert_eq!(
            classify_frame_result(&output(0, &["Output file is empty, nothing was encoded"]), false),
            FrameOutcome::EndOfStream
        );
        assert_eq!(classify_frame_result(&output(0, &[]), false), FrameOutcome::EndOfStream);
    }

    #[test]
    fn failing_exit_is_end_of_stream_only_with_marker() {
        assert_eq!(
            classify_frame_result(
                &output(1, &["Output file #0 does not contain any stream"]),
                false
            ),
            FrameOutcome::EndOfStream
        );
        assert!(matches!(
            classify_frame_result(&output(1, &["Invalid data found when processing input"]), false),
            FrameOutcome::DecoderError(msg) if msg.contains("Invalid data")
        ));
    }

    #[test]
    fn timeout_and_cancel_are_not_end_of_stream() {
        let mut out = output(0, &[]);
        out.ending = Ending::TimedOut;
        assert!(matches!(
            classify_frame_result(&out, false),
            FrameOutcome::DecoderError(_)
        ));
        out.ending = Ending::Cancelled;
        assert_eq!(classify_frame_result(&out, false), FrameOutcome::Cancelled);
    }

    #[test]
    fn reads_last_frame_counter() {
        let stderr = vec![
            "Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'a.mov':".to_string(),
            "frame=  120 fps=0.0 q=-1.0 size=N/A".to_string(),
            "frame=  240 fps=0.0 q=-1.0 Lsize=N/A time=00:00:08.00".to_string(),
        ];
        assert_eq!(parse_frame_counter(&stderr), Some(240));
        assert_eq!(parse_frame_counter(&["nothing".to_string()]), None);
    }

    #[test]
    fn filter_chain_orders_select_first() {
        assert_eq!(
            Ffmpeg::filter_chain(Some(4), Some("bt709"), true).as_deref(),
            Some("select='eq(n,4)',colorspace=all=bt709,transpose=clock")
        );
        assert_eq!(Ffmpeg::filter_chain(None, None, false), None);
    }

    #[test]
    fn raw_frames_are_read_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake::ffmpeg(
            dir.path(),
            r"printf '\001\002\003\004\005\006'",
            "echo 1x1",
            Duration::from_secs(30),
        );
        let mut frames = ffmpeg
            .raw_frames(Path::new("clip.mp4"), 1, 1, None, &CancelToken::new())
            .unwrap();
        assert_eq!(frames.next_frame().unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(frames.next_frame().unwrap(), Some(vec![4, 5, 6]));
        assert_eq!(frames.next_frame().unwrap(), None);
        frames.finish().unwrap();
    }

    #[test]
    fn stalled_raw_stream_is_killed_at_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake::ffmpeg(dir.path(), "exec sleep 30", "echo 2x1", Duration::from_secs(1));
        let start = Instant::now();
        let mut frames = ffmpeg
            .raw_frames(Path::new("clip.mp4"), 2, 1, None, &CancelToken::new())
            .unwrap();
        assert_eq!(frames.next_frame().unwrap(), None);
        let err = frames.finish().unwrap_err();
        assert!(err.to_string().contains("no frame"), "{err}");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancelled_raw_stream_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake::ffmpeg(dir.path(), "exec sleep 30", "echo 2x1", Duration::from_secs(60));
        let cancel = CancelToken::new();
        let start = Instant::now();
        let mut frames = ffmpeg
            .raw_frames(Path::new("clip.mp4"), 2, 1, None, &cancel)
            .unwrap();
        cancel.cancel();
        assert_eq!(frames.next_frame().unwrap(), None);
        assert!(frames.finish().unwrap_err().to_string().contains("cancelled"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
