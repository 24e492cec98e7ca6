//! The transcoding engine core
//!
//! A [`Stream`] produces the segment files for one (asset, video quality) or
//! (asset, audio track) pair. Segments are cut on precomputed keyframe
//! boundaries by live ffmpeg processes called *heads*: each head encodes a
//! contiguous run of segments through the container's segment muxer, and the
//! engine learns about completed files from the muxer's segment-list output
//! on stdout. Callers block on per-segment readiness signals, never on
//! polling the filesystem.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::hwaccel::HwAccel;
use crate::keyframe::Keyframe;
use crate::media::MediaInfo;

pub mod audio;
pub mod video;

pub use audio::AudioStream;
pub use video::VideoStream;

/// A new head never starts closer than this (in seconds of media time)
/// behind a live head that will reach the requested segment anyway.
const MAX_ENCODER_DISTANCE: f64 = 60.0;

/// How many upcoming segments `prepare_next_segments` looks at.
const READ_AHEAD: u32 = 10;

/// Shared context handed to every stream of one asset.
#[derive(Clone)]
pub(crate) struct StreamCtx {
    pub info: Arc<MediaInfo>,
    pub keyframes: Arc<Keyframe>,
    /// Cache subtree of the owning asset
    pub out_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub hwaccel: Arc<HwAccel>,
    pub segment_timeout: Duration,
}

/// Track selection, codec arguments and output layout for one stream
/// flavor. Implemented by the video and audio specializations.
pub(crate) trait StreamKind: Send + Sync + 'static {
    fn is_video(&self) -> bool;

    /// Output path template for a head; `%d` is the segment index.
    fn out_pattern(&self, head_id: usize) -> PathBuf;

    /// Codec/bitrate arguments, given the keyframe boundary list (absolute
    /// timestamps, comma separated) the encoder must cut on.
    fn transcode_args(&self, segment_times: &str) -> Vec<String>;

    /// Short label for logs, e.g. `video 0 720p`.
    fn describe(&self) -> String;
}

#[derive(Clone, Debug)]
enum SegmentState {
    Pending,
    Ready { head: usize },
    Failed(Error),
}

/// Readiness signal for one segment: fire-once-and-broadcast. After a
/// failure is broadcast the slot is reset to a fresh pending channel so a
/// later request can spawn a replacement head; waiters that already
/// subscribed keep the old channel and observe the failure.
struct SegmentSlot {
    tx: watch::Sender<SegmentState>,
}

impl SegmentSlot {
    fn new() -> Self {
        Self {
            tx: watch::channel(SegmentState::Pending).0,
        }
    }

    fn state(&self) -> SegmentState {
        self.tx.borrow().clone()
    }

    fn is_ready(&self) -> bool {
        matches!(*self.tx.borrow(), SegmentState::Ready { .. })
    }

    fn subscribe(&self) -> watch::Receiver<SegmentState> {
        self.tx.subscribe()
    }

    fn set_ready(&self, head: usize) {
        self.tx.send_replace(SegmentState::Ready { head });
    }

    fn fail(&mut self, err: Error) {
        self.tx.send_replace(SegmentState::Failed(err));
        self.tx = watch::channel(SegmentState::Pending).0;
    }
}

/// One encoding process, producing segments `[segment, end)`. Entries are
/// never removed from the head table (indices are stable encoder IDs); dead
/// heads are only marked.
struct Head {
    /// Latest segment this head produced (its start until then)
    segment: u32,
    end: u32,
    alive: bool,
    kill_tx: Option<oneshot::Sender<()>>,
}

struct Inner {
    segments: Vec<SegmentSlot>,
    heads: Vec<Head>,
}

/// Per (asset, quality) or (asset, audio track) segment producer.
pub struct Stream {
    kind: Box<dyn StreamKind>,
    ctx: StreamCtx,
    inner: Mutex<Inner>,
}

impl Stream {
    pub(crate) fn new(ctx: StreamCtx, kind: Box<dyn StreamKind>) -> Arc<Self> {
        let (len, _) = ctx.keyframes.len();
        let stream = Arc::new(Self {
            kind,
            ctx,
            inner: Mutex::new(Inner {
                segments: (0..len).map(|_| SegmentSlot::new()).collect(),
                heads: Vec::new(),
            }),
        });

        // Grow the segment table as keyframe extraction appends boundaries.
        // The listener runs under the keyframe write lock; the keyframe lock
        // is always taken before the stream lock.
        let weak = Arc::downgrade(&stream);
        stream.ctx.keyframes.add_listener(move |all| {
            if let Some(stream) = weak.upgrade() {
                let mut inner = stream.inner.lock();
                while inner.segments.len() < all.len() {
                    inner.segments.push(SegmentSlot::new());
                }
            }
        });

        stream
    }

    /// Variant index playlist for this stream. While keyframe extraction is
    /// incomplete the playlist is an event playlist listing only the
    /// segments whose duration is already known.
    pub fn index_playlist(&self) -> String {
        let (len, complete) = self.ctx.keyframes.len();
        let keys = self.ctx.keyframes.to_vec();
        let duration = self.ctx.info.duration;

        let mut durations: Vec<f64> = keys.windows(2).map(|w| w[1] - w[0]).collect();
        if complete && len > 0 {
            // the final segment ends at the media duration, not a keyframe
            durations.push((duration - keys[len - 1]).max(0.0));
        }

        let target = durations
            .iter()
            .copied()
            .fold(0.0f64, f64::max)
            .ceil()
            .max(1.0) as u32;

        let mut index = String::from("#EXTM3U\n#EXT-X-VERSION:6\n");
        index.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target));
        index.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
        index.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");
        if !complete {
            index.push_str("#EXT-X-PLAYLIST-TYPE:EVENT\n");
        }
        for (segment, dur) in durations.iter().enumerate() {
            index.push_str(&format!("#EXTINF:{:.6}\n", dur));
            index.push_str(&format!("segment-{}.ts\n", segment));
        }
        if complete {
            index.push_str("#EXT-X-ENDLIST\n");
        }
        index
    }

    /// Path of segment `idx`, transcoding if necessary. Blocks until the
    /// backing file exists, the owning head fails, or the wait times out.
    pub async fn get_segment(self: &Arc<Self>, idx: u32) -> Result<PathBuf> {
        let i = idx as usize;
        let (len, complete) = self.ctx.keyframes.len();
        if i >= len {
            if complete {
                return Err(Error::SegmentOutOfRange { index: idx, len });
            }
            // extraction is still running; wait for it to reach the index
            if !self
                .ctx
                .keyframes
                .wait_for_index(i, self.ctx.segment_timeout)
                .await?
            {
                let (len, _) = self.ctx.keyframes.len();
                return Err(Error::SegmentOutOfRange { index: idx, len });
            }
        }

        let keys = self.ctx.keyframes.to_vec();
        let (state, mut rx, start_new) = {
            let mut inner = self.inner.lock();
            while inner.segments.len() < keys.len() {
                inner.segments.push(SegmentSlot::new());
            }
            let state = inner.segments[i].state();
            let mut start_new = false;
            if !matches!(state, SegmentState::Ready { .. }) {
                // start a fresh head unless a live one is close enough that
                // waiting beats seeking
                let distance = min_encoder_distance(&inner.heads, &keys, idx);
                let scheduled = inner
                    .heads
                    .iter()
                    .any(|h| h.alive && h.segment <= idx && idx < h.end);
                start_new = distance > MAX_ENCODER_DISTANCE || !scheduled;
            }
            (state, inner.segments[i].subscribe(), start_new)
        };

        let path = match state {
            SegmentState::Ready { head } => self.segment_path(head, idx),
            _ => {
                if start_new {
                    self.run(idx)?;
                } else {
                    debug!(
                        stream = %self.kind.describe(),
                        segment = idx,
                        "waiting for a live encoder head"
                    );
                }

                let timeout = self.ctx.segment_timeout;
                let outcome = tokio::time::timeout(
                    timeout,
                    rx.wait_for(|s| !matches!(s, SegmentState::Pending)),
                )
                .await
                .map_err(|_| Error::SegmentTimeout {
                    index: idx,
                    timeout_secs: timeout.as_secs(),
                })?;

                match outcome {
                    Ok(state) => match &*state {
                        SegmentState::Ready { head } => self.segment_path(*head, idx),
                        SegmentState::Failed(err) => return Err(err.clone()),
                        SegmentState::Pending => unreachable!("wait_for filters pending"),
                    },
                    // slot dropped: the stream was destroyed under us
                    Err(_) => return Err(Error::Cancelled),
                }
            }
        };

        self.prepare_next_segments(idx, &keys);
        Ok(path)
    }

    /// Spawn a head encoding from `start`. The range is clamped at the
    /// first segment that is already ready or already being produced, so a
    /// request stampede on one segment yields exactly one process.
    fn run(self: &Arc<Self>, start: u32) -> Result<()> {
        let keys = self.ctx.keyframes.to_vec();
        let length = keys.len() as u32;
        if start >= length {
            return Err(Error::SegmentOutOfRange {
                index: start,
                len: keys.len(),
            });
        }

        // look-ahead buffer sized by source duration
        let buffer: u32 = if self.ctx.info.duration <= 300.0 {
            15
        } else if self.ctx.info.duration <= 600.0 {
            20
        } else {
            25
        };

        let mut end = (start + buffer).min(length);
        let head_id;
        {
            let mut inner = self.inner.lock();
            for i in start..end {
                if inner.segments[i as usize].is_ready() || is_transcoding(&inner.heads, i) {
                    end = i;
                    break;
                }
            }
            if start >= end {
                // the segment became ready (or scheduled) between the
                // caller's check and this call
                return Ok(());
            }
            head_id = inner.heads.len();
            inner.heads.push(Head {
                segment: start,
                end,
                alive: true,
                kill_tx: None,
            });
        }

        info!(
            stream = %self.kind.describe(),
            head = head_id,
            start,
            end,
            total = length,
            "starting transcode head"
        );

        // Seek one segment back. Audio needs leading context or the cut
        // loses ~100ms to silence; for video, -ss snaps to the keyframe at
        // or before the timestamp, so aim past the boundary we want.
        let mut start_ref = 0f64;
        let mut start_segment = start;
        if start != 0 {
            start_segment = start - 1;
            if !self.kind.is_video() {
                start_ref = keys[start_segment as usize];
            } else if start_segment + 1 == length {
                start_ref = (keys[start_segment as usize] + self.ctx.info.duration) / 2.0;
            } else {
                start_ref =
                    (keys[start_segment as usize] + keys[start_segment as usize + 1]) / 2.0;
            }
        }

        // Both delimiting keyframes are included: -ss and -to are not
        // sample-accurate, the segment muxer does the precise cutting.
        let end_padding = if end == length { 0 } else { 1 };
        let mut segments: Vec<f64> =
            keys[(start_segment + 1) as usize..(end + end_padding) as usize].to_vec();
        if segments.is_empty() {
            // the muxer rejects an empty segment_times list
            segments = vec![9_999_999.0];
        }

        let out_pattern = self.kind.out_pattern(head_id);

        let mut args: Vec<String> = ["-nostats", "-hide_banner", "-loglevel", "warning"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        if self.kind.is_video() {
            args.extend(self.ctx.hwaccel.decode_flags().iter().cloned());
        }

        if start_ref != 0.0 {
            if self.kind.is_video() {
                // audio must keep accurate seeking or gaps appear at the cut
                args.push("-noaccurate_seek".to_string());
            }
            args.push("-ss".to_string());
            args.push(format!("{:.6}", start_ref));
        }
        // no -to when the head runs to EOF
        if end + 1 < length {
            // -ss may land on an earlier keyframe; give back the time lost
            // or -to cuts the tail short
            let end_ref = keys[(end + 1) as usize] + start_ref - keys[start_segment as usize];
            args.push("-to".to_string());
            args.push(format!("{:.6}", end_ref));
        }
        // some files miss pts; deriving them from dts keeps -c:v copy alive
        args.push("-fflags".to_string());
        args.push("+genpts".to_string());
        args.push("-i".to_string());
        args.push(self.ctx.info.path.display().to_string());
        // makes soft and hardware decodes behave the same after -ss, and
        // the output start at 0s instead of a muxer-chosen delay
        args.push("-start_at_zero".to_string());
        args.push("-copyts".to_string());
        args.push("-muxdelay".to_string());
        args.push("0".to_string());
        args.extend(self.kind.transcode_args(&to_segment_str(&segments)));

        // segment_times wants durations relative to the seek reference, and
        // the reference keyframe itself, not the padded -ss value
        let relative: Vec<f64> = segments
            .iter()
            .map(|s| s - keys[start_segment as usize])
            .collect();
        args.extend(
            [
                "-f",
                "segment",
                // tolerance for keyframe rounding; 1/(2*fps) is the
                // recommended floor, more than ~0.1 repeats short segments
                "-segment_time_delta",
                "0.05",
                "-segment_format",
                "mpegts",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push("-segment_times".to_string());
        args.push(to_segment_str(&relative));
        args.extend(
            ["-segment_list_type", "flat", "-segment_list", "pipe:1"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push("-segment_start_number".to_string());
        args.push(start_segment.to_string());
        args.push(out_pattern.display().to_string());

        debug!(
            "running {} {}",
            self.ctx.ffmpeg_path.display(),
            args.join(" ")
        );

        let spawned = out_pattern
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .map_err(Error::from)
            .and_then(|_| {
                Command::new(&self.ctx.ffmpeg_path)
                    .args(&args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| {
                        Error::Process(format!(
                            "failed to spawn {}: {}",
                            self.ctx.ffmpeg_path.display(),
                            e
                        ))
                    })
            });
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                // the head was reserved; settle it so concurrent waiters on
                // its range are woken instead of timing out
                let mut inner = self.inner.lock();
                settle_dead_head(&mut inner, head_id, start, &err);
                return Err(err);
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (kill_tx, kill_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if inner.heads[head_id].alive {
                inner.heads[head_id].kill_tx = Some(kill_tx);
            }
            // if the head was killed before the process was registered the
            // sender is dropped here and the watcher kills the child
            // immediately
        }

        let stream = self.clone();
        tokio::spawn(async move {
            stream
                .watch_head(head_id, start, end, child, stdout, stderr, kill_rx)
                .await;
        });

        Ok(())
    }

    /// Follow one head: mark segments ready as the muxer reports them, stop
    /// the encoder when it runs into already-produced segments, and settle
    /// every pending waiter when the process ends.
    #[allow(clippy::too_many_arguments)]
    async fn watch_head(
        self: Arc<Self>,
        head_id: usize,
        start: u32,
        end: u32,
        mut child: Child,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        let name = self.kind.describe();
        let pattern = self.segment_regex(head_id);

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut killed = false;
        // keep the pipe open until the process exits; closing it early would
        // SIGPIPE an encoder that still writes its trailing list line
        let mut lines = stdout.map(|s| BufReader::new(s).lines());
        if let Some(lines) = lines.as_mut() {
            loop {
                tokio::select! {
                    _ = &mut kill_rx, if !killed => {
                        // explicit kill, or the head was killed before the
                        // process was registered (dropped sender)
                        killed = true;
                        let _ = child.start_kill();
                        break;
                    }
                    line = lines.next_line() => {
                        let line = match line {
                            Ok(Some(line)) => line,
                            Ok(None) => break,
                            Err(err) => {
                                warn!(stream = %name, head = head_id, "error reading segment list: {}", err);
                                break;
                            }
                        };
                        let Some(segment) = parse_segment_index(&pattern, &line) else {
                            continue;
                        };
                        if segment < start {
                            // pre-roll from the previous keyframe; the muxer
                            // cuts it but we never serve it
                            continue;
                        }

                        let mut stop = false;
                        {
                            let mut inner = self.inner.lock();
                            let total = inner.segments.len() as u32;
                            if segment >= total {
                                // the muxer should never get past the last
                                // boundary; ignore rather than index out of
                                // the table
                                warn!(stream = %name, head = head_id, segment, "segment index beyond keyframe table");
                                continue;
                            }
                            inner.heads[head_id].segment = segment;
                            if inner.segments[segment as usize].is_ready() {
                                // another head already went past this point
                                info!(stream = %name, head = head_id, segment, "stopping encoder, segment already produced");
                                killed = true;
                                let _ = child.start_kill();
                                stop = true;
                            } else {
                                inner.segments[segment as usize].set_ready(head_id);
                                debug!(stream = %name, head = head_id, segment, "segment ready");
                                if segment + 1 == end {
                                    // range finished, ffmpeg exits on its own
                                    stop = true;
                                } else if segment + 1 < total
                                    && inner.segments[(segment + 1) as usize].is_ready()
                                {
                                    info!(stream = %name, head = head_id, segment, "stopping encoder, next segment already produced");
                                    killed = true;
                                    let _ = child.start_kill();
                                    stop = true;
                                }
                            }
                        }
                        if stop {
                            break;
                        }
                    }
                }
            }
        }

        // stay killable while the encoder drains its last segment; wait()
        // is cancel safe, so re-creating it after a kill loses nothing
        let status = loop {
            let mut want_kill = false;
            tokio::select! {
                status = child.wait() => break status,
                _ = &mut kill_rx, if !killed => {
                    killed = true;
                    want_kill = true;
                }
            }
            if want_kill {
                let _ = child.start_kill();
            }
        };

        let stderr_tail = stderr_task.await.unwrap_or_default();
        let failure = match &status {
            _ if killed => None,
            Ok(status) if status.success() => None,
            Ok(status) => Some(Error::Process(format!(
                "{} head {} exited with {}: {}",
                name,
                head_id,
                status,
                stderr_tail.trim()
            ))),
            Err(err) => Some(Error::Process(format!(
                "{} head {} wait failed: {}",
                name, head_id, err
            ))),
        };

        match &failure {
            None if killed => info!(stream = %name, head = head_id, "encoder killed"),
            None => info!(stream = %name, head = head_id, "encoder finished"),
            Some(err) => error!(stream = %name, head = head_id, "{}", err),
        }

        // A clean exit normally leaves nothing pending in the range; when it
        // does (file shorter than the keyframe table claimed), waking the
        // waiters beats letting them time out.
        let err = match failure {
            Some(err) => err,
            None if killed => Error::Cancelled,
            None => Error::Process(format!("{} head {} ended before its range", name, head_id)),
        };
        let mut inner = self.inner.lock();
        settle_dead_head(&mut inner, head_id, start, &err);
    }

    /// Video-only read-ahead: keep one head running toward the next few
    /// segments of the playback position. Audio heads are cheap enough that
    /// running them early would only steal compute from the video encode.
    fn prepare_next_segments(self: &Arc<Self>, segment: u32, keys: &[f64]) {
        if !self.kind.is_video() {
            return;
        }
        let next = {
            let inner = self.inner.lock();
            // the slot table may have outgrown this caller's keyframe
            // snapshot; never look past the snapshot
            let last = (segment + READ_AHEAD)
                .min(inner.segments.len().saturating_sub(1) as u32)
                .min(keys.len().saturating_sub(1) as u32);
            (segment + 1..=last).find(|&i| {
                !inner.segments[i as usize].is_ready()
                    && min_encoder_distance(&inner.heads, keys, i)
                        >= MAX_ENCODER_DISTANCE + 5.0 * f64::from(i - segment)
            })
        };
        if let Some(i) = next {
            info!(
                stream = %self.kind.describe(),
                segment = i,
                "starting head for upcoming segment"
            );
            if let Err(err) = self.run(i) {
                warn!(
                    stream = %self.kind.describe(),
                    segment = i,
                    "read-ahead head failed to start: {}",
                    err
                );
            }
        }
    }

    /// Idempotently kill every head. Waiters are woken with a cancellation.
    pub fn kill(&self) {
        let mut inner = self.inner.lock();
        for head in inner.heads.iter_mut() {
            if !head.alive {
                continue;
            }
            if let Some(tx) = head.kill_tx.take() {
                let _ = tx.send(());
            } else {
                // not registered yet; run() drops its sender on seeing this
                head.alive = false;
            }
        }
    }

    /// Number of heads ever spawned by this stream.
    pub fn head_count(&self) -> usize {
        self.inner.lock().heads.len()
    }

    fn segment_path(&self, head_id: usize, segment: u32) -> PathBuf {
        let pattern = self.kind.out_pattern(head_id).display().to_string();
        PathBuf::from(pattern.replacen("%d", &segment.to_string(), 1))
    }

    /// Regex matching this head's segment-list lines, capturing the index.
    fn segment_regex(&self, head_id: usize) -> Regex {
        let pattern = self.kind.out_pattern(head_id);
        let base = pattern
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let escaped = regex::escape(&base).replacen("%d", r"(\d+)", 1);
        Regex::new(&format!("^{}$", escaped)).expect("escaped pattern is a valid regex")
    }
}

/// Mark a head dead, wake every waiter on its unfinished range, and reset
/// those slots so the next request spawns a replacement head instead of
/// hanging. Segments another live head still covers are left alone.
fn settle_dead_head(inner: &mut Inner, head_id: usize, start: u32, err: &Error) {
    let head_end = inner.heads[head_id].end.min(inner.segments.len() as u32);
    for i in start..head_end {
        let covered = inner
            .heads
            .iter()
            .enumerate()
            .any(|(id, h)| id != head_id && h.alive && h.segment <= i && i < h.end);
        if covered || inner.segments[i as usize].is_ready() {
            continue;
        }
        inner.segments[i as usize].fail(err.clone());
    }
    let head = &mut inner.heads[head_id];
    head.alive = false;
    head.kill_tx = None;
}

/// True while some head's current position is exactly `segment`.
fn is_transcoding(heads: &[Head], segment: u32) -> bool {
    heads.iter().any(|h| h.alive && h.segment == segment)
}

/// Media-time distance between `segment` and the closest live head that is
/// behind it and will reach it. Infinite when no such head exists.
fn min_encoder_distance(heads: &[Head], keys: &[f64], segment: u32) -> f64 {
    let time = keys[segment as usize];
    heads
        .iter()
        .filter_map(|h| {
            // a head spawned after this keyframe snapshot can sit past it
            if !h.alive || segment >= h.end || h.segment as usize >= keys.len() {
                return None;
            }
            let head_time = keys[h.segment as usize];
            if head_time > time {
                return None;
            }
            Some(time - head_time)
        })
        .fold(f64::INFINITY, f64::min)
}

fn parse_segment_index(pattern: &Regex, line: &str) -> Option<u32> {
    let caps = pattern.captures(line.trim())?;
    caps.get(1)?.as_str().parse().ok()
}

fn to_segment_str(segments: &[f64]) -> String {
    segments
        .iter()
        .map(|s| format!("{:.6}", s))
        .collect::<Vec<_>>()
        .join(",")
}
