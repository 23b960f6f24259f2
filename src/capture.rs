//! Capture: reads frames from a `SourceStrategy`'s descriptors through a
//! `FrameDecoder`, pushes them (optionally subsampled) to a `SinkStrategy`,
//! and disposes of the consumed source via a `HistoryStrategy`.
//!
//! Grounded in `original_source/detection/capture.py`'s `VideoCaptureThreading`
//! state machine (`SHUT_DOWN`/`RUNNING`, `update()` loop) and `onurtuna-OasisNvr`'s
//! `supervised_connect` backoff for the RTSP reconnect case. The per-frame
//! RTSP snapshot hook (`post_frame_process`) is grounded on the same
//! `update()` loop's step 3 and `manager.py`'s PNG-encode pattern for
//! writing frames to disk.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use image::RgbImage;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use crate::decode::FrameDecoder;
use crate::error::{PipelineError, Result};
use crate::frame::Frame;
use crate::history::HistoryStrategy;
use crate::source::{SourceEvent, SourceStrategy};

/// How long Capture waits before re-polling a `SourceStrategy` that reports
/// `SourceEvent::Pending` (the live indexed-online variants).
const SOURCE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Where Capture hands off decoded frames. `ToQueue` is the common case
/// (bounded channel into Controller's dispatch loop); `Callback` lets a
/// caller (e.g. a test) observe frames directly without a channel, per
/// spec.md §4.1's Callback sink variant.
pub enum SinkStrategy {
    ToQueue(mpsc::Sender<Frame>),
    Callback(Box<dyn FnMut(Frame) + Send>),
}

impl SinkStrategy {
    async fn push(&mut self, frame: Frame) -> Result<()> {
        match self {
            SinkStrategy::ToQueue(tx) => tx.send(frame).await.map_err(|_| PipelineError::QueueClosed),
            SinkStrategy::Callback(cb) => {
                cb(frame);
                Ok(())
            }
        }
    }
}

/// Exponential backoff for an RTSP source that keeps reopening the same
/// URL. `max_attempts == 0` means retry forever.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
}

/// Opens a decoder for a given stream path. Boxed so production code can
/// plug in `GstDecoder::open` and tests can plug in a `FakeDecoder` factory.
pub type DecoderFactory = Box<dyn Fn(&PathBuf) -> Result<Box<dyn FrameDecoder>> + Send>;

/// Per-frame RTSP snapshot behavior (§4.1's RTSP variant): write every
/// `modulus`th decoded frame as a PNG into `sample_root/<camera_index>/`,
/// independent of whatever `SinkStrategy`/`HistoryStrategy` this Capture
/// uses. Distinct from `ArchiveSample`, which archives whole source files
/// on a time interval rather than individual frames on a frame-count
/// modulus.
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    pub sample_root: PathBuf,
    pub modulus: u32,
}

fn write_snapshot(policy: &SnapshotPolicy, camera_index: u32, frame: &Frame, counter: u64) -> Result<()> {
    let dir = policy.sample_root.join(camera_index.to_string());
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::FilesystemFault { path: dir.clone(), source: e })?;

    let stamp = Local::now().format("%m-%d-%H-%M");
    let path = dir.join(format!("{stamp}-{counter}.png"));

    let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or_else(|| {
        PipelineError::FilesystemFault {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "frame byte length mismatch"),
        }
    })?;
    image.save(&path).map_err(|e| PipelineError::FilesystemFault {
        path: path.clone(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e),
    })?;
    Ok(())
}

/// Cancellation handle shared between a Monitor and its Captures.
#[derive(Clone)]
pub struct CancelToken {
    quit: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self { quit: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    pub fn cancel(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Capture {
    camera_index: u32,
    source: Box<dyn SourceStrategy>,
    history: Box<dyn HistoryStrategy>,
    sink: SinkStrategy,
    open_decoder: DecoderFactory,
    reconnect: Option<ReconnectPolicy>,
    cancel: CancelToken,
    sample_rate: u32,
    snapshot: Option<SnapshotPolicy>,
    frames_captured: u64,
}

impl Capture {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera_index: u32,
        source: Box<dyn SourceStrategy>,
        history: Box<dyn HistoryStrategy>,
        sink: SinkStrategy,
        open_decoder: DecoderFactory,
        reconnect: Option<ReconnectPolicy>,
        cancel: CancelToken,
        sample_rate: u32,
        snapshot: Option<SnapshotPolicy>,
    ) -> Self {
        Self {
            camera_index,
            source,
            history,
            sink,
            open_decoder,
            reconnect,
            cancel,
            sample_rate: sample_rate.max(1),
            snapshot,
            frames_captured: 0,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    async fn next_descriptor(&mut self) -> Result<Option<crate::frame::StreamDescriptor>> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            match self.source.next()? {
                SourceEvent::Ready(d) => return Ok(Some(d)),
                SourceEvent::Exhausted => return Ok(None),
                SourceEvent::Pending => {
                    tokio::time::sleep(SOURCE_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Runs until the source is exhausted or cancellation is requested.
    /// Decoder-open and mid-stream read failures are absorbed and logged;
    /// `QueueClosed` propagates because the consumer is gone and there is
    /// nothing useful left to do.
    pub async fn run(&mut self) -> Result<()> {
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let descriptor = match self.next_descriptor().await? {
                Some(d) => d,
                None => {
                    info!(camera = self.camera_index, "stream source exhausted");
                    return Ok(());
                }
            };

            let mut decoder = match (self.open_decoder)(&descriptor.path) {
                Ok(d) => {
                    attempt = 0;
                    d
                }
                Err(e) => {
                    warn!(camera = self.camera_index, path = %descriptor.path.display(), error = %e, "decoder open failed");
                    if let Some(policy) = self.reconnect {
                        attempt += 1;
                        if policy.max_attempts != 0 && attempt >= policy.max_attempts {
                            return Err(e);
                        }
                        let backoff = Duration::from_secs(2u64.pow(attempt.min(6)).min(60));
                        tokio::time::sleep(backoff).await;
                    }
                    continue;
                }
            };

            loop {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                match decoder.next_frame() {
                    Ok(Some(frame)) => {
                        self.frames_captured += 1;

                        if let Some(policy) = &self.snapshot {
                            if self.frames_captured % policy.modulus as u64 == 0 {
                                if let Err(e) = write_snapshot(policy, self.camera_index, &frame, self.frames_captured)
                                {
                                    warn!(camera = self.camera_index, error = %e, "failed to write rtsp snapshot");
                                }
                            }
                        }

                        if (self.frames_captured - 1) % self.sample_rate as u64 == 0 {
                            self.sink.push(frame).await?;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(camera = self.camera_index, path = %descriptor.path.display(), error = %e, "read failed mid-stream");
                        break;
                    }
                }
            }

            self.history.handle(&descriptor.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::FakeDecoder;
    use crate::history::Delete;
    use crate::source::OfflineSource;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn callback_sink_receives_all_frames_then_stops() {
        let received = Arc::new(AtomicU32::new(0));
        let received2 = received.clone();

        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        std::fs::File::create(&clip).unwrap();

        let source = Box::new(OfflineSource::new(clip, 0));
        let history = Box::new(Delete);
        let sink = SinkStrategy::Callback(Box::new(move |_frame| {
            received2.fetch_add(1, Ordering::SeqCst);
        }));
        let open_decoder: DecoderFactory =
            Box::new(|_path| Ok(Box::new(FakeDecoder::new(4, 4, 5)) as Box<dyn FrameDecoder>));

        let mut capture = Capture::new(0, source, history, sink, open_decoder, None, CancelToken::new(), 1, None);
        capture.run().await.unwrap();

        assert_eq!(received.load(Ordering::SeqCst), 5);
        assert_eq!(capture.frames_captured(), 5);
    }

    #[tokio::test]
    async fn queue_sink_stops_cleanly_when_receiver_drops() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        std::fs::File::create(&clip).unwrap();

        let source = Box::new(OfflineSource::new(clip, 0));
        let history = Box::new(Delete);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = SinkStrategy::ToQueue(tx);
        let open_decoder: DecoderFactory =
            Box::new(|_path| Ok(Box::new(FakeDecoder::new(2, 2, 3)) as Box<dyn FrameDecoder>));

        let mut capture = Capture::new(0, source, history, sink, open_decoder, None, CancelToken::new(), 1, None);
        let err = capture.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::QueueClosed));
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_source() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        std::fs::File::create(&clip).unwrap();

        let source = Box::new(OfflineSource::new(clip, 0));
        let history = Box::new(Delete);
        let cancel = CancelToken::new();
        cancel.cancel();
        let sink = SinkStrategy::Callback(Box::new(|_frame| {}));
        let open_decoder: DecoderFactory =
            Box::new(|_path| Ok(Box::new(FakeDecoder::new(2, 2, 3)) as Box<dyn FrameDecoder>));

        let mut capture = Capture::new(0, source, history, sink, open_decoder, None, cancel, 1, None);
        capture.run().await.unwrap();
        assert_eq!(capture.frames_captured(), 0);
    }

    #[tokio::test]
    async fn sample_rate_forwards_only_every_nth_frame() {
        let received = Arc::new(AtomicU32::new(0));
        let received2 = received.clone();

        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        std::fs::File::create(&clip).unwrap();

        let source = Box::new(OfflineSource::new(clip, 0));
        let history = Box::new(Delete);
        let sink = SinkStrategy::Callback(Box::new(move |_frame| {
            received2.fetch_add(1, Ordering::SeqCst);
        }));
        let open_decoder: DecoderFactory =
            Box::new(|_path| Ok(Box::new(FakeDecoder::new(2, 2, 9)) as Box<dyn FrameDecoder>));

        let mut capture = Capture::new(0, source, history, sink, open_decoder, None, CancelToken::new(), 3, None);
        capture.run().await.unwrap();

        // frames 1, 4, 7 forwarded out of 9 decoded.
        assert_eq!(received.load(Ordering::SeqCst), 3);
        assert_eq!(capture.frames_captured(), 9);
    }

    #[tokio::test]
    async fn rtsp_snapshot_writes_every_modulus_frame() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        std::fs::File::create(&clip).unwrap();
        let sample_root = dir.path().join("samples");

        let source = Box::new(OfflineSource::new(clip, 2));
        let history = Box::new(Delete);
        let sink = SinkStrategy::Callback(Box::new(|_frame| {}));
        let open_decoder: DecoderFactory =
            Box::new(|_path| Ok(Box::new(FakeDecoder::new(2, 2, 20)) as Box<dyn FrameDecoder>));
        let snapshot = Some(SnapshotPolicy { sample_root: sample_root.clone(), modulus: 5 });

        let mut capture = Capture::new(2, source, history, sink, open_decoder, None, CancelToken::new(), 1, snapshot);
        capture.run().await.unwrap();

        let written: Vec<_> = std::fs::read_dir(sample_root.join("2")).unwrap().collect();
        assert_eq!(written.len(), 4);
    }
}
