//! Monitor: the run-level supervisor. Cleans working directories, wires one
//! Capture -> Controller -> Writer pipeline per enabled camera, and
//! coordinates shutdown.
//!
//! Grounded in `original_source/detection/manager.py`'s `DetectionMonitor`
//! (`clean()`, `call()`, `wait()`); the per-camera component ordering
//! invariant (StreamSource constructed before Capture's first `next()`,
//! Capture before Controller's probe frame) is preserved by building each
//! pipeline's components in that order before spawning any task.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::capture::{Capture, CancelToken, DecoderFactory, ReconnectPolicy, SinkStrategy, SnapshotPolicy};
use crate::config::{CameraConfig, Config};
use crate::controller::Controller;
use crate::decode::FrameDecoder;
use crate::detector::TileDetector;
use crate::error::{PipelineError, Result};
use crate::frame::Frame;
use crate::fsutil::clean_dir;
use crate::history::{ArchiveSample, Delete, HistoryStrategy, Keep};
use crate::source::{IndexedOnlineSource, IndexedSource, RtspSource, SourceStrategy};
use crate::writer::Writer;

const FRAME_QUEUE_DEPTH: usize = 8;
const RESULT_QUEUE_DEPTH: usize = 8;

/// Builds a decoder for a given stream path/URL. Shared across every
/// camera's Capture task, so it must be `Sync`.
pub type DecoderOpenFn = Arc<dyn Fn(&Path) -> Result<Box<dyn FrameDecoder>> + Send + Sync>;

/// Builds the `row * col` TileDetectors for one camera. The detection
/// algorithm is an external collaborator (spec Non-goals); production
/// wiring and tests each supply their own factory.
pub type DetectorFactory = Arc<dyn Fn(&CameraConfig) -> Vec<Box<dyn TileDetector>> + Send + Sync>;

pub struct Monitor {
    config: Config,
    decoder_open: DecoderOpenFn,
    detector_factory: DetectorFactory,
    cancel: CancelToken,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl Monitor {
    pub fn new(config: Config, decoder_open: DecoderOpenFn, detector_factory: DetectorFactory) -> Self {
        Self {
            config,
            decoder_open,
            detector_factory,
            cancel: CancelToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Empties the stream/sample/region directories. Must run before `call`.
    pub fn clean(&self) -> Result<()> {
        clean_dir(&self.config.paths.stream_path)?;
        clean_dir(&self.config.paths.sample_path)?;
        clean_dir(&self.config.paths.region_path)?;
        Ok(())
    }

    /// Three-way per spec.md §4.1's variant table: `rtsp` set selects the
    /// RTSP variant; `online` without `rtsp` selects the indexed-online
    /// variant (fed live from `stream_path`); otherwise the one-shot
    /// offline-glob variant (`offline_path`), which is the only variant
    /// that terminates on exhaustion.
    fn build_source(&self, camera: &CameraConfig) -> Result<Box<dyn SourceStrategy>> {
        if let Some(url) = &camera.rtsp {
            Ok(Box::new(RtspSource::new(url.clone(), camera.index)))
        } else if camera.online {
            let dir = self.config.paths.stream_path.join(camera.index.to_string());
            std::fs::create_dir_all(&dir)
                .map_err(|e| PipelineError::FilesystemFault { path: dir.clone(), source: e })?;
            Ok(Box::new(IndexedOnlineSource::new(camera.index, dir)))
        } else {
            let offline_root = self.config.paths.offline_path.clone().ok_or_else(|| {
                PipelineError::Config(format!("camera {}: offline without paths.offline-path", camera.index))
            })?;
            let dir = offline_root.join(camera.index.to_string());
            std::fs::create_dir_all(&dir)
                .map_err(|e| PipelineError::FilesystemFault { path: dir.clone(), source: e })?;
            Ok(Box::new(IndexedSource::new(&dir, camera.index)?))
        }
    }

    /// RTSP sources have nothing to clean up (`Keep`); indexed-online
    /// cameras either archive on a time interval (`archive_sample`) or
    /// delete on close; offline replay follows `delete_post`.
    fn build_history(&self, camera: &CameraConfig) -> Box<dyn HistoryStrategy> {
        if camera.rtsp.is_some() {
            Box::new(Keep)
        } else if camera.online && camera.archive_sample {
            let interval = Duration::from_secs(camera.sample_interval_minutes.max(1) as u64 * 60);
            Box::new(ArchiveSample::new(self.config.paths.sample_path.clone(), camera.index, interval))
        } else if camera.online {
            Box::new(Delete)
        } else if camera.delete_post.unwrap_or(true) {
            Box::new(Delete)
        } else {
            Box::new(Keep)
        }
    }

    fn build_reconnect(&self, camera: &CameraConfig) -> Option<ReconnectPolicy> {
        camera.rtsp.is_some().then_some(ReconnectPolicy { max_attempts: camera.max_reconnect_attempts })
    }

    /// RTSP's per-frame PNG snapshot hook, gated by `enable_sample_frame`
    /// (distinct from `archive_sample`'s whole-file archiving above).
    fn build_snapshot(&self, camera: &CameraConfig) -> Option<SnapshotPolicy> {
        if camera.rtsp.is_some() && camera.enable_sample_frame {
            Some(SnapshotPolicy {
                sample_root: self.config.paths.sample_path.clone(),
                modulus: camera.rtsp_saved_per_frame.max(1),
            })
        } else {
            None
        }
    }

    /// Spawns one Capture/Controller/Writer pipeline per enabled camera.
    pub fn call(&mut self) -> Result<()> {
        for camera in self.config.enabled_cameras().cloned().collect::<Vec<_>>() {
            let source = self.build_source(&camera)?;
            let history = self.build_history(&camera);
            let reconnect = self.build_reconnect(&camera);

            let (frame_tx, frame_rx) = tokio::sync::mpsc::channel::<Frame>(FRAME_QUEUE_DEPTH);
            let (result_tx, result_rx) = tokio::sync::mpsc::channel(RESULT_QUEUE_DEPTH);

            let decoder_open = self.decoder_open.clone();
            let open_decoder: DecoderFactory = Box::new(move |path| decoder_open(path));
            let snapshot = self.build_snapshot(&camera);

            let mut capture = Capture::new(
                camera.index,
                source,
                history,
                SinkStrategy::ToQueue(frame_tx),
                open_decoder,
                reconnect,
                self.cancel.clone(),
                camera.sample_rate,
                snapshot,
            );

            let detectors = (self.detector_factory)(&camera);
            let mut controller = Controller::new(camera.clone(), detectors);

            let region_root = self.config.paths.region_path.clone();
            let writer = Writer::new(camera.index, region_root);

            let camera_index = camera.index;
            self.handles.push(tokio::spawn(async move {
                info!(camera = camera_index, "capture task started");
                capture.run().await
            }));
            self.handles.push(tokio::spawn(async move {
                info!(camera = camera_index, "controller task started");
                controller.run(frame_rx, result_tx).await
            }));
            self.handles.push(tokio::spawn(async move {
                info!(camera = camera_index, "writer task started");
                writer.run(result_rx).await;
                Ok(())
            }));
        }
        Ok(())
    }

    /// Signals every pipeline to stop at its next cancellation check.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Waits for every spawned task, returning the first error encountered.
    pub async fn wait(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in self.handles.drain(..) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(PipelineError::QueueClosed);
                    }
                    tracing::error!(error = %join_err, "pipeline task panicked");
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PathsConfig, ResizeConfig, RoiConfig, TileGrid};
    use crate::decode::FakeDecoder;
    use crate::detector::NeverPositive;

    fn test_config(dir: &Path) -> Config {
        Config {
            paths: PathsConfig {
                stream_path: dir.join("streams"),
                sample_path: dir.join("samples"),
                region_path: dir.join("regions"),
                offline_path: Some(dir.join("offline")),
            },
            cameras: vec![CameraConfig {
                index: 0,
                name: Some("front-door".into()),
                enable: true,
                online: false,
                rtsp: None,
                routine: TileGrid { row: 1, col: 1 },
                sample_rate: 1,
                sample_interval_minutes: 10,
                resize: ResizeConfig::default(),
                roi: RoiConfig::default(),
                enable_sample_frame: false,
                rtsp_saved_per_frame: 5,
                archive_sample: false,
                draw_boundary: false,
                show_window: false,
                delete_post: Some(true),
                max_reconnect_attempts: 0,
            }],
        }
    }

    #[test]
    fn clean_creates_all_configured_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let decoder_open: DecoderOpenFn = Arc::new(|_p| Ok(Box::new(FakeDecoder::new(2, 2, 0)) as Box<dyn FrameDecoder>));
        let detector_factory: DetectorFactory = Arc::new(|_cam| vec![Box::new(NeverPositive) as Box<dyn TileDetector>]);
        let monitor = Monitor::new(config.clone(), decoder_open, detector_factory);

        monitor.clean().unwrap();

        assert!(config.paths.stream_path.exists());
        assert!(config.paths.sample_path.exists());
        assert!(config.paths.region_path.exists());
    }

    #[tokio::test]
    async fn call_and_wait_drains_an_offline_camera_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(dir.path().join("offline").join("0")).unwrap();
        std::fs::write(dir.path().join("offline").join("0").join("clip.mp4"), b"x").unwrap();

        let decoder_open: DecoderOpenFn =
            Arc::new(|_p| Ok(Box::new(FakeDecoder::new(2, 2, 2)) as Box<dyn FrameDecoder>));
        let detector_factory: DetectorFactory =
            Arc::new(|_cam| vec![Box::new(NeverPositive) as Box<dyn TileDetector>]);
        let mut monitor = Monitor::new(config, decoder_open, detector_factory);

        monitor.clean().unwrap();
        monitor.call().unwrap();
        monitor.wait().await.unwrap();
    }
}
