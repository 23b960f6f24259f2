//! Writer: drains reconstructed frames to PNG files under the region path.
//!
//! Filename shape and the monotonically increasing per-camera counter are
//! grounded in `original_source/detection/manager.py`'s `write_work()`
//! (`MM-DD-HH:MM-<counter>.png` under a per-camera subdirectory).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;
use image::RgbImage;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::error::{PipelineError, Result};
use crate::frame::ReconstructedFrame;

pub struct Writer {
    camera_index: u32,
    region_root: PathBuf,
    counter: AtomicU64,
}

impl Writer {
    pub fn new(camera_index: u32, region_root: PathBuf) -> Self {
        Self { camera_index, region_root, counter: AtomicU64::new(0) }
    }

    fn frame_dir(&self) -> PathBuf {
        self.region_root.join(self.camera_index.to_string()).join("frames")
    }

    /// Writes one reconstructed frame to disk and returns the path written.
    pub fn write_one(&self, frame: &ReconstructedFrame) -> Result<PathBuf> {
        let dir = self.frame_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| PipelineError::FilesystemFault { path: dir.clone(), source: e })?;

        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        let stamp = Local::now().format("%m-%d-%H:%M");
        let path = dir.join(format!("{stamp}-{count}.png"));

        let image = RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone())
            .ok_or_else(|| PipelineError::FilesystemFault {
                path: path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "reconstructed frame byte length mismatch",
                ),
            })?;
        image
            .save(&path)
            .map_err(|e| PipelineError::FilesystemFault {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;

        Ok(path)
    }

    /// Drains `result_rx` until it closes, writing every frame received.
    pub async fn run(&self, mut result_rx: mpsc::Receiver<ReconstructedFrame>) {
        let mut written = 0u64;
        while let Some(frame) = result_rx.recv().await {
            match self.write_one(&frame) {
                Ok(path) => {
                    written += 1;
                    info!(camera = self.camera_index, path = %path.display(), "wrote detection frame");
                }
                Err(e) => error!(camera = self.camera_index, error = %e, "failed to write detection frame"),
            }
        }
        info!(camera = self.camera_index, written, "writer stream ended");
    }
}
