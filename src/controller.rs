//! Controller: preprocesses frames, dispatches tiles to detectors, collects
//! results in a fixed order, and reconstructs a frame worth writing.
//!
//! Grounded in `original_source/detection/manager.py`'s `DetectorController`:
//! `init_control_range()` (probe frame sets the tile step), `preprocess()`
//! (resize by scale/width/height priority, then crop, then blur), `dispatch()`
//! (fire-and-forget to every tile), `collect()` (ordered per-tile reads),
//! and `construct_rgb()`/`construct_gray()` (reshape the frame into a tile
//! grid; here expressed as direct row-major byte-range writes rather than
//! numpy reshape+transpose, since Rust has no ndarray dependency in the
//! teacher's stack).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::{imageops, RgbImage};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{CameraConfig, ResizeConfig, RoiConfig, TileGrid};
use crate::detector::TileDetector;
use crate::error::{PipelineError, Result};
use crate::frame::{DetectionResult, Frame, ReconstructedFrame, Subframe};

const TILE_CHANNEL_DEPTH: usize = 4;

/// Snapshot of Controller throughput, logged periodically.
/// Grounded on `rust/src/streaming/frame_distributor.rs`'s `FrameStats`.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_dispatched: AtomicU64,
    pub frames_reconstructed: AtomicU64,
    pub frames_written: AtomicU64,
    pub tiles_dropped: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            frames_reconstructed: self.frames_reconstructed.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            tiles_dropped: self.tiles_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub frames_dispatched: u64,
    pub frames_reconstructed: u64,
    pub frames_written: u64,
    pub tiles_dropped: u64,
}

/// Resizes by scale/width/height priority order, then crops to the ROI,
/// then applies a light blur, matching the original's `cv2.GaussianBlur`
/// 3x3 smoothing step ahead of tile slicing.
pub fn preprocess(frame: &Frame, resize: &ResizeConfig, roi: &RoiConfig) -> Result<Frame> {
    let mut img = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| PipelineError::ReadFailed {
            path: "<frame>".into(),
            source: anyhow::anyhow!("frame byte length does not match width*height*3"),
        })?;

    if resize.scale > 0.0 {
        let w = ((img.width() as f32) * resize.scale).round().max(1.0) as u32;
        let h = ((img.height() as f32) * resize.scale).round().max(1.0) as u32;
        img = imageops::resize(&img, w, h, imageops::FilterType::Triangle);
    } else if resize.width > 0 {
        let w = resize.width as u32;
        let h = ((img.height() as f32) * (w as f32) / (img.width() as f32)).round().max(1.0) as u32;
        img = imageops::resize(&img, w, h, imageops::FilterType::Triangle);
    } else if resize.height > 0 {
        let h = resize.height as u32;
        let w = ((img.width() as f32) * (h as f32) / (img.height() as f32)).round().max(1.0) as u32;
        img = imageops::resize(&img, w, h, imageops::FilterType::Triangle);
    }

    if roi.width > 0 && roi.height > 0 {
        img = imageops::crop(&mut img, roi.x, roi.y, roi.width, roi.height).to_image();
    }

    // 3x3 Gaussian blur with sigma derived from OpenCV's "auto sigma" for a
    // 3-pixel kernel (~0.8); no equivalent constant exists in `image`.
    img = imageops::blur(&img, 0.8);

    let (width, height) = img.dimensions();
    Ok(Frame { width, height, data: img.into_raw(), index: frame.index })
}

/// Slices a preprocessed frame into `grid.row * grid.col` tiles in
/// row-major order. Dimensions not evenly divisible by the grid leave a
/// narrower/shorter strip on the bottom and right edges, matching the
/// original's integer `col_step`/`row_step` division.
pub fn slice_tiles(frame: &Frame, grid: TileGrid) -> Vec<Subframe> {
    let tile_w = frame.width as usize / grid.col;
    let tile_h = frame.height as usize / grid.row;
    let stride = frame.width as usize * 3;

    let mut tiles = Vec::with_capacity(grid.count());
    for row in 0..grid.row {
        for col in 0..grid.col {
            let x0 = col * tile_w;
            let y0 = row * tile_h;
            let mut data = Vec::with_capacity(tile_w * tile_h * 3);
            for y in 0..tile_h {
                let start = (y0 + y) * stride + x0 * 3;
                let end = start + tile_w * 3;
                data.extend_from_slice(&frame.data[start..end]);
            }
            tiles.push(Subframe {
                row,
                col,
                width: tile_w as u32,
                height: tile_h as u32,
                data,
                frame_index: frame.index,
            });
        }
    }
    tiles
}

/// Reassembles the RGB plane from each tile's own `frame` sub-image: the
/// reshape `(rows, cols, tile_h, tile_w, 3) -> transpose -> (rows*tile_h,
/// cols*tile_w, 3)` expressed as direct row-major byte-range writes.
fn reconstruct_rgb(grid: TileGrid, tile_w: usize, tile_h: usize, results: &[DetectionResult]) -> Vec<u8> {
    reconstruct_plane(grid, tile_w, tile_h, 3, results, |r| &r.frame)
}

/// Same reshape as `reconstruct_rgb` but for a single-channel plane
/// (binary or threshold mask).
fn reconstruct_gray(
    grid: TileGrid,
    tile_w: usize,
    tile_h: usize,
    results: &[DetectionResult],
    pick: impl Fn(&DetectionResult) -> &Vec<u8>,
) -> Vec<u8> {
    reconstruct_plane(grid, tile_w, tile_h, 1, results, pick)
}

fn reconstruct_plane(
    grid: TileGrid,
    tile_w: usize,
    tile_h: usize,
    channels: usize,
    results: &[DetectionResult],
    pick: impl Fn(&DetectionResult) -> &Vec<u8>,
) -> Vec<u8> {
    let width = tile_w * grid.col;
    let height = tile_h * grid.row;
    let stride = width * channels;
    let mut out = vec![0u8; width * height * channels];

    for result in results {
        let src = pick(result);
        let x0 = result.col * tile_w * channels;
        let y0 = result.row * tile_h;
        let src_stride = tile_w * channels;
        for y in 0..tile_h {
            let dst_start = (y0 + y) * stride + x0;
            let src_start = y * src_stride;
            out[dst_start..dst_start + src_stride].copy_from_slice(&src[src_start..src_start + src_stride]);
        }
    }
    out
}

/// Draws one-pixel-thick red lines at every internal tile edge, independent
/// of detection results. Grounded in `manager.py`'s `draw_boundary`
/// (`cv2.line` with color `(0,0,255)` = red).
pub fn draw_grid_lines(rgb: &mut [u8], width: usize, height: usize, grid: TileGrid, tile_w: usize, tile_h: usize) {
    let stride = width * 3;

    for col in 1..grid.col {
        let x = col * tile_w;
        if x >= width {
            continue;
        }
        for y in 0..height {
            set_red(rgb, stride, x, y);
        }
    }

    for row in 1..grid.row {
        let y = row * tile_h;
        if y >= height {
            continue;
        }
        for x in 0..width {
            set_red(rgb, stride, x, y);
        }
    }
}

fn set_red(data: &mut [u8], stride: usize, x: usize, y: usize) {
    let offset = y * stride + x * 3;
    if offset + 2 < data.len() {
        data[offset] = 255;
        data[offset + 1] = 0;
        data[offset + 2] = 0;
    }
}

/// A live handle to one tile's detector task: send a Subframe in, receive
/// exactly one DetectionResult back.
struct TileWorker {
    tx: mpsc::Sender<Subframe>,
    rx: mpsc::Receiver<DetectionResult>,
}

fn spawn_tile_worker(mut detector: Box<dyn TileDetector>) -> TileWorker {
    let (in_tx, mut in_rx) = mpsc::channel::<Subframe>(TILE_CHANNEL_DEPTH);
    let (out_tx, out_rx) = mpsc::channel::<DetectionResult>(TILE_CHANNEL_DEPTH);

    tokio::task::spawn_blocking(move || {
        while let Some(subframe) = in_rx.blocking_recv() {
            let (row, col) = (subframe.row, subframe.col);
            match detector.detect(&subframe) {
                Ok(result) => {
                    if out_tx.blocking_send(result).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(row, col, error = %e, "tile detector faulted");
                    break;
                }
            }
        }
    });

    TileWorker { tx: in_tx, rx: out_rx }
}

/// Owns one tile-worker task per grid cell and drives the dispatch/collect
/// loop over an input frame stream. `rows * cols` must equal
/// `detectors.len()`.
pub struct Controller {
    camera: CameraConfig,
    grid: TileGrid,
    workers: Vec<TileWorker>,
    stats: Arc<PipelineStats>,
}

impl Controller {
    pub fn new(camera: CameraConfig, detectors: Vec<Box<dyn TileDetector>>) -> Self {
        let grid = camera.routine;
        assert_eq!(detectors.len(), grid.count(), "one detector required per tile");
        let workers = detectors.into_iter().map(spawn_tile_worker).collect();
        Self { camera, grid, workers, stats: Arc::new(PipelineStats::default()) }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Reads frames from `frame_rx` until it closes, preprocesses each,
    /// dispatches tiles, collects results in row-major order, reconstructs,
    /// and forwards frames with any positive tile to `result_tx`.
    pub async fn run(
        &mut self,
        mut frame_rx: mpsc::Receiver<Frame>,
        result_tx: mpsc::Sender<ReconstructedFrame>,
    ) -> Result<()> {
        while let Some(frame) = frame_rx.recv().await {
            let preprocessed = preprocess(&frame, &self.camera.resize, &self.camera.roi)?;
            let tile_w = preprocessed.width as usize / self.grid.col;
            let tile_h = preprocessed.height as usize / self.grid.row;
            let tiles = slice_tiles(&preprocessed, self.grid);

            // dispatch: fire every tile's subframe to its worker.
            for (worker, subframe) in self.workers.iter_mut().zip(tiles.into_iter()) {
                if worker.tx.send(subframe).await.is_err() {
                    self.stats.tiles_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.stats.frames_dispatched.fetch_add(1, Ordering::Relaxed);

            // collect: read back in the same fixed tile order.
            let mut results = Vec::with_capacity(self.grid.count());
            for worker in self.workers.iter_mut() {
                match worker.rx.recv().await {
                    Some(result) => results.push(result),
                    None => {
                        self.stats.tiles_dropped.fetch_add(1, Ordering::Relaxed);
                        return Err(PipelineError::DetectorFault {
                            row: results.len() / self.grid.col,
                            col: results.len() % self.grid.col,
                            source: anyhow::anyhow!("tile worker channel closed"),
                        });
                    }
                }
            }

            let any_positive = results.iter().any(|r| r.is_positive());
            let mut rgb = reconstruct_rgb(self.grid, tile_w, tile_h, &results);
            let binary = reconstruct_gray(self.grid, tile_w, tile_h, &results, |r| &r.binary);
            let thresh = reconstruct_gray(self.grid, tile_w, tile_h, &results, |r| &r.thresh);

            let width = (tile_w * self.grid.col) as u32;
            let height = (tile_h * self.grid.row) as u32;

            if self.camera.draw_boundary {
                draw_grid_lines(&mut rgb, width as usize, height as usize, self.grid, tile_w, tile_h);
            }

            self.stats.frames_reconstructed.fetch_add(1, Ordering::Relaxed);

            if any_positive {
                let reconstructed = ReconstructedFrame {
                    frame_index: preprocessed.index,
                    width,
                    height,
                    rgb,
                    binary,
                    thresh,
                    any_positive,
                };
                if result_tx.send(reconstructed).await.is_err() {
                    return Err(PipelineError::QueueClosed);
                }
                self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
            }
        }

        info!(camera = self.camera.index, stats = ?self.stats.snapshot(), "controller stream ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, ResizeConfig, RoiConfig, TileGrid};
    use crate::detector::{NeverPositive, PaintPositive, SinglePositive};

    fn solid_frame(width: u32, height: u32, value: u8) -> Frame {
        Frame { width, height, data: vec![value; (width * height * 3) as usize], index: 1 }
    }

    fn base_camera(grid: TileGrid) -> CameraConfig {
        CameraConfig {
            index: 0,
            name: None,
            enable: true,
            online: false,
            rtsp: None,
            routine: grid,
            sample_rate: 1,
            sample_interval_minutes: 10,
            resize: ResizeConfig::default(),
            roi: RoiConfig::default(),
            enable_sample_frame: false,
            rtsp_saved_per_frame: 5,
            archive_sample: false,
            draw_boundary: true,
            show_window: false,
            delete_post: Some(true),
            max_reconnect_attempts: 0,
        }
    }

    #[test]
    fn slice_tiles_partitions_row_major() {
        let frame = solid_frame(4, 4, 1);
        let tiles = slice_tiles(&frame, TileGrid { row: 2, col: 2 });
        assert_eq!(tiles.len(), 4);
        assert_eq!((tiles[0].row, tiles[0].col), (0, 0));
        assert_eq!((tiles[1].row, tiles[1].col), (0, 1));
        assert_eq!((tiles[2].row, tiles[2].col), (1, 0));
        assert_eq!((tiles[3].row, tiles[3].col), (1, 1));
        for t in &tiles {
            assert_eq!(t.width, 2);
            assert_eq!(t.height, 2);
            assert_eq!(t.data.len(), 2 * 2 * 3);
        }
    }

    #[test]
    fn preprocess_resize_priority_scale_over_width() {
        let frame = solid_frame(10, 10, 5);
        let resize = ResizeConfig { scale: 2.0, width: 999, height: -1 };
        let out = preprocess(&frame, &resize, &RoiConfig::default()).unwrap();
        assert_eq!(out.width, 20);
        assert_eq!(out.height, 20);
    }

    #[test]
    fn preprocess_crops_to_roi() {
        let frame = solid_frame(10, 10, 5);
        let roi = RoiConfig { x: 1, y: 1, width: 4, height: 4 };
        let out = preprocess(&frame, &ResizeConfig::default(), &roi).unwrap();
        assert_eq!(out.width, 4);
        assert_eq!(out.height, 4);
    }

    #[test]
    fn draw_grid_lines_marks_only_internal_edges_in_red() {
        let width = 4usize;
        let height = 4usize;
        let mut rgb = vec![10u8; width * height * 3];
        draw_grid_lines(&mut rgb, width, height, TileGrid { row: 2, col: 2 }, 2, 2);

        // internal vertical edge at x=2, every row.
        for y in 0..height {
            let offset = y * width * 3 + 2 * 3;
            assert_eq!(&rgb[offset..offset + 3], &[255, 0, 0]);
        }
        // outer edge (x=0) untouched.
        assert_eq!(&rgb[0..3], &[10, 10, 10]);
    }

    #[tokio::test]
    async fn controller_forwards_only_positive_frames() {
        let grid = TileGrid { row: 2, col: 2 };
        let detectors: Vec<Box<dyn crate::detector::TileDetector>> =
            vec![Box::new(NeverPositive), Box::new(NeverPositive), Box::new(NeverPositive), Box::new(NeverPositive)];
        let mut controller = Controller::new(base_camera(grid), detectors);

        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (result_tx, mut result_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move { controller.run(frame_rx, result_tx).await });

        frame_tx.send(solid_frame(4, 4, 10)).await.unwrap();
        drop(frame_tx);

        assert!(result_rx.recv().await.is_none());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn controller_forwards_frame_with_one_positive_tile() {
        let grid = TileGrid { row: 2, col: 2 };
        let detectors: Vec<Box<dyn crate::detector::TileDetector>> = vec![
            Box::new(NeverPositive),
            Box::new(SinglePositive { row: 0, col: 1 }),
            Box::new(NeverPositive),
            Box::new(NeverPositive),
        ];
        let mut controller = Controller::new(base_camera(grid), detectors);

        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (result_tx, mut result_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move { controller.run(frame_rx, result_tx).await });

        frame_tx.send(solid_frame(4, 4, 10)).await.unwrap();
        drop(frame_tx);

        let reconstructed = result_rx.recv().await.unwrap();
        assert!(reconstructed.any_positive);
        assert!(result_rx.recv().await.is_none());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn controller_reconstructs_rgb_from_each_tiles_own_frame() {
        // A detector that redacts its own tile's sub-image must have a
        // visible effect on the written RGB: the reconstructed frame is
        // assembled from each tile's `DetectionResult.frame`, not the
        // original preprocessed frame.
        let grid = TileGrid { row: 2, col: 2 };
        let detectors: Vec<Box<dyn crate::detector::TileDetector>> = vec![
            Box::new(NeverPositive),
            Box::new(PaintPositive { row: 0, col: 1, mark: 200 }),
            Box::new(NeverPositive),
            Box::new(NeverPositive),
        ];
        let mut camera = base_camera(grid);
        camera.draw_boundary = false;
        let mut controller = Controller::new(camera, detectors);

        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (result_tx, mut result_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move { controller.run(frame_rx, result_tx).await });

        frame_tx.send(solid_frame(4, 4, 10)).await.unwrap();
        drop(frame_tx);

        let reconstructed = result_rx.recv().await.unwrap();
        // tile (0,1) occupies columns 2..4 of row 0..2; every byte there
        // should now read the marked value instead of the original 10.
        let stride = reconstructed.width as usize * 3;
        let offset = 0 * stride + 2 * 3;
        assert_eq!(&reconstructed.rgb[offset..offset + 3], &[200, 200, 200]);
        // tile (0,0) was untouched.
        assert_eq!(&reconstructed.rgb[0..3], &[10, 10, 10]);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn draw_boundary_overlay_is_unconditional_on_negative_frames() {
        // Even with no positive tile, `draw_boundary` still overlays red grid
        // lines on every reconstructed frame that *would* be written; since
        // negative frames are never enqueued, assert this indirectly via a
        // mixed frame where only one tile is positive but the grid line
        // crossing a negative tile is still red.
        let grid = TileGrid { row: 2, col: 2 };
        let detectors: Vec<Box<dyn crate::detector::TileDetector>> = vec![
            Box::new(SinglePositive { row: 0, col: 0 }),
            Box::new(NeverPositive),
            Box::new(NeverPositive),
            Box::new(NeverPositive),
        ];
        let mut controller = Controller::new(base_camera(grid), detectors);

        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (result_tx, mut result_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move { controller.run(frame_rx, result_tx).await });

        frame_tx.send(solid_frame(4, 4, 10)).await.unwrap();
        drop(frame_tx);

        let reconstructed = result_rx.recv().await.unwrap();
        let stride = reconstructed.width as usize * 3;
        // internal vertical edge at x=2 within tile row 1 (negative tiles).
        let offset = 3 * stride + 2 * 3;
        assert_eq!(&reconstructed.rgb[offset..offset + 3], &[255, 0, 0]);
        handle.await.unwrap().unwrap();
    }
}
