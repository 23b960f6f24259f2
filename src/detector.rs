//! TileDetector: the external collaborator that decides whether a single
//! tile is positive. The detection algorithm itself is out of scope (spec
//! Non-goals); this module only defines the boundary and test doubles.

use crate::frame::{DetectionResult, Region, Subframe};

/// Pure function from a Subframe to a DetectionResult. Implementations may
/// be arbitrarily expensive; Controller treats each call as independent and
/// runs it on its own task.
pub trait TileDetector: Send {
    fn detect(&mut self, subframe: &Subframe) -> anyhow::Result<DetectionResult>;
}

fn plane(width: u32, height: u32, value: u8) -> Vec<u8> {
    vec![value; (width * height) as usize]
}

/// Always reports negative and passes its sub-image through unchanged. Also
/// doubles as the identity detector for the round-trip reconstruction law:
/// `regions` empty, `frame == input`.
pub struct NeverPositive;

impl TileDetector for NeverPositive {
    fn detect(&mut self, subframe: &Subframe) -> anyhow::Result<DetectionResult> {
        Ok(DetectionResult {
            row: subframe.row,
            col: subframe.col,
            frame_index: subframe.frame_index,
            frame: subframe.data.clone(),
            binary: plane(subframe.width, subframe.height, 0),
            thresh: plane(subframe.width, subframe.height, 0),
            regions: Vec::new(),
        })
    }
}

/// Reports positive whenever the subframe's mean byte value exceeds
/// `threshold`. Deterministic and cheap, used to drive integration tests
/// without a real detection model.
pub struct ThresholdDetector {
    pub threshold: f64,
}

impl TileDetector for ThresholdDetector {
    fn detect(&mut self, subframe: &Subframe) -> anyhow::Result<DetectionResult> {
        let sum: u64 = subframe.data.iter().map(|&b| b as u64).sum();
        let mean = if subframe.data.is_empty() {
            0.0
        } else {
            sum as f64 / subframe.data.len() as f64
        };
        let positive = mean > self.threshold;
        let regions = if positive {
            vec![Region { x: 0, y: 0, width: subframe.width, height: subframe.height }]
        } else {
            Vec::new()
        };
        let mask_value = if positive { 255 } else { 0 };
        Ok(DetectionResult {
            row: subframe.row,
            col: subframe.col,
            frame_index: subframe.frame_index,
            frame: subframe.data.clone(),
            binary: plane(subframe.width, subframe.height, mask_value),
            thresh: plane(subframe.width, subframe.height, mask_value),
            regions,
        })
    }
}

/// Reports positive only for one fixed `(row, col)` tile, negative for all
/// others. Used to test that exactly one tile's positivity propagates to
/// `ReconstructedFrame.any_positive`.
pub struct SinglePositive {
    pub row: usize,
    pub col: usize,
}

impl TileDetector for SinglePositive {
    fn detect(&mut self, subframe: &Subframe) -> anyhow::Result<DetectionResult> {
        let positive = subframe.row == self.row && subframe.col == self.col;
        let regions = if positive {
            vec![Region { x: 0, y: 0, width: subframe.width, height: subframe.height }]
        } else {
            Vec::new()
        };
        let mask_value = if positive { 255 } else { 0 };
        Ok(DetectionResult {
            row: subframe.row,
            col: subframe.col,
            frame_index: subframe.frame_index,
            frame: subframe.data.clone(),
            binary: plane(subframe.width, subframe.height, mask_value),
            thresh: plane(subframe.width, subframe.height, mask_value),
            regions,
        })
    }
}

/// Marks its own tile's sub-image with a constant fill value and reports a
/// region covering it; every other tile passes its input through unchanged.
/// Proves Controller reconstructs the RGB/binary/thresh frames from each
/// tile's own `DetectionResult` rather than forwarding the preprocessed
/// frame untouched.
pub struct PaintPositive {
    pub row: usize,
    pub col: usize,
    pub mark: u8,
}

impl TileDetector for PaintPositive {
    fn detect(&mut self, subframe: &Subframe) -> anyhow::Result<DetectionResult> {
        let positive = subframe.row == self.row && subframe.col == self.col;
        let frame = if positive {
            vec![self.mark; subframe.data.len()]
        } else {
            subframe.data.clone()
        };
        let mask_value = if positive { 255 } else { 0 };
        let regions = if positive {
            vec![Region { x: 0, y: 0, width: subframe.width, height: subframe.height }]
        } else {
            Vec::new()
        };
        Ok(DetectionResult {
            row: subframe.row,
            col: subframe.col,
            frame_index: subframe.frame_index,
            frame,
            binary: plane(subframe.width, subframe.height, mask_value),
            thresh: plane(subframe.width, subframe.height, mask_value),
            regions,
        })
    }
}
