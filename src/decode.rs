//! Video decoding: the `FrameDecoder` trait boundary plus a real GStreamer
//! implementation. Capture is generic over this trait so the decoder stays
//! an external collaborator, swappable for a deterministic fake in tests.

use std::path::Path;

use gstreamer as gst;
use gstreamer_app as gst_app;
use gst::prelude::*;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::frame::Frame;

/// Decodes a single stream source into a sequence of RGB frames.
pub trait FrameDecoder: Send {
    /// Pulls the next frame, or `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// GStreamer-backed decoder: `uridecodebin`/`filesrc` into an `appsink`,
/// converted to RGB. Grounded on the teacher's `camera/mod.rs` Camera
/// struct (pipeline + appsink + reused buffer, Drop sets state to Null) and
/// `onurtuna-OasisNvr`'s `src-camera.rs` for the RTSP-flavored launch string.
pub struct GstDecoder {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    width: u32,
    height: u32,
    frame_index: u64,
}

impl GstDecoder {
    /// Opens `source` (a file path or an `rtsp://` URL) and negotiates RGB
    /// output at its native resolution.
    pub fn open(source: &str) -> Result<Self> {
        gst::init().map_err(|e| PipelineError::DecoderOpenFailed {
            path: source.into(),
            source: e.into(),
        })?;

        let pipe_description = format!(
            "uridecodebin uri={uri} ! videoconvert ! video/x-raw,format=RGB ! appsink name=sink max-buffers=2 drop=true sync=false",
            uri = to_uri(source),
        );

        let pipeline = gst::parse::launch(&pipe_description)
            .map_err(|e| PipelineError::DecoderOpenFailed { path: source.into(), source: e.into() })?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError::DecoderOpenFailed {
                path: source.into(),
                source: anyhow::anyhow!("parsed element is not a gst::Pipeline"),
            })?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| PipelineError::DecoderOpenFailed {
                path: source.into(),
                source: anyhow::anyhow!("element 'sink' not found"),
            })?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| PipelineError::DecoderOpenFailed {
                path: source.into(),
                source: anyhow::anyhow!("element 'sink' is not an appsink"),
            })?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| PipelineError::DecoderOpenFailed { path: source.into(), source: e.into() })?;

        Ok(Self { pipeline, appsink, width: 0, height: 0, frame_index: 0 })
    }
}

impl FrameDecoder for GstDecoder {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let sample = match self.appsink.pull_sample() {
            Ok(sample) => sample,
            Err(_) => return Ok(None), // EOS or pipeline stopped
        };

        if self.width == 0 {
            if let Some(caps) = sample.caps() {
                if let Some(s) = caps.structure(0) {
                    self.width = s.get::<i32>("width").unwrap_or(0) as u32;
                    self.height = s.get::<i32>("height").unwrap_or(0) as u32;
                }
            }
            debug!(width = self.width, height = self.height, "negotiated frame dimensions");
        }

        let buffer = sample
            .buffer()
            .ok_or_else(|| PipelineError::ReadFailed {
                path: "<stream>".into(),
                source: anyhow::anyhow!("sample had no buffer"),
            })?;
        let map = buffer.map_readable().map_err(|e| PipelineError::ReadFailed {
            path: "<stream>".into(),
            source: e.into(),
        })?;

        let frame = Frame::new(self.width, self.height, map.as_slice().to_vec());
        self.frame_index += 1;
        Ok(Some(Frame { index: self.frame_index, ..frame }))
    }
}

impl Drop for GstDecoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn to_uri(source: &str) -> String {
    if source.contains("://") {
        source.to_string()
    } else {
        gst::glib::filename_to_uri(source, None).unwrap_or_else(|_| format!("file://{source}"))
    }
}

/// Deterministic in-memory decoder for tests: yields `count` solid-color
/// frames of a fixed size, then exhausts.
pub struct FakeDecoder {
    width: u32,
    height: u32,
    remaining: u64,
    next_index: u64,
}

impl FakeDecoder {
    pub fn new(width: u32, height: u32, count: u64) -> Self {
        Self { width, height, remaining: count, next_index: 0 }
    }
}

impl FrameDecoder for FakeDecoder {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.next_index += 1;
        let data = vec![0u8; (self.width * self.height * 3) as usize];
        Ok(Some(Frame { width: self.width, height: self.height, data, index: self.next_index }))
    }
}
