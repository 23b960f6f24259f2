//! Stream source strategies: where Capture gets its next video source from.
//!
//! Grounded in `original_source/detection/capture.py`'s `load_next_src()` /
//! `get_posix()` contract: indexed sources walk a directory in order, an
//! exhausted source returns a sentinel ("-1" in the original, `SourceEvent::
//! Exhausted` here), and non-video extensions are skipped rather than
//! erroring. The live "indexed online" variant additionally never treats a
//! momentarily-empty directory as exhaustion — it reports `Pending` so
//! Capture waits and asks again, matching `load_next_src`'s "blocks until a
//! descriptor is available" contract (only the offline variant terminates
//! on exhaustion).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::frame::StreamDescriptor;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov"];

fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.iter().any(|ext| ext.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// What `SourceStrategy::next` reports.
pub enum SourceEvent {
    /// A descriptor is ready to open.
    Ready(StreamDescriptor),
    /// Nothing available right now; the caller should wait briefly and ask
    /// again. Only emitted by sources that are fed live and never
    /// permanently exhaust on their own.
    Pending,
    /// The descriptor stream is exhausted (offline only) or the configured
    /// index signalled `-1`. Capture stops.
    Exhausted,
}

/// Supplies Capture with the next `StreamDescriptor` to open.
pub trait SourceStrategy: Send {
    fn next(&mut self) -> Result<SourceEvent>;
}

/// Walks a fixed directory in sorted order, once, then reports `Exhausted`.
/// Used for the Offline Capture variant: a directory glob enumerated once at
/// init, terminating the pipeline when the list is drained.
pub struct IndexedSource {
    camera_index: u32,
    entries: Vec<PathBuf>,
    cursor: usize,
}

impl IndexedSource {
    pub fn new(dir: &Path, camera_index: u32) -> Result<Self> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| PipelineError::FilesystemFault { path: dir.to_path_buf(), source: e })?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| is_video_file(p))
            .collect();
        entries.sort();
        Ok(Self { camera_index, entries, cursor: 0 })
    }
}

impl SourceStrategy for IndexedSource {
    fn next(&mut self) -> Result<SourceEvent> {
        if self.cursor >= self.entries.len() {
            return Ok(SourceEvent::Exhausted);
        }
        let path = self.entries[self.cursor].clone();
        self.cursor += 1;
        Ok(SourceEvent::Ready(StreamDescriptor { path, camera_index: self.camera_index }))
    }
}

/// Drains a live index queue under `dir`: stream files dropped in by an
/// external StreamSource. Unlike `IndexedSource`, an empty directory is
/// never permanent exhaustion — it yields `Pending` so Capture blocks and
/// asks again, backing the "Indexed online" and "Archive-sample online"
/// Capture variants (§4.1's variant table).
pub struct IndexedOnlineSource {
    camera_index: u32,
    dir: PathBuf,
    seen: HashSet<PathBuf>,
}

impl IndexedOnlineSource {
    pub fn new(camera_index: u32, dir: PathBuf) -> Self {
        Self { camera_index, dir, seen: HashSet::new() }
    }
}

impl SourceStrategy for IndexedOnlineSource {
    fn next(&mut self) -> Result<SourceEvent> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .map_err(|e| PipelineError::FilesystemFault { path: self.dir.clone(), source: e })?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| is_video_file(p) && !self.seen.contains(p))
            .collect();
        entries.sort();

        match entries.into_iter().next() {
            Some(path) => {
                self.seen.insert(path.clone());
                Ok(SourceEvent::Ready(StreamDescriptor { path, camera_index: self.camera_index }))
            }
            None => Ok(SourceEvent::Pending),
        }
    }
}

/// A single fixed file or directory path, replayed once then exhausted.
/// Corresponds to the original's `VideoOfflineCapture` operating on one
/// configured `offline_path`.
pub struct OfflineSource {
    camera_index: u32,
    path: Option<PathBuf>,
}

impl OfflineSource {
    pub fn new(path: PathBuf, camera_index: u32) -> Self {
        Self { camera_index, path: Some(path) }
    }
}

impl SourceStrategy for OfflineSource {
    fn next(&mut self) -> Result<SourceEvent> {
        match self.path.take() {
            Some(path) => Ok(SourceEvent::Ready(StreamDescriptor { path, camera_index: self.camera_index })),
            None => Ok(SourceEvent::Exhausted),
        }
    }
}

/// Always returns the same RTSP URL descriptor; never exhausts on its own.
/// Reconnection backoff on repeated decoder-open failure lives in Capture,
/// not here, since exhaustion and reconnection are different concerns.
pub struct RtspSource {
    camera_index: u32,
    url: String,
}

impl RtspSource {
    pub fn new(url: String, camera_index: u32) -> Self {
        Self { camera_index, url }
    }
}

impl SourceStrategy for RtspSource {
    fn next(&mut self) -> Result<SourceEvent> {
        Ok(SourceEvent::Ready(StreamDescriptor {
            path: PathBuf::from(&self.url),
            camera_index: self.camera_index,
        }))
    }
}
