//! Post-stream history policy: what Capture does with a finished source file.
//!
//! Grounded in `original_source/detection/capture.py`'s `handle_history()`
//! polymorphism: plain capture deletes, archive-sample capture copies a
//! periodic snapshot elsewhere before deleting, and some variants keep the
//! file untouched.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::warn;

/// What to do with a stream's backing file once Capture has finished
/// reading it.
pub trait HistoryStrategy: Send {
    fn handle(&mut self, path: &Path);
}

/// Remove the file. The default for indexed/offline replay sources, whose
/// files Capture owns exclusively for the duration of the run.
pub struct Delete;

impl HistoryStrategy for Delete {
    fn handle(&mut self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to delete consumed stream file");
        }
    }
}

/// Leave the file in place untouched. Used for RTSP sources, where the
/// "file" is a live URL with nothing to clean up, and for sources the
/// caller wants to replay later.
pub struct Keep;

impl HistoryStrategy for Keep {
    fn handle(&mut self, _path: &Path) {}
}

/// Archive-sample online: every `interval` of elapsed wall-clock time, copy
/// the just-consumed file into `sample_root/<camera_index>/<time>-<name>`
/// before deleting it. The original is always deleted regardless of whether
/// this cycle copied it (`capture.py:242-249`).
pub struct ArchiveSample {
    sample_root: PathBuf,
    camera_index: u32,
    interval: Duration,
    last_archived: Instant,
}

impl ArchiveSample {
    pub fn new(sample_root: PathBuf, camera_index: u32, interval: Duration) -> Self {
        Self { sample_root, camera_index, interval, last_archived: Instant::now() }
    }

    fn archive(&self, path: &Path) {
        let dir = self.sample_root.join(self.camera_index.to_string());
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(path = %dir.display(), error = %e, "failed to create archive-sample directory");
            return;
        }
        let stamp = Local::now().format("%m-%d-%H:%M");
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let dest = dir.join(format!("{stamp}-{name}"));
        if let Err(e) = std::fs::copy(path, &dest) {
            warn!(from = %path.display(), to = %dest.display(), error = %e, "failed to archive sample");
        }
    }
}

impl HistoryStrategy for ArchiveSample {
    fn handle(&mut self, path: &Path) {
        let now = Instant::now();
        if now.duration_since(self.last_archived) >= self.interval {
            self.archive(path);
            self.last_archived = now;
        }
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to delete consumed stream file");
        }
    }
}
