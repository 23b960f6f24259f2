//! Filesystem housekeeping the Monitor runs once before starting pipelines.
//!
//! Grounded in `original_source/detection/manager.py`'s `DetectionMonitor.
//! clean()`, which empties the stream/sample/region directories at the
//! start of each run rather than accumulating across runs indefinitely.

use std::path::Path;

use tracing::{info, warn};

use crate::error::{PipelineError, Result};

/// Removes every entry under `dir`, then recreates `dir` itself. Missing
/// directories are created, not treated as an error.
pub fn clean_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .map_err(|e| PipelineError::FilesystemFault { path: dir.to_path_buf(), source: e })?;
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| PipelineError::FilesystemFault { path: dir.to_path_buf(), source: e })?;
    info!(dir = %dir.display(), "cleaned directory");
    Ok(())
}

/// Best-effort variant used during shutdown, where a failure to clean up
/// should be logged, not abort the rest of teardown.
pub fn clean_dir_lenient(dir: &Path) {
    if let Err(e) = clean_dir(dir) {
        warn!(dir = %dir.display(), error = %e, "failed to clean directory");
    }
}
