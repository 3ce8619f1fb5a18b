// SPDX-License-Identifier: MPL-2.0

//! Output file naming and writing

use crate::constants::{DEFAULT_EXTENSION, TIMESTAMP_FORMAT};
use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Generated file name for a capture taken at `now`
pub fn timestamp_filename(now: &DateTime<Local>) -> String {
    format!("{}.{}", now.format(TIMESTAMP_FORMAT), DEFAULT_EXTENSION)
}

/// Where the encoded image goes
///
/// No path means a timestamped name in the working directory, a directory
/// gets a timestamped name inside it, anything else is used as is.
pub fn resolve_output_path(output: Option<&Path>, now: &DateTime<Local>) -> PathBuf {
    match output {
        None => PathBuf::from(timestamp_filename(now)),
        Some(path) if path.is_dir() => path.join(timestamp_filename(now)),
        Some(path) => path.to_path_buf(),
    }
}

/// Write (or overwrite) the output file
pub fn write_output(path: &Path, data: &[u8]) -> AppResult<()> {
    std::fs::write(path, data)
        .map_err(|e| AppError::Storage(format!("{}: {}", path.display(), e)))?;
    debug!(path = %path.display(), bytes = data.len(), "Wrote output file");
    Ok(())
}
