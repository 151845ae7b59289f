use std::path::Path;

use patch_types::BuildManifest;
use tracing::debug;

/// One remaining file's contribution to the disk-space forecast.
pub(crate) struct RemainingFile<'a> {
    pub filename: &'a str,
    /// Bytes still to be written for this file (resume credit applied).
    pub bytes_to_write: u64,
}

/// Peak additional disk usage for the remainder of the job.
///
/// Walks the remaining files in construction order keeping a running delta:
/// each new file adds its outstanding bytes; in destructive mode the replaced
/// prior file's size is credited back after its replacement lands. The answer
/// is the highest point of that walk, never negative.
pub(crate) fn required_disk_space(
    remaining: &[RemainingFile<'_>],
    prior: Option<&BuildManifest>,
    destructive: bool,
) -> u64 {
    let mut delta: i64 = 0;
    let mut peak: i64 = 0;
    for file in remaining {
        delta += file.bytes_to_write as i64;
        if peak < delta {
            peak = delta;
        }
        if destructive {
            if let Some(prior_size) = prior.and_then(|p| p.file_size(file.filename)) {
                delta -= prior_size as i64;
            }
        }
    }
    peak.max(0) as u64
}

/// Free bytes on the volume holding `dir`, unless a fixed figure was
/// configured (tests, dry runs).
pub(crate) fn available_disk_space(
    dir: &Path,
    assumed: Option<u64>,
) -> std::io::Result<u64> {
    if let Some(assumed) = assumed {
        return Ok(assumed);
    }
    let available = fs2::available_space(dir)?;
    debug!(dir = %dir.display(), available, "queried free disk space");
    Ok(available)
}
