use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use patch_types::FileManifestEntry;
use tracing::{debug, info};

const RESUME_MARKER_NAME: &str = "resume.dat";

/// The plain-text resume marker: newline-separated resume ids identifying
/// the install+version combinations a staging area's partial state belongs
/// to. Loaded, intersected with the current manifest's ids, then rewritten
/// at run start.
pub(crate) struct ResumeData {
    enabled: bool,
    /// Prior state on disk belongs to a compatible install+version.
    compatible: bool,
}

impl ResumeData {
    pub fn init(
        staging_dir: &Path,
        current_ids: &[String],
        enabled: bool,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(staging_dir)?;
        let path = staging_dir.join(RESUME_MARKER_NAME);

        let mut compatible = false;
        if enabled && path.exists() {
            let loaded: HashSet<String> = std::fs::read_to_string(&path)?
                .lines()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect();
            compatible = current_ids.iter().any(|id| loaded.contains(id));
            info!(found = loaded.len(), compatible, "loaded resume marker");
        }

        if enabled {
            let mut file = std::fs::File::create(&path)?;
            for id in current_ids {
                writeln!(file, "{id}")?;
            }
        }

        Ok(Self { enabled, compatible })
    }

    /// Whether on-disk partial files may be resumed at all this run.
    pub fn resumable(&self) -> bool {
        self.enabled && self.compatible
    }
}

/// What to do with one target file given its on-disk remnant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FileResumeAction {
    /// No usable remnant; construct from part zero.
    Fresh,
    /// Remnant is incompatible (larger than expected); delete it first.
    DeleteThenFresh,
    /// Keep the first `next_part` whole parts (`byte_offset` bytes) and
    /// construct the rest. Never lands mid-chunk.
    Resume { next_part: usize, byte_offset: u64 },
    /// Remnant has the full expected size; re-hash before trusting it.
    VerifyComplete,
}

/// Decides the resume action from the remnant's size alone.
///
/// Files larger than expected are incompatible and restart from zero; files
/// at or under the expected size resume from the largest whole multiple of
/// chunk parts that fits within the existing bytes.
pub(crate) fn file_resume_action(
    entry: &FileManifestEntry,
    on_disk_size: Option<u64>,
    resumable: bool,
    min_resume_size: u64,
) -> FileResumeAction {
    let Some(size) = on_disk_size else {
        return FileResumeAction::Fresh;
    };
    if size > entry.file_size {
        return FileResumeAction::DeleteThenFresh;
    }
    if !resumable || entry.file_size < min_resume_size {
        return FileResumeAction::DeleteThenFresh;
    }
    if size == entry.file_size {
        return FileResumeAction::VerifyComplete;
    }

    let mut byte_offset = 0u64;
    let mut next_part = 0usize;
    for part in &entry.parts {
        if byte_offset + part.length as u64 > size {
            break;
        }
        byte_offset += part.length as u64;
        next_part += 1;
    }
    if next_part == 0 {
        debug!(file = %entry.filename, size, "remnant smaller than first part; restarting");
        return FileResumeAction::Fresh;
    }
    FileResumeAction::Resume { next_part, byte_offset }
}

#[cfg(test)]
mod tests {
    use patch_types::{ChunkId, ChunkPart, FileHash};
    use tempfile::TempDir;

    use super::*;

    fn entry_with_parts(lens: &[u32]) -> FileManifestEntry {
        let parts: Vec<ChunkPart> = lens
            .iter()
            .enumerate()
            .map(|(i, &length)| ChunkPart {
                id: ChunkId::from_data(&[i as u8]),
                chunk_offset: 0,
                length,
            })
            .collect();
        FileManifestEntry {
            filename: "f".into(),
            file_size: lens.iter().map(|&l| l as u64).sum(),
            file_hash: FileHash::default(),
            parts,
            symlink_target: None,
        }
    }

    #[test]
    fn resumes_on_whole_part_boundaries_only() {
        let entry = entry_with_parts(&[100, 100, 100]);

        // 250 bytes on disk: only two whole parts fit.
        assert_eq!(
            file_resume_action(&entry, Some(250), true, 0),
            FileResumeAction::Resume { next_part: 2, byte_offset: 200 }
        );
        // Exactly at a boundary.
        assert_eq!(
            file_resume_action(&entry, Some(200), true, 0),
            FileResumeAction::Resume { next_part: 2, byte_offset: 200 }
        );
        // Less than one part: restart.
        assert_eq!(file_resume_action(&entry, Some(50), true, 0), FileResumeAction::Fresh);
    }

    #[test]
    fn oversized_remnants_are_deleted() {
        let entry = entry_with_parts(&[100]);
        assert_eq!(
            file_resume_action(&entry, Some(101), true, 0),
            FileResumeAction::DeleteThenFresh
        );
    }

    #[test]
    fn full_size_remnants_are_verified() {
        let entry = entry_with_parts(&[100, 100]);
        assert_eq!(
            file_resume_action(&entry, Some(200), true, 0),
            FileResumeAction::VerifyComplete
        );
    }

    #[test]
    fn resume_disabled_or_below_minimum_restarts() {
        let entry = entry_with_parts(&[100, 100]);
        assert_eq!(
            file_resume_action(&entry, Some(100), false, 0),
            FileResumeAction::DeleteThenFresh
        );
        assert_eq!(
            file_resume_action(&entry, Some(100), true, 1 << 20),
            FileResumeAction::DeleteThenFresh
        );
    }

    #[test]
    fn marker_round_trip_controls_compatibility() {
        let dir = TempDir::new().unwrap();
        let ids = vec!["build-abc".to_string()];

        // First run writes the marker; nothing to resume yet.
        let first = ResumeData::init(dir.path(), &ids, true).unwrap();
        assert!(!first.resumable());

        // Second run with matching ids resumes.
        let second = ResumeData::init(dir.path(), &ids, true).unwrap();
        assert!(second.resumable());

        // A different version does not, and rewrites the marker.
        let other = vec!["build-xyz".to_string()];
        let third = ResumeData::init(dir.path(), &other, true).unwrap();
        assert!(!third.resumable());
        let fourth = ResumeData::init(dir.path(), &other, true).unwrap();
        assert!(fourth.resumable());
    }
}
