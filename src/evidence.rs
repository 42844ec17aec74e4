use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// printf-style pattern handed to the segmenting sink. Segments appear as
/// `evidence_00000.mp4`, `evidence_00001.mp4`, ... in the recording
/// directory, one per chunk-duration period, each a self-contained
/// playable container.
pub const SEGMENT_PATTERN: &str = "evidence_%05d.mp4";

const SEGMENT_PREFIX: &str = "evidence_";
const SEGMENT_SUFFIX: &str = ".mp4";

/// Full location argument for the segmenting sink.
pub fn segment_location(dir: &Path) -> PathBuf {
    dir.join(SEGMENT_PATTERN)
}

/// Create the recording directory if needed. Called once at startup,
/// before the pipeline is built.
pub fn ensure_recording_dir(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    info!("Recording directory ready: {}", dir.display());
    Ok(())
}

/// List evidence segment filenames in rotation order. A missing directory
/// or one with no segments yet is an expected empty result, not an error.
pub fn list_segments(dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("No evidence to list at {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut segments: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX))
        .collect();
    segments.sort();
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_location_appends_pattern() {
        let location = segment_location(Path::new("/data/recordings"));
        assert_eq!(
            location,
            PathBuf::from("/data/recordings/evidence_%05d.mp4")
        );
    }

    #[test]
    fn test_missing_directory_lists_empty() {
        assert!(list_segments(Path::new("/definitely/not/here")).is_empty());
    }

    #[test]
    fn test_list_segments_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "evidence_00002.mp4",
            "evidence_00000.mp4",
            "evidence_00001.mp4",
            "notes.txt",
            "evidence_partial.tmp",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let segments = list_segments(dir.path());
        assert_eq!(
            segments,
            vec![
                "evidence_00000.mp4",
                "evidence_00001.mp4",
                "evidence_00002.mp4"
            ]
        );
    }

    #[test]
    fn test_ensure_recording_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("recordings");
        ensure_recording_dir(&target).unwrap();
        ensure_recording_dir(&target).unwrap();
        assert!(target.is_dir());
    }
}
