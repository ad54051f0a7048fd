//! Checkpoint discovery inside a run directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Newest safetensors checkpoint under `dir`, if any.
///
/// Runs keep every intermediate checkpoint around; the export always picks
/// the most recently written one.
pub fn search_for_run(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("safetensors") {
                return None;
            }
            let modified = path
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, path))
        })
        // Ties on coarse filesystem timestamps resolve to the highest
        // checkpoint name.
        .max_by(|a, b| a.cmp(b))
        .map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_directory_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(search_for_run(dir.path()).is_none());
    }

    #[test]
    fn test_missing_directory_yields_none() {
        assert!(search_for_run(Path::new("/definitely/not/a/run")).is_none());
    }

    #[test]
    fn test_only_safetensors_files_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "wip").unwrap();
        assert!(search_for_run(dir.path()).is_none());

        std::fs::write(dir.path().join("step_100.safetensors"), b"x").unwrap();
        let found = search_for_run(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "step_100.safetensors");
    }
}
