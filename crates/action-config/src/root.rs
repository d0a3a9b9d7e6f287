use crate::ActionConfigError;
use std::path::{Path, PathBuf};

/// Walk `start` and its ancestors, returning the first directory that
/// contains an entry named `marker`.
pub fn find_root_dir(start: &Path, marker: &str) -> Result<PathBuf, ActionConfigError> {
    for dir in start.ancestors() {
        if dir.join(marker).exists() {
            return Ok(dir.to_path_buf());
        }
    }

    Err(ActionConfigError::RootNotFound {
        marker: marker.to_string(),
        start: start.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn finds_marker_in_start_dir() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("action.json"), "{}").unwrap();
        assert_eq!(
            find_root_dir(temp.path(), "action.json").unwrap(),
            temp.path()
        );
    }

    #[test]
    fn walks_up_to_nearest_ancestor() {
        let temp = TempDir::new().unwrap();
        let outer = temp.path().join("outer");
        let inner = outer.join("inner");
        let deep = inner.join("src").join("bin");
        fs::create_dir_all(&deep).unwrap();
        fs::write(outer.join("action.json"), "{}").unwrap();
        fs::write(inner.join("action.json"), "{}").unwrap();

        assert_eq!(find_root_dir(&deep, "action.json").unwrap(), inner);
    }

    #[test]
    fn reports_not_found() {
        let temp = TempDir::new().unwrap();
        let err = find_root_dir(temp.path(), "definitely-not-present.marker").unwrap_err();
        assert!(matches!(err, ActionConfigError::RootNotFound { .. }));
        assert!(err.to_string().contains("definitely-not-present.marker"));
    }
}
