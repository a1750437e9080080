use std::path::Path;

use super::{ExistsFile, ReadFile, WriteFile};

/// Zero-sized type; delegates to `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemFs;

impl ReadFile for SystemFs {
    #[inline]
    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }
}

impl WriteFile for SystemFs {
    fn write(&self, path: &Path, contents: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)
    }
}

impl ExistsFile for SystemFs {
    #[inline]
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonexistent_file_is_reported_missing() {
        assert!(!SystemFs.exists(Path::new("/nonexistent_maint_sync_schedule_12345.json")));
    }

    #[test]
    fn write_creates_parent_directories() {
        let dir = std::env::temp_dir().join(format!("maint-std-{}", std::process::id()));
        let path = dir.join("nested").join("schedule.json");

        SystemFs.write(&path, r#"{"crons":[]}"#).unwrap();

        assert_eq!(SystemFs.read_to_string(&path).unwrap(), r#"{"crons":[]}"#);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
