use std::path::PathBuf;

use maint_std::fs::{ExistsFile, ReadFile, WriteFile};

use crate::{config::ScheduleFile, error::SyncError};

/// The ad-hoc schedule file on disk.
///
/// A missing file is created with the default entry. A file that cannot be
/// parsed is reported and treated as an empty schedule, so the process still
/// comes up.
#[derive(Clone)]
pub struct ScheduleFileStore<F> {
    fs: F,
    path: PathBuf,
}

impl<F> ScheduleFileStore<F>
where
    F: ReadFile + WriteFile + ExistsFile,
{
    pub fn new(fs: F, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn load(&self) -> ScheduleFile {
        if !self.fs.exists(&self.path) {
            let file = ScheduleFile::with_default_entry();
            match self.save(&file) {
                Ok(()) => tracing::info!(path = %self.path.display(), "Created default schedule file"),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Could not create default schedule file, using the default in memory"
                ),
            }
            return file;
        }

        let raw = match self.fs.read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to read schedule file");
                return ScheduleFile::default();
            }
        };
        match serde_json::from_str::<ScheduleFile>(&raw) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Schedule file is corrupt, starting with no ad-hoc jobs");
                ScheduleFile::default()
            }
        }
    }

    pub fn save(&self, file: &ScheduleFile) -> Result<(), SyncError> {
        let json = serde_json::to_string_pretty(file)?;
        self.fs.write(&self.path, &json)?;
        Ok(())
    }
}
