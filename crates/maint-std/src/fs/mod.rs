//! Filesystem access for the schedule configuration file.
//!
//! ```
//! use maint_std::fs::{ReadFile, SystemFs};
//! use std::path::Path;
//!
//! fn read_schedule<F: ReadFile>(fs: &F, path: &Path) -> String {
//!     fs.read_to_string(path)
//!         .unwrap_or_else(|_| r#"{"crons":[]}"#.to_string())
//! }
//!
//! let raw = read_schedule(&SystemFs, Path::new("config/schedule.json"));
//! ```

mod mem;
mod system;

#[cfg(any(test, feature = "test-support"))]
pub use mem::MemFs;
pub use system::SystemFs;

use std::io;
use std::path::Path;

pub trait ReadFile {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
}

/// Writes replace the whole file. Implementations create missing parent
/// directories.
pub trait WriteFile {
    fn write(&self, path: &Path, contents: &str) -> io::Result<()>;
}

pub trait ExistsFile {
    fn exists(&self, path: &Path) -> bool;
}
