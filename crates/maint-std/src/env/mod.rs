//! Environment variable access.
//!
//! ```
//! use maint_std::env::{ReadEnv, SystemEnv};
//!
//! fn schedule_file<E: ReadEnv>(env: &E) -> String {
//!     env.var("MAINT_SYNC_SCHEDULE_FILE")
//!         .unwrap_or_else(|_| "config/schedule.json".to_string())
//! }
//!
//! let path = schedule_file(&SystemEnv);
//! ```

mod in_memory;

#[cfg(any(test, feature = "test-support"))]
pub use in_memory::InMemoryEnv;

use std::env;

/// Does **not** require `Send + Sync`; configuration is resolved once at startup.
pub trait ReadEnv {
    fn var(&self, key: &str) -> Result<String, env::VarError>;
}

/// Zero-sized type; delegates to `std::env`.
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Result<String, env::VarError> {
        env::var(key)
    }
}
