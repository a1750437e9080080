//! Env, filesystem and clock seams for maint-sync.
//!
//! | Concern | Trait(s) | Production | Test |
//! |---------|----------|------------|------|
//! | Env vars | [`ReadEnv`] | [`SystemEnv`] | [`InMemoryEnv`]* |
//! | Filesystem | [`ReadFile`], [`WriteFile`], [`ExistsFile`] | [`SystemFs`] | [`MemFs`]* |
//! | Wall clock | [`GetNow`] | [`SystemClock`] | [`MockClock`]* |
//!
//! *Available with `#[cfg(test)]` or the `"test-support"` feature.
//!
//! The schedule file store and the dedup/sync clocks are shared across tokio
//! tasks, so [`MemFs`] and [`MockClock`] are `Send + Sync` (mutex-backed).
//! [`InMemoryEnv`] is only read during startup and stays `RefCell`-based.

pub mod env;
pub mod fs;
pub mod time;

pub use env::{ReadEnv, SystemEnv};
pub use fs::{ExistsFile, ReadFile, SystemFs, WriteFile};
pub use time::{GetNow, SystemClock};
