pub mod error;
pub mod json_bridge;
pub mod schema;
pub mod store;

use std::env;
use std::path::PathBuf;

pub use error::{Result, StoreError};
pub use json_bridge::{EXPORT_VERSION, KernelExport};
pub use store::{KernelRecord, KernelStats, KernelStatus, Store, TensionSignal};

/// Database file name inside the data directory.
pub const DB_FILE: &str = "kernels.db";

/// `~/.kernel-studio`, falling back to the working directory without a home.
pub fn default_base_dir() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".kernel-studio")
}
