//! DRX Backup - tiered backups with post-upload validation
//!
//! - [`BackupScheduler`]: per-tier cadence loops producing [`drx_core::BackupJob`]s
//! - [`BackupValidator`]: checksum and structure verification, manifest recording
//! - [`RetentionSweeper`]: expiry of manifests past their tier's retention

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod retention;
pub mod scheduler;
pub mod validator;

pub use retention::RetentionSweeper;
pub use scheduler::BackupScheduler;
pub use validator::{check_structure, BackupValidator};
