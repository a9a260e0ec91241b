//! Custom Resource Definitions and foreign resource types
//!
//! This module contains all CR types the operator reads or reconciles:
//! - BackupInstall: the per-cluster backup storage instance
//! - BackupStorageLocation / VolumeSnapshotLocation: Velero location records
//! - CredentialsRequest: credential-minting record with an opaque payload
//! - ServiceMonitor: Prometheus scrape record

pub mod backup_install;
pub mod credentials;
pub mod monitoring;
pub mod velero;

pub use backup_install::*;
pub use credentials::*;
pub use monitoring::*;
pub use velero::*;
