//! Managed Backup Operator
//!
//! A Kubernetes operator that provisions a hardened cloud object-storage
//! bucket per cluster and keeps a Velero installation reconciled against
//! it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Instance Coordinator                        │
//! │   load instance → resolve platform → select driver → dispatch    │
//! ├────────────────────────────┬─────────────────────────────────────┤
//! │   Bucket Lifecycle Machine │     Dependent Resource Sweep        │
//! │   adopt → propose → create │  locations → credentials →          │
//! │   → verify → harden        │  deployment → metrics → scrape      │
//! ├────────────────────────────┴─────────────────────────────────────┤
//! │                       Storage Drivers                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────────┐  │
//! │  │   AWS (S3)   │  │  GCP (GCS)   │  │ Azure (account + blob) │  │
//! │  └──────────────┘  └──────────────┘  └────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: the per-instance coordinator and controller wiring
//! - [`storage`]: per-provider drivers owning the bucket state machine
//! - [`resources`]: dependent-resource desired specs and diff/patch
//! - [`crd`]: custom resource definitions and foreign resource types
//! - [`platform`]: cluster platform resolution
//! - [`config`]: hoisted operator constants
//! - [`error`]: error types and requeue actions

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod platform;
pub mod resources;
pub mod storage;

// Re-export commonly used types
pub use config::OperatorConfig;
pub use crd::{BackupInstall, BackupInstallSpec, BackupInstallStatus, StorageBucket};
pub use error::{Error, ErrorAction, Result};
pub use platform::{PlatformStatus, PlatformType};
pub use storage::{StorageDriver, StorageDriverRef};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Operator name
pub const NAME: &str = env!("CARGO_PKG_NAME");
