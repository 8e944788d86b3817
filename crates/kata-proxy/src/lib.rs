//! Reverse-proxy reconciliation for kata apps.

pub mod admin;
pub mod error;
pub mod reconcile;

pub use admin::{HttpAdminClient, MemoryAdminClient, ProxyAdmin};
pub use error::ProxyError;
pub use reconcile::{ProxyReconciler, ReconcileOutcome, prepare_section};
