//! Core model for kata: manifests, layered environments, deployment modes,
//! compose descriptors and host-local locking.

pub mod descriptor;
pub mod env;
pub mod error;
pub mod expand;
pub mod lock;
pub mod manifest;
pub mod mode;
pub mod paths;

pub use descriptor::{DependencyDigests, Descriptor, DescriptorGenerator, qualified_secret_name};
pub use env::{EnvironmentResolver, Identity, ResolvedEnvironment};
pub use error::{CoreError, ErrorKind};
pub use lock::LockGuard;
pub use manifest::{AppManifest, EnvEntries, ServiceSpec};
pub use mode::{ClusterProbe, DeploymentMode, ModeChange, ModeResolution, ModeSelector, ModeSource, ModeStore};
pub use paths::{AppPaths, HostLayout, sanitize_app_name};
