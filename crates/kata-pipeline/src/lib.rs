//! Deployment pipeline for kata.
//!
//! A run is triggered by a push (via the post-receive hook) or an operator
//! request and walks `received -> resolved -> generated -> routed -> started`.

pub mod checkout;
pub mod config;
pub mod error;
pub mod hook;
pub mod pipeline;
pub mod types;

pub use checkout::{GitCheckout, SourceSync, hook_script};
pub use config::{KataConfig, default_root};
pub use error::PipelineError;
pub use hook::{RefUpdate, deploy_target, parse_hook_input};
pub use pipeline::DeploymentPipeline;
pub use types::{DeployReport, PipelineState, Trigger};
