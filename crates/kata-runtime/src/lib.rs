//! Container backends for kata.
//!
//! [`ContainerBackend`] is the seam the pipeline talks to. [`CliBackend`]
//! shells out to the container engine; [`StubBackend`] records calls for tests.

pub mod backend;
pub mod cli;
pub mod error;
pub mod stub;

pub use backend::{BackendOutput, ContainerBackend, LogOptions, StackRef};
pub use cli::CliBackend;
pub use error::BackendError;
pub use stub::{BackendCall, StubBackend};
