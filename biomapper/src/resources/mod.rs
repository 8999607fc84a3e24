//! Resource management.
//!
//! This module provides:
//! - Resource configuration and status types
//! - The [`ResourceProbe`] interface with closure, container and HTTP probes
//! - The [`ResourceManager`] with preflight checks, recovery and monitoring
//! - The static action to resource [`RequirementTable`]

mod container;
#[cfg(feature = "http-probes")]
mod http;
mod manager;
mod monitor;
mod probe;
mod requirements;
mod types;

pub use container::{ContainerProbe, ContainerRuntime, ContainerSpec, ContainerState, DockerCli};
#[cfg(feature = "http-probes")]
pub use http::HttpProbe;
pub use manager::ResourceManager;
pub use probe::{FnProbe, ProbeError, ProbeRegistry, ProbeReport, ResourceProbe};
pub use requirements::{RequirementTable, EXTERNAL_API, METADATA_STORE, VECTOR_STORE};
pub use types::{
    ManagedResource, RecoveryAttempt, ResourceConfig, ResourceStatus, ResourceType, MAX_INTERVAL_SECONDS,
};
