//! Backend-agnostic runtime abstraction
//!
//! A [`Runtime`] creates and controls one bot instance on one kind of backend.
//! Backends register a constructor under their discriminator string with the
//! [`RuntimeRegistry`]; nothing outside a backend module knows which backends exist.

pub mod cluster;
pub mod container;
pub mod local;
pub mod registry;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::models::{CreateSpec, Endpoint, RuntimeHandle, StatusSnapshot};

pub use registry::{RegistryBuilder, RuntimeConstructor, RuntimeRegistry};

/// Capability set every backend implements for a single bot instance.
///
/// Lifecycle operations are never retried internally; callers decide.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Backend discriminator this runtime is registered under
    fn kind(&self) -> &'static str;

    /// Allocate the bot on the backend. Does not start it.
    async fn create(&self, bot_name: &str, spec: &CreateSpec) -> Result<RuntimeHandle, RuntimeError>;

    async fn start(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError>;

    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError>;

    async fn restart(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError>;

    /// Current health and resource usage.
    ///
    /// `NotFound` when the backend no longer knows the handle,
    /// `Transient` when the backend could not be reached.
    async fn inspect(&self, handle: &RuntimeHandle) -> Result<StatusSnapshot, RuntimeError>;

    /// Where the bot's HTTP API can be reached right now.
    /// `Ok(None)` while the bot is stopped or still starting.
    async fn resolve_endpoint(&self, handle: &RuntimeHandle) -> Result<Option<Endpoint>, RuntimeError>;
}

/// Register every backend compiled into this binary.
///
/// Each backend module owns its discriminator and constructor; adding a backend
/// means adding its module and one line here.
pub fn register_builtin_backends(builder: &mut RegistryBuilder) {
    local::register(builder);
    container::register(builder);
    cluster::register(builder);
}
