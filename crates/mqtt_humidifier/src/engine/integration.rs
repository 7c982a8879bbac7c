//! The seam between the engine and the integrations it hosts.

use std::error::Error;

use async_trait::async_trait;
use linkme::distributed_slice;
use tokio::sync::mpsc;

use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use crate::config::Config;

/// Entity events flow to the engine over a bounded channel, so a chatty
/// broker applies backpressure instead of growing memory.
pub type FromIntegrationSender = mpsc::Sender<FromIntegrationMessage>;
pub type FromIntegrationReceiver = mpsc::Receiver<FromIntegrationMessage>;

/// Commands flow to integrations unbounded; routing a command never waits.
pub type ToIntegrationSender = mpsc::UnboundedSender<ToIntegrationMessage>;

/// Error type crossing the integration seam
pub type IntegrationError = Box<dyn Error + Send>;

/// Result type for integration factory functions
pub type IntegrationFactoryResult = anyhow::Result<Option<Box<dyn Integration>>>;

/// What a factory gets to look at when deciding whether to start
pub struct IntegrationContext<'a> {
    pub config: &'a Config,
}

/// Every integration contributes a factory here; factories return `Ok(None)`
/// when their section is absent from the config.
#[distributed_slice]
pub static REGISTRY: [fn(&IntegrationContext) -> IntegrationFactoryResult];

#[async_trait]
pub trait Integration: Send + Sync {
    /// Name commands are routed by
    fn name(&self) -> &str;

    /// Connect, then add configured entities and report them on `events`.
    async fn setup(&mut self, events: FromIntegrationSender) -> Result<(), IntegrationError>;

    /// Carry out a command addressed to one of this integration's entities
    async fn handle_command(
        &mut self,
        command: ToIntegrationMessage,
    ) -> Result<(), IntegrationError>;

    /// Remove every entity and release its broker subscriptions
    async fn shutdown(&mut self) -> Result<(), IntegrationError>;
}
