use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::device::Device;
use super::integration::FromIntegrationReceiver;
use super::integration::FromIntegrationSender;
use super::integration::Integration;
use super::integration::ToIntegrationSender;
use super::message::EntityInfo;
use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use super::state::HumidifierState;
use super::state::State;
use crate::engine::IntegrationContext;

/// Errors raised while routing commands to integrations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no integration found for entity: {0}")]
    UnknownEntity(String),

    #[error("integration channel not found: {0}")]
    IntegrationUnavailable(String),

    #[error("integration {0} is no longer accepting commands")]
    ChannelClosed(String),
}

/// The engine
///
/// This structure owns the integrations, routes commands to the integration
/// that owns the target entity, and maintains a view of the world with State.
pub struct Engine {
    /// Centralized state snapshot (readers load the Arc, writer stores a new one)
    state: ArcSwap<State>,

    /// Map of entity_id -> integration name for routing messages
    entity_integration_map: std::sync::Mutex<HashMap<String, String>>,

    /// Communication channels to integrations (for commands)
    integration_channels: std::sync::Mutex<HashMap<String, ToIntegrationSender>>,

    /// Receive messages from integrations (events)
    message_rx: Mutex<FromIntegrationReceiver>,

    /// Sender for integrations to report events back to the engine
    message_tx: FromIntegrationSender,

    /// Handles for integration tasks
    integration_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Capacity for the integration->engine message channel
const FROM_INTEGRATION_CHANNEL_SIZE: usize = 1024;

impl Engine {
    /// Create a new Engine instance
    pub fn new() -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_INTEGRATION_CHANNEL_SIZE);
        Self {
            state: ArcSwap::new(Arc::default()),
            entity_integration_map: std::sync::Mutex::new(HashMap::new()),
            integration_channels: std::sync::Mutex::new(HashMap::new()),
            message_rx: Mutex::new(message_rx),
            message_tx,
            integration_handles: Mutex::new(Vec::new()),
        }
    }

    /// Register every integration whose factory accepts the configuration.
    pub async fn register_integrations_from_config(&self, cfg: &crate::config::Config) {
        let ctx = IntegrationContext { config: cfg };
        for constr in super::integration::REGISTRY {
            let integration = match constr(&ctx) {
                Ok(Some(i)) => i,
                Err(e) => {
                    error!("failed to setup integration: {:#}", e);
                    continue;
                }
                Ok(None) => continue,
            };
            let name = integration.name().to_string();
            self.register_integration(name, integration).await;
        }
    }

    /// Register an integration with the engine
    ///
    /// This spawns the integration in a background task, wires up channels,
    /// and starts its setup process.
    pub async fn register_integration(&self, name: String, mut integration: Box<dyn Integration>) {
        let (to_integration_tx, mut to_integration_rx) = mpsc::unbounded_channel();
        let from_integration_tx = self.message_tx.clone();

        if let Ok(mut channels) = self.integration_channels.lock() {
            channels.insert(name.clone(), to_integration_tx);
        }

        let handle = tokio::spawn(async move {
            if let Err(e) = integration.setup(from_integration_tx).await {
                warn!("Integration '{}' setup failed: {}", name, e);
                return;
            }

            // Process commands from engine until the channel is dropped
            while let Some(command) = to_integration_rx.recv().await {
                if let Err(e) = integration.handle_command(command).await {
                    warn!("Integration '{}' failed to handle command: {}", name, e);
                }
            }

            if let Err(e) = integration.shutdown().await {
                warn!("Integration '{}' shutdown failed: {}", name, e);
            }
        });

        self.integration_handles.lock().await.push(handle);
    }

    /// Send a command to an integration
    ///
    /// Routes the command to the integration that owns the target entity.
    pub fn send_command(&self, msg: ToIntegrationMessage) -> Result<(), Error> {
        let entity_id = msg.entity_id().to_string();

        let integration_name = self
            .entity_integration_map
            .lock()
            .ok()
            .and_then(|map| map.get(&entity_id).cloned())
            .ok_or_else(|| Error::UnknownEntity(entity_id.clone()))?;

        let channels = self
            .integration_channels
            .lock()
            .map_err(|_| Error::IntegrationUnavailable(integration_name.clone()))?;
        let tx = channels
            .get(&integration_name)
            .ok_or_else(|| Error::IntegrationUnavailable(integration_name.clone()))?;

        tx.send(msg)
            .map_err(|_| Error::ChannelClosed(integration_name.clone()))
    }

    /// Turn a humidifier on, optionally setting its target humidity
    pub fn turn_on_humidifier(&self, entity_id: String, humidity: Option<i64>) -> Result<(), Error> {
        self.send_command(ToIntegrationMessage::HumidifierTurnOn {
            entity_id,
            humidity,
        })
    }

    /// Set a humidifier's target humidity
    pub fn set_humidifier_humidity(&self, entity_id: String, humidity: i64) -> Result<(), Error> {
        self.send_command(ToIntegrationMessage::HumidifierSetHumidity {
            entity_id,
            humidity,
        })
    }

    /// Run the engine's main event loop
    ///
    /// Processes incoming events from integrations and updates state.
    pub async fn run(&self) {
        info!("Engine starting");

        let mut rx = self.message_rx.lock().await;
        while let Some(msg) = rx.recv().await {
            self.handle_event(msg);
        }

        info!("Engine shutting down");
    }

    /// Stop all integrations and wait for them to finish their shutdown.
    pub async fn shutdown(&self) {
        // Dropping the command senders ends each integration's command loop,
        // which then runs its own shutdown.
        if let Ok(mut channels) = self.integration_channels.lock() {
            channels.clear();
        }

        let handles = std::mem::take(&mut *self.integration_handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Integration task ended abnormally: {}", e);
            }
        }
    }

    /// Get a snapshot of the current engine state.
    ///
    /// Clones the `Arc` (atomic refcount bump), essentially free.
    pub fn state_snapshot(&self) -> Arc<State> {
        self.state.load_full()
    }

    /// Handle an event from an integration
    fn handle_event(&self, msg: FromIntegrationMessage) {
        match msg {
            FromIntegrationMessage::EntityDiscovered {
                entity_id,
                integration_name,
                info,
            } => {
                info!(
                    "Entity discovered: {} (from {})",
                    entity_id, integration_name
                );

                if let Ok(mut map) = self.entity_integration_map.lock() {
                    map.insert(entity_id.clone(), integration_name);
                }

                self.update_state(|state| Self::register_device(state, &entity_id, &info));
            }
            FromIntegrationMessage::EntityRemoved { entity_id } => {
                info!("Entity removed: {}", entity_id);

                self.update_state(|state| {
                    state.humidifiers.remove(&entity_id);
                    Self::unregister_device(state, &entity_id);
                });

                if let Ok(mut map) = self.entity_integration_map.lock() {
                    map.remove(&entity_id);
                }
            }
            FromIntegrationMessage::HumidifierStateChanged { entity_id, state } => {
                debug!(
                    "Humidifier state changed: {} -> on={}, humidity={:?}, available={}",
                    entity_id, state.is_on, state.humidity, state.available
                );

                self.update_state(|snapshot| {
                    snapshot.humidifiers.insert(entity_id, state);
                });
            }
        }
    }

    /// Copy-on-write update of the state snapshot
    fn update_state(&self, f: impl FnOnce(&mut State)) {
        let mut state = State::clone(&self.state.load());
        f(&mut state);
        self.state.store(Arc::new(state));
    }

    fn register_device(state: &mut State, entity_id: &str, info: &EntityInfo) {
        // A re-registration may move the entity to a different device
        Self::unregister_device(state, entity_id);

        let Some(device_info) = &info.device else {
            return;
        };
        let Some(device) = Device::from_info(device_info) else {
            warn!(
                "Ignoring device block for {}: no identifiers or connections",
                entity_id
            );
            return;
        };

        let entry = state
            .devices
            .entry(device.id.clone())
            .or_insert(device);
        entry.info = device_info.clone();
        entry.add_entity(entity_id.to_string());
    }

    fn unregister_device(state: &mut State, entity_id: &str) {
        state
            .devices
            .retain(|_, device| !device.remove_entity(entity_id));
    }

    /// Look up the rendered state of a single humidifier.
    pub fn humidifier(&self, entity_id: &str) -> Option<HumidifierState> {
        self.state.load().humidifiers.get(entity_id).cloned()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
