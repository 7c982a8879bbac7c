mod device;
#[allow(clippy::module_inception)]
mod engine;
mod integration;
mod message;
pub mod state;

pub use device::Device;
pub use device::DeviceInfo;
pub use engine::Engine;
pub use engine::Error;
pub use integration::FromIntegrationSender;
pub use integration::Integration;
pub use integration::IntegrationContext;
pub use integration::IntegrationError;
pub use integration::IntegrationFactoryResult;
pub use integration::REGISTRY as INTEGRATION_REGISTRY;
pub use message::EntityInfo;
pub use message::FromIntegrationMessage;
pub use message::ToIntegrationMessage;
pub use state::HumidifierState;
pub use state::State;
