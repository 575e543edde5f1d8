//! Webhook registration and delivery gateway.
//!
//! Registers a callback URL with a provider, serves it over HTTP, validates
//! each callback and hands it to a downstream [`Pipeline`] at most once.
//! Shutdown stops the listener before unregistering.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod pipeline;
pub mod provider;
pub mod registration;
pub mod types;
pub mod verification;

pub use config::{ProviderConfig, RetryConfig, WebhookConfig};
pub use dispatcher::{Dispatcher, PendingDelivery, Pipeline};
pub use error::{ConfigError, GatewayError, PipelineError, RegistrationError, ValidationError};
pub use gateway::{Gateway, GatewayState, WebhookCapable};
pub use pipeline::{ChannelPipeline, JsonLinesPipeline};
pub use provider::RestRegistrationApi;
pub use registration::{RegistrationApi, RegistrationClient, UnregisterError};
pub use types::{CallbackRecord, DeliveryReason, DeliveryResult, InboundCallback, RegistrationHandle};
pub use verification::SignatureScheme;
