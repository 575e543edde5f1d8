//! Lifecycle control: couples the upstream registration to the listener.
//!
//! Startup binds the socket, registers the callback URL and only then starts
//! serving. Shutdown stops the listener first and unregisters afterwards, so
//! the route is never served while the provider believes it is gone.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Method;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::config::WebhookConfig;
use crate::dispatcher::{Dispatcher, Pipeline};
use crate::error::{ConfigError, GatewayError};
use crate::listener::{self, ListenerHandle};
use crate::registration::{RegistrationApi, RegistrationClient, UnregisterError};
use crate::types::RegistrationHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Stopped,
    Registering,
    Listening,
    Stopping,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GatewayState::Stopped => "stopped",
            GatewayState::Registering => "registering",
            GatewayState::Listening => "listening",
            GatewayState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// A target that can both register callbacks and process them.
pub trait WebhookCapable: RegistrationApi + Pipeline {
    /// Methods the target's provider sends with. `None` keeps the configured set.
    fn webhook_methods(&self) -> Option<Vec<Method>> {
        None
    }

    /// Called once with the gateway configuration before the gateway is built.
    fn webhook_configured(&self, _config: &WebhookConfig) {}
}

#[derive(Default)]
struct Running {
    registration: Option<RegistrationHandle>,
    listener: Option<ListenerHandle>,
    callback_url: Option<String>,
}

pub struct Gateway {
    config: Arc<WebhookConfig>,
    methods: Vec<Method>,
    dispatcher: Dispatcher,
    registration: Option<RegistrationClient>,
    state: watch::Sender<GatewayState>,
    running: Mutex<Running>,
}

impl Gateway {
    /// Build a stopped gateway feeding `pipeline`. Validates `config`.
    pub fn new(config: WebhookConfig, pipeline: Arc<dyn Pipeline>) -> Result<Self, GatewayError> {
        config.validate()?;
        let methods = config.allowed_methods()?;
        let dispatcher = Dispatcher::new(pipeline, config.max_in_flight);
        let (state, _) = watch::channel(GatewayState::Stopped);

        Ok(Self {
            config: Arc::new(config),
            methods,
            dispatcher,
            registration: None,
            state,
            running: Mutex::new(Running::default()),
        })
    }

    /// Attach the provider registration capability.
    pub fn with_registration(mut self, api: Arc<dyn RegistrationApi>) -> Self {
        self.registration = Some(RegistrationClient::new(
            api,
            self.config.retry.clone(),
            self.config.unregister_timeout(),
        ));
        self
    }

    /// Build a gateway whose registration and pipeline are the same target.
    pub fn for_capable<T>(config: WebhookConfig, target: Arc<T>) -> Result<Self, GatewayError>
    where
        T: WebhookCapable + 'static,
    {
        target.webhook_configured(&config);
        let declared = target.webhook_methods();
        let mut gateway = Self::new(config, target.clone())?.with_registration(target);
        if let Some(methods) = declared.filter(|m| !m.is_empty()) {
            gateway.methods = methods;
        }
        Ok(gateway)
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    pub fn state(&self) -> GatewayState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<GatewayState> {
        self.state.subscribe()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .await
            .listener
            .as_ref()
            .map(ListenerHandle::local_addr)
    }

    /// URL registered with (or to be given to) the provider while listening.
    pub async fn callback_url(&self) -> Option<String> {
        self.running.lock().await.callback_url.clone()
    }

    fn set_state(&self, next: GatewayState) {
        let prev = self.state.send_replace(next);
        info!(path = %self.config.full_path(), from = %prev, to = %next, "gateway state changed");
    }

    pub async fn start(&self) -> Result<(), GatewayError> {
        let mut running = self.running.lock().await;
        let current = self.state();
        if current != GatewayState::Stopped {
            return Err(GatewayError::InvalidState {
                operation: "start",
                state: current,
            });
        }

        let client = match (self.config.auto_register, &self.registration) {
            (true, Some(client)) => Some(client),
            (true, None) => {
                return Err(ConfigError::InvalidValue {
                    field: "auto_register".to_string(),
                    message: "requires a registration capability".to_string(),
                }
                .into())
            }
            (false, _) => None,
        };

        // Bind and build the router before registering: the callback URL
        // names the real port, and only serving can fail after the provider
        // call. Nothing is served until registration succeeds.
        let socket = listener::bind(&self.config.bind_address).await?;
        let local_addr = socket.local_addr().map_err(|source| GatewayError::Bind {
            address: self.config.bind_address.clone(),
            source,
        })?;
        let url = self.config.callback_url(local_addr);
        let router = listener::router(
            self.config.clone(),
            self.methods.clone(),
            self.dispatcher.clone(),
        );

        if let Some(client) = client {
            self.set_state(GatewayState::Registering);
            match client.register(&url, self.config.secret.as_deref()).await {
                Ok(handle) => running.registration = Some(handle),
                Err(e) => {
                    error!(%url, error = %e, "registration failed, gateway not started");
                    self.set_state(GatewayState::Stopped);
                    return Err(e.into());
                }
            }
        }

        let handle = match listener::serve(socket, router, self.config.max_connections) {
            Ok(handle) => handle,
            Err(e) => {
                if let (Some(handle), Some(client)) = (running.registration.take(), client) {
                    if let Err(undo) = client.unregister(handle).await {
                        warn!(%url, error = %undo, "rollback unregister failed");
                    }
                }
                self.set_state(GatewayState::Stopped);
                return Err(e);
            }
        };

        running.listener = Some(handle);
        running.callback_url = Some(url);
        self.set_state(GatewayState::Listening);
        Ok(())
    }

    /// Stop serving, then unregister. Stopping a stopped gateway is a no-op.
    ///
    /// The gateway always ends up `Stopped`; the first drain or unregister
    /// problem is returned.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        let mut running = self.running.lock().await;
        match self.state() {
            GatewayState::Stopped => return Ok(()),
            GatewayState::Listening => {}
            other => {
                return Err(GatewayError::InvalidState {
                    operation: "stop",
                    state: other,
                })
            }
        }
        self.set_state(GatewayState::Stopping);

        let drained = match running.listener.take() {
            Some(listener) => listener.shutdown(self.config.drain_grace()).await,
            None => Ok(()),
        };
        running.callback_url = None;

        let unregistered = match (running.registration.take(), &self.registration) {
            (Some(handle), Some(client)) => match client.unregister(handle).await {
                Ok(()) => Ok(()),
                Err(UnregisterError::Failed(e)) => Err(GatewayError::Registration(e)),
                Err(UnregisterError::TimedOut) => Err(GatewayError::ShutdownTimeout("unregister")),
            },
            _ => Ok(()),
        };

        self.set_state(GatewayState::Stopped);
        drained.and(unregistered)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if self.state() == GatewayState::Listening {
            warn!(path = %self.config.full_path(), "gateway dropped while listening; registration left in place");
        }
    }
}
