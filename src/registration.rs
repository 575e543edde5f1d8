//! Registration of the callback URL with the remote provider.
//!
//! [`RegistrationApi`] is the provider-specific capability. [`RegistrationClient`]
//! wraps it with the gateway's guarantees: one active registration per URL,
//! bounded retries for transient failures, and a time limit on unregistering.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::RegistrationError;
use crate::types::RegistrationHandle;

/// Provider-side registration capability.
#[async_trait]
pub trait RegistrationApi: Send + Sync {
    /// Register `url`, returning the provider's identifier for it.
    async fn register(&self, url: &str, secret: Option<&str>) -> Result<String, RegistrationError>;

    async fn unregister(&self, handle_id: &str) -> Result<(), RegistrationError>;
}

pub struct RegistrationClient {
    api: Arc<dyn RegistrationApi>,
    retry: RetryConfig,
    unregister_timeout: Duration,
    active: Mutex<HashSet<String>>,
}

impl RegistrationClient {
    pub fn new(api: Arc<dyn RegistrationApi>, retry: RetryConfig, unregister_timeout: Duration) -> Self {
        Self {
            api,
            retry,
            unregister_timeout,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Register `url`, retrying transient failures with exponential backoff.
    ///
    /// Fails with [`RegistrationError::AlreadyRegistered`] if this client
    /// already holds a live registration for the same URL.
    pub async fn register(
        &self,
        url: &str,
        secret: Option<&str>,
    ) -> Result<RegistrationHandle, RegistrationError> {
        // Held across the provider call so concurrent registers for the same
        // URL cannot both reach the provider.
        let mut active = self.active.lock().await;
        if active.contains(url) {
            return Err(RegistrationError::AlreadyRegistered(url.to_string()));
        }

        let id = self
            .with_retry(url, "registration", || self.api.register(url, secret))
            .await?;

        active.insert(url.to_string());
        info!(url, handle = %id, "callback registered");
        Ok(RegistrationHandle::new(id, url.to_string()))
    }

    /// Unregister, consuming the handle. Transient failures are retried like
    /// registration, all within the configured timeout.
    ///
    /// The handle is released locally whatever the provider answers, so a
    /// later `register` for the same URL is never blocked by a failed cleanup.
    pub async fn unregister(&self, handle: RegistrationHandle) -> Result<(), UnregisterError> {
        self.active.lock().await.remove(handle.url());

        let attempts =
            self.with_retry(handle.url(), "unregister", || self.api.unregister(handle.id()));
        let result = tokio::time::timeout(self.unregister_timeout, attempts).await;
        match result {
            Ok(Ok(())) => {
                info!(url = handle.url(), handle = handle.id(), "callback unregistered");
                Ok(())
            }
            Ok(Err(e)) => Err(UnregisterError::Failed(e)),
            Err(_) => {
                warn!(url = handle.url(), timeout = ?self.unregister_timeout, "unregister timed out");
                Err(UnregisterError::TimedOut)
            }
        }
    }

    /// Run `call`, retrying transient failures with exponential backoff.
    async fn with_retry<T, F, Fut>(
        &self,
        url: &str,
        action: &str,
        mut call: F,
    ) -> Result<T, RegistrationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistrationError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(url, action, attempt, error = %e, ?delay, "provider call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(url, action, attempt, error = %e, "provider call failed");
                    return Err(e);
                }
            }
        }
    }

    pub async fn is_registered(&self, url: &str) -> bool {
        let registered = self.active.lock().await.contains(url);
        debug!(url, registered, "registration lookup");
        registered
    }
}

/// Why an unregister did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnregisterError {
    #[error(transparent)]
    Failed(RegistrationError),

    #[error("unregister timed out")]
    TimedOut,
}

#[cfg(test)]
#[path = "registration_tests.rs"]
mod tests;
