//! Generic REST registration adapter.
//!
//! Registers with `POST <registration_url>` and a `{"url", "secret"}` body,
//! expecting `{"id": ...}` back, and unregisters with
//! `DELETE <registration_url>/<id>`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::ProviderConfig;
use crate::error::RegistrationError;
use crate::registration::RegistrationApi;

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    id: String,
}

pub struct RestRegistrationApi {
    client: Client,
    registration_url: Url,
    bearer_token: Option<String>,
}

impl RestRegistrationApi {
    pub fn new(config: &ProviderConfig) -> Result<Self, RegistrationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RegistrationError::Permanent(format!("http client: {e}")))?;

        let mut registration_url = Url::parse(&config.registration_url)
            .map_err(|e| RegistrationError::Permanent(format!("registration_url: {e}")))?;
        registration_url
            .path_segments_mut()
            .map_err(|_| RegistrationError::Permanent("registration_url cannot be a base".into()))?
            .pop_if_empty();

        Ok(Self {
            client,
            registration_url,
            bearer_token: config.bearer_token.clone(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map a non-success provider status onto the registration taxonomy.
fn classify(status: StatusCode, body: &str, url: &str) -> RegistrationError {
    if status == StatusCode::CONFLICT {
        RegistrationError::AlreadyRegistered(url.to_string())
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RegistrationError::Transient(format!("HTTP {status}: {body}"))
    } else {
        RegistrationError::Permanent(format!("HTTP {status}: {body}"))
    }
}

#[async_trait]
impl RegistrationApi for RestRegistrationApi {
    async fn register(&self, url: &str, secret: Option<&str>) -> Result<String, RegistrationError> {
        let request = self
            .client
            .post(self.registration_url.clone())
            .json(&RegisterRequest { url, secret });

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| RegistrationError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body, url));
        }

        let parsed: RegisterResponse = response
            .json()
            .await
            .map_err(|e| RegistrationError::Permanent(format!("unexpected response: {e}")))?;
        debug!(url, id = %parsed.id, "provider accepted registration");
        Ok(parsed.id)
    }

    async fn unregister(&self, handle_id: &str) -> Result<(), RegistrationError> {
        let mut target = self.registration_url.clone();
        target
            .path_segments_mut()
            .map_err(|_| RegistrationError::Permanent("registration_url cannot be a base".into()))?
            .push(handle_id);
        let response = self
            .authorize(self.client.delete(target.clone()))
            .send()
            .await
            .map_err(|e| RegistrationError::Transient(e.to_string()))?;

        let status = response.status();
        // Already gone upstream counts as unregistered.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body, target.as_str()))
    }
}
