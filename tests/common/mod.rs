#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use webhook_gateway::{
    InboundCallback, Pipeline, PipelineError, RegistrationApi, RegistrationError, RetryConfig,
    WebhookConfig,
};

/// In-memory provider that tracks live registrations.
#[derive(Default)]
pub struct MockProvider {
    pub register_calls: AtomicUsize,
    pub unregister_calls: AtomicUsize,
    pub active: Mutex<HashSet<String>>,
    pub urls: Mutex<Vec<String>>,
    pub failures: Mutex<VecDeque<RegistrationError>>,
    pub unregister_failure: Mutex<Option<RegistrationError>>,
    pub unregister_delay: Mutex<Option<Duration>>,
}

impl MockProvider {
    pub fn failing(failures: Vec<RegistrationError>) -> Arc<Self> {
        let provider = Self::default();
        *provider.failures.lock().unwrap() = failures.into();
        Arc::new(provider)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

#[async_trait]
impl RegistrationApi for MockProvider {
    async fn register(&self, url: &str, _secret: Option<&str>) -> Result<String, RegistrationError> {
        let n = self.register_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let id = format!("wh_{n}");
        self.active.lock().unwrap().insert(id.clone());
        self.urls.lock().unwrap().push(url.to_string());
        Ok(id)
    }

    async fn unregister(&self, handle_id: &str) -> Result<(), RegistrationError> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.unregister_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active.lock().unwrap().remove(handle_id);
        match self.unregister_failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Pipeline that holds each delivery until `release` is notified.
#[derive(Default)]
pub struct GatedPipeline {
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
    pub release: Notify,
}

#[async_trait]
impl Pipeline for GatedPipeline {
    async fn accept(&self, _callback: InboundCallback) -> Result<(), PipelineError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn config(path: &str) -> WebhookConfig {
    WebhookConfig {
        path: Some(path.to_string()),
        bind_address: "127.0.0.1:0".to_string(),
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
        },
        drain_grace_ms: 2_000,
        unregister_timeout_ms: 500,
        ..Default::default()
    }
}

pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
