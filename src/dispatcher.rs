//! Handoff of validated callbacks to the downstream pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::types::{DeliveryResult, InboundCallback};

/// The processing pipeline the gateway feeds.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Take ownership of one callback. `Err(PipelineError::Busy)` signals
    /// backpressure; the gateway does not retry.
    async fn accept(&self, callback: InboundCallback) -> Result<(), PipelineError>;
}

/// Submits callbacks to a [`Pipeline`], bounding the number in flight.
#[derive(Clone)]
pub struct Dispatcher {
    pipeline: Arc<dyn Pipeline>,
    in_flight: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<dyn Pipeline>, max_in_flight: usize) -> Self {
        Self {
            pipeline,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
        }
    }

    /// Submit and wait for the pipeline's answer.
    pub async fn submit(&self, callback: InboundCallback) -> DeliveryResult {
        match self.dispatch(callback) {
            Ok(pending) => pending.wait().await,
            Err(rejected) => rejected,
        }
    }

    /// Admit a callback without waiting for the pipeline.
    ///
    /// Returns the rejection right away when no in-flight slot is free.
    /// Otherwise the delivery runs on its own task; dropping the returned
    /// [`PendingDelivery`] leaves it running.
    pub fn dispatch(&self, callback: InboundCallback) -> Result<PendingDelivery, DeliveryResult> {
        let permit = match self.in_flight.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(callback_id = %callback.id, "dispatcher saturated, rejecting callback");
                return Err(DeliveryResult::backpressure());
            }
        };

        let id = callback.id;
        let pipeline = self.pipeline.clone();
        let task = tokio::spawn(async move {
            let result = match pipeline.accept(callback).await {
                Ok(()) => DeliveryResult::accepted(),
                Err(PipelineError::Busy) => DeliveryResult::backpressure(),
                Err(PipelineError::Failed(msg)) => DeliveryResult::failed(msg),
            };
            drop(permit);
            if result.accepted {
                debug!(callback_id = %id, "delivery accepted");
            } else {
                warn!(callback_id = %id, reason = ?result.reason, "delivery rejected");
            }
            result
        });

        Ok(PendingDelivery { id, task })
    }

    pub fn available_slots(&self) -> usize {
        self.in_flight.available_permits()
    }
}

/// A delivery that has been admitted and is running.
pub struct PendingDelivery {
    id: Uuid,
    task: JoinHandle<DeliveryResult>,
}

impl PendingDelivery {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn wait(self) -> DeliveryResult {
        // A panicking pipeline surfaces as a failed delivery.
        self.task
            .await
            .unwrap_or_else(|e| DeliveryResult::failed(format!("pipeline task aborted: {e}")))
    }

    /// Wait for the outcome; on `&mut` so a timed-out wait can be abandoned
    /// without cancelling the delivery.
    pub async fn wait_mut(&mut self) -> DeliveryResult {
        (&mut self.task)
            .await
            .unwrap_or_else(|e| DeliveryResult::failed(format!("pipeline task aborted: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeliveryReason;
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn callback(body: &'static str) -> InboundCallback {
        InboundCallback::new(Method::POST, "/hooks/x", HeaderMap::new(), Bytes::from_static(body.as_bytes()), None)
    }

    struct CountingPipeline {
        calls: AtomicUsize,
        answer: Result<(), PipelineError>,
    }

    #[async_trait]
    impl Pipeline for CountingPipeline {
        async fn accept(&self, _callback: InboundCallback) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    /// Blocks every delivery until released.
    struct GatedPipeline {
        gate: Notify,
        started: AtomicUsize,
    }

    #[async_trait]
    impl Pipeline for GatedPipeline {
        async fn accept(&self, _callback: InboundCallback) -> Result<(), PipelineError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_submit_accepted() {
        let pipeline = Arc::new(CountingPipeline {
            calls: AtomicUsize::new(0),
            answer: Ok(()),
        });
        let dispatcher = Dispatcher::new(pipeline.clone(), 4);

        let result = dispatcher.submit(callback("{}")).await;
        assert_eq!(result, DeliveryResult::accepted());
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.available_slots(), 4);
    }

    #[tokio::test]
    async fn test_busy_pipeline_is_backpressure_without_retry() {
        let pipeline = Arc::new(CountingPipeline {
            calls: AtomicUsize::new(0),
            answer: Err(PipelineError::Busy),
        });
        let dispatcher = Dispatcher::new(pipeline.clone(), 4);

        let result = dispatcher.submit(callback("{}")).await;
        assert!(!result.accepted);
        assert_eq!(result.reason, DeliveryReason::Backpressure);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_pipeline() {
        let pipeline = Arc::new(CountingPipeline {
            calls: AtomicUsize::new(0),
            answer: Err(PipelineError::Failed("disk full".into())),
        });
        let dispatcher = Dispatcher::new(pipeline, 4);

        let result = dispatcher.submit(callback("{}")).await;
        assert_eq!(result.reason, DeliveryReason::PipelineFailed("disk full".into()));
    }

    #[tokio::test]
    async fn test_saturated_dispatcher_rejects_immediately() {
        let pipeline = Arc::new(GatedPipeline {
            gate: Notify::new(),
            started: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(pipeline.clone(), 1);

        let first = dispatcher.dispatch(callback("1")).ok().unwrap();
        let second = dispatcher.dispatch(callback("2"));
        assert!(matches!(second, Err(r) if r.reason == DeliveryReason::Backpressure));

        while pipeline.started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        pipeline.gate.notify_one();
        assert!(first.wait().await.accepted);
        assert_eq!(dispatcher.available_slots(), 1);
        assert_eq!(pipeline.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_wait_keeps_delivery_running() {
        let pipeline = Arc::new(GatedPipeline {
            gate: Notify::new(),
            started: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(pipeline.clone(), 2);

        let mut pending = dispatcher.dispatch(callback("1")).ok().unwrap();
        let timed = tokio::time::timeout(std::time::Duration::from_millis(20), pending.wait_mut()).await;
        assert!(timed.is_err());

        pipeline.gate.notify_one();
        assert!(pending.wait().await.accepted);
    }
}
