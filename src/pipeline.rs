//! Ready-made [`Pipeline`] implementations.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::dispatcher::Pipeline;
use crate::error::PipelineError;
use crate::types::InboundCallback;

/// Feeds callbacks into a bounded channel. A full or closed channel is busy.
pub struct ChannelPipeline {
    tx: mpsc::Sender<InboundCallback>,
}

impl ChannelPipeline {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InboundCallback>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Pipeline for ChannelPipeline {
    async fn accept(&self, callback: InboundCallback) -> Result<(), PipelineError> {
        self.tx.try_send(callback).map_err(|_| PipelineError::Busy)
    }
}

/// Writes each callback as one JSON line.
pub struct JsonLinesPipeline<W> {
    out: Mutex<W>,
}

impl<W> JsonLinesPipeline<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W> Pipeline for JsonLinesPipeline<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn accept(&self, callback: InboundCallback) -> Result<(), PipelineError> {
        let mut line = serde_json::to_vec(&callback.to_record())
            .map_err(|e| PipelineError::Failed(format!("serialize callback: {e}")))?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| PipelineError::Failed(format!("write callback: {e}")))?;
        out.flush()
            .await
            .map_err(|e| PipelineError::Failed(format!("flush callback: {e}")))
    }
}
