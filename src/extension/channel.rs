//! Async request/response channel in front of an [`ExtensionExecutor`].
//!
//! The executor and its document are synchronous, so they live on a blocking
//! worker; callers just await [`ExtensionHandle::send`].

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::executor::{Document, ExtensionExecutor};
use super::protocol::{ExtensionRequest, ExtensionResponse};

const CHANNEL_CAPACITY: usize = 32;

type Envelope = (ExtensionRequest, oneshot::Sender<ExtensionResponse>);

#[derive(Clone)]
pub struct ExtensionHandle {
    tx: mpsc::Sender<Envelope>,
}

impl ExtensionHandle {
    /// Move the executor onto a blocking worker. The worker exits once every
    /// handle is dropped.
    pub fn spawn<D>(mut executor: ExtensionExecutor<D>) -> (Self, JoinHandle<()>)
    where
        D: Document + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);
        let worker = tokio::task::spawn_blocking(move || {
            info!("extension executor started");
            while let Some((request, reply)) = rx.blocking_recv() {
                let response = executor.handle(request);
                if reply.send(response).is_err() {
                    warn!("extension caller went away before the response");
                }
            }
            info!("extension executor stopped");
        });
        (Self { tx }, worker)
    }

    pub async fn send(&self, request: ExtensionRequest) -> ExtensionResponse {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send((request, reply_tx)).await.is_err() {
            return ExtensionResponse::error("Extension disconnected");
        }
        reply_rx
            .await
            .unwrap_or_else(|_| ExtensionResponse::error("Extension disconnected"))
    }

    /// Parse and send an untyped message.
    pub async fn send_value(&self, raw: Value) -> ExtensionResponse {
        match serde_json::from_value::<ExtensionRequest>(raw) {
            Ok(request) => self.send(request).await,
            Err(e) => ExtensionResponse::error(format!("Invalid message: {}", e)),
        }
    }
}
