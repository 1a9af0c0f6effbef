//! Compile worker hook

use crate::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Request handed to an external compile worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    pub app_id: String,
    pub draft_id: String,
    pub compiled_id: String,
    pub triggered_at: u64,
}

/// External compiler invoked when a pipeline is triggered.
/// Invocations are fire-and-forget from the engine's point of view.
#[async_trait]
pub trait CompileWorker: Send + Sync {
    async fn invoke(&self, request: CompileRequest) -> Result<(), StorageError>;
}

/// Worker that forwards requests to a channel
pub struct ChannelCompileWorker {
    tx: mpsc::UnboundedSender<CompileRequest>,
}

impl ChannelCompileWorker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CompileRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CompileWorker for ChannelCompileWorker {
    async fn invoke(&self, request: CompileRequest) -> Result<(), StorageError> {
        self.tx
            .send(request)
            .map_err(|_| StorageError::Worker("compile queue closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompileRequest {
        CompileRequest {
            app_id: "app".into(),
            draft_id: "d1".into(),
            compiled_id: "compiled-d1-1-abcdef".into(),
            triggered_at: 1,
        }
    }

    #[tokio::test]
    async fn test_channel_worker() {
        let (worker, mut rx) = ChannelCompileWorker::new();
        worker.invoke(request()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), request());

        drop(rx);
        assert!(matches!(
            worker.invoke(request()).await,
            Err(StorageError::Worker(_))
        ));
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_value(request()).unwrap();
        assert_eq!(json["draftId"], "d1");
        assert_eq!(json["triggeredAt"], 1);
    }
}
