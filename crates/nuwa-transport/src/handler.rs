//! Connection handler - executes requests and forwards watched changes

use nuwa_protocol::{ErrorCode, LineCodec, ProtocolError, Request, Response};
use nuwa_storage::RemoteStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Handles a single client connection
pub struct ConnectionHandler {
    /// Unique client ID
    pub client_id: String,
    store: Arc<dyn RemoteStore>,
    codec: LineCodec,
    /// One forwarding task per watched key
    watches: HashMap<String, JoinHandle<()>>,
    updates_tx: mpsc::UnboundedSender<Response>,
    closed: bool,
}

impl ConnectionHandler {
    /// Create a handler and the receiver of `changed` frames for its watches
    pub fn new(
        client_id: String,
        store: Arc<dyn RemoteStore>,
    ) -> (Self, mpsc::UnboundedReceiver<Response>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let handler = Self {
            client_id,
            store,
            codec: LineCodec::new(),
            watches: HashMap::new(),
            updates_tx,
            closed: false,
        };
        (handler, updates_rx)
    }

    /// Process incoming data and return responses
    pub async fn process(&mut self, data: &[u8]) -> Vec<Response> {
        let mut responses = Vec::new();

        if let Err(e) = self.codec.feed(data) {
            warn!(client = %self.client_id, error = %e, "Dropping connection");
            self.closed = true;
            responses.push(Response::error(None, ErrorCode::TOO_LARGE, e.to_string()));
            return responses;
        }

        loop {
            match self.codec.decode::<Request>() {
                Ok(Some(request)) => {
                    let response = self.handle_request(request).await;
                    responses.push(response);
                }
                Ok(None) => break,
                Err(ProtocolError::FrameTooLarge { size, max }) => {
                    self.closed = true;
                    responses.push(Response::error(
                        None,
                        ErrorCode::TOO_LARGE,
                        format!("frame of {} bytes exceeds {}", size, max),
                    ));
                    break;
                }
                Err(e) => {
                    debug!(client = %self.client_id, error = %e, "Malformed request");
                    responses.push(Response::error(None, ErrorCode::BAD_REQUEST, e.to_string()));
                }
            }
        }

        responses
    }

    /// Whether the connection must be closed after flushing responses
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn handle_request(&mut self, request: Request) -> Response {
        trace!(client = %self.client_id, request = ?request, "Processing request");

        match request {
            Request::Ping { id } => Response::pong(id),
            Request::Get { id, key } => match self.store.get(&key).await {
                Ok(snapshot) => Response::document(id, key, snapshot.and_then(|s| s.value())),
                Err(e) => Response::error(Some(id), ErrorCode::STORE, e.to_string()),
            },
            Request::Set { id, key, value } => match self.store.set(&key, value).await {
                Ok(()) => {
                    debug!(client = %self.client_id, key = %key, "Document written");
                    Response::ok(id)
                }
                Err(e) => Response::error(Some(id), ErrorCode::STORE, e.to_string()),
            },
            Request::Watch { id, key } => self.handle_watch(id, key).await,
        }
    }

    async fn handle_watch(&mut self, id: u64, key: String) -> Response {
        if self.watches.contains_key(&key) {
            return Response::ok(id);
        }

        let mut changes = match self.store.subscribe(&key).await {
            Ok(changes) => changes,
            Err(e) => return Response::error(Some(id), ErrorCode::STORE, e.to_string()),
        };

        let tx = self.updates_tx.clone();
        let watched = key.clone();
        let task = tokio::spawn(async move {
            while let Some(snapshot) = changes.recv().await {
                let Some(value) = snapshot.value() else {
                    continue;
                };
                if tx.send(Response::changed(watched.clone(), value)).is_err() {
                    break;
                }
            }
        });

        debug!(client = %self.client_id, key = %key, "Watching document");
        self.watches.insert(key, task);
        Response::ok(id)
    }

    /// Number of keys this client watches
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Stop every watch forwarder
    pub fn cleanup(&mut self) {
        for (_, task) in self.watches.drain() {
            task.abort();
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nuwa_storage::MemoryRemoteStore;
    use serde_json::json;

    fn handler() -> (ConnectionHandler, mpsc::UnboundedReceiver<Response>) {
        ConnectionHandler::new("test".into(), Arc::new(MemoryRemoteStore::new()))
    }

    #[tokio::test]
    async fn test_get_set() {
        let (mut handler, _updates) = handler();

        let responses = handler
            .process(b"{\"op\":\"get\",\"id\":1,\"key\":\"/a\"}\n{\"op\":\"set\",\"id\":2,\"key\":\"/a\",\"value\":{\"n\":1}}\n{\"op\":\"get\",\"id\":3,\"key\":\"/a\"}\n")
            .await;

        assert_eq!(
            responses,
            vec![
                Response::document(1, "/a", None),
                Response::ok(2),
                Response::document(3, "/a", Some(json!({"n": 1}))),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_request_keeps_connection() {
        let (mut handler, _updates) = handler();

        let responses = handler.process(b"{\"op\":\"drop\"}\n{\"op\":\"ping\",\"id\":4}\n").await;
        assert_eq!(responses.len(), 2);
        assert!(matches!(&responses[0], Response::Error { id: None, code, .. } if code == ErrorCode::BAD_REQUEST));
        assert_eq!(responses[1], Response::pong(4));
        assert!(!handler.is_closed());
    }

    #[tokio::test]
    async fn test_watch_forwards_changes() {
        let store = Arc::new(MemoryRemoteStore::new());
        let (mut handler, mut updates) = ConnectionHandler::new("w".into(), store.clone());

        let responses = handler.process(b"{\"op\":\"watch\",\"id\":1,\"key\":\"/a\"}\n").await;
        assert_eq!(responses, vec![Response::ok(1)]);
        handler.process(b"{\"op\":\"watch\",\"id\":2,\"key\":\"/a\"}\n").await;
        assert_eq!(handler.watch_count(), 1);

        store.set("/a", json!(5)).await.unwrap();
        assert_eq!(updates.recv().await, Some(Response::changed("/a", json!(5))));

        handler.cleanup();
        assert_eq!(handler.watch_count(), 0);
    }
}
