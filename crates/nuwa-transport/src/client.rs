//! Network remote store speaking to a [`crate::RelayServer`]

use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use nuwa_protocol::{encode, LineCodec, Request, Response};
use nuwa_storage::{RemoteSnapshot, RemoteStore, SnapshotStream, StorageError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default time to wait for the reply to one request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Shared {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    watchers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<RemoteSnapshot>>>>,
}

/// Remote store backed by a TCP relay connection.
///
/// Requests are multiplexed over one connection and matched to replies by
/// id. Transactions are not supported.
pub struct TcpRemoteStore {
    shared: Arc<Shared>,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl TcpRemoteStore {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(write_half),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        });
        let reader = tokio::spawn(read_loop(read_half, shared.clone()));

        info!(relay = %peer, "Connected to relay");
        Ok(Self {
            shared,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            reader,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn ping(&self) -> TransportResult<()> {
        match self.request(Request::ping).await? {
            Response::Pong { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn request(&self, build: impl FnOnce(u64) -> Request) -> TransportResult<Response> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode(&build(id))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let sent = async {
            let mut writer = self.shared.writer.lock().await;
            writer.write_all(&frame).await
        }
        .await;
        if let Err(e) = sent {
            self.shared.pending.lock().remove(&id);
            return Err(e.into());
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                return Err(TransportError::Timeout(self.timeout));
            }
        };

        match response {
            Response::Error { code, message, .. } => {
                Err(StorageError::Remote { code, message }.into())
            }
            response => Ok(response),
        }
    }
}

impl Drop for TcpRemoteStore {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl RemoteStore for TcpRemoteStore {
    async fn get(&self, key: &str) -> Result<Option<RemoteSnapshot>, StorageError> {
        match self.request(|id| Request::get(id, key)).await? {
            Response::Document { value, .. } => Ok(value.map(RemoteSnapshot::present)),
            other => Err(unexpected(other).into()),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        match self.request(|id| Request::set(id, key, value)).await? {
            Response::Ok { .. } => Ok(()),
            other => Err(unexpected(other).into()),
        }
    }

    async fn subscribe(&self, key: &str) -> Result<SnapshotStream, StorageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut watchers = self.shared.watchers.lock();
            let entry = watchers.entry(key.to_string()).or_default();
            entry.push(tx);
            entry.len() == 1
        };

        if first {
            if let Err(e) = self.request(|id| Request::watch(id, key)).await {
                self.shared.watchers.lock().remove(key);
                return Err(e.into());
            }
            debug!(key = %key, "Watching relay document");
        }
        Ok(rx)
    }
}

async fn read_loop(mut stream: OwnedReadHalf, shared: Arc<Shared>) {
    let mut codec = LineCodec::new();
    let mut buf = vec![0u8; 8192];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Relay read error");
                break;
            }
        };
        if let Err(e) = codec.feed(&buf[..n]) {
            warn!(error = %e, "Relay stream unusable");
            break;
        }

        loop {
            match codec.decode::<Response>() {
                Ok(Some(frame)) => dispatch(&shared, frame),
                Ok(None) => break,
                Err(e) => warn!(error = %e, "Skipping malformed relay frame"),
            }
        }
    }

    info!("Relay connection closed");
    // Dropping the senders fails every outstanding request
    shared.pending.lock().clear();
    shared.watchers.lock().clear();
}

fn dispatch(shared: &Shared, frame: Response) {
    if let Response::Changed { key, value } = frame {
        if let Some(senders) = shared.watchers.lock().get_mut(&key) {
            senders.retain(|tx| tx.send(RemoteSnapshot::present(value.clone())).is_ok());
        }
        return;
    }

    let Some(id) = frame.request_id() else {
        warn!(frame = ?frame, "Relay error without request id");
        return;
    };
    match shared.pending.lock().remove(&id) {
        Some(tx) => {
            let _ = tx.send(frame);
        }
        None => debug!(id, "Reply to abandoned request"),
    }
}

fn unexpected(frame: Response) -> TransportError {
    TransportError::Storage(StorageError::Remote {
        code: "UNEXPECTED".into(),
        message: format!("unexpected reply: {:?}", frame),
    })
}
