//! TCP relay server

use nuwa_protocol::{encode, Response};
use nuwa_storage::RemoteStore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use crate::error::TransportResult;
use crate::handler::ConnectionHandler;

/// Serves a remote store to TCP clients
pub struct RelayServer {
    store: Arc<dyn RemoteStore>,
    addr: SocketAddr,
    client_counter: Arc<AtomicU64>,
}

impl RelayServer {
    pub fn new(store: Arc<dyn RemoteStore>, addr: SocketAddr) -> Self {
        Self {
            store,
            addr,
            client_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> TransportResult<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "nuwa relay listening");
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> TransportResult<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let client_id = format!(
                        "tcp:{}:{}",
                        peer_addr,
                        self.client_counter.fetch_add(1, Ordering::Relaxed)
                    );
                    let store = self.store.clone();

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, client_id.clone(), store).await {
                            error!(client = %client_id, error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        client_id: String,
        store: Arc<dyn RemoteStore>,
    ) -> TransportResult<()> {
        info!(client = %client_id, "Client connected");

        let (mut handler, mut update_rx) = ConnectionHandler::new(client_id.clone(), store);
        let mut buf = vec![0u8; 8192];

        loop {
            tokio::select! {
                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            info!(client = %client_id, "Client disconnected");
                            break;
                        }
                        Ok(n) => {
                            for response in handler.process(&buf[..n]).await {
                                stream.write_all(&encode(&response)?).await?;
                            }
                            if handler.is_closed() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!(client = %client_id, error = %e, "Read error");
                            break;
                        }
                    }
                }

                Some(change) = update_rx.recv() => {
                    if let Err(e) = write_frame(&mut stream, &change).await {
                        error!(client = %client_id, error = %e, "Write error");
                        break;
                    }
                }
            }
        }

        handler.cleanup();
        Ok(())
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &Response) -> TransportResult<()> {
    stream.write_all(&encode(frame)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nuwa_storage::MemoryRemoteStore;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};

    async fn spawn_relay() -> (SocketAddr, Arc<MemoryRemoteStore>) {
        let store = Arc::new(MemoryRemoteStore::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::new(store.clone(), addr);
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        (addr, store)
    }

    async fn read_frame(reader: &mut BufReader<TcpStream>) -> Response {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_ping_pong() {
        let (addr, _store) = spawn_relay().await;

        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        client.get_mut().write_all(b"{\"op\":\"ping\",\"id\":1}\n").await.unwrap();

        assert_eq!(read_frame(&mut client).await, Response::pong(1));
    }

    #[tokio::test]
    async fn test_watcher_receives_other_clients_write() {
        let (addr, store) = spawn_relay().await;

        let mut watcher = BufReader::new(TcpStream::connect(addr).await.unwrap());
        watcher
            .get_mut()
            .write_all(b"{\"op\":\"watch\",\"id\":1,\"key\":\"/doc\"}\n")
            .await
            .unwrap();
        assert_eq!(read_frame(&mut watcher).await, Response::ok(1));

        let mut writer = BufReader::new(TcpStream::connect(addr).await.unwrap());
        writer
            .get_mut()
            .write_all(b"{\"op\":\"set\",\"id\":9,\"key\":\"/doc\",\"value\":{\"rev\":2}}\n")
            .await
            .unwrap();
        assert_eq!(read_frame(&mut writer).await, Response::ok(9));

        assert_eq!(
            read_frame(&mut watcher).await,
            Response::changed("/doc", json!({"rev": 2}))
        );
        assert_eq!(
            store.get("/doc").await.unwrap().and_then(|s| s.value()),
            Some(json!({"rev": 2}))
        );
    }
}
