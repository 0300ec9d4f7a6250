use std::sync::Arc;
use std::time::Duration;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response, ErrorResponse};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use log::{info, warn, error};

use crate::config::{CLIENT_OUTBOX_CAPACITY, HANDSHAKE_TIMEOUT_SECS, SHUTDOWN_GRACE_SECS, WRITE_TIMEOUT_SECS};
use crate::market::PriceTable;
use crate::websocket::{BroadcastHub, ClientHandle, ConnectionId};

pub const STREAM_PATH: &str = "/ws";

/// Accepts streaming connections until `shutdown` flips to `true` (or its
/// sender is dropped). On the way out every client is closed and the
/// connection tasks get a grace period to send their close frames.
pub async fn run_listener(
    listener: TcpListener,
    hub: Arc<BroadcastHub>,
    table: Arc<PriceTable>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let handler = WebSocketHandler::new(hub.clone(), table.clone(), addr.to_string());
                    connections.spawn(handler.handle_connection(stream));
                }
                Err(e) => {
                    warn!("Failed to accept WebSocket connection: {}", e);
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Price stream shutting down, closing {} clients", hub.len());
    hub.close_all();

    let drain = async { while connections.join_next().await.is_some() {} };
    if timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), drain).await.is_err() {
        warn!("{} connections still open after grace period, aborting", connections.len());
        connections.abort_all();
    }
    info!("Price stream stopped");
}

/// Keeps a client in the hub for exactly as long as this value lives.
struct Registration {
    hub: Arc<BroadcastHub>,
    id: ConnectionId,
}

impl Registration {
    /// `None` when the hub filled up after the handshake was accepted.
    fn new(hub: Arc<BroadcastHub>, client: ClientHandle) -> Option<Self> {
        let id = client.id();
        if !hub.register(client) {
            return None;
        }
        Some(Self { hub, id })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.deregister(self.id);
    }
}

pub struct WebSocketHandler {
    hub: Arc<BroadcastHub>,
    table: Arc<PriceTable>,
    peer_addr: String,
    handshake_timeout: Duration,
}

impl WebSocketHandler {
    pub fn new(hub: Arc<BroadcastHub>, table: Arc<PriceTable>, peer_addr: String) -> Self {
        Self {
            hub,
            table,
            peer_addr,
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub async fn handle_connection(self, stream: TcpStream) {
        let handshake = accept_hdr_async(stream, |req: &Request, response: Response| {
            self.route_request(req, response)
        });

        let ws_stream = match timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                error!("WebSocket handshake failed for {}: {:?}", self.peer_addr, e);
                return;
            }
            Err(_) => {
                warn!("WebSocket handshake timed out for {}", self.peer_addr);
                return;
            }
        };

        self.handle_websocket_connection(ws_stream).await;
    }

    fn route_request(&self, req: &Request, response: Response) -> Result<Response, ErrorResponse> {
        let path = req.uri().path();
        info!("WebSocket connection request for path: {} from {}", path, self.peer_addr);

        if path != STREAM_PATH {
            warn!("Unknown WebSocket path '{}' from {}", path, self.peer_addr);
            return Err(error_response(StatusCode::NOT_FOUND, "Invalid WebSocket path"));
        }

        if self.hub.is_full() {
            warn!("Rejecting {}: maximum connections reached", self.peer_addr);
            return Err(error_response(StatusCode::SERVICE_UNAVAILABLE, "Maximum connections reached"));
        }

        Ok(response)
    }

    async fn handle_websocket_connection(&self, mut ws_stream: WebSocketStream<TcpStream>) {
        let (outbox_tx, outbox_rx) = mpsc::channel::<String>(CLIENT_OUTBOX_CAPACITY);

        let client = ClientHandle::new(self.peer_addr.clone(), outbox_tx);
        let Some(registration) = Registration::new(self.hub.clone(), client) else {
            // The upgrade already succeeded, so the refusal travels as a close code.
            let close = CloseFrame {
                code: CloseCode::Again,
                reason: "Maximum connections reached".into(),
            };
            if let Err(e) = ws_stream.close(Some(close)).await {
                warn!("Error refusing {}: {}", self.peer_addr, e);
            }
            return;
        };
        let id = registration.id;

        let (write, read) = ws_stream.split();

        // Current prices right away instead of waiting for the next tick.
        if !self.hub.send_to(id, &self.table.snapshot()) {
            warn!("Initial snapshot could not be queued for {}", self.peer_addr);
        }

        let mut write_task = spawn_write_task(write, outbox_rx, self.peer_addr.clone());
        let mut read_task = spawn_read_task(read, self.peer_addr.clone());

        tokio::select! {
            _ = &mut write_task => {
                info!("Write task completed for client {}", id);
                read_task.abort();
            }
            _ = &mut read_task => {
                info!("Read task completed for client {}", id);
            }
        }

        // Deregistering drops the outbox sender, which lets a still running
        // write task send its close frame and finish.
        drop(registration);
        if !write_task.is_finished()
            && timeout(Duration::from_secs(WRITE_TIMEOUT_SECS), &mut write_task).await.is_err()
        {
            write_task.abort();
        }

        info!("WebSocket connection closed - client {} from {}", id, self.peer_addr);
    }
}

fn error_response(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

fn spawn_write_task(
    mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbox: mpsc::Receiver<String>,
    peer_addr: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let write_timeout = Duration::from_secs(WRITE_TIMEOUT_SECS);

        while let Some(message) = outbox.recv().await {
            match timeout(write_timeout, write.send(Message::Text(message))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Error sending prices to {}: {}", peer_addr, e);
                    return;
                }
                Err(_) => {
                    warn!("Timed out sending prices to {}", peer_addr);
                    return;
                }
            }
        }

        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "Stream closed".into(),
        }));
        if let Ok(Err(e)) = timeout(write_timeout, write.send(close)).await {
            warn!("Error sending close frame to {}: {}", peer_addr, e);
        }
    })
}

fn spawn_read_task(
    mut read: SplitStream<WebSocketStream<TcpStream>>,
    peer_addr: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Clients have nothing to say; reading only tells us when they leave.
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Close(close_frame)) => {
                    info!("Received close frame from {}: {:?}", peer_addr, close_frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Error reading from {}: {}", peer_addr, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Error as WsError;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use crate::market::PriceEntry;

    struct TestServer {
        url: String,
        table: Arc<PriceTable>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    fn test_table() -> Arc<PriceTable> {
        Arc::new(PriceTable::new([("AAPL", 100.0), ("TSLA", 200.0)]).unwrap())
    }

    async fn start_server(hub: Arc<BroadcastHub>) -> TestServer {
        let table = test_table();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_listener(listener, hub, table.clone(), shutdown_rx));
        TestServer {
            url: format!("ws://{}", addr),
            table,
            shutdown,
            task,
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    async fn next_prices<S>(ws: &mut S) -> Vec<PriceEntry>
    where
        S: futures::Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let message = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no message within timeout")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initial_snapshot_on_connect() {
        let hub = Arc::new(BroadcastHub::new());
        let server = start_server(hub.clone()).await;

        let (mut ws, _) = connect_async(format!("{}{}", server.url, STREAM_PATH)).await.unwrap();

        assert_eq!(next_prices(&mut ws).await, server.table.snapshot());
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_then_disconnect_deregisters() {
        let hub = Arc::new(BroadcastHub::new());
        let server = start_server(hub.clone()).await;
        let (mut ws, _) = connect_async(format!("{}{}", server.url, STREAM_PATH)).await.unwrap();
        next_prices(&mut ws).await;

        server.table.apply_perturbation(|entry| entry.price + 1.0);
        assert_eq!(hub.publish(&server.table.snapshot()), 1);
        let update = next_prices(&mut ws).await;
        assert_eq!(update[0].price, 101.0);

        ws.close(None).await.unwrap();
        assert!(wait_until(|| hub.is_empty()).await);
    }

    #[tokio::test]
    async fn test_dropped_socket_deregisters() {
        let hub = Arc::new(BroadcastHub::new());
        let server = start_server(hub.clone()).await;
        let (mut ws, _) = connect_async(format!("{}{}", server.url, STREAM_PATH)).await.unwrap();
        next_prices(&mut ws).await;

        drop(ws);

        assert!(wait_until(|| hub.is_empty()).await);
    }

    #[tokio::test]
    async fn test_unknown_path_rejected() {
        let hub = Arc::new(BroadcastHub::new());
        let server = start_server(hub.clone()).await;

        let result = connect_async(format!("{}/other", server.url)).await;

        match result {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
            other => panic!("expected 404, got {:?}", other.map(|(_, response)| response)),
        }
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_full_hub_rejects_upgrade() {
        let hub = Arc::new(BroadcastHub::with_capacity(1));
        let server = start_server(hub.clone()).await;
        let (mut first, _) = connect_async(format!("{}{}", server.url, STREAM_PATH)).await.unwrap();
        next_prices(&mut first).await;

        let result = connect_async(format!("{}{}", server.url, STREAM_PATH)).await;

        match result {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE)
            }
            other => panic!("expected 503, got {:?}", other.map(|(_, response)| response)),
        }
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_ends_stream() {
        let hub = Arc::new(BroadcastHub::new());
        let server = start_server(hub.clone()).await;
        let (mut ws, _) = connect_async(format!("{}{}", server.url, STREAM_PATH)).await.unwrap();
        next_prices(&mut ws).await;

        assert_eq!(hub.close_all(), 1);

        let next = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
        assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients_cleanly() {
        let hub = Arc::new(BroadcastHub::new());
        let server = start_server(hub.clone()).await;
        let (mut ws, _) = connect_async(format!("{}{}", server.url, STREAM_PATH)).await.unwrap();
        next_prices(&mut ws).await;

        server.shutdown.send(true).unwrap();

        let next = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
        match next {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected a normal close frame, got {:?}", other),
        }

        timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS + 1), server.task)
            .await
            .expect("listener did not stop")
            .unwrap();
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_during_handshake() {
        let hub = Arc::new(BroadcastHub::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _idle = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let handler = WebSocketHandler::new(hub.clone(), test_table(), peer.to_string())
            .with_handshake_timeout(Duration::from_millis(100));

        timeout(Duration::from_secs(2), handler.handle_connection(stream))
            .await
            .expect("handshake never timed out");
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_hub_filled_after_handshake_refuses_with_close_code() {
        let hub = Arc::new(BroadcastHub::with_capacity(1));
        let (occupant_tx, _occupant_rx) = mpsc::channel(1);
        hub.register(ClientHandle::new("occupant".to_string(), occupant_tx));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let server_ws = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let mut client_ws = WebSocketStream::from_raw_socket(client, Role::Client, None).await;

        let handler = WebSocketHandler::new(hub.clone(), test_table(), peer.to_string());
        let task = tokio::spawn(async move { handler.handle_websocket_connection(server_ws).await });

        let next = timeout(Duration::from_secs(2), client_ws.next()).await.unwrap();
        match next {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Again),
            other => panic!("expected a refusal close frame, got {:?}", other),
        }

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(hub.len(), 1);
    }
}
