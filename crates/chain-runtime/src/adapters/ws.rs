//! # WebSocket Transport
//!
//! JSON-RPC 2.0 over WebSocket.
//!
//! One reader task routes every incoming frame: responses are matched to
//! their pending request by numeric id, notifications are forwarded to the
//! channel of their subscription id. One writer task owns the sink and
//! drains an unbounded queue, so callers never block on the socket.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::{RuntimeError, RuntimeResult};
use crate::ports::{NotificationStream, Transport, TransportFactory};

/// Default time to wait for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Notification = RuntimeResult<serde_json::Value>;
type SubscribeReply = RuntimeResult<(String, mpsc::UnboundedReceiver<Notification>)>;

/// JSON-RPC request.
#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a serde_json::Value,
}

/// Any incoming JSON-RPC frame: a response or a notification.
#[derive(Deserialize)]
struct RpcMessage {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcError>,
    #[serde(default)]
    params: Option<NotificationParams>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct NotificationParams {
    subscription: serde_json::Value,
    result: serde_json::Value,
}

enum PendingCall {
    Request(oneshot::Sender<Notification>),
    Subscribe(oneshot::Sender<SubscribeReply>),
}

struct Connection {
    endpoint: String,
    outbound: mpsc::UnboundedSender<Message>,
    pending: DashMap<u64, PendingCall>,
    subscriptions: DashMap<String, mpsc::UnboundedSender<Notification>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Connection {
    fn closed_error(&self) -> RuntimeError {
        RuntimeError::transport(&self.endpoint, "connection closed")
    }

    fn send(&self, id: u64, method: &str, params: &serde_json::Value) -> RuntimeResult<()> {
        let text = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })?;
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| self.closed_error())
    }

    fn call(&self, method: &str, params: &serde_json::Value, call: PendingCall) -> RuntimeResult<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.insert(id, call);
        if let Err(e) = self.send(id, method, params) {
            self.pending.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    fn route(&self, text: &str) {
        let Ok(message) = serde_json::from_str::<RpcMessage>(text) else {
            debug!(endpoint = %self.endpoint, "ignoring non JSON-RPC frame");
            return;
        };

        if let Some(params) = message.params {
            let key = subscription_key(&params.subscription);
            match self.subscriptions.get(&key) {
                Some(channel) => {
                    let _ = channel.send(Ok(params.result));
                }
                None => debug!(subscription = %key, "notification for unknown subscription"),
            }
            return;
        }

        let Some(id) = message.id.as_ref().and_then(serde_json::Value::as_u64) else {
            return;
        };
        let Some((_, call)) = self.pending.remove(&id) else {
            return;
        };

        let outcome = match (message.result, message.error) {
            (_, Some(error)) => Err(RuntimeError::query(format!(
                "rpc error {}: {}",
                error.code, error.message
            ))),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(serde_json::Value::Null),
        };

        match call {
            PendingCall::Request(reply) => {
                let _ = reply.send(outcome);
            }
            PendingCall::Subscribe(reply) => {
                let registered = outcome.map(|subscription| {
                    let key = subscription_key(&subscription);
                    let (sender, receiver) = mpsc::unbounded_channel();
                    self.subscriptions.insert(key.clone(), sender);
                    (key, receiver)
                });
                let _ = reply.send(registered);
            }
        }
    }

    fn shut_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
    }

    /// Fail every pending call and end every subscription stream.
    fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<u64> = self.pending.iter().map(|p| *p.key()).collect();
        for id in ids {
            match self.pending.remove(&id) {
                Some((_, PendingCall::Request(reply))) => {
                    let _ = reply.send(Err(self.closed_error()));
                }
                Some((_, PendingCall::Subscribe(reply))) => {
                    let _ = reply.send(Err(self.closed_error()));
                }
                None => {}
            }
        }

        let keys: Vec<String> = self.subscriptions.iter().map(|s| s.key().clone()).collect();
        for key in keys {
            if let Some((_, channel)) = self.subscriptions.remove(&key) {
                let _ = channel.send(Err(self.closed_error()));
            }
        }
    }
}

fn subscription_key(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON-RPC transport over one WebSocket connection.
pub struct WsTransport {
    connection: Arc<Connection>,
    request_timeout: Duration,
}

impl WsTransport {
    /// Open a WebSocket to `endpoint`.
    pub async fn connect(endpoint: &Url, request_timeout: Duration) -> RuntimeResult<Self> {
        let endpoint_str = endpoint.to_string();
        let (socket, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| RuntimeError::transport(&endpoint_str, e))?;
        let (mut write, mut read) = socket.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let connection = Arc::new(Connection {
            endpoint: endpoint_str.clone(),
            outbound,
            pending: DashMap::new(),
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            shutdown: Mutex::new(Some(shutdown_tx)),
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outbound_rx.recv() => match message {
                        Some(message) => {
                            if let Err(e) = write.send(message).await {
                                debug!(error = %e, "websocket write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = &mut shutdown_rx => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = write.close().await;
        });

        let reader = Arc::downgrade(&connection);
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let Some(connection) = reader.upgrade() else {
                    return;
                };
                match frame {
                    Ok(Message::Text(text)) => connection.route(&text),
                    Ok(Message::Ping(data)) => {
                        let _ = connection.outbound.send(Message::Pong(data));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(endpoint = %connection.endpoint, error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            if let Some(connection) = reader.upgrade() {
                debug!(endpoint = %connection.endpoint, "websocket closed");
                connection.fail_all();
            }
        });

        info!(endpoint = %endpoint_str, "websocket connected");
        Ok(Self {
            connection,
            request_timeout,
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn endpoint(&self) -> &str {
        &self.connection.endpoint
    }

    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> RuntimeResult<serde_json::Value> {
        let (reply, response) = oneshot::channel();
        let id = self
            .connection
            .call(method, &params, PendingCall::Request(reply))?;

        match tokio::time::timeout(self.request_timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.connection.closed_error()),
            Err(_) => {
                self.connection.pending.remove(&id);
                Err(RuntimeError::transport(
                    &self.connection.endpoint,
                    format!(
                        "{method} timed out after {}ms",
                        self.request_timeout.as_millis()
                    ),
                ))
            }
        }
    }

    async fn subscribe(
        &self,
        method: &str,
        params: serde_json::Value,
        unsubscribe_method: &str,
    ) -> RuntimeResult<NotificationStream> {
        let (reply, response) = oneshot::channel();
        let id = self
            .connection
            .call(method, &params, PendingCall::Subscribe(reply))?;

        let (subscription, receiver) = match tokio::time::timeout(self.request_timeout, response).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(self.connection.closed_error()),
            Err(_) => {
                self.connection.pending.remove(&id);
                return Err(RuntimeError::transport(
                    &self.connection.endpoint,
                    format!("{method} timed out"),
                ));
            }
        };

        debug!(endpoint = %self.connection.endpoint, subscription = %subscription, "subscribed");
        Ok(SubscriptionStream {
            receiver,
            subscription,
            unsubscribe_method: unsubscribe_method.to_string(),
            connection: Arc::downgrade(&self.connection),
        }
        .boxed())
    }

    fn close(&self) {
        if !self.connection.closed.load(Ordering::SeqCst) {
            debug!(endpoint = %self.connection.endpoint, "closing websocket");
        }
        self.connection.shut_down();
        self.connection.fail_all();
    }

    fn is_closed(&self) -> bool {
        self.connection.closed.load(Ordering::SeqCst)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Notifications of one subscription. Dropping it unsubscribes.
struct SubscriptionStream {
    receiver: mpsc::UnboundedReceiver<Notification>,
    subscription: String,
    unsubscribe_method: String,
    connection: Weak<Connection>,
}

impl Stream for SubscriptionStream {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        if connection.subscriptions.remove(&self.subscription).is_none() {
            return;
        }
        if connection.closed.load(Ordering::SeqCst) {
            return;
        }

        // Fire and forget; the response matches no pending call and is ignored.
        let id = connection.next_id.fetch_add(1, Ordering::SeqCst);
        let params = serde_json::json!([self.subscription]);
        if connection.send(id, &self.unsubscribe_method, &params).is_ok() {
            debug!(subscription = %self.subscription, "unsubscribed");
        }
    }
}

/// Opens [`WsTransport`]s. `http`/`https` endpoints are dialled as
/// `ws`/`wss`.
#[derive(Clone, Debug)]
pub struct WsTransportFactory {
    request_timeout: Duration,
}

impl Default for WsTransportFactory {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl WsTransportFactory {
    /// Factory whose transports wait `request_timeout` for each response.
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn open(&self, endpoint: &Url) -> RuntimeResult<Arc<dyn Transport>> {
        let mut url = endpoint.clone();
        let scheme = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| RuntimeError::transport(endpoint.as_str(), "cannot switch to websocket scheme"))?;
        }

        let transport = WsTransport::connect(&url, self.request_timeout).await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Minimal node: answers `system_chain`, rejects `fail`, and opens one
    /// subscription that immediately notifies.
    async fn spawn_node() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            while let Some(Ok(frame)) = ws.next().await {
                let Message::Text(text) = frame else {
                    continue;
                };
                let request: serde_json::Value = serde_json::from_str(&text).unwrap();
                let id = request["id"].clone();

                let replies = match request["method"].as_str().unwrap_or_default() {
                    "system_chain" => vec![json!({ "jsonrpc": "2.0", "id": id, "result": "Dev" })],
                    "fail" => vec![json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32601, "message": "Method not found" }
                    })],
                    "events_subscribe" => vec![
                        json!({ "jsonrpc": "2.0", "id": id, "result": "sub-1" }),
                        json!({
                            "jsonrpc": "2.0",
                            "method": "events_notify",
                            "params": { "subscription": "sub-1", "result": { "n": 1 } }
                        }),
                    ],
                    _ => vec![],
                };

                for reply in replies {
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                }
            }
        });

        Url::parse(&format!("ws://{addr}")).unwrap()
    }

    #[tokio::test]
    async fn test_request_response() {
        let url = spawn_node().await;
        let transport = WsTransport::connect(&url, Duration::from_secs(5)).await.unwrap();

        assert_eq!(
            transport.request("system_chain", json!([])).await.unwrap(),
            json!("Dev")
        );

        let err = transport.request("fail", json!([])).await.unwrap_err();
        assert!(err.to_string().contains("Method not found"));
    }

    #[tokio::test]
    async fn test_subscription_notifications() {
        let url = spawn_node().await;
        let transport = WsTransport::connect(&url, Duration::from_secs(5)).await.unwrap();

        let mut stream = transport
            .subscribe("events_subscribe", json!([]), "events_unsubscribe")
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), json!({ "n": 1 }));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let url = spawn_node().await;
        let transport = WsTransport::connect(&url, Duration::from_millis(100)).await.unwrap();

        let err = transport.request("unanswered", json!([])).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transport { .. }));
        assert!(transport.connection.pending.is_empty());
    }

    #[tokio::test]
    async fn test_close_rejects_requests() {
        let url = spawn_node().await;
        let transport = WsTransport::connect(&url, Duration::from_secs(5)).await.unwrap();

        transport.close();

        assert!(transport.is_closed());
        assert!(transport.request("system_chain", json!([])).await.is_err());
    }

    #[tokio::test]
    async fn test_factory_refuses_dead_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let factory = WsTransportFactory::default();
        let result = factory
            .open(&Url::parse(&format!("http://{addr}")).unwrap())
            .await;
        assert!(matches!(result, Err(RuntimeError::Transport { .. })));
    }
}
