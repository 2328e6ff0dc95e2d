//! Hub connection over a WebSocket with JSON framing.
//!
//! Frames are JSON objects terminated by the record separator `0x1E`. After
//! the socket opens the client sends `{"protocol":"json","version":1}` and
//! waits for an empty handshake reply. Message types used:
//! 1 = invocation, 3 = completion, 6 = ping, 7 = close.
//!
//! When an established socket drops, the connection retries on its own
//! (immediately, then after 2s, 10s and 30s) before reporting `Closed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::hub::{
    AccessTokenProvider, HubConnection, HubConnectionFactory, HubHandler, HubLifecycle,
    LifecycleHandler,
};
use crate::error::{SessionError, SessionResult};

const RECORD_SEPARATOR: char = '\u{1e}';

const MSG_INVOCATION: u64 = 1;
const MSG_COMPLETION: u64 = 3;
const MSG_PING: u64 = 6;
const MSG_CLOSE: u64 = 7;

/// Built-in reconnect schedule after an established connection drops.
const RECONNECT_DELAYS_SECS: [u64; 4] = [0, 2, 10, 30];

/// How long `stop` waits for the socket task before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsHubFactory;

impl HubConnectionFactory for WsHubFactory {
    fn build(&self, url: &str, token: AccessTokenProvider) -> Arc<dyn HubConnection> {
        Arc::new(WsHubConnection::new(url, token))
    }
}

struct WsShared {
    url: String,
    token: AccessTokenProvider,
    handlers: Mutex<HashMap<String, HubHandler>>,
    lifecycle: Mutex<Vec<LifecycleHandler>>,
    pending: Mutex<HashMap<String, oneshot::Sender<SessionResult<Value>>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    next_invocation: AtomicU64,
    stopping: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn frame(value: &Value) -> Message {
    Message::Text(format!("{value}{RECORD_SEPARATOR}"))
}

pub struct WsHubConnection {
    shared: Arc<WsShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsHubConnection {
    pub fn new(url: impl Into<String>, token: AccessTokenProvider) -> Self {
        Self {
            shared: Arc::new(WsShared {
                url: url.into(),
                token,
                handlers: Mutex::new(HashMap::new()),
                lifecycle: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                next_invocation: AtomicU64::new(1),
                stopping: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }
}

impl WsShared {
    async fn open_socket(&self) -> SessionResult<Socket> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = (self.token)().await {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SessionError::Connection(format!("Invalid token header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (mut socket, _) = connect_async(request).await?;
        socket
            .send(frame(&json!({ "protocol": "json", "version": 1 })))
            .await?;

        match socket.next().await {
            Some(Ok(Message::Text(reply))) => {
                let body = reply.trim_end_matches(RECORD_SEPARATOR);
                let handshake: Value = serde_json::from_str(body)
                    .map_err(|e| SessionError::Connection(format!("Bad handshake reply: {e}")))?;
                if let Some(error) = handshake.get("error").and_then(Value::as_str) {
                    return Err(SessionError::Connection(format!("Handshake rejected: {error}")));
                }
                Ok(socket)
            }
            Some(Err(e)) => Err(e.into()),
            _ => Err(SessionError::Connection("Socket closed during handshake".into())),
        }
    }

    fn signal(&self, event: HubLifecycle) {
        let handlers: Vec<LifecycleHandler> = lock(&self.lifecycle).clone();
        for handler in handlers {
            handler(&event);
        }
    }

    fn fail_pending(&self, reason: &str) {
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        for (_, reply) in pending {
            let _ = reply.send(Err(SessionError::Connection(reason.to_string())));
        }
    }

    /// Dispatch every frame in one text message. Returns a reason when the
    /// server asked to close.
    fn dispatch_frames(&self, text: &str) -> Option<String> {
        for raw in text.split(RECORD_SEPARATOR).filter(|f| !f.trim().is_empty()) {
            let message: Value = match serde_json::from_str(raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed hub frame");
                    continue;
                }
            };
            match message.get("type").and_then(Value::as_u64) {
                Some(MSG_INVOCATION) => {
                    let Some(target) = message.get("target").and_then(Value::as_str) else {
                        continue;
                    };
                    let handler = lock(&self.handlers).get(target).cloned();
                    match handler {
                        Some(handler) => {
                            let args = match message.get("arguments") {
                                Some(Value::Array(args)) => args.clone(),
                                _ => Vec::new(),
                            };
                            handler(&args);
                        }
                        None => debug!(event = target, "No handler for hub event"),
                    }
                }
                Some(MSG_COMPLETION) => {
                    let Some(id) = message.get("invocationId").and_then(Value::as_str) else {
                        continue;
                    };
                    if let Some(reply) = lock(&self.pending).remove(id) {
                        let result = match message.get("error").and_then(Value::as_str) {
                            Some(error) => Err(SessionError::Connection(error.to_string())),
                            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
                        };
                        let _ = reply.send(result);
                    }
                }
                Some(MSG_PING) => {}
                Some(MSG_CLOSE) => {
                    let reason = message
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("server closed the connection");
                    return Some(reason.to_string());
                }
                other => debug!(kind = ?other, "Ignoring hub frame"),
            }
        }
        None
    }

    /// Pump one socket until it drops (`Some(reason)`) or a local close was
    /// requested (`None`).
    async fn pump(
        &self,
        socket: &mut Socket,
        outbound: &mut mpsc::UnboundedReceiver<Message>,
    ) -> Option<String> {
        loop {
            tokio::select! {
                queued = outbound.recv() => match queued {
                    Some(Message::Close(close)) => {
                        let _ = socket.send(Message::Close(close)).await;
                        return None;
                    }
                    Some(message) => {
                        if let Err(e) = socket.send(message).await {
                            return Some(e.to_string());
                        }
                    }
                    None => return None,
                },
                incoming = socket.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reason) = self.dispatch_frames(&text) {
                            return Some(reason);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Some("socket closed by server".to_string());
                    }
                    Some(Err(e)) => return Some(e.to_string()),
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        mut socket: Socket,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) {
        loop {
            let Some(reason) = self.pump(&mut socket, &mut outbound).await else {
                return;
            };
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            self.fail_pending("connection lost");
            warn!(url = %self.url, reason = %reason, "Hub connection dropped");
            self.signal(HubLifecycle::Reconnecting(Some(reason.clone())));

            match self.reconnect().await {
                Ok(fresh) => {
                    socket = fresh;
                    info!(url = %self.url, "Hub connection restored");
                    self.signal(HubLifecycle::Reconnected);
                }
                Err(e) => {
                    if !self.stopping.load(Ordering::SeqCst) {
                        self.signal(HubLifecycle::Closed(Some(e.to_string())));
                    }
                    return;
                }
            }
        }
    }

    async fn reconnect(&self) -> SessionResult<Socket> {
        let mut last_error = SessionError::Connection("no reconnect attempts made".into());
        for delay in RECONNECT_DELAYS_SECS {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            match self.open_socket().await {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    debug!(url = %self.url, error = %e, "Hub reconnect attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl HubConnection for WsHubConnection {
    async fn start(&self) -> SessionResult<()> {
        self.shared.stopping.store(false, Ordering::SeqCst);
        let socket = self.shared.open_socket().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.outbound) = Some(tx);
        let task = tokio::spawn(Arc::clone(&self.shared).run(socket, rx));
        if let Some(previous) = lock(&self.task).replace(task) {
            previous.abort();
        }
        debug!(url = %self.shared.url, "Hub connection started");
        Ok(())
    }

    async fn stop(&self) -> SessionResult<()> {
        self.shared.stopping.store(true, Ordering::SeqCst);
        if let Some(tx) = lock(&self.shared.outbound).take() {
            let _ = tx.send(Message::Close(None));
        }
        let task = lock(&self.task).take();
        if let Some(mut task) = task {
            // Reconnect back-off can be long; a stop must not wait it out.
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                debug!(url = %self.shared.url, "Hub task did not finish in time; aborting");
                task.abort();
                let _ = task.await;
            }
        }
        self.shared.fail_pending("connection stopped");
        self.shared.signal(HubLifecycle::Closed(None));
        Ok(())
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> SessionResult<Value> {
        let id = self
            .shared
            .next_invocation
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let (reply, response) = oneshot::channel();
        lock(&self.shared.pending).insert(id.clone(), reply);

        let message = frame(&json!({
            "type": MSG_INVOCATION,
            "invocationId": id,
            "target": method,
            "arguments": args,
        }));
        let sent = lock(&self.shared.outbound)
            .as_ref()
            .map(|tx| tx.send(message).is_ok())
            .unwrap_or(false);
        if !sent {
            lock(&self.shared.pending).remove(&id);
            return Err(SessionError::Connection("not connected".into()));
        }

        response
            .await
            .unwrap_or_else(|_| Err(SessionError::Connection("connection lost".into())))
    }

    fn on(&self, event: &str, handler: HubHandler) {
        lock(&self.shared.handlers).insert(event.to_string(), handler);
    }

    fn off(&self, event: &str) {
        lock(&self.shared.handlers).remove(event);
    }

    fn on_lifecycle(&self, handler: LifecycleHandler) {
        lock(&self.shared.lifecycle).push(handler);
    }
}
