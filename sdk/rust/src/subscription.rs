//! Subscriptions over `graphql-transport-ws`.
//!
//! A [`SubscriptionClient`] owns at most one WebSocket connection, opened by
//! the first `subscribe` and shared by every later one. Each subscription
//! gets its own id on that connection. When the socket drops while
//! subscriptions are active the connection task reconnects with
//! exponential backoff and re-sends every active `subscribe`, so handlers
//! keep receiving events without the caller doing anything. When the last
//! subscription goes away the socket is closed.

use crate::client::GraphQLClient;
use crate::config::ReconnectPolicy;
use crate::error::{ConnectError, ConnectResult, GraphQLError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// WebSocket sub-protocol name.
pub const PROTOCOL: &str = "graphql-transport-ws";

const ACK_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
}

impl Frame {
    fn new(kind: &str, id: Option<&str>, payload: Option<serde_json::Value>) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.map(str::to_string),
            payload,
        }
    }

    fn to_message(&self) -> ConnectResult<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// Events delivered by [`SubscriptionHandlers::channel`].
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Next(serde_json::Value),
    Error(ConnectError),
    Complete,
}

type NextFn = Box<dyn Fn(serde_json::Value) + Send + Sync>;
type ErrorFn = Box<dyn Fn(ConnectError) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;

/// Callbacks for one subscription.
///
/// `next` receives the `data` of every result. Results carrying GraphQL
/// errors go to `error` instead and the subscription stays active. A
/// server-side `error` or `complete` ends the subscription.
pub struct SubscriptionHandlers {
    next: NextFn,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
}

impl std::fmt::Debug for SubscriptionHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandlers")
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandlers {
    pub fn new(next: impl Fn(serde_json::Value) + Send + Sync + 'static) -> Self {
        Self {
            next: Box::new(next),
            error: None,
            complete: None,
        }
    }

    pub fn on_error(mut self, error: impl Fn(ConnectError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(error));
        self
    }

    pub fn on_complete(mut self, complete: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(complete));
        self
    }

    /// Handlers that forward every event into a channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_error = tx.clone();
        let on_complete = tx.clone();
        let handlers = Self::new(move |data| {
            let _ = tx.send(SubscriptionEvent::Next(data));
        })
        .on_error(move |err| {
            let _ = on_error.send(SubscriptionEvent::Error(err));
        })
        .on_complete(move || {
            let _ = on_complete.send(SubscriptionEvent::Complete);
        });
        (handlers, rx)
    }

    fn next(&self, data: serde_json::Value) {
        (self.next)(data);
    }

    fn error(&self, err: ConnectError) {
        match &self.error {
            Some(handler) => handler(err),
            None => warn!(error = %err, "subscription error without an error handler"),
        }
    }

    fn complete(&self) {
        if let Some(handler) = &self.complete {
            handler();
        }
    }
}

struct Entry {
    payload: serde_json::Value,
    handlers: Arc<SubscriptionHandlers>,
}

enum Command {
    Subscribe(String),
    Stop(String),
}

#[derive(Default)]
struct State {
    entries: FxHashMap<String, Entry>,
    /// Present while a connection task is running.
    commands: Option<mpsc::UnboundedSender<Command>>,
    next_id: u64,
}

struct Inner {
    url: String,
    client: GraphQLClient,
    policy: ReconnectPolicy,
    state: Mutex<State>,
}

impl Inner {
    fn handlers(&self, id: &str) -> Option<Arc<SubscriptionHandlers>> {
        self.state
            .lock()
            .entries
            .get(id)
            .map(|entry| entry.handlers.clone())
    }

    fn remove(&self, id: &str) -> Option<Arc<SubscriptionHandlers>> {
        self.state
            .lock()
            .entries
            .remove(id)
            .map(|entry| entry.handlers)
    }

    /// Detaches the connection task when nothing is subscribed.
    fn retire_if_idle(&self) -> bool {
        let mut state = self.state.lock();
        if state.entries.is_empty() {
            state.commands = None;
            true
        } else {
            false
        }
    }
}

/// Shared streaming connection.
#[derive(Clone)]
pub struct SubscriptionClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SubscriptionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionClient")
            .field("url", &self.inner.url)
            .field("active", &self.active_count())
            .finish()
    }
}

impl SubscriptionClient {
    /// `client` supplies the headers sent in `connection_init`.
    ///
    /// Fails with `NotConfigured` unless `url` is a `ws://` or `wss://` URL.
    pub fn new(
        url: impl Into<String>,
        client: GraphQLClient,
        policy: ReconnectPolicy,
    ) -> ConnectResult<Self> {
        let url = url.into();
        handshake_request(&url)?;
        Ok(Self {
            inner: Arc::new(Inner {
                url,
                client,
                policy,
                state: Mutex::new(State::default()),
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// True while a connection task exists, including while it reconnects.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().commands.is_some()
    }

    /// Registers a subscription; events arrive on `handlers` asynchronously.
    pub async fn subscribe(
        &self,
        document: impl Into<String>,
        variables: Option<serde_json::Value>,
        handlers: SubscriptionHandlers,
    ) -> ConnectResult<SubscriptionHandle> {
        let mut payload = serde_json::json!({ "query": document.into() });
        if let Some(variables) = variables {
            payload["variables"] = variables;
        }

        let mut state = self.inner.state.lock();
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.entries.insert(
            id.clone(),
            Entry {
                payload,
                handlers: Arc::new(handlers),
            },
        );

        let delivered = state
            .commands
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Subscribe(id.clone())).is_ok());
        if !delivered {
            let (tx, rx) = mpsc::unbounded_channel();
            state.commands = Some(tx);
            tokio::spawn(run_connection(self.inner.clone(), rx));
        }
        drop(state);

        debug!(id = %id, url = %self.inner.url, "subscription registered");
        Ok(SubscriptionHandle {
            id,
            inner: self.inner.clone(),
        })
    }
}

/// Cancels one subscription; other subscriptions on the connection are unaffected.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: String,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Idempotent. Sends `complete` for this id; the complete handler is not invoked.
    pub fn unsubscribe(&self) {
        let mut state = self.inner.state.lock();
        if state.entries.remove(&self.id).is_some() {
            if let Some(tx) = &state.commands {
                let _ = tx.send(Command::Stop(self.id.clone()));
            }
        }
    }
}

enum SessionEnd {
    Idle,
    Dropped,
}

async fn run_connection(inner: Arc<Inner>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut attempt: u32 = 0;
    loop {
        match open(&inner).await {
            Ok(ws) => {
                info!(url = %inner.url, "streaming connection established");
                attempt = 0;
                match session(&inner, ws, &mut commands).await {
                    SessionEnd::Idle => {
                        info!(url = %inner.url, "streaming connection closed, no subscriptions left");
                        return;
                    }
                    SessionEnd::Dropped => {
                        warn!(url = %inner.url, "streaming connection dropped");
                    }
                }
            }
            Err(err) => warn!(url = %inner.url, error = %err, "streaming connection failed"),
        }

        if inner.retire_if_idle() {
            return;
        }
        let delay = inner.policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
        if inner.retire_if_idle() {
            return;
        }
    }
}

fn network(context: &str, err: impl std::fmt::Display) -> ConnectError {
    ConnectError::network(format!("{}: {}", context, err))
}

fn handshake_request(url: &str) -> ConnectResult<Request> {
    let invalid = |reason: String| {
        ConnectError::not_configured(format!("invalid streaming endpoint {:?}: {}", url, reason))
    };
    let mut request = url.into_client_request().map_err(|e| invalid(e.to_string()))?;
    match request.uri().scheme_str() {
        Some("ws" | "wss") => {}
        other => return Err(invalid(format!("unsupported scheme {:?}", other.unwrap_or("")))),
    }
    if request.uri().host().is_none() {
        return Err(invalid("missing host".into()));
    }
    request
        .headers_mut()
        .insert("sec-websocket-protocol", HeaderValue::from_static(PROTOCOL));
    Ok(request)
}

async fn open(inner: &Inner) -> ConnectResult<WsStream> {
    let request = handshake_request(&inner.url)?;
    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| network("websocket connect failed", e))?;

    let headers: HashMap<String, String> = inner.client.effective_headers(&HashMap::new()).await?;
    let init = Frame::new(
        "connection_init",
        None,
        Some(serde_json::json!({ "headers": headers })),
    );
    ws.send(init.to_message()?)
        .await
        .map_err(|e| network("connection_init failed", e))?;

    tokio::time::timeout(ACK_TIMEOUT, await_ack(&mut ws))
        .await
        .map_err(|_| ConnectError::network("timed out waiting for connection_ack"))??;
    Ok(ws)
}

async fn await_ack(ws: &mut WsStream) -> ConnectResult<()> {
    while let Some(message) = ws.next().await {
        match message.map_err(|e| network("websocket error", e))? {
            Message::Text(text) => {
                let frame: Frame = serde_json::from_str(&text)?;
                match frame.kind.as_str() {
                    "connection_ack" => return Ok(()),
                    "ping" => {
                        ws.send(Frame::new("pong", None, None).to_message()?)
                            .await
                            .map_err(|e| network("pong failed", e))?;
                    }
                    other => {
                        return Err(ConnectError::unexpected(format!(
                            "expected connection_ack, got {}",
                            other
                        )))
                    }
                }
            }
            Message::Ping(data) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ConnectError::network("connection closed before connection_ack"))
}

async fn session(
    inner: &Inner,
    ws: WsStream,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let (mut sink, mut source) = ws.split();

    // Commands queued while disconnected are covered by the snapshot.
    let active: Vec<(String, serde_json::Value)> = {
        let state = inner.state.lock();
        while commands.try_recv().is_ok() {}
        state
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.payload.clone()))
            .collect()
    };
    for (id, payload) in active {
        if send_frame(&mut sink, Frame::new("subscribe", Some(&id), Some(payload)))
            .await
            .is_err()
        {
            return SessionEnd::Dropped;
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => {
                let sent = match command {
                    Some(Command::Subscribe(id)) => {
                        let payload = inner.state.lock().entries.get(&id).map(|e| e.payload.clone());
                        match payload {
                            Some(payload) => {
                                send_frame(&mut sink, Frame::new("subscribe", Some(&id), Some(payload))).await
                            }
                            None => Ok(()),
                        }
                    }
                    Some(Command::Stop(id)) => {
                        send_frame(&mut sink, Frame::new("complete", Some(&id), None)).await
                    }
                    None => return SessionEnd::Idle,
                };
                if sent.is_err() {
                    return SessionEnd::Dropped;
                }
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = dispatch(inner, &text) {
                            if send_frame(&mut sink, reply).await.is_err() {
                                return SessionEnd::Dropped;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return SessionEnd::Dropped,
                    Some(Ok(_)) => {}
                }
            }
        }

        if inner.retire_if_idle() {
            let _ = sink.send(Message::Close(None)).await;
            return SessionEnd::Idle;
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: Frame) -> ConnectResult<()> {
    sink.send(frame.to_message()?)
        .await
        .map_err(|e| network("websocket send failed", e))
}

/// Routes one server frame to its handlers; returns a reply frame if one is due.
fn dispatch(inner: &Inner, text: &str) -> Option<Frame> {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "undecodable frame on streaming connection");
            return None;
        }
    };

    let id = frame.id.as_deref().unwrap_or_default();
    match frame.kind.as_str() {
        "next" => {
            let Some(handlers) = inner.handlers(id) else {
                return None;
            };
            let payload = frame.payload.unwrap_or_default();
            let errors: Vec<GraphQLError> = payload
                .get("errors")
                .cloned()
                .and_then(|errors| serde_json::from_value(errors).ok())
                .unwrap_or_default();
            if errors.is_empty() {
                handlers.next(payload.get("data").cloned().unwrap_or_default());
            } else {
                handlers.error(ConnectError::from_graphql(errors));
            }
            None
        }
        "error" => {
            if let Some(handlers) = inner.remove(id) {
                let errors: Vec<GraphQLError> = frame
                    .payload
                    .and_then(|payload| serde_json::from_value(payload).ok())
                    .unwrap_or_default();
                let err = if errors.is_empty() {
                    ConnectError::unexpected("subscription failed without details")
                } else {
                    ConnectError::from_graphql(errors)
                };
                handlers.error(err);
            }
            None
        }
        "complete" => {
            if let Some(handlers) = inner.remove(id) {
                handlers.complete();
            }
            None
        }
        "ping" => Some(Frame::new("pong", None, frame.payload)),
        "pong" => None,
        other => {
            debug!(kind = other, "ignoring frame");
            None
        }
    }
}
