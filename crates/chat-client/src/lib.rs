//! Persistent WebSocket client for the chat server.
//!
//! One background task owns the socket. Outbound requests travel over an
//! `mpsc` queue; inbound messages are fanned out to per-`message_id`
//! channels. A lost connection fails every in-flight request and the task
//! reconnects with exponential backoff.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use shared::models::{ChatMessage, ChatRequest, PartKind};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 64;
const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);
const MAX_BACKOFF_EXPONENT: u32 = 16;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Responder = mpsc::UnboundedSender<Result<ChatMessage, ClientError>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("Not connected to server")]
    NotConnected,
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("failed to encode chat request: {0}")]
    Encode(String),
    #[error("Error: {0}")]
    Server(String),
    #[error("chat client has shut down")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub url: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl ChatClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
        }
    }

    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.min(MAX_BACKOFF_EXPONENT);
        self.reconnect_base_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay)
    }
}

struct Command {
    message_id: u64,
    request: ChatRequest,
    responder: Responder,
}

impl Command {
    fn reject(self, err: ClientError) {
        let _ = self.responder.send(Err(err));
    }
}

pub struct ChatClient {
    commands: mpsc::Sender<Command>,
    session_id: Arc<Mutex<Option<String>>>,
    next_message_id: AtomicU64,
    task: JoinHandle<()>,
}

impl ChatClient {
    /// Spawns the connection task. Requests sent before the first connection
    /// attempt finishes are queued rather than rejected.
    pub fn start(config: ChatClientConfig) -> Self {
        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let session_id = Arc::new(Mutex::new(None));
        let task = tokio::spawn(run_connection(config, commands_rx, session_id.clone()));

        Self {
            commands,
            session_id,
            next_message_id: AtomicU64::new(0),
            task,
        }
    }

    /// The session id most recently issued by the server.
    pub fn session_id(&self) -> Option<String> {
        lock_session(&self.session_id).clone()
    }

    /// Queues one request and returns the stream of its outbound messages.
    ///
    /// A request without a session id reuses the one the server issued
    /// earlier on this client, so history carries across reconnects.
    pub async fn send(&self, mut request: ChatRequest) -> Result<ResponseStream, ClientError> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        if request.client_session_id().is_none() {
            request.session_id = self.session_id();
        }
        request.message_id = Some(Value::from(message_id));

        let (responder, responses) = mpsc::unbounded_channel();
        self.commands
            .send(Command {
                message_id,
                request,
                responder,
            })
            .await
            .map_err(|_| ClientError::Stopped)?;

        Ok(ResponseStream {
            message_id,
            responses,
        })
    }

    /// Sends a request and yields answer chunks. An error message from the
    /// server surfaces as `ClientError::Server` and ends the stream.
    pub async fn stream_response(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<String, ClientError>>, ClientError> {
        let responses = self.send(request).await?;
        Ok(responses
            .map(|message| {
                let message = message?;
                match message.kind {
                    PartKind::Response => Ok(message.content),
                    PartKind::Error => Err(ClientError::Server(message.content)),
                }
            })
            .boxed())
    }

    /// Closes the socket and waits for the connection task to exit.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(err) = task.await {
            warn!(error = %err, "chat client task ended abnormally");
        }
    }
}

/// Messages for one request, ending after its `is_last` message.
pub struct ResponseStream {
    message_id: u64,
    responses: mpsc::UnboundedReceiver<Result<ChatMessage, ClientError>>,
}

impl ResponseStream {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }
}

impl Stream for ResponseStream {
    type Item = Result<ChatMessage, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.responses.poll_recv(cx)
    }
}

enum ConnectionEnd {
    Shutdown,
    Lost,
}

async fn run_connection(
    config: ChatClientConfig,
    mut commands: mpsc::Receiver<Command>,
    session_id: Arc<Mutex<Option<String>>>,
) {
    let mut attempt = 0_u32;

    loop {
        let socket = match connect_async(config.url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(err) => {
                let delay = config.reconnect_delay(attempt);
                attempt = attempt.saturating_add(1);
                warn!(
                    url = %config.url,
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "chat server connection failed"
                );
                if !reject_until(delay, &mut commands).await {
                    return;
                }
                continue;
            }
        };

        attempt = 0;
        info!(url = %config.url, "chat server connected");
        match serve_connection(socket, &mut commands, &session_id).await {
            ConnectionEnd::Shutdown => {
                debug!("chat client shut down");
                return;
            }
            ConnectionEnd::Lost => warn!(url = %config.url, "chat server connection lost"),
        }
    }
}

/// Rejects requests until `delay` elapses. Returns `false` once the client
/// has been shut down.
async fn reject_until(delay: Duration, commands: &mut mpsc::Receiver<Command>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(command) => command.reject(ClientError::NotConnected),
                None => return false,
            },
        }
    }
}

async fn serve_connection(
    socket: Socket,
    commands: &mut mpsc::Receiver<Command>,
    session_id: &Mutex<Option<String>>,
) -> ConnectionEnd {
    let (mut socket_tx, mut socket_rx) = socket.split();
    let mut in_flight: HashMap<u64, Responder> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = socket_tx.close().await;
                    fail_in_flight(&mut in_flight, &ClientError::Stopped);
                    return ConnectionEnd::Shutdown;
                };

                let payload = match serde_json::to_string(&command.request) {
                    Ok(payload) => payload,
                    Err(err) => {
                        command.reject(ClientError::Encode(err.to_string()));
                        continue;
                    }
                };
                if let Err(err) = socket_tx.send(Message::Text(payload.into())).await {
                    command.reject(ClientError::Connection(err.to_string()));
                    fail_in_flight(&mut in_flight, &ClientError::NotConnected);
                    return ConnectionEnd::Lost;
                }
                in_flight.insert(command.message_id, command.responder);
            }
            frame = socket_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    route_incoming(text.as_str(), &mut in_flight, session_id);
                }
                Some(Ok(Message::Close(_))) | None => {
                    fail_in_flight(&mut in_flight, &ClientError::NotConnected);
                    return ConnectionEnd::Lost;
                }
                Some(Err(err)) => {
                    debug!(error = %err, "chat socket read failed");
                    fail_in_flight(&mut in_flight, &ClientError::NotConnected);
                    return ConnectionEnd::Lost;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

fn route_incoming(
    raw: &str,
    in_flight: &mut HashMap<u64, Responder>,
    session_id: &Mutex<Option<String>>,
) {
    let message = match serde_json::from_str::<ChatMessage>(raw) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "ignoring malformed chat server message");
            return;
        }
    };

    if !message.session_id.is_empty() {
        *lock_session(session_id) = Some(message.session_id.clone());
    }

    let Some(message_id) = message.message_id.as_ref().and_then(Value::as_u64) else {
        debug!("chat server message without a known message id");
        return;
    };
    let finished = message.is_last || message.kind == PartKind::Error;

    let delivered = in_flight
        .get(&message_id)
        .is_some_and(|responder| responder.send(Ok(message)).is_ok());
    if finished || !delivered {
        in_flight.remove(&message_id);
    }
}

fn fail_in_flight(in_flight: &mut HashMap<u64, Responder>, err: &ClientError) {
    for (_, responder) in in_flight.drain() {
        let _ = responder.send(Err(err.clone()));
    }
}

fn lock_session(session_id: &Mutex<Option<String>>) -> MutexGuard<'_, Option<String>> {
    session_id
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{ChatClientConfig, ClientError, fail_in_flight, route_incoming};

    #[test]
    fn reconnect_delay_doubles_up_to_cap() {
        let config = ChatClientConfig {
            url: "ws://127.0.0.1:1/chat".to_string(),
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_millis(1_000),
        };
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(100));
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(200));
        assert_eq!(config.reconnect_delay(3), Duration::from_millis(800));
        assert_eq!(config.reconnect_delay(4), Duration::from_millis(1_000));
        assert_eq!(config.reconnect_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn routes_messages_by_id_and_closes_on_last() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut in_flight = HashMap::from([(3_u64, tx)]);
        let session = Mutex::new(None);

        let chunk = json!({
            "type": "response", "content": "Hi", "message_id": 3,
            "session_id": "s-1", "is_last": false,
        });
        route_incoming(&chunk.to_string(), &mut in_flight, &session);
        assert!(in_flight.contains_key(&3));
        assert_eq!(session.lock().expect("lock").as_deref(), Some("s-1"));

        let last = json!({
            "type": "response", "content": "!", "message_id": 3,
            "session_id": "s-1", "is_last": true,
        });
        route_incoming(&last.to_string(), &mut in_flight, &session);
        assert!(in_flight.is_empty());

        let first = rx.try_recv().expect("first chunk").expect("ok chunk");
        assert_eq!(first.content, "Hi");
        let second = rx.try_recv().expect("last chunk").expect("ok chunk");
        assert!(second.is_last);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unknown_message_ids_are_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut in_flight = HashMap::from([(1_u64, tx)]);
        let session = Mutex::new(None);

        let stray = json!({
            "type": "response", "content": "x", "message_id": 9,
            "session_id": "s-2", "is_last": true,
        });
        route_incoming(&stray.to_string(), &mut in_flight, &session);
        route_incoming("not json", &mut in_flight, &session);

        assert!(in_flight.contains_key(&1));
        assert!(rx.try_recv().is_err());
        assert_eq!(session.lock().expect("lock").as_deref(), Some("s-2"));
    }

    #[test]
    fn lost_connection_fails_every_in_flight_request() {
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        let mut in_flight = HashMap::from([(1_u64, first_tx), (2_u64, second_tx)]);

        fail_in_flight(&mut in_flight, &ClientError::NotConnected);

        assert!(in_flight.is_empty());
        for rx in [&mut first_rx, &mut second_rx] {
            let err = rx.try_recv().expect("failure delivered").expect_err("error");
            assert_eq!(err.to_string(), "Not connected to server");
        }
    }
}
