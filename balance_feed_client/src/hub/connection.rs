//! The SignalR WebSocket transport.
//!
//! [`SignalRTransport::start`] negotiates, opens the WebSocket, completes the handshake and then hands the socket to a
//! worker task. The worker owns the socket for the rest of the connection's life: it writes invocations and pings,
//! reads server messages, matches completions to pending invocations and, when the socket drops, reconnects on its own.
//! [`SignalRConnection`] is a thin handle that talks to the worker over a command channel.
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use balance_feed_engine::{AccessTokenFactory, HubConnection, HubEvent, HubTransport, TransportError};
use bf_common::Secret;
use futures::{SinkExt, StreamExt};
use log::*;
use reqwest::Client;
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::{Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Error as WsError,
        Message,
    },
    MaybeTlsStream,
    WebSocketStream,
};
use url::Url;

use crate::hub::{
    negotiate::{negotiate, websocket_url},
    protocol::{
        encode_close,
        encode_invocation,
        encode_ping,
        handshake_request,
        parse_handshake_response,
        parse_message,
        FrameBuffer,
        HubMessage,
    },
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type InvocationReply = oneshot::Sender<Result<(), TransportError>>;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_BUFFER: usize = 32;

/// The pauses before each automatic reconnect attempt.
pub fn default_reconnect_delays() -> Vec<Duration> {
    [0, 2, 10, 30].into_iter().map(Duration::from_secs).collect()
}

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub hub_url: Url,
    /// Open the WebSocket directly, without the negotiate round trip. Only valid for hubs that only offer WebSockets.
    pub skip_negotiation: bool,
    /// How often the client pings the hub.
    pub keep_alive: Duration,
    /// The connection is considered lost if nothing arrives from the hub for this long.
    pub server_timeout: Duration,
    pub invoke_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_delays: Vec<Duration>,
}

impl HubOptions {
    pub fn new(hub_url: Url) -> Self {
        Self {
            hub_url,
            skip_negotiation: false,
            keep_alive: DEFAULT_KEEP_ALIVE,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            reconnect_delays: default_reconnect_delays(),
        }
    }

    pub fn with_skip_negotiation(mut self, skip: bool) -> Self {
        self.skip_negotiation = skip;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self.server_timeout = self.server_timeout.max(keep_alive * 2);
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn with_reconnect_delays(mut self, delays: Vec<Duration>) -> Self {
        self.reconnect_delays = delays;
        self
    }
}

pub struct SignalRTransport {
    options: HubOptions,
    http: Client,
}

impl SignalRTransport {
    pub fn new(options: HubOptions) -> Result<Self, TransportError> {
        let http = Client::builder()
            .user_agent(concat!("balance-feed/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Network(format!("Could not create the HTTP client. {e}")))?;
        Ok(Self { options, http })
    }

    pub fn options(&self) -> &HubOptions {
        &self.options
    }
}

impl HubTransport for SignalRTransport {
    type Connection = SignalRConnection;

    async fn start(
        &self,
        tokens: AccessTokenFactory,
        events: mpsc::Sender<HubEvent>,
    ) -> Result<SignalRConnection, TransportError> {
        let token = tokens(None).await?;
        let session = open_session(&self.options, &self.http, token).await?;
        info!("🔌️ Hub connection established with {}", self.options.hub_url.host_str().unwrap_or_default());
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let worker = Worker {
            options: self.options.clone(),
            http: self.http.clone(),
            tokens,
            events,
            commands: receiver,
            pending: HashMap::new(),
        };
        tokio::spawn(worker.run(session));
        Ok(SignalRConnection { commands, next_id: AtomicU64::new(0), invoke_timeout: self.options.invoke_timeout })
    }
}

enum Command {
    Invoke { id: String, target: String, arguments: Vec<Value>, reply: InvocationReply },
    Stop,
}

/// A handle on a live hub connection. Dropping it stops the connection.
pub struct SignalRConnection {
    commands: mpsc::Sender<Command>,
    next_id: AtomicU64,
    invoke_timeout: Duration,
}

impl SignalRConnection {
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl HubConnection for SignalRConnection {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<(), TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let (reply, response) = oneshot::channel();
        let command = Command::Invoke { id: id.clone(), target: method.to_string(), arguments: args, reply };
        self.commands.send(command).await.map_err(|_| TransportError::Closed)?;
        match tokio::time::timeout(self.invoke_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Invocation(format!(
                "{method} (invocation {id}) was not acknowledged within {}s",
                self.invoke_timeout.as_secs()
            ))),
        }
    }

    async fn stop(&self) {
        if self.commands.send(Command::Stop).await.is_err() {
            return;
        }
        if tokio::time::timeout(STOP_TIMEOUT, self.commands.closed()).await.is_err() {
            warn!("🔌️ The hub connection did not shut down within {}s", STOP_TIMEOUT.as_secs());
        }
    }
}

struct Session {
    ws: WsStream,
    buffer: FrameBuffer,
    /// Messages that arrived together with the handshake response.
    backlog: VecDeque<String>,
}

enum Exit {
    /// Stopped by the client. Nothing is reported.
    Stopped,
    /// The server ended the connection for good.
    Closed(Option<String>),
    /// The connection was lost and may be restored.
    Dropped(String),
}

enum Reconnect {
    Restored(Session),
    Stopped,
    GaveUp(String),
}

struct Worker {
    options: HubOptions,
    http: Client,
    tokens: AccessTokenFactory,
    events: mpsc::Sender<HubEvent>,
    commands: mpsc::Receiver<Command>,
    pending: HashMap<String, InvocationReply>,
}

impl Worker {
    async fn run(mut self, mut session: Session) {
        loop {
            let exit = self.serve(&mut session).await;
            self.fail_pending();
            match exit {
                Exit::Stopped => {
                    close_session(&mut session.ws).await;
                    debug!("🔌️ Hub connection stopped");
                    return;
                },
                Exit::Closed(reason) => {
                    info!("🔌️ The hub closed the connection. {}", reason.as_deref().unwrap_or_default());
                    self.emit(HubEvent::Closed { reason }).await;
                    return;
                },
                Exit::Dropped(reason) => {
                    warn!("🔌️ Hub connection lost. {reason}");
                    self.emit(HubEvent::Reconnecting { reason }).await;
                    match self.reconnect().await {
                        Reconnect::Restored(next) => {
                            session = next;
                            info!("🔌️ Hub connection restored");
                            self.emit(HubEvent::Reconnected).await;
                        },
                        Reconnect::Stopped => {
                            debug!("🔌️ Hub connection stopped while reconnecting");
                            return;
                        },
                        Reconnect::GaveUp(reason) => {
                            error!("🔌️ Giving up on the hub connection. {reason}");
                            self.emit(HubEvent::Closed { reason: Some(reason) }).await;
                            return;
                        },
                    }
                },
            }
        }
    }

    async fn serve(&mut self, session: &mut Session) -> Exit {
        let mut last_received = Instant::now();
        for frame in std::mem::take(&mut session.backlog) {
            if let Some(exit) = self.handle_frame(&frame).await {
                return exit;
            }
        }
        let period = self.options.keep_alive;
        let mut keep_alive = tokio::time::interval_at(Instant::now() + period, period);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Invoke { id, target, arguments, reply }) => {
                        let frame = encode_invocation(&id, &target, &arguments);
                        if let Err(e) = session.ws.send(Message::text(frame)).await {
                            let _ = reply.send(Err(TransportError::Network(e.to_string())));
                            return Exit::Dropped(format!("Could not send {target}. {e}"));
                        }
                        trace!("🔌️ Invoked {target} (invocation {id})");
                        self.pending.insert(id, reply);
                    },
                    Some(Command::Stop) | None => return Exit::Stopped,
                },
                message = session.ws.next() => {
                    last_received = Instant::now();
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                        Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                        Some(Ok(Message::Close(frame))) => {
                            let reason = match frame {
                                Some(f) => {
                                    format!("The server closed the WebSocket ({}). {}", u16::from(f.code), f.reason)
                                },
                                None => "The server closed the WebSocket".to_string(),
                            };
                            return Exit::Dropped(reason);
                        },
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Exit::Dropped(format!("WebSocket error. {e}")),
                        None => return Exit::Dropped("The WebSocket stream ended".to_string()),
                    };
                    for frame in session.buffer.push(&text) {
                        if let Some(exit) = self.handle_frame(&frame).await {
                            return exit;
                        }
                    }
                },
                _ = keep_alive.tick() => {
                    if last_received.elapsed() > self.options.server_timeout {
                        return Exit::Dropped(format!(
                            "Nothing received from the hub in {}s",
                            self.options.server_timeout.as_secs()
                        ));
                    }
                    if let Err(e) = session.ws.send(Message::text(encode_ping())).await {
                        return Exit::Dropped(format!("Could not send a ping. {e}"));
                    }
                },
            }
        }
    }

    async fn handle_frame(&mut self, frame: &str) -> Option<Exit> {
        let message = match parse_message(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("🔌️ Ignoring hub message. {e}");
                return None;
            },
        };
        match message {
            HubMessage::Invocation { target, arguments, .. } => {
                let payload = arguments.into_iter().next().unwrap_or(Value::Null);
                if self.events.send(HubEvent::Invocation { target, payload }).await.is_err() {
                    debug!("🔌️ Nobody is listening to hub events any more. Stopping.");
                    return Some(Exit::Stopped);
                }
            },
            HubMessage::Completion { invocation_id, error, .. } => match self.pending.remove(&invocation_id) {
                Some(reply) => {
                    let result = match error {
                        Some(error) => Err(TransportError::Invocation(error)),
                        None => Ok(()),
                    };
                    let _ = reply.send(result);
                },
                None => debug!("🔌️ Completion for unknown invocation {invocation_id}"),
            },
            HubMessage::Ping => trace!("🔌️ Ping from hub"),
            HubMessage::Close { error, allow_reconnect } => {
                let reason = error.unwrap_or_else(|| "The server closed the connection".to_string());
                return Some(if allow_reconnect { Exit::Dropped(reason) } else { Exit::Closed(Some(reason)) });
            },
            HubMessage::Unsupported(kind) => debug!("🔌️ Ignoring hub message of type {kind}"),
        }
        None
    }

    async fn reconnect(&mut self) -> Reconnect {
        let delays = self.options.reconnect_delays.clone();
        let mut last_error = None;
        for (attempt, delay) in delays.into_iter().enumerate() {
            if !delay.is_zero() {
                info!("🔌️ Reconnect attempt {} in {}s", attempt + 1, delay.as_secs());
                if wait_or_stop(&mut self.commands, tokio::time::sleep(delay)).await.is_none() {
                    return Reconnect::Stopped;
                }
            }
            let attempt_result = reconnect_once(&self.options, &self.http, &self.tokens);
            match wait_or_stop(&mut self.commands, attempt_result).await {
                None => return Reconnect::Stopped,
                Some(Ok(session)) => return Reconnect::Restored(session),
                Some(Err(TransportError::Token(reason))) => {
                    return Reconnect::GaveUp(format!("Could not obtain a fresh access token. {reason}"));
                },
                Some(Err(e)) if e.is_auth_error() => {
                    return Reconnect::GaveUp(format!("The hub rejected the refreshed access token. {e}"));
                },
                Some(Err(e)) => {
                    warn!("🔌️ Reconnect attempt {} failed. {e}", attempt + 1);
                    last_error = Some(e);
                },
            }
        }
        match last_error {
            Some(e) => Reconnect::GaveUp(format!("Reconnect attempts exhausted. {e}")),
            None => Reconnect::GaveUp("Automatic reconnection is disabled".to_string()),
        }
    }

    async fn emit(&self, event: HubEvent) {
        if self.events.send(event).await.is_err() {
            debug!("🔌️ Hub event dropped. Nobody is listening.");
        }
    }

    fn fail_pending(&mut self) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(TransportError::Closed));
        }
    }
}

/// Runs `future` to completion while answering commands. Returns `None` if the connection is stopped first.
async fn wait_or_stop<F: Future>(commands: &mut mpsc::Receiver<Command>, future: F) -> Option<F::Output> {
    tokio::pin!(future);
    loop {
        tokio::select! {
            output = &mut future => return Some(output),
            command = commands.recv() => match command {
                Some(Command::Invoke { target, reply, .. }) => {
                    let error = TransportError::Network(format!("Cannot invoke {target} while reconnecting"));
                    let _ = reply.send(Err(error));
                },
                Some(Command::Stop) | None => return None,
            },
        }
    }
}

/// One reconnect attempt. A rejected token is handed back to the factory, which refreshes it once.
async fn reconnect_once(
    options: &HubOptions,
    http: &Client,
    tokens: &AccessTokenFactory,
) -> Result<Session, TransportError> {
    let token = tokens(None).await?;
    match open_session(options, http, token.clone()).await {
        Err(e) if e.is_auth_error() => {
            warn!("🔑️ The hub rejected the access token while reconnecting. Asking for a new one.");
            let fresh = tokens(Some(token)).await?;
            open_session(options, http, fresh).await
        },
        result => result,
    }
}

async fn open_session(options: &HubOptions, http: &Client, token: Secret<String>) -> Result<Session, TransportError> {
    let (url, connection_token, token) = if options.skip_negotiation {
        (options.hub_url.clone(), None, token)
    } else {
        let negotiated = negotiate(http, &options.hub_url, token).await?;
        (negotiated.url, negotiated.connection_token, negotiated.access_token)
    };
    let ws_url = websocket_url(&url, connection_token.as_deref(), &token)?;
    let mut request = ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Protocol(format!("Invalid WebSocket request. {e}")))?;
    if !token.is_empty() {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.reveal()))
            .map_err(|_| TransportError::Token("The access token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
    }
    debug!("🔌️ Opening WebSocket to {}{}", ws_url.host_str().unwrap_or_default(), ws_url.path());
    let (mut ws, _) = connect_async(request).await.map_err(map_ws_error)?;
    let (buffer, backlog) = tokio::time::timeout(options.handshake_timeout, handshake(&mut ws))
        .await
        .map_err(|_| TransportError::Protocol("The hub did not answer the handshake in time".to_string()))??;
    Ok(Session { ws, buffer, backlog })
}

async fn handshake(ws: &mut WsStream) -> Result<(FrameBuffer, VecDeque<String>), TransportError> {
    ws.send(Message::text(handshake_request())).await.map_err(|e| TransportError::Network(e.to_string()))?;
    let mut buffer = FrameBuffer::default();
    while let Some(message) = ws.next().await {
        let text = match message.map_err(|e| TransportError::Network(e.to_string()))? {
            Message::Text(text) => text.as_str().to_string(),
            Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        let mut frames = VecDeque::from(buffer.push(&text));
        if let Some(response) = frames.pop_front() {
            parse_handshake_response(&response)?;
            trace!("🔌️ Handshake complete");
            return Ok((buffer, frames));
        }
    }
    Err(TransportError::Protocol("The hub closed the connection during the handshake".to_string()))
}

async fn close_session(ws: &mut WsStream) {
    let _ = ws.send(Message::text(encode_close())).await;
    let _ = ws.close(None).await;
}

fn map_ws_error(e: WsError) -> TransportError {
    match e {
        WsError::Http(response) => {
            TransportError::from_status(response.status().as_u16(), "The hub refused the WebSocket upgrade")
        },
        e => TransportError::Network(e.to_string()),
    }
}
