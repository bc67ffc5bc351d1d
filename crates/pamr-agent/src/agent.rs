//! Agent: one persistent router connection per process.
//!
//! [`Agent::connect`] opens a stream through the configured
//! [`SocketFactory`], registers, and spawns two tasks:
//!
//! - the connection task reads frames, completes pending calls, answers
//!   router heartbeats, and reconnects when the stream dies
//! - the dispatcher hands inbound `DATA` to the [`MessageHandler`]. One-way
//!   messages run one at a time in arrival order. Two-way requests each get
//!   their own task, up to [`MAX_CONCURRENT_REQUESTS`], so a handler may call
//!   back into an agent that is itself waiting on this one.
//!
//! When the router sends heartbeats, the connection task also treats three
//! missed periods of silence as a dead link unless an explicit
//! `heartbeat_timeout_ms` is configured.
//!
//! Writes from any task go through one mutex-guarded writer so frames never
//! interleave on the wire.

use crate::pending::PendingCalls;
use crate::retry::{compute_backoff, connect_retry_config};
use crate::socket::{socket_factory, BoxedStream, SocketFactory};
use async_trait::async_trait;
use bytes::Bytes;
use pamr_types::config::AgentConfig;
use pamr_types::{AgentId, MagicCookie, PamrError, PamrResult};
use pamr_wire::message::decode_agent_list;
use pamr_wire::{read_frame, write_frame, AgentDescriptor, ErrorCode, Frame, MessageType, MAX_PAYLOAD_SIZE};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Inbound messages waiting for the handler.
const DISPATCH_QUEUE_DEPTH: usize = 1024;

/// Two-way requests handled at the same time.
pub const MAX_CONCURRENT_REQUESTS: usize = 64;

/// Missed router heartbeats before the link is declared dead.
const MISSED_HEARTBEATS: u32 = 3;

/// A `DATA` message delivered to this agent.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub source: AgentId,
    pub message_id: u32,
    pub one_way: bool,
    pub payload: Bytes,
}

/// Application side of an agent.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message. For two-way messages the returned bytes are the
    /// reply; an `Err` is reported to the caller as a remote failure.
    async fn handle_message(&self, message: IncomingMessage) -> Result<Bytes, String>;
}

type Writer = Arc<Mutex<WriteHalf<BoxedStream>>>;

/// The live connection, if any.
#[derive(Clone)]
struct Session {
    agent_id: AgentId,
    generation: u64,
    writer: Writer,
    /// Longest silence tolerated from the router, `None` to wait forever.
    silence_limit: Option<Duration>,
}

impl Session {
    async fn write(&self, frame: &Frame) -> PamrResult<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame)
            .await
            .map_err(|_| PamrError::ConnectionLost)
    }
}

struct AgentInner {
    config: AgentConfig,
    factory: Arc<dyn SocketFactory>,
    cookie: MagicCookie,
    /// Id to request on the next registration: the configured reservable id,
    /// then whatever the router assigned.
    identity: RwLock<Option<AgentId>>,
    session: RwLock<Option<Session>>,
    generation: AtomicU64,
    next_message_id: AtomicU32,
    pending: PendingCalls,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Handle to a connected agent. Cheap to clone.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Connect using the transport selected in `config`.
    pub async fn from_config(
        config: AgentConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> PamrResult<Self> {
        let factory = socket_factory(&config);
        Self::connect(config, factory, handler).await
    }

    /// Connect and register, retrying until the connect timeout elapses.
    pub async fn connect(
        config: AgentConfig,
        factory: Arc<dyn SocketFactory>,
        handler: Arc<dyn MessageHandler>,
    ) -> PamrResult<Self> {
        config.validate()?;
        let identity = config.requested_id()?;
        let cookie = config
            .magic_cookie
            .clone()
            .unwrap_or_else(MagicCookie::generate);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(AgentInner {
            config,
            factory,
            cookie,
            identity: RwLock::new(identity),
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            next_message_id: AtomicU32::new(1),
            pending: PendingCalls::new(),
            shutdown_tx,
            shutdown_rx,
        });

        let (reader, session) = inner.establish().await?;
        info!(
            agent_id = %session.agent_id,
            router = %inner.config.router_address(),
            transport = inner.factory.name(),
            "Agent registered"
        );

        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
        tokio::spawn(dispatch_loop(Arc::clone(&inner), handler, dispatch_rx));
        tokio::spawn(connection_loop(Arc::clone(&inner), reader, session, dispatch_tx));

        Ok(Self { inner })
    }

    /// Id currently held on the router, `None` while reconnecting.
    pub fn agent_id(&self) -> Option<AgentId> {
        self.inner.current_session().map(|s| s.agent_id)
    }

    pub fn cookie(&self) -> &MagicCookie {
        &self.inner.cookie
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current_session().is_some()
    }

    /// Send a message.
    ///
    /// One-way sends return as soon as the frame is written, with an empty
    /// reply. Two-way sends wait for the reply, bounded by the configured
    /// call timeout when there is one.
    pub async fn send(
        &self,
        destination: AgentId,
        payload: impl Into<Bytes>,
        one_way: bool,
    ) -> PamrResult<Bytes> {
        if one_way {
            self.send_one_way(destination, payload).await?;
            return Ok(Bytes::new());
        }
        self.call_with_timeout(destination, payload, self.inner.config.call_timeout())
            .await
    }

    /// Fire-and-forget send.
    pub async fn send_one_way(
        &self,
        destination: AgentId,
        payload: impl Into<Bytes>,
    ) -> PamrResult<()> {
        let payload = checked_payload(payload.into())?;
        let session = self.inner.require_session()?;
        let message_id = self.inner.next_message_id();
        let frame = Frame::data(message_id, session.agent_id, destination, payload, true);
        trace!("-> {frame}");
        session.write(&frame).await
    }

    /// Two-way send with the configured call timeout.
    pub async fn call(&self, destination: AgentId, payload: impl Into<Bytes>) -> PamrResult<Bytes> {
        self.call_with_timeout(destination, payload, self.inner.config.call_timeout())
            .await
    }

    /// Two-way send; `None` waits until a reply or a disconnect.
    pub async fn call_with_timeout(
        &self,
        destination: AgentId,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> PamrResult<Bytes> {
        let payload = checked_payload(payload.into())?;
        self.inner
            .request(Some(destination), timeout, |message_id, source| {
                Frame::data(message_id, source, destination, payload, false)
            })
            .await
    }

    /// Agents currently registered on the router.
    pub async fn list_agents(&self) -> PamrResult<Vec<AgentDescriptor>> {
        let timeout = self
            .inner
            .config
            .call_timeout()
            .or(Some(Duration::from_secs(30)));
        // LIST_REPLY comes from the router itself, which has no agent id;
        // peer departures never fail it.
        let payload = self
            .inner
            .request(None, timeout, |message_id, source| {
                Frame::list_request(message_id, source)
            })
            .await?;
        Ok(decode_agent_list(&payload)?)
    }

    /// Close the connection and stop reconnecting. Pending calls fail with
    /// [`PamrError::ShuttingDown`].
    pub async fn shutdown(&self) {
        info!(agent_id = ?self.agent_id(), "Agent shutting down");
        let _ = self.inner.shutdown_tx.send(true);
        if let Some(session) = self.inner.take_session(None) {
            let mut writer = session.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.inner.pending.fail_all(|| PamrError::ShuttingDown);
    }
}

fn checked_payload(payload: Bytes) -> PamrResult<Bytes> {
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(PamrError::ProtocolViolation(format!(
            "payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    Ok(payload)
}

impl AgentInner {
    fn next_message_id(&self) -> u32 {
        // 0 is reserved for router notices.
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn current_session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn require_session(&self) -> PamrResult<Session> {
        if self.is_shutting_down() {
            return Err(PamrError::ShuttingDown);
        }
        self.current_session().ok_or(PamrError::ConnectionLost)
    }

    /// Clear the session if it is still `generation` (any when `None`).
    fn take_session(&self, generation: Option<u64>) -> Option<Session> {
        let mut slot = self.session.write().unwrap_or_else(|e| e.into_inner());
        match (&*slot, generation) {
            (Some(current), Some(g)) if current.generation != g => None,
            _ => slot.take(),
        }
    }

    fn install_session(&self, session: Session) {
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = Some(session.agent_id);
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(session);
    }

    /// Write a correlated request and wait for its reply.
    async fn request(
        &self,
        destination: Option<AgentId>,
        timeout: Option<Duration>,
        build: impl FnOnce(u32, AgentId) -> Frame,
    ) -> PamrResult<Bytes> {
        let session = self.require_session()?;
        let message_id = self.next_message_id();
        let reply = self.pending.register(message_id, destination);

        // A disconnect clears the session before failing pending calls, so a
        // call registered after that sweep is caught here.
        match self.current_session() {
            Some(current) if current.generation == session.generation => {}
            _ => {
                self.pending.remove(message_id);
                return Err(PamrError::ConnectionLost);
            }
        }

        let frame = build(message_id, session.agent_id);
        trace!("-> {frame}");
        if let Err(e) = session.write(&frame).await {
            self.pending.remove(message_id);
            return Err(e);
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.remove(message_id);
                    return Err(PamrError::Timeout(limit.as_millis() as u64));
                }
            },
            None => reply.await,
        };
        outcome.unwrap_or(Err(PamrError::ConnectionLost))
    }

    /// Connect and register, retrying with backoff until the connect timeout.
    async fn establish(&self) -> PamrResult<(ReadHalf<BoxedStream>, Session)> {
        let policy = connect_retry_config();
        let deadline = self.config.connect_timeout().map(|t| Instant::now() + t);
        let mut attempt: u32 = 0;
        loop {
            if self.is_shutting_down() {
                return Err(PamrError::ShuttingDown);
            }
            let failure = match self.register().await {
                Ok(established) => return Ok(established),
                Err(PamrError::InvalidAgentId(raw)) => {
                    // The router forgot us (restart or eviction): start over
                    // with a fresh dynamic id.
                    warn!(agent_id = raw, "Router does not know our id, registering dynamically");
                    self.forget_identity();
                    continue;
                }
                Err(e @ (PamrError::AuthFailure(_) | PamrError::IdInUse(_)))
                    if self.holds_assigned_identity() =>
                {
                    // A restarted router handed our old dynamic id to someone
                    // else. Only configured reservable ids are worth fighting for.
                    warn!("Previous id no longer ours ({e}), registering dynamically");
                    self.forget_identity();
                    continue;
                }
                Err(e @ (PamrError::AuthFailure(_)
                | PamrError::IdInUse(_)
                | PamrError::CapacityExhausted
                | PamrError::HostKeyVerification { .. }
                | PamrError::Config(_))) => return Err(e),
                Err(e) => e,
            };

            let delay = Duration::from_millis(compute_backoff(&policy, attempt));
            attempt = attempt.saturating_add(1);
            let sleep_until = Instant::now() + delay;
            if let Some(deadline) = deadline {
                if sleep_until >= deadline {
                    return Err(PamrError::ConnectFailure {
                        address: self.config.router_address(),
                        reason: failure.to_string(),
                    });
                }
            }
            if failure.is_transient() {
                debug!(attempt, ?delay, "Router connection failed: {failure}");
            } else {
                warn!(attempt, ?delay, "Router connection failed: {failure}");
            }
            let mut shutdown = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep_until(sleep_until) => {}
                _ = shutdown.changed() => return Err(PamrError::ShuttingDown),
            }
        }
    }

    fn forget_identity(&self) {
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Whether the next registration asks for a router-assigned dynamic id.
    fn holds_assigned_identity(&self) -> bool {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|id| !id.is_reserved())
    }

    /// One connection attempt: open a stream and run the handshake.
    async fn register(&self) -> PamrResult<(ReadHalf<BoxedStream>, Session)> {
        let stream = self
            .factory
            .connect(&self.config.router_host, self.config.router_port)
            .await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let requested = *self.identity.read().unwrap_or_else(|e| e.into_inner());
        let request = Frame::register_request(self.next_message_id(), requested, Some(&self.cookie));
        write_frame(&mut writer, &request).await?;

        let handshake_limit = self
            .config
            .connect_timeout()
            .unwrap_or(Duration::from_secs(30));
        let reply = tokio::time::timeout(handshake_limit, read_frame(&mut reader))
            .await
            .map_err(|_| PamrError::Timeout(handshake_limit.as_millis() as u64))??;

        let agent_id = match reply.kind {
            MessageType::RegisterReply if reply.message_id == request.message_id => {
                reply.assigned_id()?
            }
            MessageType::Error => {
                let (code, detail) = reply.error_details()?;
                return Err(code.into_error(reply.source, detail));
            }
            other => {
                return Err(PamrError::ProtocolViolation(format!(
                    "expected REG_REP, got {other}"
                )))
            }
        };
        if let Some(wanted) = requested {
            if wanted != agent_id {
                return Err(PamrError::ProtocolViolation(format!(
                    "asked for id {wanted}, router assigned {agent_id}"
                )));
            }
        }

        let silence_limit = self.config.heartbeat_timeout().or_else(|| {
            reply
                .advertised_heartbeat()
                .map(|period| period * MISSED_HEARTBEATS)
        });
        let session = Session {
            agent_id,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            writer: Arc::new(Mutex::new(writer)),
            silence_limit,
        };
        self.install_session(session.clone());
        Ok((reader, session))
    }
}

/// Read frames until the connection dies, then reconnect.
async fn connection_loop(
    inner: Arc<AgentInner>,
    mut reader: ReadHalf<BoxedStream>,
    mut session: Session,
    dispatch: mpsc::Sender<Frame>,
) {
    loop {
        let reason = read_loop(&inner, &mut reader, &session, &dispatch).await;
        inner.take_session(Some(session.generation));
        let failed = inner.pending.fail_all(|| PamrError::ConnectionLost);

        if inner.is_shutting_down() {
            debug!(agent_id = %session.agent_id, "Connection task stopped");
            return;
        }
        warn!(
            agent_id = %session.agent_id,
            failed_calls = failed,
            "Router connection lost ({reason}), reconnecting"
        );

        match inner.establish().await {
            Ok((new_reader, new_session)) => {
                info!(
                    previous = %session.agent_id,
                    agent_id = %new_session.agent_id,
                    "Agent re-registered"
                );
                reader = new_reader;
                session = new_session;
            }
            Err(PamrError::ShuttingDown) => return,
            Err(e) => {
                error!(agent_id = %session.agent_id, "Giving up on router: {e}");
                return;
            }
        }
    }
}

/// Process frames from one connection. Returns why it ended.
async fn read_loop(
    inner: &AgentInner,
    reader: &mut ReadHalf<BoxedStream>,
    session: &Session,
    dispatch: &mpsc::Sender<Frame>,
) -> String {
    let mut shutdown = inner.shutdown_rx.clone();
    let silence_limit = session.silence_limit;
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => return "shutdown".to_string(),
            frame = read_with_limit(reader, silence_limit) => frame,
        };
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => return e.to_string(),
        };
        trace!("<- {frame}");

        match frame.kind {
            MessageType::Data => {
                if dispatch.send(frame).await.is_err() {
                    return "dispatcher stopped".to_string();
                }
            }
            MessageType::DataReply | MessageType::ListReply => {
                inner.pending.complete(frame.message_id, Ok(frame.payload));
            }
            MessageType::Error => handle_error(inner, frame),
            MessageType::HeartbeatRouter => {
                let beat = Frame::heartbeat_agent(frame.message_id, session.agent_id);
                if let Err(e) = session.write(&beat).await {
                    return e.to_string();
                }
            }
            other => {
                return format!("protocol violation: unexpected {other} from router");
            }
        }
    }
}

async fn read_with_limit(
    reader: &mut ReadHalf<BoxedStream>,
    limit: Option<Duration>,
) -> PamrResult<Frame> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, read_frame(reader)).await {
            Ok(frame) => Ok(frame?),
            Err(_) => Err(PamrError::Timeout(limit.as_millis() as u64)),
        },
        None => Ok(read_frame(reader).await?),
    }
}

fn handle_error(inner: &AgentInner, frame: Frame) {
    let (code, detail) = match frame.error_details() {
        Ok(details) => details,
        Err(e) => {
            warn!("Undecodable error frame from router: {e}");
            return;
        }
    };
    if frame.message_id != 0 {
        let error = code.into_error(frame.source, detail);
        if !inner.pending.complete(frame.message_id, Err(error)) {
            debug!(message_id = frame.message_id, ?code, "Error for a one-way or expired message");
        }
        return;
    }
    match (code, AgentId::new(frame.source)) {
        (ErrorCode::PeerDisconnected, Ok(departed)) => {
            let failed = inner
                .pending
                .fail_destination(departed, || PamrError::PeerDisconnected(departed));
            debug!(agent_id = %departed, failed, "Peer disconnected");
        }
        _ => warn!(?code, "Router notice: {detail}"),
    }
}

/// Deliver inbound messages to the handler.
async fn dispatch_loop(
    inner: Arc<AgentInner>,
    handler: Arc<dyn MessageHandler>,
    mut inbound: mpsc::Receiver<Frame>,
) {
    let in_flight = Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS));
    while let Some(request) = inbound.recv().await {
        let Ok(source) = AgentId::new(request.source) else {
            continue;
        };
        let message = IncomingMessage {
            source,
            message_id: request.message_id,
            one_way: request.one_way,
            payload: request.payload.clone(),
        };

        if request.one_way {
            if let Err(e) = handler.handle_message(message).await {
                debug!(%source, "One-way message handler failed: {e}");
            }
            continue;
        }

        let Ok(permit) = Arc::clone(&in_flight).acquire_owned().await else {
            return;
        };
        let inner = Arc::clone(&inner);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let outcome = handler.handle_message(message).await;
            answer(&inner, &request, outcome).await;
            drop(permit);
        });
    }
}

/// Send the reply to a two-way request.
async fn answer(inner: &AgentInner, request: &Frame, outcome: Result<Bytes, String>) {
    let source = request.source;
    // Only answer on a connection still bound to the id the request was
    // addressed to; the router rejects any other source.
    let Some(session) = inner.current_session() else {
        debug!(source, "No connection, dropping reply");
        return;
    };
    if session.agent_id.get() != request.destination {
        debug!(source, "Identity changed since request, dropping reply");
        return;
    }
    let reply = match outcome {
        Ok(payload) => match checked_payload(payload) {
            Ok(payload) => Frame::data_reply(request, payload),
            Err(e) => remote_failure(request, &e.to_string()),
        },
        Err(detail) => remote_failure(request, &detail),
    };
    if let Err(e) = session.write(&reply).await {
        debug!(source, "Failed to send reply: {e}");
    }
}

fn remote_failure(request: &Frame, detail: &str) -> Frame {
    Frame::error(
        request.message_id,
        request.destination,
        request.source,
        ErrorCode::RemoteFailure,
        detail,
    )
}
