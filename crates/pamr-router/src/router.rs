//! Router: TCP server relaying frames between registered agents.
//!
//! Each accepted connection gets a reader task (this module's
//! `handle_connection`) and a writer task draining a bounded queue. The
//! reader first expects a `REGISTER_REQUEST`; anything else is a protocol
//! violation and closes that connection only. Once registered, `DATA`,
//! `DATA_REPLY` and `ERROR` frames are forwarded by destination id.

use crate::table::{AgentEntry, AgentTable};
use chrono::Utc;
use pamr_types::config::RouterConfig;
use pamr_types::{AgentId, PamrError, PamrResult};
use pamr_wire::{read_frame, write_frame, ErrorCode, Frame, MessageType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// A running router.
pub struct Router {
    config: RouterConfig,
    table: AgentTable,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    next_conn_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Router {
    /// Bind the listener and start serving.
    ///
    /// Returns the router and the accept loop's handle, which completes after
    /// [`Router::shutdown`].
    pub async fn start(
        config: RouterConfig,
    ) -> PamrResult<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        config.validate()?;
        let table = AgentTable::with_reservations(&config.reserved)?;

        let listener = TcpListener::bind(config.listen_addr.as_str()).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "PAMR: router listening on {} ({} reserved ids)",
            local_addr,
            config.reserved.len()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = Arc::new(Self {
            config,
            table,
            local_addr,
            next_conn_id: AtomicU64::new(1),
            shutdown_tx,
            shutdown_rx,
        });

        if let Some(period) = router.config.heartbeat_period() {
            tokio::spawn(Arc::clone(&router).heartbeat_loop(period));
        }
        if let Some(max_age) = router.config.eviction_timeout() {
            tokio::spawn(Arc::clone(&router).eviction_loop(max_age));
        }

        let accept_router = Arc::clone(&router);
        let accept_handle = tokio::spawn(async move {
            accept_router.accept_loop(listener).await;
        });

        Ok((router, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The live agent table.
    pub fn table(&self) -> &AgentTable {
        &self.table
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        info!("PAMR: router shutting down");
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "PAMR: accepted connection");
                        let router = Arc::clone(&self);
                        tokio::spawn(async move {
                            router.handle_connection(stream, addr).await;
                        });
                    }
                    Err(e) => {
                        warn!("PAMR: accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("PAMR: accept loop stopped");
    }

    /// Serve one connection from handshake to disconnect.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if self.is_shutting_down() {
            return;
        }
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, "PAMR: set_nodelay failed: {e}");
        }
        let (mut reader, mut writer) = stream.into_split();
        let mut shutdown = self.shutdown_rx.clone();

        // AWAITING_REGISTRATION
        let request = tokio::select! {
            frame = self.read_next(&mut reader) => match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(peer = %addr, "PAMR: connection ended before registration: {e}");
                    return;
                }
            },
            _ = shutdown.changed() => return,
        };

        let (tx, rx) = mpsc::channel(self.config.queue_depth);
        let entry = AgentEntry::new(conn_id, tx.clone(), addr);
        let close = Arc::clone(&entry.close);
        let activity = entry.last_activity.clone();

        let agent_id = match self.admit(&request, entry) {
            Ok(agent_id) => agent_id,
            Err(e) => {
                warn!(peer = %addr, "PAMR: registration refused: {e}");
                let refusal = Frame::error(
                    request.message_id,
                    request.destination,
                    AgentId::DYNAMIC_SENTINEL,
                    ErrorCode::for_error(&e),
                    &e.to_string(),
                );
                let _ = write_frame(&mut writer, &refusal).await;
                let _ = writer.shutdown().await;
                return;
            }
        };

        // The reply goes out before the writer task starts, so it is the first
        // frame the agent sees. Frames forwarded meanwhile wait in the queue.
        let reply = Frame::register_reply(
            request.message_id,
            agent_id,
            self.config.heartbeat_period(),
        );
        if let Err(e) = write_frame(&mut writer, &reply).await {
            debug!(agent_id = %agent_id, "PAMR: failed to send registration reply: {e}");
            self.table.disconnect(agent_id, conn_id);
            return;
        }
        info!(agent_id = %agent_id, peer = %addr, "PAMR: agent registered");

        let writer_close = Arc::clone(&close);
        let writer_task = tokio::spawn(write_loop(writer, rx, writer_close));

        // REGISTERED
        let reason = loop {
            let next = tokio::select! {
                _ = close.notified() => break "closed by router".to_string(),
                _ = shutdown.changed() => break "router shutdown".to_string(),
                frame = self.read_next(&mut reader) => frame,
            };
            match next {
                Ok(frame) => {
                    activity.touch();
                    if let Err(e) = self.dispatch(agent_id, frame, &tx).await {
                        warn!(agent_id = %agent_id, "PAMR: {e}");
                        let _ = tx.try_send(Frame::error(
                            0,
                            agent_id.get(),
                            agent_id.get(),
                            ErrorCode::ProtocolViolation,
                            &e.to_string(),
                        ));
                        break e.to_string();
                    }
                }
                Err(PamrError::ConnectionLost) => break "closed by peer".to_string(),
                Err(e) => break e.to_string(),
            }
        };

        // DISCONNECTED
        if self.table.disconnect(agent_id, conn_id) {
            info!(agent_id = %agent_id, peer = %addr, %reason, "PAMR: agent disconnected");
            self.broadcast_disconnection(agent_id);
        } else {
            info!(agent_id = %agent_id, peer = %addr, %reason, "PAMR: stale connection closed");
        }
        drop(tx);
        // The writer drains queued frames, then closes the socket once the
        // table and any in-flight forwards have released their senders.
        if tokio::time::timeout(Duration::from_secs(5), writer_task)
            .await
            .is_err()
        {
            debug!(agent_id = %agent_id, "PAMR: writer did not finish in time");
        }
    }

    /// Validate a registration request and bind the connection.
    fn admit(&self, request: &Frame, entry: AgentEntry) -> PamrResult<AgentId> {
        if request.kind != MessageType::RegisterRequest {
            return Err(PamrError::ProtocolViolation(format!(
                "expected REG_REQ, got {}",
                request.kind
            )));
        }
        let cookie = request.cookie()?;
        let registered = self
            .table
            .register(request.requested_id(), cookie, entry)?;
        if let Some(previous) = registered.evicted {
            info!(
                agent_id = %registered.agent_id,
                previous = %previous.remote_addr,
                "PAMR: id taken over, closing previous connection"
            );
            previous.close.notify_one();
        }
        Ok(registered.agent_id)
    }

    /// Read the next frame, bounded by the heartbeat timeout when heartbeats are on.
    async fn read_next(&self, reader: &mut OwnedReadHalf) -> PamrResult<Frame> {
        let limit = self
            .config
            .heartbeat_period()
            .and(self.config.heartbeat_timeout());
        match limit {
            Some(limit) => match tokio::time::timeout(limit, read_frame(reader)).await {
                Ok(frame) => Ok(frame?),
                Err(_) => Err(PamrError::Timeout(limit.as_millis() as u64)),
            },
            None => Ok(read_frame(reader).await?),
        }
    }

    /// Handle one frame from a registered agent.
    async fn dispatch(
        &self,
        agent_id: AgentId,
        frame: Frame,
        own: &mpsc::Sender<Frame>,
    ) -> PamrResult<()> {
        trace!(agent_id = %agent_id, "PAMR: <- {frame}");
        match frame.kind {
            MessageType::Data | MessageType::DataReply | MessageType::Error => {
                if frame.source != agent_id.get() {
                    return Err(PamrError::ProtocolViolation(format!(
                        "{} claims source {} on connection bound to {}",
                        frame.kind, frame.source, agent_id
                    )));
                }
                self.forward(frame, own).await;
                Ok(())
            }
            MessageType::ListRequest => {
                let reply =
                    Frame::list_reply(frame.message_id, agent_id, &self.table.descriptors());
                own.send(reply)
                    .await
                    .map_err(|_| PamrError::ConnectionLost)
            }
            MessageType::HeartbeatAgent => Ok(()),
            other => Err(PamrError::ProtocolViolation(format!(
                "unexpected {other} from registered agent"
            ))),
        }
    }

    /// Relay a frame to its destination.
    ///
    /// An undeliverable `DATA` is answered with `ERROR{DestinationUnknown}` to
    /// the sender. Replies to agents that have gone are dropped.
    pub async fn forward(&self, frame: Frame, origin: &mpsc::Sender<Frame>) {
        let target = AgentId::new(frame.destination)
            .ok()
            .and_then(|id| self.table.lookup(id));
        let undelivered = match target {
            Some(queue) => match queue.send(frame).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };

        if undelivered.kind != MessageType::Data {
            debug!(
                "PAMR: dropping {} for departed agent {}",
                undelivered.kind, undelivered.destination
            );
            return;
        }
        debug!(
            source = undelivered.source,
            destination = undelivered.destination,
            "PAMR: destination unknown"
        );
        let error = Frame::error(
            undelivered.message_id,
            undelivered.destination,
            undelivered.source,
            ErrorCode::DestinationUnknown,
            "destination unknown",
        );
        let _ = origin.send(error).await;
    }

    /// Tell every other agent that `departed` has left.
    fn broadcast_disconnection(&self, departed: AgentId) {
        for (agent_id, queue) in self.table.live_agents() {
            if agent_id == departed {
                continue;
            }
            let notice = Frame::error(
                0,
                departed.get(),
                agent_id.get(),
                ErrorCode::PeerDisconnected,
                "",
            );
            if queue.try_send(notice).is_err() {
                debug!(agent_id = %agent_id, "PAMR: queue full, disconnection notice dropped");
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, period: Duration) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut beat: u32 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            beat = beat.wrapping_add(1);
            for (agent_id, queue) in self.table.live_agents() {
                if queue.try_send(Frame::heartbeat_router(beat, agent_id)).is_err() {
                    trace!(agent_id = %agent_id, "PAMR: heartbeat skipped, queue full");
                }
            }
        }
    }

    async fn eviction_loop(self: Arc<Self>, max_age: Duration) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(max_age.min(Duration::from_secs(60)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let evicted = self.table.evict_stale(Utc::now(), max_age);
            if !evicted.is_empty() {
                info!(count = evicted.len(), "PAMR: evicted stale dynamic bindings");
            }
        }
    }
}

/// Drain the outbound queue onto the socket.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    close: Arc<Notify>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!("PAMR: write failed: {e}");
            close.notify_one();
            return;
        }
    }
    let _ = writer.shutdown().await;
}
