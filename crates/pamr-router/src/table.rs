//! Agent table: live connections and the cookie bindings that outlive them.
//!
//! The [`AgentTable`] is shared by every connection task. All registration
//! decisions happen under a single write lock so two concurrent handshakes
//! can never end up holding the same id. The lock is never held across
//! socket I/O: forwarding clones the destination's queue sender and releases
//! the lock before sending.

use crate::allocator::AgentIdAllocator;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pamr_types::config::ReservedAgent;
use pamr_types::{AgentId, MagicCookie, PamrError, PamrResult};
use pamr_wire::{AgentDescriptor, Frame};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// A registered connection as the table sees it.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    /// Router-local connection number, distinguishes successive holders of an id.
    pub conn_id: u64,
    /// Outbound queue drained by the connection's writer task.
    pub outbound: mpsc::Sender<Frame>,
    /// Signalled to force the connection closed (takeover).
    pub close: Arc<Notify>,
    /// Peer address of the socket.
    pub remote_addr: SocketAddr,
    /// When the connection registered.
    pub connected_at: DateTime<Utc>,
    /// Last frame read from the agent.
    pub last_activity: Activity,
}

/// Shared timestamp of a connection's last inbound frame, in unix milliseconds.
/// Cloning it does not hold the connection's queue open.
#[derive(Debug, Clone)]
pub struct Activity(Arc<AtomicI64>);

impl Activity {
    fn starting_at(at: DateTime<Utc>) -> Self {
        Self(Arc::new(AtomicI64::new(at.timestamp_millis())))
    }

    pub fn touch(&self) {
        self.0.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0.load(Ordering::Relaxed))
    }
}

impl AgentEntry {
    pub fn new(conn_id: u64, outbound: mpsc::Sender<Frame>, remote_addr: SocketAddr) -> Self {
        let now = Utc::now();
        Self {
            conn_id,
            outbound,
            close: Arc::new(Notify::new()),
            remote_addr,
            connected_at: now,
            last_activity: Activity::starting_at(now),
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity.at().unwrap_or(self.connected_at)
    }
}

/// Cookie binding for an id, kept across disconnects.
#[derive(Debug, Clone)]
struct Binding {
    cookie: Option<MagicCookie>,
    reserved: bool,
    disconnected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    live: HashMap<AgentId, AgentEntry>,
    bindings: HashMap<AgentId, Binding>,
    allocator: AgentIdAllocator,
}

/// Result of a successful registration.
#[derive(Debug)]
pub struct Registered {
    pub agent_id: AgentId,
    /// Previous holder of the id, displaced by a takeover. The caller must close it.
    pub evicted: Option<AgentEntry>,
}

/// Thread-safe table of registered agents.
#[derive(Debug, Clone, Default)]
pub struct AgentTable {
    inner: Arc<RwLock<Inner>>,
}

impl AgentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with operator reservations pre-bound.
    pub fn with_reservations(reserved: &[ReservedAgent]) -> PamrResult<Self> {
        let table = Self::new();
        {
            let mut inner = table.inner.write().unwrap_or_else(|e| e.into_inner());
            for entry in reserved {
                let id = AgentId::reserved(entry.id)?;
                inner.bindings.insert(
                    id,
                    Binding {
                        cookie: Some(entry.cookie.clone()),
                        reserved: true,
                        disconnected_at: Some(Utc::now()),
                    },
                );
            }
        }
        Ok(table)
    }

    /// Bind a connection to an id.
    ///
    /// - no id requested: allocate a fresh dynamic id
    /// - reservable id never seen: bind it to the presented cookie (possibly none)
    /// - known id, matching cookie: take over, displacing any live holder
    /// - known id, other cookie: [`PamrError::IdInUse`] when held by a live
    ///   connection, [`PamrError::AuthFailure`] otherwise
    /// - unknown dynamic id: [`PamrError::InvalidAgentId`]
    pub fn register(
        &self,
        requested: Option<u32>,
        cookie: Option<MagicCookie>,
        entry: AgentEntry,
    ) -> PamrResult<Registered> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *guard;

        let agent_id = match requested {
            None => {
                let id = inner.allocator.allocate()?;
                inner.bindings.insert(
                    id,
                    Binding {
                        cookie,
                        reserved: false,
                        disconnected_at: None,
                    },
                );
                id
            }
            Some(raw) => {
                let id = AgentId::new(raw)?;
                match inner.bindings.get_mut(&id) {
                    Some(binding) => {
                        let matches = match (&binding.cookie, &cookie) {
                            (Some(bound), Some(presented)) => bound == presented,
                            // Cookie-less bindings only exist for reservable ids.
                            (None, None) => binding.reserved,
                            _ => false,
                        };
                        if !matches {
                            return Err(if inner.live.contains_key(&id) {
                                PamrError::IdInUse(id)
                            } else {
                                PamrError::AuthFailure(id)
                            });
                        }
                        binding.disconnected_at = None;
                    }
                    None if id.is_reserved() => {
                        inner.bindings.insert(
                            id,
                            Binding {
                                cookie,
                                reserved: true,
                                disconnected_at: None,
                            },
                        );
                    }
                    None => return Err(PamrError::InvalidAgentId(raw)),
                }
                id
            }
        };

        let evicted = inner.live.insert(agent_id, entry);
        Ok(Registered { agent_id, evicted })
    }

    /// Remove `agent_id` if it is still held by connection `conn_id`.
    ///
    /// Returns `false` when the id was already taken over by a newer
    /// connection, in which case nothing changes.
    pub fn disconnect(&self, agent_id: AgentId, conn_id: u64) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.live.get(&agent_id) {
            Some(entry) if entry.conn_id == conn_id => {}
            _ => return false,
        }
        inner.live.remove(&agent_id);

        let forget = match inner.bindings.get_mut(&agent_id) {
            Some(binding) if binding.reserved || binding.cookie.is_some() => {
                binding.disconnected_at = Some(Utc::now());
                false
            }
            Some(_) => true,
            None => false,
        };
        if forget {
            inner.bindings.remove(&agent_id);
        }
        true
    }

    /// Outbound queue of a live agent.
    pub fn lookup(&self, agent_id: AgentId) -> Option<mpsc::Sender<Frame>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.live.get(&agent_id).map(|e| e.outbound.clone())
    }

    /// Whether `agent_id` is currently held by a live connection.
    pub fn is_live(&self, agent_id: AgentId) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.live.contains_key(&agent_id)
    }

    /// Outbound queues of all live agents.
    pub fn live_agents(&self) -> Vec<(AgentId, mpsc::Sender<Frame>)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .live
            .iter()
            .map(|(id, e)| (*id, e.outbound.clone()))
            .collect()
    }

    /// Snapshot of the live agents for `LIST_REPLY`, ordered by id.
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut agents: Vec<AgentDescriptor> = inner
            .live
            .iter()
            .map(|(id, e)| AgentDescriptor {
                agent_id: *id,
                reserved: id.is_reserved(),
                idle_ms: (now - e.last_activity())
                    .num_milliseconds()
                    .clamp(0, i64::from(u32::MAX)) as u32,
                endpoint: e.remote_addr.to_string(),
            })
            .collect();
        agents.sort_by_key(|a| a.agent_id);
        agents
    }

    /// Number of live agents.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget dynamic bindings disconnected for longer than `max_age`.
    ///
    /// Reservable bindings are kept forever. Returns the evicted ids.
    pub fn evict_stale(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<AgentId> {
        let max_age =
            ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::days(365 * 100));
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<AgentId> = inner
            .bindings
            .iter()
            .filter(|(_, b)| !b.reserved)
            .filter(|(_, b)| matches!(b.disconnected_at, Some(at) if now - at > max_age))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            inner.bindings.remove(id);
            debug!(agent_id = %id, "Evicted stale dynamic binding");
        }
        stale
    }
}
