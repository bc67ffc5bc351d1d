//! In-flight two-way calls.
//!
//! Every two-way call owns a oneshot slot keyed by its message id. The
//! reader completes the slot when the matching `DATA_REPLY` or `ERROR`
//! arrives; a disconnect fails every slot at once so no caller waits on a
//! reply that can no longer come.

use bytes::Bytes;
use dashmap::DashMap;
use pamr_types::{AgentId, PamrError, PamrResult};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome delivered to a waiting caller.
pub type CallResult = PamrResult<Bytes>;

/// One call awaiting its reply.
#[derive(Debug)]
pub struct PendingCall {
    /// Agent the request was sent to, `None` for requests the router answers.
    pub destination: Option<AgentId>,
    /// When the call started.
    pub created_at: Instant,
    slot: oneshot::Sender<CallResult>,
}

/// Table of calls awaiting replies.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: DashMap<u32, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call and return the receiver its caller waits on.
    pub fn register(
        &self,
        message_id: u32,
        destination: Option<AgentId>,
    ) -> oneshot::Receiver<CallResult> {
        let (slot, rx) = oneshot::channel();
        self.calls.insert(
            message_id,
            PendingCall {
                destination,
                created_at: Instant::now(),
                slot,
            },
        );
        rx
    }

    /// Wake the caller waiting on `message_id`.
    ///
    /// Returns `false` when no such call exists (late reply, timed out, or
    /// belonging to a previous connection).
    pub fn complete(&self, message_id: u32, result: CallResult) -> bool {
        match self.calls.remove(&message_id) {
            Some((_, call)) => {
                // The caller may have given up already.
                let _ = call.slot.send(result);
                true
            }
            None => {
                debug!(message_id, "No pending call for reply");
                false
            }
        }
    }

    /// Forget a call without waking anyone.
    pub fn remove(&self, message_id: u32) -> Option<PendingCall> {
        self.calls.remove(&message_id).map(|(_, call)| call)
    }

    /// Fail every pending call. Returns how many were woken.
    pub fn fail_all(&self, error: impl Fn() -> PamrError) -> usize {
        let ids: Vec<u32> = self.calls.iter().map(|entry| *entry.key()).collect();
        self.fail_ids(ids, error)
    }

    /// Fail the calls addressed to `destination`.
    pub fn fail_destination(&self, destination: AgentId, error: impl Fn() -> PamrError) -> usize {
        let ids: Vec<u32> = self
            .calls
            .iter()
            .filter(|entry| entry.value().destination == Some(destination))
            .map(|entry| *entry.key())
            .collect();
        self.fail_ids(ids, error)
    }

    fn fail_ids(&self, ids: Vec<u32>, error: impl Fn() -> PamrError) -> usize {
        let mut woken = 0;
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                let _ = call.slot.send(Err(error()));
                woken += 1;
            }
        }
        woken
    }

    /// Calls older than `age`, oldest first, for diagnostics.
    pub fn older_than(&self, age: Duration) -> Vec<(u32, Option<AgentId>, Duration)> {
        let now = Instant::now();
        let mut stale: Vec<(u32, Option<AgentId>, Duration)> = self
            .calls
            .iter()
            .map(|e| (*e.key(), e.value().destination, now - e.value().created_at))
            .filter(|(_, _, elapsed)| *elapsed > age)
            .collect();
        stale.sort_by(|a, b| b.2.cmp(&a.2));
        stale
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> AgentId {
        AgentId::new(raw).unwrap()
    }

    fn to(raw: u32) -> Option<AgentId> {
        Some(id(raw))
    }

    #[tokio::test]
    async fn test_reply_wakes_only_its_caller() {
        let pending = PendingCalls::new();
        let first = pending.register(1, to(10));
        let mut second = pending.register(2, to(10));

        assert!(pending.complete(1, Ok(Bytes::from_static(b"pong"))));
        assert_eq!(first.await.unwrap().unwrap(), Bytes::from_static(b"pong"));
        assert!(second.try_recv().is_err());
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_reply_is_ignored() {
        let pending = PendingCalls::new();
        assert!(!pending.complete(99, Ok(Bytes::new())));
    }

    #[tokio::test]
    async fn test_fail_all_wakes_every_waiter() {
        let pending = PendingCalls::new();
        let waiters: Vec<_> = (1..=5).map(|n| pending.register(n, to(n))).collect();
        assert_eq!(pending.fail_all(|| PamrError::ConnectionLost), 5);
        for waiter in waiters {
            assert!(matches!(waiter.await.unwrap(), Err(PamrError::ConnectionLost)));
        }
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_fail_destination_is_selective() {
        let pending = PendingCalls::new();
        let to_gone = pending.register(1, to(20));
        let _to_other = pending.register(2, to(21));
        let gone = id(20);
        assert_eq!(
            pending.fail_destination(gone, || PamrError::PeerDisconnected(gone)),
            1
        );
        assert!(matches!(
            to_gone.await.unwrap(),
            Err(PamrError::PeerDisconnected(a)) if a == gone
        ));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_router_requests_survive_peer_departures() {
        let pending = PendingCalls::new();
        let mut listing = pending.register(1, None);
        let to_zero = pending.register(2, to(0));
        let zero = id(0);

        assert_eq!(
            pending.fail_destination(zero, || PamrError::PeerDisconnected(zero)),
            1
        );
        assert!(to_zero.await.unwrap().is_err());
        assert!(listing.try_recv().is_err());
        assert!(pending.complete(1, Ok(Bytes::from_static(b"list"))));
        assert_eq!(listing.await.unwrap().unwrap(), Bytes::from_static(b"list"));
    }

    #[test]
    fn test_older_than() {
        let pending = PendingCalls::new();
        let _rx = pending.register(1, to(1));
        assert!(pending.older_than(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pending.older_than(Duration::from_millis(1)).len(), 1);
    }
}
