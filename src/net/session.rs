//! Per-connection session state and request tracking.

use crate::net::message::{Message, Request, RequestKind, Response, SearchRecord};
use crate::types::{
    now, ConversationStatus, IdentityId, PublicKeyBytes, RelayToken, RoleSet, SemVer,
    CHALLENGE_SIZE,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard, Notify};
use tracing::debug;

/// Outbound write queue depth per connection.
pub const SESSION_SEND_QUEUE: usize = 64;

/// A request this server sent on the session, awaiting the client's response.
pub struct PendingRequest {
    pub kind: RequestKind,
    pub conversation: bool,
    pub reply: oneshot::Sender<Response>,
}

/// Mutable conversation state, guarded by one mutex per session.
pub struct SessionState {
    pub status: ConversationStatus,
    pub client_version: SemVer,
    pub public_key: Option<PublicKeyBytes>,
    pub identity_id: Option<IdentityId>,
    /// Challenge issued in the Start response; `VerifyIdentity` and `CheckIn`
    /// signatures are checked against it.
    pub challenge: [u8; CHALLENGE_SIZE],
    /// Application services registered by the checked-in identity.
    pub application_services: HashSet<String>,
    /// Full result of the last over-limit search, served by ProfileSearchPart.
    pub search_cache: Option<Vec<SearchRecord>>,
    /// Relay token this app-service connection is paired under.
    pub relay_token: Option<RelayToken>,
    /// Follower id while this session drives a neighborhood initialization.
    pub init_follower: Option<IdentityId>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            status: ConversationStatus::None,
            client_version: SemVer::INVALID,
            public_key: None,
            identity_id: None,
            challenge: [0u8; CHALLENGE_SIZE],
            application_services: HashSet::new(),
            search_cache: None,
            relay_token: None,
            init_follower: None,
        }
    }
}

/// One accepted connection.
///
/// The reader task owns the receive loop; everything else talks to the
/// session through the outbound queue (`send`) and the shared state. Requests
/// the server originates register a pending slot keyed by message id; the
/// reader resolves the slot when the matching response frame arrives.
pub struct Session {
    pub id: u64,
    pub remote: SocketAddr,
    /// Role of the listener this connection arrived on.
    pub roles: RoleSet,

    state: Mutex<SessionState>,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    next_msg_id: AtomicU32,
    tx: mpsc::Sender<Message>,

    last_activity: AtomicU64,
    closing: AtomicBool,
    pub closed: Notify,
}

impl Session {
    pub fn new(id: u64, remote: SocketAddr, roles: RoleSet, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            remote,
            roles,
            state: Mutex::new(SessionState::new()),
            pending: Mutex::new(HashMap::new()),
            next_msg_id: AtomicU32::new(1),
            tx,
            last_activity: AtomicU64::new(now()),
            closing: AtomicBool::new(false),
            closed: Notify::new(),
        }
    }

    pub async fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    pub async fn status(&self) -> ConversationStatus {
        self.state.lock().await.status
    }

    pub async fn identity_id(&self) -> Option<IdentityId> {
        self.state.lock().await.identity_id
    }

    /// Queue an outbound frame. False when the connection is gone.
    pub async fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    pub async fn send_response(&self, id: u32, response: Response) -> bool {
        self.send(Message::response(id, response)).await
    }

    /// Send a server-originated request and return the slot its response will
    /// resolve. The sender side is dropped (failing the receiver) when the
    /// session closes.
    pub async fn send_request(&self, request: Request) -> Option<oneshot::Receiver<Response>> {
        if self.is_closing() {
            return None;
        }
        let id = self.next_msg_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id,
            PendingRequest {
                kind: request.kind(),
                conversation: request.is_conversation(),
                reply: reply_tx,
            },
        );

        if !self.send(Message::request(id, request)).await {
            self.pending.lock().await.remove(&id);
            return None;
        }
        Some(reply_rx)
    }

    /// Pop the pending request a response frame claims to answer.
    pub async fn take_pending(&self, id: u32) -> Option<PendingRequest> {
        self.pending.lock().await.remove(&id)
    }

    /// Refresh the keep-alive deadline; called for every decoded frame.
    pub fn touch(&self) {
        self.last_activity.store(now(), Ordering::Relaxed);
    }

    pub fn idle_secs(&self) -> u64 {
        now().saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Tear the connection down: wake the reader, fail every pending request.
    pub async fn force_close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("session {} ({}) closing", self.id, self.remote);
        // Dropping the senders resolves every waiter with an error.
        self.pending.lock().await.clear();
        // notify_one stores a permit, so a reader that is mid-dispatch still
        // observes the close on its next wait.
        self.closed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::SingleRequest;

    fn session() -> (Session, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Session::new(1, "127.0.0.1:1".parse().unwrap(), crate::types::ROLE_PRIMARY, tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_send_request_registers_pending() {
        let (session, mut rx) = session();
        let slot = session
            .send_request(Request::Single(SingleRequest::ListRoles))
            .await
            .unwrap();

        let sent = rx.recv().await.unwrap();
        let pending = session.take_pending(sent.id).await.unwrap();
        assert_eq!(pending.kind, RequestKind::ListRoles);
        assert!(!pending.conversation);
        drop(pending);
        drop(slot);
    }

    #[tokio::test]
    async fn test_force_close_fails_pending() {
        let (session, _rx) = session();
        let slot = session
            .send_request(Request::Single(SingleRequest::ListRoles))
            .await
            .unwrap();

        session.force_close().await;
        assert!(session.is_closing());
        assert!(slot.await.is_err());

        // Requests after close are refused.
        assert!(session
            .send_request(Request::Single(SingleRequest::ListRoles))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_touch_resets_idle() {
        let (session, _rx) = session();
        session.touch();
        assert!(session.idle_secs() <= 1);
    }
}
