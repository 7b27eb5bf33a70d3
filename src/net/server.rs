//! Listener setup, per-connection tasks, background sweepers.
//!
//! One logical task per accepted connection: read a frame, dispatch, repeat.
//! Within a session processing is strictly sequential — the next frame is not
//! dispatched until the previous one produced its response or explicitly
//! suspended (the relay case). Writes go through a per-session queue drained
//! by a dedicated writer task.

use crate::config::Config;
use crate::crypto::Keypair;
use crate::db::Store;
use crate::images::ImageStore;
use crate::net::dispatch::{dispatch_message, Outcome};
use crate::net::frame::{read_message, write_message, FrameError};
use crate::net::message::{
    Response, RoleInfo, SingleResponse, Status, PROTOCOL_VIOLATION_MSG_ID,
};
use crate::net::registry::ClientRegistry;
use crate::net::serde_safe::BoundedVec;
use crate::net::session::{Session, SESSION_SEND_QUEUE};
use crate::types::{ConversationStatus, IdentityId, RoleSet, ROLE_PRIMARY};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

/// Sweep interval for idle-session checks.
const KEEPALIVE_SWEEP_SECS: u64 = 5;

/// Sweep interval for expired hosted identities.
const EXPIRATION_SWEEP_SECS: u64 = 3600;

/// Everything the dispatcher and handlers need, passed explicitly.
pub struct ServerContext {
    pub config: Config,
    pub keypair: Keypair,
    /// This server's own identity id, reported as a covered search node.
    pub server_id: IdentityId,
    pub store: Store,
    pub images: ImageStore,
    pub registry: ClientRegistry,
    /// Every live session, for the keep-alive sweeper.
    pub sessions: RwLock<HashMap<u64, Arc<Session>>>,
    /// Wakes the neighborhood action worker after a commit.
    pub worker_signal: Notify,
    /// Neighborhood initializations currently streaming.
    pub init_in_flight: AtomicUsize,
    session_seq: AtomicU64,
}

impl ServerContext {
    pub fn new(config: Config, keypair: Keypair) -> io::Result<Arc<Self>> {
        let store = Store::open(config.data_dir.join("db"))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let images = ImageStore::open(config.data_dir.join("images"))?;

        // Reclaim blobs a crash between commit and unlink left behind.
        match store.referenced_images() {
            Ok(referenced) => {
                if let Err(e) = images.sweep_orphans(&referenced) {
                    warn!("orphan sweep failed: {}", e);
                }
            }
            Err(e) => warn!("orphan sweep skipped: {}", e),
        }

        let server_id = keypair.identity_id();
        Ok(Arc::new(Self {
            config,
            keypair,
            server_id,
            store,
            images,
            registry: ClientRegistry::new(),
            sessions: RwLock::new(HashMap::new()),
            worker_signal: Notify::new(),
            init_in_flight: AtomicUsize::new(0),
            session_seq: AtomicU64::new(1),
        }))
    }

    /// Active roles with their ports, for `ListRoles`. All endpoints are TCP;
    /// every role but Primary terminates TLS in front of this core.
    pub fn role_infos(&self) -> BoundedVec<RoleInfo, 8> {
        let infos = self
            .config
            .role_ports()
            .into_iter()
            .map(|(role, port)| RoleInfo {
                role,
                port,
                is_tcp: true,
                is_tls: role != ROLE_PRIMARY,
            })
            .collect();
        BoundedVec::new_unchecked(infos)
    }

    fn next_session_id(&self) -> u64 {
        self.session_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

// =============================================================================
// STARTUP
// =============================================================================

/// Bind all role listeners, record the actual ports (ephemeral ports are
/// used by the tests), and spawn the accept loops, sweepers and the action
/// worker. Returns once everything is listening.
pub async fn start(mut config: Config, keypair: Keypair) -> io::Result<Arc<ServerContext>> {
    let mut listeners = Vec::new();
    for (role, port) in config.role_ports() {
        let listener = TcpListener::bind(SocketAddr::new(config.bind_addr, port)).await?;
        let bound = listener.local_addr()?.port();
        config.record_bound_port(role, bound);
        info!("listening on {} ({})", bound, crate::types::role_name(role));
        listeners.push((role, listener));
    }

    let ctx = ServerContext::new(config, keypair)?;

    for (role, listener) in listeners {
        tokio::spawn(accept_loop(ctx.clone(), listener, role));
    }
    tokio::spawn(keepalive_sweeper(ctx.clone()));
    tokio::spawn(expiration_sweeper(ctx.clone()));
    tokio::spawn(crate::replication::run_action_worker(ctx.clone()));

    info!(
        "haven server up, identity {}",
        crate::crypto::fingerprint(&ctx.server_id)
    );
    Ok(ctx)
}

async fn accept_loop(ctx: Arc<ServerContext>, listener: TcpListener, role: RoleSet) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tokio::spawn(handle_connection(ctx.clone(), stream, remote, role));
            }
            Err(e) => {
                warn!("accept failed on {}: {}", crate::types::role_name(role), e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

async fn handle_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    remote: SocketAddr,
    role: RoleSet,
) {
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = mpsc::channel(SESSION_SEND_QUEUE);
    let session = Arc::new(Session::new(ctx.next_session_id(), remote, role, tx));
    ctx.sessions.write().await.insert(session.id, session.clone());
    debug!(
        "session {} accepted from {} on {}",
        session.id,
        remote,
        crate::types::role_name(role)
    );

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write_message(&mut writer, &msg).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    loop {
        if session.is_closing() {
            break;
        }
        tokio::select! {
            _ = session.closed.notified() => break,
            result = read_message(&mut reader) => match result {
                Ok(msg) => {
                    if session.is_closing() {
                        break;
                    }
                    match dispatch_message(&ctx, &session, msg).await {
                        Outcome::Continue => {}
                        Outcome::Close => break,
                    }
                }
                Err(e) => {
                    match &e {
                        FrameError::Codec(_) | FrameError::TooLarge(_) => {
                            // Malformed or oversized envelope: generic
                            // violation under the reserved id, then close.
                            session
                                .send_response(
                                    PROTOCOL_VIOLATION_MSG_ID,
                                    Response::Single(SingleResponse::error(
                                        Status::ProtocolViolation,
                                    )),
                                )
                                .await;
                        }
                        _ if e.is_disconnect() => {}
                        _ => warn!("session {}: read error: {}", session.id, e),
                    }
                    break;
                }
            }
        }
    }

    session.force_close().await;
    on_session_closed(&ctx, &session).await;
    ctx.sessions.write().await.remove(&session.id);
    drop(session);

    // Let the writer flush queued responses; it ends once every sender is
    // gone.
    let _ = tokio::time::timeout(Duration::from_secs(5), writer_task).await;
}

/// Session teardown: destroy an owned relay and uncheck the identity. A
/// disconnect mid-neighborhood-initialization is rolled back by the stream
/// task itself when its pending slots fail.
async fn on_session_closed(ctx: &Arc<ServerContext>, session: &Arc<Session>) {
    crate::relay::on_session_closed(ctx, session).await;

    let (identity, status) = {
        let state = session.state().await;
        (state.identity_id, state.status)
    };
    if let (Some(identity), ConversationStatus::Authenticated) = (identity, status) {
        ctx.registry.uncheck(&identity, session.id).await;
    }
    debug!("session {} cleaned up", session.id);
}

// =============================================================================
// SWEEPERS
// =============================================================================

/// Close sessions whose keep-alive deadline passed.
async fn keepalive_sweeper(ctx: Arc<ServerContext>) {
    let mut interval = tokio::time::interval(Duration::from_secs(KEEPALIVE_SWEEP_SECS));
    loop {
        interval.tick().await;
        let expired: Vec<Arc<Session>> = ctx
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.idle_secs() > ctx.config.keep_alive_secs)
            .cloned()
            .collect();
        for session in expired {
            debug!(
                "session {} idle for {}s, closing",
                session.id,
                session.idle_secs()
            );
            session.force_close().await;
        }
    }
}

/// Remove hosted identities whose expiration passed, then their blobs.
async fn expiration_sweeper(ctx: Arc<ServerContext>) {
    let mut interval = tokio::time::interval(Duration::from_secs(EXPIRATION_SWEEP_SECS));
    loop {
        interval.tick().await;
        match ctx.store.sweep_expired().await {
            Ok(removed) => {
                for (_, images) in removed {
                    ctx.images.remove_all(&images).await;
                }
            }
            Err(e) => warn!("expiration sweep failed: {}", e),
        }
    }
}
