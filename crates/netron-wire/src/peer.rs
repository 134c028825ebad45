//! Peer: one connection to another Netron runtime.
//!
//! A [`Peer`] owns the connection status machine, the table of outstanding
//! requests (awaiters), the definitions the other side has advertised and the
//! ones it handed out in values.
//! Once started it runs a reader task that settles awaiters from responses,
//! hands requests and notifications to a [`PeerHandle`] and, when the
//! transport ends, rejects every outstanding awaiter before reporting the
//! peer closed.

use crate::message::{Notification, Packet, PacketKind, Request, Response};
use crate::transport::Transport;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use netron_types::definition::Definition;
use netron_types::error::{NetronError, NetronResult};
use netron_types::event::{PeerEvent, PeerId};
use netron_types::status::PeerStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, trace, warn};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Capacity of each peer's event channel.
const PEER_EVENT_CAPACITY: usize = 64;

/// Code sent for requests that arrive before the handshake completed.
pub const CODE_HANDSHAKE_REQUIRED: i32 = 401;

type Awaiter = oneshot::Sender<NetronResult<Response>>;

/// Trait for the runtime to handle inbound traffic on a peer.
#[async_trait]
pub trait PeerHandle: Send + Sync + 'static {
    /// Handle a request. The implementation answers with [`Peer::respond`].
    ///
    /// Each request runs on its own task.
    async fn handle_request(&self, peer: Arc<Peer>, id: u64, request: Request);

    /// Handle a notification from an online peer.
    ///
    /// Runs on the reader task, so notifications are seen in arrival order.
    /// Must not wait for the peer to disconnect.
    async fn handle_notification(&self, peer: Arc<Peer>, notification: Notification);

    /// The peer went offline. Every awaiter has already been rejected.
    async fn peer_closed(&self, peer: Arc<Peer>);
}

/// One connection to a remote runtime.
pub struct Peer {
    id: PeerId,
    uid: RwLock<Option<String>>,
    remote_addr: Option<String>,
    status: AtomicU8,
    is_super: AtomicBool,
    transport: OnceLock<Arc<dyn Transport>>,
    next_request_id: AtomicU64,
    awaiters: DashMap<u64, Awaiter>,
    definitions: RwLock<HashMap<String, Definition>>,
    /// Definitions handed out in values, by id.
    references: DashMap<u64, Definition>,
    events: broadcast::Sender<PeerEvent>,
    /// Set once the handshake response has been read.
    answered: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    done: watch::Sender<bool>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("uid", &self.uid())
            .field("remote_addr", &self.remote_addr)
            .field("status", &self.status())
            .finish()
    }
}

/// Removes an awaiter when the waiting future is dropped.
struct AwaiterGuard<'a> {
    awaiters: &'a DashMap<u64, Awaiter>,
    id: u64,
}

impl Drop for AwaiterGuard<'_> {
    fn drop(&mut self) {
        self.awaiters.remove(&self.id);
    }
}

impl Peer {
    /// Create an offline peer. `remote_addr` is the dialed address for
    /// outbound peers.
    pub fn new(remote_addr: Option<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(PEER_EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            uid: RwLock::new(None),
            remote_addr,
            status: AtomicU8::new(PeerStatus::Offline.as_u8()),
            is_super: AtomicBool::new(false),
            transport: OnceLock::new(),
            next_request_id: AtomicU64::new(1),
            awaiters: DashMap::new(),
            definitions: RwLock::new(HashMap::new()),
            references: DashMap::new(),
            events,
            answered: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
            done,
            created_at: Utc::now(),
        })
    }

    /// Create a peer over an already established transport.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Arc<Self> {
        let peer = Self::new(transport.remote_addr());
        let _ = peer.transport.set(transport);
        peer
    }

    /// Process-local id.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Remote runtime uid, known once the handshake has been received.
    pub fn uid(&self) -> Option<String> {
        self.uid.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Fix the remote uid. It cannot change afterwards.
    pub fn set_uid(&self, uid: &str) -> NetronResult<()> {
        let mut slot = self.uid.write().unwrap_or_else(|e| e.into_inner());
        match slot.as_deref() {
            None => {
                *slot = Some(uid.to_string());
                Ok(())
            }
            Some(existing) if existing == uid => Ok(()),
            Some(existing) => Err(NetronError::IllegalState(format!(
                "peer uid already set to '{existing}'"
            ))),
        }
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Whether the remote runtime announced hub mode.
    pub fn is_super(&self) -> bool {
        self.is_super.load(Ordering::Relaxed)
    }

    pub fn set_super(&self, is_super: bool) {
        self.is_super.store(is_super, Ordering::Relaxed);
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus::try_from(self.status.load(Ordering::SeqCst)).unwrap_or(PeerStatus::Offline)
    }

    /// Change status, emitting [`PeerEvent::Status`] when it actually changes.
    pub fn set_status(&self, status: PeerStatus) {
        let previous = self.status.swap(status.as_u8(), Ordering::SeqCst);
        if previous != status.as_u8() {
            trace!(peer = self.id, %status, "peer status changed");
            let _ = self.events.send(PeerEvent::Status { status });
        }
    }

    /// Change status from a raw value. Values outside the valid range are ignored.
    pub fn set_raw_status(&self, raw: u8) {
        match PeerStatus::try_from(raw) {
            Ok(status) => self.set_status(status),
            Err(raw) => debug!(peer = self.id, raw, "ignoring invalid peer status"),
        }
    }

    /// Subscribe to this peer's status and reconnect events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn emit_reconnect_attempt(&self, attempt: u32) {
        let _ = self.events.send(PeerEvent::ReconnectAttempt { attempt });
    }

    /// Install the transport of an outbound peer once it has been dialed.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) -> NetronResult<()> {
        self.transport
            .set(transport)
            .map_err(|_| NetronError::IllegalState("peer transport already set".to_string()))
    }

    fn transport(&self) -> NetronResult<&Arc<dyn Transport>> {
        self.transport
            .get()
            .ok_or_else(|| NetronError::IllegalState("peer is not connected".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a response.
    pub fn awaiter_count(&self) -> usize {
        self.awaiters.len()
    }

    // ---- remote definitions ----

    /// Definition advertised by the remote side under `name`.
    pub fn definition(&self, name: &str) -> Option<Definition> {
        self.definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Definition with the given id, advertised or handed out by the remote side.
    pub fn definition_by_id(&self, def_id: u64) -> Option<Definition> {
        let advertised = self
            .definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|d| d.id == def_id)
            .cloned();
        advertised.or_else(|| self.references.get(&def_id).map(|d| d.value().clone()))
    }

    /// Remember a definition the remote side handed out in a value.
    pub fn insert_reference(&self, definition: Definition) {
        self.references.insert(definition.id, definition);
    }

    /// Forget a handed-out definition.
    pub fn remove_reference(&self, def_id: u64) -> Option<Definition> {
        self.references.remove(&def_id).map(|(_, d)| d)
    }

    pub fn definitions(&self) -> Vec<Definition> {
        self.definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn definition_names(&self) -> Vec<String> {
        self.definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Record a remote definition, returning the one it replaced.
    pub fn insert_definition(&self, definition: Definition) -> Option<Definition> {
        self.definitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(definition.name.clone(), definition)
    }

    /// Forget a remote definition. A stale `def_id` leaves a newer one in place.
    pub fn remove_definition(&self, name: &str, def_id: u64) -> Option<Definition> {
        let mut defs = self.definitions.write().unwrap_or_else(|e| e.into_inner());
        match defs.get(name) {
            Some(d) if d.id == def_id => defs.remove(name),
            _ => None,
        }
    }

    // ---- I/O ----

    /// Start the reader task. Inbound traffic goes to `handle`.
    pub fn start(self: &Arc<Self>, handle: Weak<dyn PeerHandle>) -> NetronResult<()> {
        let transport = Arc::clone(self.transport()?);
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NetronError::IllegalState(
                "peer reader already started".to_string(),
            ));
        }

        let peer = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => {
                        debug!(peer = peer.id, "peer disconnect requested");
                        break;
                    }
                    received = transport.recv() => received,
                };
                match received {
                    Ok(Some(packet)) => peer.dispatch(packet, &handle).await,
                    Ok(None) => {
                        debug!(peer = peer.id, uid = ?peer.uid(), "connection closed by remote");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = peer.id, uid = ?peer.uid(), "connection ended: {e}");
                        break;
                    }
                }
            }
            peer.finish(&handle).await;
        });
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, packet: Packet, handle: &Weak<dyn PeerHandle>) {
        match packet.kind {
            PacketKind::Response(response) => {
                if let Response::HandshakeAck(ack) = &response {
                    for definition in &ack.definitions {
                        self.insert_definition(definition.clone());
                    }
                    self.answered.store(true, Ordering::SeqCst);
                }
                match self.awaiters.remove(&packet.id) {
                    Some((_, awaiter)) => {
                        let _ = awaiter.send(response.into_result());
                    }
                    None => debug!(
                        peer = self.id,
                        request_id = packet.id,
                        "dropping response without awaiter"
                    ),
                }
            }
            PacketKind::Request(request) => {
                let Some(handle) = handle.upgrade() else {
                    return;
                };
                let peer = Arc::clone(self);
                tokio::spawn(async move {
                    if !matches!(request, Request::Handshake(_)) && !peer.wait_online().await {
                        warn!(
                            peer = peer.id,
                            method = request.method(),
                            "rejected request before handshake"
                        );
                        if request.expects_response() {
                            let _ = peer
                                .respond(
                                    packet.id,
                                    Response::Error {
                                        code: CODE_HANDSHAKE_REQUIRED,
                                        message: "Handshake required".to_string(),
                                    },
                                )
                                .await;
                        }
                        return;
                    }
                    handle.handle_request(peer, packet.id, request).await;
                });
            }
            PacketKind::Notification(notification) => {
                // Definitions are tracked even while the handshake is being
                // confirmed so that nothing sent right after the ack is lost.
                match &notification {
                    Notification::ContextAttach { definition } => {
                        self.insert_definition(definition.clone());
                    }
                    Notification::ContextDetach { name, def_id } => {
                        self.remove_definition(name, *def_id);
                    }
                    Notification::Event { .. } => {}
                }
                if self.status() != PeerStatus::Online {
                    return;
                }
                if let Some(handle) = handle.upgrade() {
                    handle
                        .handle_notification(Arc::clone(self), notification)
                        .await;
                }
            }
        }
    }

    /// Whether this side is, or is about to be, online.
    ///
    /// Once the handshake response has been read the remote side is already
    /// online and may send requests while this side still confirms it. Those
    /// wait for the confirmation instead of being refused.
    async fn wait_online(&self) -> bool {
        let mut events = self.events.subscribe();
        loop {
            match self.status() {
                PeerStatus::Online => return true,
                PeerStatus::Handshaking
                    if self.answered.load(Ordering::SeqCst) && !self.is_closed() => {}
                _ => return false,
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    }

    async fn finish(self: &Arc<Self>, handle: &Weak<dyn PeerHandle>) {
        self.closed.store(true, Ordering::SeqCst);
        self.reject_awaiters();
        if let Ok(transport) = self.transport() {
            transport.close().await;
        }
        self.set_status(PeerStatus::Offline);
        if let Some(handle) = handle.upgrade() {
            handle.peer_closed(Arc::clone(self)).await;
        }
        self.done.send_replace(true);
    }

    fn reject_awaiters(&self) {
        let ids: Vec<u64> = self.awaiters.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, awaiter)) = self.awaiters.remove(&id) {
                let _ = awaiter.send(Err(NetronError::PeerDisconnected));
            }
        }
    }

    /// Close the connection and wait until the peer is fully offline.
    ///
    /// Must not be called from [`PeerHandle::handle_notification`] or
    /// [`PeerHandle::peer_closed`].
    pub async fn disconnect(&self) {
        if !self.started.load(Ordering::SeqCst) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.reject_awaiters();
                if let Ok(transport) = self.transport() {
                    transport.close().await;
                }
                self.set_status(PeerStatus::Offline);
            }
            return;
        }
        // Settle awaiters before the reader winds down, so that a response
        // timer due at the same instant cannot report a timeout.
        self.reject_awaiters();
        self.shutdown.send_replace(true);
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Send a request and wait for its response.
    ///
    /// An `error` response comes back as the matching [`NetronError`]. When
    /// `timeout` expires the request fails with [`NetronError::Timeout`],
    /// unless a disconnect already settled it.
    pub async fn request(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> NetronResult<Response> {
        if self.is_closed() {
            return Err(NetronError::PeerDisconnected);
        }
        let status = self.status();
        if !status.can_send() {
            return Err(NetronError::IllegalState(format!(
                "cannot send {} while peer is {status}",
                request.method()
            )));
        }
        let transport = self.transport()?;

        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        self.awaiters.insert(id, tx);
        let _guard = AwaiterGuard {
            awaiters: &self.awaiters,
            id,
        };
        if self.is_closed() {
            return Err(NetronError::PeerDisconnected);
        }

        trace!(peer = self.id, request_id = id, method = request.method(), "sending request");
        transport.send(&Packet::request(id, request)).await?;

        let settled = match timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(settled) => settled,
                Err(_) => {
                    // A disconnect due at the same instant settles first.
                    tokio::task::yield_now().await;
                    if self.awaiters.remove(&id).is_some() {
                        return Err(NetronError::Timeout(limit.as_millis() as u64));
                    }
                    rx.await
                }
            },
        };
        settled.unwrap_or(Err(NetronError::PeerDisconnected))
    }

    /// Send a request that is never answered, without waiting.
    pub async fn post(&self, request: Request) -> NetronResult<()> {
        if self.is_closed() {
            return Err(NetronError::PeerDisconnected);
        }
        let status = self.status();
        if !status.can_send() {
            return Err(NetronError::IllegalState(format!(
                "cannot send {} while peer is {status}",
                request.method()
            )));
        }
        let transport = self.transport()?;
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        trace!(peer = self.id, request_id = id, method = request.method(), "posting request");
        transport.send(&Packet::request(id, request)).await?;
        Ok(())
    }

    /// Answer request `id`.
    pub async fn respond(&self, id: u64, response: Response) -> NetronResult<()> {
        let transport = self.transport()?;
        transport.send(&Packet::response(id, response)).await?;
        Ok(())
    }

    /// Send a one-way notification.
    pub async fn notify(&self, notification: Notification) -> NetronResult<()> {
        if self.is_closed() {
            return Err(NetronError::PeerDisconnected);
        }
        let transport = self.transport()?;
        transport.send(&Packet::notification(notification)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duplex::DuplexTransport;
    use crate::message::Handshake;
    use std::sync::Mutex;

    /// Answers every request after an optional delay and records what it saw.
    #[derive(Default)]
    struct EchoHandle {
        delay: Option<Duration>,
        silent: bool,
        notifications: Mutex<Vec<Notification>>,
        void_calls: AtomicU64,
        closed: AtomicBool,
    }

    #[async_trait]
    impl PeerHandle for EchoHandle {
        async fn handle_request(&self, peer: Arc<Peer>, id: u64, request: Request) {
            if self.silent {
                return;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let response = match request {
                Request::Handshake(hs) => {
                    peer.set_status(PeerStatus::Online);
                    Response::HandshakeAck(Handshake::new(format!("ack-{}", hs.uid), false, vec![]))
                }
                Request::Call { args, .. } => Response::Value {
                    value: args.into_iter().next(),
                },
                Request::Get { name, .. } => Response::Error {
                    code: 404,
                    message: format!("Unknown property '{name}'"),
                },
                Request::CallVoid { .. } => {
                    self.void_calls.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                _ => Response::Ack,
            };
            let _ = peer.respond(id, response).await;
        }

        async fn handle_notification(&self, _peer: Arc<Peer>, notification: Notification) {
            self.notifications.lock().unwrap().push(notification);
        }

        async fn peer_closed(&self, _peer: Arc<Peer>) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn as_weak(handle: &Arc<EchoHandle>) -> Weak<dyn PeerHandle> {
        let handle: Arc<dyn PeerHandle> = handle.clone();
        Arc::downgrade(&handle)
    }

    /// Client and server peers over a duplex pair; the client is handshaking.
    fn linked(
        server_handle: &Arc<EchoHandle>,
        client_handle: &Arc<EchoHandle>,
    ) -> (Arc<Peer>, Arc<Peer>) {
        let (a, b) = DuplexTransport::pair();
        let client = Peer::with_transport(Arc::new(a));
        let server = Peer::with_transport(Arc::new(b));
        server.start(as_weak(server_handle)).unwrap();
        client.start(as_weak(client_handle)).unwrap();
        client.set_status(PeerStatus::Handshaking);
        (client, server)
    }

    #[test]
    fn test_invalid_raw_status_is_ignored() {
        let peer = Peer::new(None);
        let mut events = peer.subscribe();
        peer.set_raw_status(2);
        assert_eq!(peer.status(), PeerStatus::Handshaking);
        peer.set_raw_status(9);
        assert_eq!(peer.status(), PeerStatus::Handshaking);
        assert_eq!(
            events.try_recv().unwrap(),
            PeerEvent::Status {
                status: PeerStatus::Handshaking
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_uid_is_fixed_once_set() {
        let peer = Peer::new(None);
        assert!(peer.uid().is_none());
        peer.set_uid("a").unwrap();
        peer.set_uid("a").unwrap();
        assert!(matches!(peer.set_uid("b"), Err(NetronError::IllegalState(_))));
        assert_eq!(peer.uid().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_request_before_handshake_is_rejected() {
        let server_handle = Arc::new(EchoHandle::default());
        let client_handle = Arc::new(EchoHandle::default());
        let (client, _server) = linked(&server_handle, &client_handle);

        let err = client
            .request(Request::Ping, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        match err {
            NetronError::Remote(msg) => assert!(msg.contains("Handshake")),
            other => panic!("Expected handshake-required error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_then_call() {
        let server_handle = Arc::new(EchoHandle::default());
        let client_handle = Arc::new(EchoHandle::default());
        let (client, _server) = linked(&server_handle, &client_handle);

        let ack = client
            .request(Request::Handshake(Handshake::new("c", false, vec![])), None)
            .await
            .unwrap();
        match ack {
            Response::HandshakeAck(hs) => assert_eq!(hs.uid, "ack-c"),
            other => panic!("Expected HandshakeAck, got {other:?}"),
        }
        client.set_status(PeerStatus::Online);

        let value = client
            .request(
                Request::Call {
                    def_id: 1,
                    name: "echo".to_string(),
                    args: vec![serde_json::json!(42)],
                },
                None,
            )
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value, Some(serde_json::json!(42)));

        let err = client
            .request(
                Request::Get {
                    def_id: 1,
                    name: "nope".to_string(),
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NetronError::Unknown(_)));
        assert_eq!(client.awaiter_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_awaiter() {
        let server_handle = Arc::new(EchoHandle {
            silent: true,
            ..Default::default()
        });
        let client_handle = Arc::new(EchoHandle::default());
        let (client, _server) = linked(&server_handle, &client_handle);

        let started = std::time::Instant::now();
        let err = client
            .request(
                Request::Handshake(Handshake::new("c", false, vec![])),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NetronError::Timeout(100)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(client.awaiter_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_awaiters_with_peer_disconnected() {
        let server_handle = Arc::new(EchoHandle {
            silent: true,
            ..Default::default()
        });
        let client_handle = Arc::new(EchoHandle::default());
        let (client, server) = linked(&server_handle, &client_handle);

        let mut pending = Vec::new();
        for _ in 0..3 {
            let client = Arc::clone(&client);
            pending.push(tokio::spawn(async move {
                client
                    .request(
                        Request::Handshake(Handshake::new("c", false, vec![])),
                        Some(Duration::from_millis(200)),
                    )
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.awaiter_count(), 3);

        server.disconnect().await;
        for task in pending {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, NetronError::PeerDisconnected), "got {err:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.status(), PeerStatus::Offline);
        assert!(client_handle.closed.load(Ordering::SeqCst));
        assert!(server_handle.closed.load(Ordering::SeqCst));
        assert_eq!(client.awaiter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_at_timeout_deadline_reports_disconnect() {
        let server_handle = Arc::new(EchoHandle {
            silent: true,
            ..Default::default()
        });
        let client_handle = Arc::new(EchoHandle::default());
        let (client, _server) = linked(&server_handle, &client_handle);
        let limit = Duration::from_millis(100);

        let mut pending = Vec::new();
        for _ in 0..3 {
            let client = Arc::clone(&client);
            pending.push(tokio::spawn(async move {
                client
                    .request(
                        Request::Handshake(Handshake::new("c", false, vec![])),
                        Some(limit),
                    )
                    .await
            }));
        }
        while client.awaiter_count() < 3 {
            tokio::task::yield_now().await;
        }

        // The clock is paused: this wakes together with every response timer.
        tokio::time::sleep(limit).await;
        client.disconnect().await;

        for task in pending {
            let err = tokio_test::assert_err!(task.await.unwrap());
            assert!(matches!(err, NetronError::PeerDisconnected), "got {err:?}");
        }
        assert_eq!(client.awaiter_count(), 0);
        assert_eq!(client.status(), PeerStatus::Offline);
    }

    #[tokio::test]
    async fn test_request_waits_while_handshake_is_confirmed() {
        let server_handle = Arc::new(EchoHandle::default());
        let client_handle = Arc::new(EchoHandle::default());
        let (client, server) = linked(&server_handle, &client_handle);

        client
            .request(Request::Handshake(Handshake::new("c", false, vec![])), None)
            .await
            .unwrap();
        assert_eq!(server.status(), PeerStatus::Online);

        // The server is online and calls back before the client confirmed it.
        let caller = Arc::clone(&server);
        let ping = tokio::spawn(async move {
            caller
                .request(Request::Ping, Some(Duration::from_secs(2)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ping.is_finished());

        client.set_status(PeerStatus::Online);
        let response = tokio_test::assert_ok!(ping.await.unwrap());
        assert_eq!(response, Response::Ack);
    }

    #[tokio::test]
    async fn test_post_installs_no_awaiter() {
        let server_handle = Arc::new(EchoHandle::default());
        let client_handle = Arc::new(EchoHandle::default());
        let (client, _server) = linked(&server_handle, &client_handle);
        client
            .request(Request::Handshake(Handshake::new("c", false, vec![])), None)
            .await
            .unwrap();
        client.set_status(PeerStatus::Online);

        tokio_test::assert_ok!(
            client
                .post(Request::CallVoid {
                    def_id: 1,
                    name: "fire".to_string(),
                    args: vec![],
                })
                .await
        );
        assert_eq!(client.awaiter_count(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server_handle.void_calls.load(Ordering::SeqCst), 1);

        client.disconnect().await;
        let err = client.post(Request::Ping).await.unwrap_err();
        assert!(matches!(err, NetronError::PeerDisconnected));
    }

    #[test]
    fn test_references_resolve_by_id_only() {
        let peer = Peer::new(None);
        let handed_out = Definition {
            id: 40,
            name: "Child".to_string(),
            methods: vec!["m".to_string()],
            properties: vec![],
        };
        peer.insert_reference(handed_out.clone());
        assert_eq!(peer.definition_by_id(40), Some(handed_out.clone()));
        assert!(peer.definition("Child").is_none());
        assert_eq!(peer.remove_reference(40), Some(handed_out));
        assert!(peer.definition_by_id(40).is_none());
    }

    #[tokio::test]
    async fn test_dropped_request_cleans_awaiter() {
        let server_handle = Arc::new(EchoHandle {
            silent: true,
            ..Default::default()
        });
        let client_handle = Arc::new(EchoHandle::default());
        let (client, _server) = linked(&server_handle, &client_handle);

        let fut = client.request(Request::Handshake(Handshake::new("c", false, vec![])), None);
        let outcome = tokio::time::timeout(Duration::from_millis(50), fut).await;
        assert!(outcome.is_err());
        assert_eq!(client.awaiter_count(), 0);
    }

    #[tokio::test]
    async fn test_notifications_track_definitions() {
        let server_handle = Arc::new(EchoHandle::default());
        let client_handle = Arc::new(EchoHandle::default());
        let (client, server) = linked(&server_handle, &client_handle);
        client.set_status(PeerStatus::Online);
        server.set_status(PeerStatus::Online);

        let definition = Definition {
            id: 3,
            name: "x".to_string(),
            methods: vec!["m".to_string()],
            properties: vec![],
        };
        server
            .notify(Notification::ContextAttach {
                definition: definition.clone(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.definition("x"), Some(definition.clone()));
        assert_eq!(client.definition_by_id(3), Some(definition));
        assert_eq!(client_handle.notifications.lock().unwrap().len(), 1);

        server
            .notify(Notification::ContextDetach {
                name: "x".to_string(),
                def_id: 3,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.definition("x").is_none());
    }
}
