//! Establishing connections: dialing, accepting and the client handshake.

use crate::hooks::Confirm;
use crate::netron::Netron;
use crate::retry::{retry_async, RetryConfig, RetryOutcome};

use netron_types::definition::Definition;
use netron_types::error::{NetronError, NetronResult};
use netron_types::event::NetronEvent;
use netron_types::status::PeerStatus;
use netron_wire::message::PROTOCOL_VERSION;
use netron_wire::{Handshake, Notification, Peer, Request, Response, TcpTransport, Transport};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

impl Netron {
    /// Connect to the runtime listening at `addr` and complete the handshake.
    ///
    /// A live connection to the same address is reused. Failed dials are
    /// retried `reconnects` times with backoff.
    pub async fn connect(&self, addr: &str) -> NetronResult<Arc<Peer>> {
        if let Some(peer) = self.connections.get(addr).map(|p| Arc::clone(p.value())) {
            if !peer.is_closed() && peer.status() == PeerStatus::Online {
                debug!(addr, uid = ?peer.uid(), "reusing connection");
                return Ok(peer);
            }
        }

        let peer = Peer::new(Some(addr.to_string()));
        self.created(&peer);
        peer.set_status(PeerStatus::Connecting);

        let retry = RetryConfig::for_connect(self.config().reconnects, &self.config().connect);
        let outcome = retry_async(
            &retry,
            || TcpTransport::connect(addr),
            |attempt, delay_ms| {
                info!(addr, attempt, delay_ms, "reconnecting");
                peer.emit_reconnect_attempt(attempt);
                self.events.publish(NetronEvent::ReconnectAttempt {
                    addr: addr.to_string(),
                    attempt,
                });
            },
        )
        .await;

        let transport = match outcome {
            RetryOutcome::Success { result, .. } => result,
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                warn!(addr, attempts, "peer unreachable: {last_error}");
                peer.disconnect().await;
                self.events.publish(NetronEvent::PeerOffline {
                    peer_id: peer.id(),
                    uid: None,
                });
                return Err(NetronError::ConnectionFailed(format!(
                    "Peer {addr} unreachable after {attempts} attempt(s): {last_error}"
                )));
            }
        };
        peer.set_transport(Arc::new(transport))?;
        self.establish(peer, addr).await
    }

    /// Connect over an already established transport.
    pub async fn connect_transport(&self, transport: Arc<dyn Transport>) -> NetronResult<Arc<Peer>> {
        let label = transport
            .remote_addr()
            .unwrap_or_else(|| "in-memory".to_string());
        let peer = Peer::with_transport(transport);
        self.created(&peer);
        peer.set_status(PeerStatus::Connecting);
        self.establish(peer, &label).await
    }

    fn created(&self, peer: &Arc<Peer>) {
        self.hooks.peer_created(peer);
        self.events.publish(NetronEvent::PeerCreate { peer_id: peer.id() });
    }

    async fn establish(&self, peer: Arc<Peer>, label: &str) -> NetronResult<Arc<Peer>> {
        peer.set_status(PeerStatus::Handshaking);
        self.events.publish(NetronEvent::PeerConnect { peer_id: peer.id() });
        peer.start(self.handle())?;

        match self.client_handshake(&peer, label).await {
            Ok(()) => {
                if let Some(addr) = peer.remote_addr() {
                    self.connections.insert(addr.to_string(), Arc::clone(&peer));
                }
                Ok(peer)
            }
            Err(e) => {
                warn!(peer = peer.id(), addr = label, "handshake failed: {e}");
                peer.disconnect().await;
                Err(e)
            }
        }
    }

    async fn client_handshake(&self, peer: &Arc<Peer>, label: &str) -> NetronResult<()> {
        let mut hello = Handshake::new(
            self.uid(),
            self.is_super(),
            self.exported_definitions(None),
        );
        self.hooks.handshake_payload(peer, &mut hello).await;
        let advertised = hello.definitions.clone();

        let response = peer
            .request(
                Request::Handshake(hello),
                Some(self.config().handshake_timeout()),
            )
            .await
            .map_err(|e| match e {
                NetronError::PeerDisconnected => {
                    NetronError::ConnectionFailed(format!("Peer {label} refused connection"))
                }
                NetronError::Timeout(ms) => NetronError::ConnectionFailed(format!(
                    "Peer {label} did not complete the handshake within {ms}ms"
                )),
                other => NetronError::ConnectionFailed(format!(
                    "Peer {label} refused connection: {}",
                    other.wire_message()
                )),
            })?;
        let Response::HandshakeAck(ack) = response else {
            return Err(NetronError::Protocol(format!(
                "expected handshake_ack from {label}"
            )));
        };

        if ack.protocol_version != PROTOCOL_VERSION {
            return Err(NetronError::ConnectionFailed(format!(
                "Peer {label} speaks protocol version {}, expected {PROTOCOL_VERSION}",
                ack.protocol_version
            )));
        }
        if ack.uid.is_empty() || ack.uid == self.uid() {
            return Err(NetronError::ConnectionFailed(format!(
                "Peer {label} presented an invalid uid '{}'",
                ack.uid
            )));
        }
        peer.set_uid(&ack.uid)?;
        peer.set_super(ack.is_super);

        if self.hooks.confirm_peer(peer, &ack).await != Confirm::Accept {
            return Err(NetronError::ConnectionFailed(format!(
                "Peer {label} refused connection: rejected by peer confirmation"
            )));
        }
        if !self.peers.add_peer(Arc::clone(peer)) {
            return Err(NetronError::ConnectionFailed(format!(
                "Peer '{}' is already connected",
                ack.uid
            )));
        }

        peer.set_status(PeerStatus::Online);
        info!(peer = peer.id(), uid = %ack.uid, addr = label, "peer online");
        self.events.publish(NetronEvent::PeerOnline {
            peer_id: peer.id(),
            uid: ack.uid.clone(),
        });
        self.catch_up(peer, &ack.uid, &advertised).await;
        self.announce_remote(peer, peer.definitions()).await;
        Ok(())
    }

    /// Tell a new peer about contexts attached or detached here while the
    /// handshake was in flight.
    ///
    /// Attach and detach only notify online peers, so the peer misses what
    /// changed between the hello and going online.
    async fn catch_up(&self, peer: &Arc<Peer>, uid: &str, advertised: &[Definition]) {
        let current = self.exported_definitions(Some(uid));
        let mut changes = Vec::new();
        for definition in advertised {
            if !current.iter().any(|d| d.id == definition.id) {
                changes.push(Notification::ContextDetach {
                    name: definition.name.clone(),
                    def_id: definition.id,
                });
            }
        }
        for definition in current {
            if !advertised.iter().any(|d| d.id == definition.id) {
                changes.push(Notification::ContextAttach { definition });
            }
        }
        for change in changes {
            debug!(peer = peer.id(), uid = %uid, "advertising change made during handshake");
            if let Err(e) = peer.notify(change).await {
                debug!(peer = peer.id(), uid = %uid, "notification not delivered: {e}");
                return;
            }
        }
    }

    /// Serve an accepted transport.
    ///
    /// The handshake is completed by the peer; a peer that is not online
    /// within the handshake timeout is dropped.
    pub async fn accept_transport(
        &self,
        transport: Arc<dyn Transport>,
    ) -> NetronResult<Arc<Peer>> {
        let peer = Peer::with_transport(transport);
        self.created(&peer);

        if self.config().restrict_access {
            let verdict = self.hooks.confirm_connection(&peer).await;
            if verdict != Confirm::Accept {
                self.log_refusal(&peer, "connection refused");
                peer.disconnect().await;
                self.events.publish(NetronEvent::PeerOffline {
                    peer_id: peer.id(),
                    uid: None,
                });
                return Err(NetronError::NotAllowed("Connection refused".to_string()));
            }
        }

        peer.set_status(PeerStatus::Connecting);
        peer.set_status(PeerStatus::Handshaking);
        self.events.publish(NetronEvent::PeerConnect { peer_id: peer.id() });
        peer.start(self.handle())?;

        let limit = self.config().handshake_timeout();
        let watched = Arc::downgrade(&peer);
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let Some(peer) = watched.upgrade() else {
                return;
            };
            if !peer.is_closed() && peer.status() != PeerStatus::Online {
                warn!(peer = peer.id(), "handshake not completed in time");
                peer.disconnect().await;
            }
        });
        Ok(peer)
    }

    /// Listen for peers on `addr`, or on the configured `listen_addr`.
    ///
    /// Returns the bound address.
    pub async fn bind(&self, addr: Option<&str>) -> NetronResult<SocketAddr> {
        let addr = match (addr, self.config().listen_addr) {
            (Some(addr), _) => addr.to_string(),
            (None, Some(addr)) => addr.to_string(),
            (None, None) => {
                return Err(NetronError::InvalidArgument(
                    "No listen address given".to_string(),
                ))
            }
        };
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        info!(uid = %self.uid(), addr = %local, "listening for peers");

        let task = tokio::spawn(accept_loop(listener, self.weak()));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
        Ok(local)
    }
}

async fn accept_loop(listener: TcpListener, netron: Weak<Netron>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let Some(netron) = netron.upgrade() else {
                    break;
                };
                debug!(%addr, "accepted connection");
                tokio::spawn(async move {
                    let transport = Arc::new(TcpTransport::new(stream));
                    if let Err(e) = netron.accept_transport(transport).await {
                        debug!(%addr, "inbound connection dropped: {e}");
                    }
                });
            }
            Err(e) => {
                error!("accept error: {e}");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}
