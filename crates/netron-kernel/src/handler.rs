//! Inbound traffic: the server side of the handshake, request dispatch,
//! context notifications and hub relay.
//!
//! Requests that concern hubs and event subscriptions are served in
//! [`crate::remote`].

use crate::hooks::Confirm;
use crate::netron::Netron;
use crate::stub::{Invocation, Stub};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use netron_types::definition::Definition;
use netron_types::error::{NetronError, NetronResult};
use netron_types::event::NetronEvent;
use netron_types::status::PeerStatus;
use netron_wire::message::PROTOCOL_VERSION;
use netron_wire::{Handshake, Notification, Peer, PeerHandle, Request, Response};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[async_trait]
impl PeerHandle for Netron {
    async fn handle_request(&self, peer: Arc<Peer>, id: u64, request: Request) {
        let response = match request {
            Request::Handshake(handshake) => {
                self.accept_handshake(&peer, id, handshake).await;
                return;
            }
            Request::Ping => Response::Ack,
            Request::AttachContext { definition } => {
                ack_or_error(self.accept_remote_attach(&peer, definition).await)
            }
            Request::DetachContext { name } => {
                ack_or_error(self.accept_remote_detach(&peer, &name).await)
            }
            Request::Subscribe { event } => ack_or_error(self.add_remote_listener(&peer, &event)),
            Request::Unsubscribe { event } => {
                self.remove_remote_listener(&peer, &event);
                Response::Ack
            }
            request => {
                let Some((def_id, invocation)) = Invocation::from_request(request) else {
                    return;
                };
                let caller = peer.uid();
                if invocation.is_void() {
                    let member = invocation.member().to_string();
                    if let Err(e) = self.serve(def_id, invocation, caller.as_deref()).await {
                        debug!(peer = peer.id(), def_id, member = %member, "call_void failed: {e}");
                    }
                    return;
                }
                let returns_value = invocation.returns_value();
                let member = invocation.member().to_string();
                match self.serve(def_id, invocation, caller.as_deref()).await {
                    Ok(value) if returns_value => Response::Value { value },
                    Ok(_) => Response::Ack,
                    Err(e) => {
                        debug!(
                            peer = peer.id(),
                            request_id = id,
                            def_id,
                            member = %member,
                            "request failed: {e}"
                        );
                        Response::error(&e)
                    }
                }
            }
        };
        if let Err(e) = peer.respond(id, response).await {
            debug!(peer = peer.id(), request_id = id, "response not delivered: {e}");
        }
    }

    async fn handle_notification(&self, peer: Arc<Peer>, notification: Notification) {
        let Some(origin) = peer.uid() else {
            return;
        };
        match notification {
            Notification::ContextAttach { definition } => {
                debug!(uid = %origin, context = %definition.name, def_id = definition.id, "remote context attached");
                self.events.publish(NetronEvent::ContextAttach {
                    definition: definition.clone(),
                    origin: Some(origin.clone()),
                });
                if self.is_super() {
                    self.relay_attach(&origin, definition).await;
                }
            }
            Notification::ContextDetach { name, def_id } => {
                debug!(uid = %origin, context = %name, def_id, "remote context detached");
                self.forget_interface(Some(&origin), def_id);
                self.events.publish(NetronEvent::ContextDetach {
                    name: name.clone(),
                    def_id,
                    origin: Some(origin.clone()),
                });
                if self.is_super() {
                    self.relay_detach(&origin, &name, def_id).await;
                }
            }
            Notification::Event { data } => self.deliver_remote_event(&origin, &data),
        }
    }

    async fn peer_closed(&self, peer: Arc<Peer>) {
        let was_online = self.peers.remove_peer(&peer);
        if let Some(addr) = peer.remote_addr() {
            self.connections
                .remove_if(addr, |_, cached| Arc::ptr_eq(cached, &peer));
        }

        let uid = peer.uid();
        if was_online {
            if let Some(origin) = &uid {
                for definition in peer.definitions() {
                    self.events.publish(NetronEvent::ContextDetach {
                        name: definition.name,
                        def_id: definition.id,
                        origin: Some(origin.clone()),
                    });
                }
                self.release_relays(origin).await;
            }
        }
        if let Some(origin) = &uid {
            let released = self.release_peer_stubs(origin);
            self.forget_interfaces_of(origin);
            self.forget_remote(origin);
            if released > 0 {
                debug!(uid = %origin, released, "stubs of offline peer released");
            }
        }

        info!(peer = peer.id(), uid = ?uid, "peer offline");
        self.events.publish(NetronEvent::PeerOffline {
            peer_id: peer.id(),
            uid,
        });
    }
}

impl Netron {
    async fn serve(
        &self,
        def_id: u64,
        invocation: Invocation,
        caller: Option<&str>,
    ) -> NetronResult<Option<Value>> {
        let stub = self.local_stub(def_id)?;
        invocation.check(stub.definition())?;
        self.invoke_stub(&stub, caller, invocation).await
    }

    /// Server side of the handshake.
    async fn accept_handshake(&self, peer: &Arc<Peer>, id: u64, handshake: Handshake) {
        if peer.status() != PeerStatus::Handshaking {
            let err = NetronError::IllegalState("Handshake already completed".to_string());
            let _ = peer.respond(id, Response::error(&err)).await;
            return;
        }

        if let Err(err) = self.check_handshake(&handshake) {
            self.log_refusal(peer, &format!("handshake refused: {err}"));
            self.refuse(peer, id, err).await;
            return;
        }
        if let Err(err) = peer.set_uid(&handshake.uid) {
            self.refuse(peer, id, err).await;
            return;
        }
        peer.set_super(handshake.is_super);
        for definition in &handshake.definitions {
            peer.insert_definition(definition.clone());
        }

        match self.hooks.confirm_peer(peer, &handshake).await {
            Confirm::Accept => {}
            Confirm::Reject => {
                self.log_refusal(peer, "peer rejected by confirmation hook");
                self.refuse(peer, id, NetronError::NotAllowed("Connection refused".to_string()))
                    .await;
                return;
            }
            Confirm::Disconnect => {
                self.log_refusal(peer, "peer dropped by confirmation hook");
                peer.disconnect().await;
                return;
            }
        }

        if !self.peers.add_peer(Arc::clone(peer)) {
            let err = NetronError::Exists(format!("Peer '{}' is already connected", handshake.uid));
            self.refuse(peer, id, err).await;
            return;
        }
        peer.set_status(PeerStatus::Online);

        let mut ack = Handshake::new(
            self.uid(),
            self.is_super(),
            self.exported_definitions(Some(&handshake.uid)),
        );
        self.hooks.handshake_payload(peer, &mut ack).await;
        if let Err(e) = peer.respond(id, Response::HandshakeAck(ack)).await {
            warn!(peer = peer.id(), uid = %handshake.uid, "handshake ack not delivered: {e}");
            peer.disconnect().await;
            return;
        }

        info!(peer = peer.id(), uid = %handshake.uid, addr = ?peer.remote_addr(), "peer online");
        self.events.publish(NetronEvent::PeerOnline {
            peer_id: peer.id(),
            uid: handshake.uid,
        });
        self.announce_remote(peer, handshake.definitions).await;
    }

    fn check_handshake(&self, handshake: &Handshake) -> NetronResult<()> {
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(NetronError::NotValid(format!(
                "Unsupported protocol version {}",
                handshake.protocol_version
            )));
        }
        if handshake.uid.is_empty() {
            return Err(NetronError::InvalidArgument("Invalid peer uid".to_string()));
        }
        if handshake.uid == self.uid() {
            return Err(NetronError::NotAllowed(
                "Cannot connect to self".to_string(),
            ));
        }
        if self.peers.contains(&handshake.uid) {
            return Err(NetronError::Exists(format!(
                "Peer '{}' is already connected",
                handshake.uid
            )));
        }
        Ok(())
    }

    async fn refuse(&self, peer: &Arc<Peer>, id: u64, err: NetronError) {
        let _ = peer.respond(id, Response::error(&err)).await;
        peer.disconnect().await;
    }

    /// Report the contexts of a peer that just came online, relaying them
    /// when running as a hub.
    pub(crate) async fn announce_remote(&self, peer: &Arc<Peer>, definitions: Vec<Definition>) {
        let Some(origin) = peer.uid() else {
            return;
        };
        for definition in definitions {
            self.events.publish(NetronEvent::ContextAttach {
                definition: definition.clone(),
                origin: Some(origin.clone()),
            });
            if self.is_super() {
                self.relay_attach(&origin, definition).await;
            }
        }
    }

    /// Expose a context of peer `origin` to every other peer.
    ///
    /// Names already exposed here, local or relayed, are never replaced.
    async fn relay_attach(&self, origin: &str, definition: Definition) {
        match self.install_relay(origin, definition) {
            Ok(relayed) => {
                self.broadcast(Notification::ContextAttach { definition: relayed }, Some(origin))
                    .await
            }
            Err(e) => debug!(uid = %origin, "not relaying: {e}"),
        }
    }

    /// Create the named relay stub for a context of peer `origin`.
    pub(crate) fn install_relay(&self, origin: &str, definition: Definition) -> NetronResult<Definition> {
        let relayed = match self.contexts.entry(definition.name.clone()) {
            Entry::Occupied(_) => {
                return Err(NetronError::Exists(format!(
                    "Context '{}' already attached",
                    definition.name
                )))
            }
            Entry::Vacant(slot) => {
                let remote_id = definition.id;
                let local = Definition {
                    id: self.allocate_def_id(),
                    ..definition
                };
                let stub = Arc::new(Stub::relay(local.clone(), origin, remote_id));
                self.stubs.insert(local.id, Arc::clone(&stub));
                slot.insert(stub);
                local
            }
        };
        debug!(uid = %origin, context = %relayed.name, def_id = relayed.id, "relaying context");
        Ok(relayed)
    }

    /// Withdraw a relayed context after its origin detached it.
    async fn relay_detach(&self, origin: &str, name: &str, remote_id: u64) {
        let Some((_, stub)) = self
            .contexts
            .remove_if(name, |_, stub| stub.relays(origin, remote_id))
        else {
            return;
        };
        let def_id = stub.definition().id;
        self.stubs.remove(&def_id);
        self.forget_interface(None, def_id);
        self.release_children(def_id);
        debug!(uid = %origin, context = %name, def_id, "relay withdrawn");
        self.broadcast(
            Notification::ContextDetach {
                name: name.to_string(),
                def_id,
            },
            Some(origin),
        )
        .await;
    }

    /// Withdraw every context relayed on behalf of `origin`.
    async fn release_relays(&self, origin: &str) {
        let relayed: Vec<String> = self
            .contexts
            .iter()
            .filter(|e| e.value().origin() == Some(origin))
            .map(|e| e.key().clone())
            .collect();
        for name in relayed {
            let Some((_, stub)) = self
                .contexts
                .remove_if(&name, |_, stub| stub.origin() == Some(origin))
            else {
                continue;
            };
            let def_id = stub.definition().id;
            self.stubs.remove(&def_id);
            self.forget_interface(None, def_id);
            self.release_children(def_id);
            debug!(uid = %origin, context = %name, def_id, "relay released");
            self.broadcast(Notification::ContextDetach { name, def_id }, Some(origin))
                .await;
        }
    }
}

fn ack_or_error(outcome: NetronResult<()>) -> Response {
    match outcome {
        Ok(()) => Response::Ack,
        Err(e) => Response::error(&e),
    }
}
