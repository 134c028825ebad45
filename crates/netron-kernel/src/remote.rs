//! Acting on other runtimes: attaching contexts on a hub and subscribing to
//! a peer's events. Both sides of each exchange live here.

use crate::netron::{exposure_name, Netron};
use crate::stub::{Context, Stub};

use dashmap::mapref::entry::Entry;
use netron_types::definition::Definition;
use netron_types::error::{NetronError, NetronResult};
use netron_types::event::NetronEvent;
use netron_wire::{Notification, Peer, Request};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Handler for events of a peer. Receives the peer uid and the event.
pub type RemoteHandler = Arc<dyn Fn(&str, &NetronEvent) + Send + Sync>;

impl Netron {
    // ---- contexts attached on hubs ----

    /// Attach a context on hub `uid`, which exposes it to its other peers.
    ///
    /// The context is served from here; it goes away with the connection
    /// to the hub. Returns the definition id under which it is served.
    pub async fn attach_context_remote(
        &self,
        uid: &str,
        context: Arc<dyn Context>,
        name: Option<&str>,
    ) -> NetronResult<u64> {
        let peer = self.hub(uid)?;
        let descriptor = context.descriptor();
        let name = exposure_name(&descriptor, name)?;

        let key = (uid.to_string(), name.clone());
        let definition = match self.pushed.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(NetronError::Exists(format!(
                    "Context '{name}' already attached on peer '{uid}'"
                )))
            }
            Entry::Vacant(slot) => {
                let definition = descriptor.into_definition(self.allocate_def_id(), name.clone());
                let stub = Stub::local(definition.clone(), context).owned_by(Some(uid));
                self.stubs.insert(definition.id, Arc::new(stub));
                slot.insert(definition.id);
                definition
            }
        };

        let def_id = definition.id;
        let outcome = peer
            .request(
                Request::AttachContext { definition },
                self.config().response_timeout(),
            )
            .await;
        if let Err(e) = outcome {
            self.pushed.remove(&key);
            self.stubs.remove(&def_id);
            return Err(e);
        }
        info!(uid = %uid, context = %name, def_id, "context attached on hub");
        Ok(def_id)
    }

    /// Detach a context previously attached on hub `uid`.
    pub async fn detach_context_remote(&self, uid: &str, name: &str) -> NetronResult<()> {
        let peer = self.hub(uid)?;
        let Some((_, def_id)) = self.pushed.remove(&(uid.to_string(), name.to_string())) else {
            return Err(NetronError::Unknown(format!(
                "Context '{name}' is not attached on peer '{uid}'"
            )));
        };
        self.stubs.remove(&def_id);
        self.forget_interface(None, def_id);
        self.release_children(def_id);
        info!(uid = %uid, context = %name, def_id, "context detached from hub");
        peer.request(
            Request::DetachContext {
                name: name.to_string(),
            },
            self.config().response_timeout(),
        )
        .await?;
        Ok(())
    }

    /// Names of the contexts attached on hub `uid`.
    pub fn remote_context_names(&self, uid: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .pushed
            .iter()
            .filter(|e| e.key().0 == uid)
            .map(|e| e.key().1.clone())
            .collect();
        names.sort();
        names
    }

    fn hub(&self, uid: &str) -> NetronResult<Arc<Peer>> {
        let peer = self.get_peer(uid)?;
        if !peer.is_super() {
            return Err(NetronError::Unknown(format!("Peer '{uid}' is not a hub")));
        }
        Ok(peer)
    }

    /// Hub side of [`Netron::attach_context_remote`].
    pub(crate) async fn accept_remote_attach(
        &self,
        peer: &Arc<Peer>,
        definition: Definition,
    ) -> NetronResult<()> {
        let origin = self.hub_request_origin(peer)?;
        let relayed = self.install_relay(&origin, definition.clone())?;
        peer.insert_definition(definition.clone());
        info!(uid = %origin, context = %relayed.name, def_id = relayed.id, "context attached by peer");
        self.events.publish(NetronEvent::ContextAttach {
            definition,
            origin: Some(origin.clone()),
        });
        self.broadcast(Notification::ContextAttach { definition: relayed }, Some(&origin))
            .await;
        Ok(())
    }

    /// Hub side of [`Netron::detach_context_remote`].
    pub(crate) async fn accept_remote_detach(&self, peer: &Arc<Peer>, name: &str) -> NetronResult<()> {
        let origin = self.hub_request_origin(peer)?;
        let Some((_, stub)) = self
            .contexts
            .remove_if(name, |_, stub| stub.origin() == Some(origin.as_str()))
        else {
            return Err(NetronError::Unknown(format!("Unknown context '{name}'")));
        };
        let def_id = stub.definition().id;
        self.stubs.remove(&def_id);
        self.forget_interface(None, def_id);
        self.release_children(def_id);

        let remote = peer.definition(name);
        if let Some(remote) = &remote {
            peer.remove_definition(name, remote.id);
        }
        info!(uid = %origin, context = %name, def_id, "context detached by peer");
        self.events.publish(NetronEvent::ContextDetach {
            name: name.to_string(),
            def_id: remote.map_or(def_id, |d| d.id),
            origin: Some(origin.clone()),
        });
        self.broadcast(
            Notification::ContextDetach {
                name: name.to_string(),
                def_id,
            },
            Some(&origin),
        )
        .await;
        Ok(())
    }

    fn hub_request_origin(&self, peer: &Peer) -> NetronResult<String> {
        if !self.is_super() {
            return Err(NetronError::NotAllowed(
                "Contexts can only be attached on a hub".to_string(),
            ));
        }
        peer.uid()
            .ok_or_else(|| NetronError::IllegalState("Handshake required".to_string()))
    }

    // ---- events of peers ----

    /// Call `handler` for every `event` emitted by peer `uid`, or by every
    /// online peer when `None`.
    ///
    /// `event` is one of [`NetronEvent::KINDS`]. Returns an id for
    /// [`Netron::off_remote`].
    pub async fn on_remote(
        &self,
        uid: Option<&str>,
        event: &str,
        handler: RemoteHandler,
    ) -> NetronResult<u64> {
        if !NetronEvent::KINDS.contains(&event) {
            return Err(NetronError::InvalidArgument(format!(
                "Unknown event '{event}'"
            )));
        }
        let uids = match uid {
            Some(uid) => vec![self.get_peer(uid)?.uid().unwrap_or_else(|| uid.to_string())],
            None => self.peer_uids(),
        };
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribed: Vec<String> = Vec::with_capacity(uids.len());
        for uid in uids {
            if let Err(e) = self.subscribe_remote(&uid, event, id, Arc::clone(&handler)).await {
                for done in &subscribed {
                    self.unsubscribe_remote(done, event, id).await;
                }
                return Err(e);
            }
            subscribed.push(uid);
        }
        Ok(id)
    }

    /// Remove handler `id` for `event` of peer `uid`, or of every peer when
    /// `None`. Unknown handlers are ignored.
    pub async fn off_remote(&self, uid: Option<&str>, event: &str, id: u64) {
        let uids: Vec<String> = match uid {
            Some(uid) => vec![uid.to_string()],
            None => self
                .remote_handlers
                .iter()
                .filter(|e| e.key().1 == event)
                .map(|e| e.key().0.clone())
                .collect(),
        };
        for uid in uids {
            self.unsubscribe_remote(&uid, event, id).await;
        }
    }

    async fn subscribe_remote(
        &self,
        uid: &str,
        event: &str,
        id: u64,
        handler: RemoteHandler,
    ) -> NetronResult<()> {
        let peer = self.get_peer(uid)?;
        let key = (uid.to_string(), event.to_string());
        let first = {
            let mut handlers = self.remote_handlers.entry(key.clone()).or_default();
            handlers.push((id, handler));
            handlers.len() == 1
        };
        if !first {
            return Ok(());
        }
        let outcome = peer
            .request(
                Request::Subscribe {
                    event: event.to_string(),
                },
                self.config().response_timeout(),
            )
            .await;
        if let Err(e) = outcome {
            self.remote_handlers.remove_if(&key, |_, handlers| {
                handlers.len() == 1 && handlers[0].0 == id
            });
            return Err(e);
        }
        debug!(uid = %uid, event, "subscribed to peer events");
        Ok(())
    }

    async fn unsubscribe_remote(&self, uid: &str, event: &str, id: u64) {
        let key = (uid.to_string(), event.to_string());
        let last = match self.remote_handlers.get_mut(&key) {
            Some(mut handlers) => {
                handlers.retain(|(handler_id, _)| *handler_id != id);
                handlers.is_empty()
            }
            None => return,
        };
        if !last || self.remote_handlers.remove_if(&key, |_, h| h.is_empty()).is_none() {
            return;
        }
        let Ok(peer) = self.get_peer(uid) else {
            return;
        };
        let outcome = peer
            .request(
                Request::Unsubscribe {
                    event: event.to_string(),
                },
                self.config().response_timeout(),
            )
            .await;
        match outcome {
            Ok(_) => debug!(uid = %uid, event, "unsubscribed from peer events"),
            Err(e) => debug!(uid = %uid, event, "unsubscribe not confirmed: {e}"),
        }
    }

    pub(crate) fn deliver_remote_event(&self, uid: &str, event: &NetronEvent) {
        let handlers: Vec<_> = self
            .remote_handlers
            .get(&(uid.to_string(), event.kind().to_string()))
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(uid, event))).is_err() {
                warn!(uid = %uid, event = event.kind(), "remote event handler panicked");
            }
        }
    }

    /// Forward our `event`s to `peer` until it unsubscribes.
    pub(crate) fn add_remote_listener(&self, peer: &Arc<Peer>, event: &str) -> NetronResult<()> {
        if !NetronEvent::KINDS.contains(&event) {
            return Err(NetronError::InvalidArgument(format!(
                "Unknown event '{event}'"
            )));
        }
        let subscriber = peer
            .uid()
            .ok_or_else(|| NetronError::IllegalState("Handshake required".to_string()))?;
        let Entry::Vacant(slot) = self
            .remote_listeners
            .entry((subscriber.clone(), event.to_string()))
        else {
            return Ok(());
        };

        let mut events = self.events.subscribe();
        let watched = Arc::downgrade(peer);
        let kind = event.to_string();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        // Never echo a peer's own contexts back to it.
                        if event.kind() != kind || event.origin() == Some(subscriber.as_str()) {
                            continue;
                        }
                        let Some(peer) = watched.upgrade() else {
                            break;
                        };
                        if let Err(e) = peer.notify(Notification::Event { data: event }).await {
                            debug!(uid = %subscriber, "event not delivered: {e}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(uid = %subscriber, skipped, "event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        slot.insert(task);
        debug!(peer = peer.id(), event, "peer subscribed to events");
        Ok(())
    }

    pub(crate) fn remove_remote_listener(&self, peer: &Peer, event: &str) {
        let Some(uid) = peer.uid() else {
            return;
        };
        if let Some((_, task)) = self.remote_listeners.remove(&(uid, event.to_string())) {
            task.abort();
            debug!(peer = peer.id(), event, "peer unsubscribed from events");
        }
    }

    /// Drop subscriptions in both directions for a peer that went offline.
    pub(crate) fn forget_remote(&self, uid: &str) {
        self.remote_handlers.retain(|(peer, _), _| peer != uid);
        self.remote_listeners.retain(|(peer, _), task| {
            if peer == uid {
                task.abort();
                false
            } else {
                true
            }
        });
    }
}
