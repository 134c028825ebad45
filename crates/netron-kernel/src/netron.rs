//! The Netron runtime: the process-wide coordinator of contexts and peers.
//!
//! A [`Netron`] owns the table of attached contexts, the registry of online
//! peers and the event bus. Connection setup lives in [`crate::connect`],
//! inbound traffic and hub relay in [`crate::handler`], contexts attached on
//! hubs and subscriptions to peer events in [`crate::remote`].

use crate::auth::SharedSecretAuth;
use crate::caller::Caller;
use crate::event_bus::EventBus;
use crate::hooks::{DefaultHooks, NetronHooks};
use crate::interface::{Interface, StockInterface};
use crate::remote::RemoteHandler;
use crate::stub::{same_context, Context, Invocation, Stub, StubTarget};
use crate::twin::TwinFactory;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use netron_types::config::NetronConfig;
use netron_types::definition::{ContextDescriptor, Definition};
use netron_types::error::{NetronError, NetronResult};
use netron_types::event::NetronEvent;
use netron_types::reference::{rewrite_embedded, Embedded};
use netron_types::status::PeerStatus;
use netron_wire::{Notification, Peer, PeerHandle, PeerRegistry, Request, Response};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cache key of an interface: owning peer uid and definition id.
type InterfaceKey = (Option<String>, u64);

/// A runtime instance.
pub struct Netron {
    me: Weak<Netron>,
    uid: String,
    config: NetronConfig,
    pub(crate) hooks: Arc<dyn NetronHooks>,
    /// Attached and relayed contexts by exposure name.
    pub(crate) contexts: DashMap<String, Arc<Stub>>,
    /// The same stubs by definition id.
    pub(crate) stubs: DashMap<u64, Arc<Stub>>,
    twins: DashMap<String, TwinFactory>,
    pub(crate) peers: PeerRegistry,
    /// Outbound peers by dialed address.
    pub(crate) connections: DashMap<String, Arc<Peer>>,
    next_def_id: AtomicU64,
    pub(crate) events: EventBus,
    pub(crate) listeners: Mutex<Vec<JoinHandle<()>>>,
    interfaces: DashMap<InterfaceKey, Arc<Interface>>,
    /// Contexts this runtime attached on hubs, by hub uid and name.
    pub(crate) pushed: DashMap<(String, String), u64>,
    /// Handlers for events of peers, by peer uid and event name.
    pub(crate) remote_handlers: DashMap<(String, String), Vec<(u64, RemoteHandler)>>,
    /// Forwarders of our events to subscribed peers, by peer uid and event name.
    pub(crate) remote_listeners: DashMap<(String, String), JoinHandle<()>>,
    pub(crate) next_handler_id: AtomicU64,
}

impl std::fmt::Debug for Netron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Netron")
            .field("uid", &self.uid)
            .field("is_super", &self.config.is_super)
            .field("contexts", &self.contexts.len())
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl Netron {
    /// Create a runtime.
    ///
    /// When `shared_secret` is configured the handshake is authenticated with
    /// [`SharedSecretAuth`]; otherwise every peer is accepted.
    pub fn new(config: NetronConfig) -> Arc<Self> {
        let hooks: Arc<dyn NetronHooks> = match &config.shared_secret {
            Some(secret) => Arc::new(SharedSecretAuth::new(secret.clone())),
            None => Arc::new(DefaultHooks),
        };
        Self::with_hooks(config, hooks)
    }

    /// Create a runtime with custom connection hooks.
    pub fn with_hooks(config: NetronConfig, hooks: Arc<dyn NetronHooks>) -> Arc<Self> {
        let uid = config.resolve_uid();
        info!(uid = %uid, is_super = config.is_super, "netron runtime created");
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            uid,
            config,
            hooks,
            contexts: DashMap::new(),
            stubs: DashMap::new(),
            twins: DashMap::new(),
            peers: PeerRegistry::new(),
            connections: DashMap::new(),
            next_def_id: AtomicU64::new(1),
            events: EventBus::new(),
            listeners: Mutex::new(Vec::new()),
            interfaces: DashMap::new(),
            pushed: DashMap::new(),
            remote_handlers: DashMap::new(),
            remote_listeners: DashMap::new(),
            next_handler_id: AtomicU64::new(1),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn config(&self) -> &NetronConfig {
        &self.config
    }

    /// Whether this runtime relays contexts between its peers.
    pub fn is_super(&self) -> bool {
        self.config.is_super
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetronEvent> {
        self.events.subscribe()
    }

    pub(crate) fn arc(&self) -> NetronResult<Arc<Netron>> {
        self.me
            .upgrade()
            .ok_or_else(|| NetronError::IllegalState("runtime is shutting down".to_string()))
    }

    pub(crate) fn weak(&self) -> Weak<Netron> {
        self.me.clone()
    }

    pub(crate) fn handle(&self) -> Weak<dyn PeerHandle> {
        self.me.clone()
    }

    pub(crate) fn allocate_def_id(&self) -> u64 {
        self.next_def_id.fetch_add(1, Ordering::Relaxed)
    }

    // ---- contexts ----

    /// Attach a context, exposing it to every connected peer.
    ///
    /// The context is exposed under `name`, or under its class name when no
    /// name is given. Returns the new definition id.
    pub async fn attach_context(
        &self,
        context: Arc<dyn Context>,
        name: Option<&str>,
    ) -> NetronResult<u64> {
        let descriptor = context.descriptor();
        let name = exposure_name(&descriptor, name)?;

        let definition = match self.contexts.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(NetronError::Exists(format!(
                    "Context '{name}' already attached"
                )))
            }
            Entry::Vacant(slot) => {
                let definition = descriptor.into_definition(self.allocate_def_id(), name);
                let stub = Arc::new(Stub::local(definition.clone(), context));
                self.stubs.insert(definition.id, Arc::clone(&stub));
                slot.insert(stub);
                definition
            }
        };

        info!(context = %definition.name, def_id = definition.id, "context attached");
        self.events.publish(NetronEvent::ContextAttach {
            definition: definition.clone(),
            origin: None,
        });
        let id = definition.id;
        self.broadcast(Notification::ContextAttach { definition }, None)
            .await;
        Ok(id)
    }

    /// Detach a context by name.
    ///
    /// Contexts it handed out go with it. Relayed contexts can be detached
    /// too; the peer they came from is not notified.
    pub async fn detach_context(&self, name: &str) -> NetronResult<()> {
        let Some((_, stub)) = self.contexts.remove(name) else {
            return Err(NetronError::Unknown(format!("Unknown context '{name}'")));
        };
        let def_id = stub.definition().id;
        self.stubs.remove(&def_id);
        self.forget_interface(None, def_id);
        self.release_children(def_id);

        info!(context = %name, def_id, "context detached");
        self.events.publish(NetronEvent::ContextDetach {
            name: name.to_string(),
            def_id,
            origin: None,
        });
        self.broadcast(
            Notification::ContextDetach {
                name: name.to_string(),
                def_id,
            },
            stub.origin(),
        )
        .await;
        Ok(())
    }

    /// Names of every context exposed by this runtime, relayed ones included.
    pub fn context_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.contexts.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_context(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }

    /// Definitions to advertise to peer `exclude`, without its own contexts.
    pub(crate) fn exported_definitions(&self, exclude: Option<&str>) -> Vec<Definition> {
        let mut definitions: Vec<Definition> = self
            .contexts
            .iter()
            .filter(|e| exclude.is_none() || e.value().origin() != exclude)
            .map(|e| e.value().definition().clone())
            .collect();
        definitions.sort_by_key(|d| d.id);
        definitions
    }

    /// Whether `uid` addresses a peer rather than this runtime.
    fn is_remote(&self, uid: &str) -> bool {
        uid != self.uid
    }

    /// Definition of context `name`, local when `uid` is `None`.
    pub fn get_definition_by_name(&self, name: &str, uid: Option<&str>) -> NetronResult<Definition> {
        match uid {
            Some(uid) if self.is_remote(uid) => self
                .get_peer(uid)?
                .definition(name)
                .ok_or_else(|| NetronError::Unknown(format!("Unknown context '{name}' of peer '{uid}'"))),
            _ => self
                .contexts
                .get(name)
                .map(|stub| stub.definition().clone())
                .ok_or_else(|| NetronError::Unknown(format!("Unknown context '{name}'"))),
        }
    }

    /// Definition with id `def_id`, local when `uid` is `None`.
    pub fn get_definition_by_id(&self, def_id: u64, uid: Option<&str>) -> NetronResult<Definition> {
        match uid {
            Some(uid) if self.is_remote(uid) => self
                .get_peer(uid)?
                .definition_by_id(def_id)
                .ok_or_else(|| {
                    NetronError::Unknown(format!("Unknown definition '{def_id}' of peer '{uid}'"))
                }),
            _ => self
                .stubs
                .get(&def_id)
                .map(|stub| stub.definition().clone())
                .ok_or_else(|| NetronError::Unknown(format!("Unknown definition '{def_id}'"))),
        }
    }

    /// Interface for context `name`, local when `uid` is `None`.
    ///
    /// Interfaces are cached: asking twice yields the same object until it
    /// is released.
    pub fn get_interface_by_name(&self, name: &str, uid: Option<&str>) -> NetronResult<Arc<Interface>> {
        let definition = self.get_definition_by_name(name, uid)?;
        Ok(self.interface_for(definition, uid))
    }

    /// Interface for definition `def_id`, local when `uid` is `None`.
    pub fn get_interface_by_id(&self, def_id: u64, uid: Option<&str>) -> NetronResult<Arc<Interface>> {
        let definition = self.get_definition_by_id(def_id, uid)?;
        Ok(self.interface_for(definition, uid))
    }

    fn interface_for(&self, definition: Definition, uid: Option<&str>) -> Arc<Interface> {
        let uid = uid.filter(|uid| self.is_remote(uid)).map(str::to_string);
        let key = (uid.clone(), definition.id);
        if let Some(cached) = self.interfaces.get(&key) {
            return Arc::clone(cached.value());
        }
        let twin = self.twins.get(&definition.name).map(|f| Arc::clone(f.value()));
        let stock = StockInterface::new(self.weak(), uid, definition);
        let interface = Arc::new(match twin {
            Some(factory) => Interface::with_twin(factory(stock)),
            None => Interface::stock_only(stock),
        });
        Arc::clone(self.interfaces.entry(key).or_insert(interface).value())
    }

    /// Drop an interface from the cache.
    ///
    /// A context handed out by a peer is forgotten as well; its stub on the
    /// peer lives on until the peer releases it. Returns whether the
    /// interface was cached.
    pub fn release_interface(&self, interface: &Interface) -> bool {
        let def_id = interface.definition().id;
        let uid = interface.uid().map(str::to_string);
        if let Some(uid) = &uid {
            if let Ok(peer) = self.get_peer(uid) {
                peer.remove_reference(def_id);
            }
        }
        let released = self.interfaces.remove(&(uid, def_id)).is_some();
        debug!(def_id, uid = ?interface.uid(), released, "interface released");
        released
    }

    pub(crate) fn forget_interface(&self, uid: Option<&str>, def_id: u64) {
        self.interfaces.remove(&(uid.map(str::to_string), def_id));
    }

    /// Forget every interface to contexts of peer `uid`.
    pub(crate) fn forget_interfaces_of(&self, uid: &str) {
        self.interfaces
            .retain(|(owner, _), _| owner.as_deref() != Some(uid));
    }

    /// Bind a twin to a context name. Each name takes one twin.
    pub fn set_interface_twin(&self, name: &str, factory: TwinFactory) -> NetronResult<()> {
        if name.trim().is_empty() {
            return Err(NetronError::InvalidArgument(
                "Twin needs a context name".to_string(),
            ));
        }
        match self.twins.entry(name.to_string()) {
            Entry::Occupied(_) => Err(NetronError::Exists(format!(
                "Twin for context '{name}' already registered"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(factory);
                self.interfaces
                    .retain(|_, interface| interface.definition().name != name);
                debug!(context = %name, "twin registered");
                Ok(())
            }
        }
    }

    // ---- references ----

    /// Hand out `context` to peer `uid`, or to this process when `None`.
    ///
    /// Returns the value to send in place of the context. Handing out the
    /// same object to the same peer twice yields the same definition. The
    /// context stays reachable until [`Netron::release_context`] or until
    /// the peer goes offline.
    pub fn ref_context(&self, uid: Option<&str>, context: Arc<dyn Context>) -> NetronResult<Value> {
        self.ref_context_under(uid, None, context)
    }

    pub(crate) fn ref_context_under(
        &self,
        uid: Option<&str>,
        parent: Option<u64>,
        context: Arc<dyn Context>,
    ) -> NetronResult<Value> {
        let uid = uid.filter(|uid| self.is_remote(uid));
        let existing = self
            .stubs
            .iter()
            .find(|e| {
                let stub = e.value();
                stub.context().is_some_and(|c| same_context(c, &context))
                    && (stub.owner() == uid || self.is_named(stub))
            })
            .map(|e| e.value().definition().clone());
        if let Some(definition) = existing {
            return Ok(Embedded::Definition(definition).into_value());
        }

        let descriptor = context.descriptor();
        descriptor.validate()?;
        let name = descriptor.class_name.clone();
        let definition = descriptor.into_definition(self.allocate_def_id(), name);
        let stub = Stub::local(definition.clone(), context)
            .with_parent(parent)
            .owned_by(uid);
        self.stubs.insert(definition.id, Arc::new(stub));
        debug!(def_id = definition.id, parent = ?parent, uid = ?uid, "context handed out");
        Ok(Embedded::Definition(definition).into_value())
    }

    /// Withdraw every handed-out stub of `context`, and what they handed
    /// out in turn. Attached contexts stay attached.
    ///
    /// Returns the number of stubs removed.
    pub fn release_context(&self, context: &Arc<dyn Context>) -> usize {
        let ids: Vec<u64> = self
            .stubs
            .iter()
            .filter(|e| {
                let stub = e.value();
                stub.context().is_some_and(|c| same_context(c, context)) && !self.is_named(stub)
            })
            .map(|e| *e.key())
            .collect();
        let mut released = 0;
        for def_id in ids {
            if self.stubs.remove(&def_id).is_some() {
                released += 1;
                self.forget_interface(None, def_id);
                released += self.release_children(def_id);
            }
        }
        debug!(released, "context released");
        released
    }

    /// Whether a stub is reachable by name, here or on a hub.
    fn is_named(&self, stub: &Stub) -> bool {
        let def_id = stub.definition().id;
        self.contexts
            .get(&stub.definition().name)
            .is_some_and(|named| named.definition().id == def_id)
            || self.pushed.iter().any(|e| *e.value() == def_id)
    }

    /// Remove every stub handed out, directly or not, by stub `parent`.
    pub(crate) fn release_children(&self, parent: u64) -> usize {
        let mut queue = VecDeque::from([parent]);
        let mut released = 0;
        while let Some(parent) = queue.pop_front() {
            let children: Vec<u64> = self
                .stubs
                .iter()
                .filter(|e| e.value().parent() == Some(parent))
                .map(|e| *e.key())
                .collect();
            for child in children {
                if self.stubs.remove(&child).is_some() {
                    self.forget_interface(None, child);
                    released += 1;
                    queue.push_back(child);
                }
            }
        }
        released
    }

    /// Remove the stubs handed to peer `uid` or leading to it.
    pub(crate) fn release_peer_stubs(&self, uid: &str) -> usize {
        let ids: Vec<u64> = self
            .stubs
            .iter()
            .filter(|e| {
                let stub = e.value();
                stub.owner() == Some(uid) || (stub.origin() == Some(uid) && !self.is_named(stub))
            })
            .map(|e| *e.key())
            .collect();
        let mut released = 0;
        for def_id in ids {
            if self.stubs.remove(&def_id).is_some() {
                self.forget_interface(None, def_id);
                released += 1 + self.release_children(def_id);
            }
        }
        self.pushed.retain(|(hub, _), _| hub != uid);
        released
    }

    /// Interface for a context carried in `value`, received from peer `uid`
    /// or from this process when `None`.
    ///
    /// Plain data yields `None`.
    pub fn interface_from_value(
        &self,
        uid: Option<&str>,
        value: &Value,
    ) -> NetronResult<Option<Arc<Interface>>> {
        let Some(embedded) = Embedded::from_value(value) else {
            return Ok(None);
        };
        let uid = uid.filter(|uid| self.is_remote(uid));
        let interface = match (embedded, uid) {
            (Embedded::Definition(definition), Some(uid)) => {
                self.get_peer(uid)?.insert_reference(definition.clone());
                self.interface_for(definition, Some(uid))
            }
            (Embedded::Definition(definition), None) => {
                self.get_interface_by_id(definition.id, None)?
            }
            (Embedded::Reference(def_id), _) => self.get_interface_by_id(def_id, None)?,
        };
        Ok(Some(interface))
    }

    /// The local context served under definition `def_id`.
    pub fn local_context(&self, def_id: u64) -> Option<Arc<dyn Context>> {
        self.stubs
            .get(&def_id)
            .and_then(|stub| stub.context().map(Arc::clone))
    }

    // ---- peers ----

    /// Online peer by uid.
    pub fn get_peer(&self, uid: &str) -> NetronResult<Arc<Peer>> {
        if uid.is_empty() {
            return Err(NetronError::InvalidArgument("Invalid peer uid".to_string()));
        }
        self.peers
            .get_peer(uid)
            .ok_or_else(|| NetronError::Unknown(format!("Unknown peer '{uid}'")))
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.all_peers()
    }

    pub fn peer_uids(&self) -> Vec<String> {
        let mut uids = self.peers.uids();
        uids.sort();
        uids
    }

    /// Round-trip a ping to `uid`. Pinging `None` checks nothing and succeeds.
    pub async fn ping(&self, uid: Option<&str>) -> NetronResult<()> {
        let Some(uid) = uid else {
            return Ok(());
        };
        let peer = self.get_peer(uid)?;
        match peer.request(Request::Ping, self.config.response_timeout()).await? {
            Response::Ack => Ok(()),
            other => Err(NetronError::Protocol(format!(
                "unexpected ping response: {other:?}"
            ))),
        }
    }

    /// Disconnect peer `uid`, or every peer when `None`.
    pub async fn disconnect(&self, uid: Option<&str>) -> NetronResult<()> {
        if let Some(uid) = uid {
            self.get_peer(uid)?.disconnect().await;
            return Ok(());
        }
        let mut all = self.peers.all_peers();
        for entry in self.connections.iter() {
            if !all.iter().any(|p| Arc::ptr_eq(p, entry.value())) {
                all.push(Arc::clone(entry.value()));
            }
        }
        for peer in all {
            peer.disconnect().await;
        }
        Ok(())
    }

    /// Stop listening and disconnect every peer.
    pub async fn shutdown(&self) {
        self.unbind();
        let _ = self.disconnect(None).await;
        info!(uid = %self.uid, "netron runtime stopped");
    }

    /// Send a notification to every online peer except `exclude`.
    pub(crate) async fn broadcast(&self, notification: Notification, exclude: Option<&str>) {
        for peer in self.peers.peers_except(exclude) {
            if peer.status() != PeerStatus::Online {
                continue;
            }
            if let Err(e) = peer.notify(notification.clone()).await {
                debug!(peer = peer.id(), uid = ?peer.uid(), "notification not delivered: {e}");
            }
        }
    }

    // ---- rpc ----

    /// Read property `name` of definition `def_id`.
    ///
    /// An undefined value resolves to `default`.
    pub async fn get(
        &self,
        uid: Option<&str>,
        def_id: u64,
        name: &str,
        default: Option<Value>,
    ) -> NetronResult<Option<Value>> {
        let value = self
            .dispatch(
                uid,
                def_id,
                Invocation::Get {
                    name: name.to_string(),
                },
            )
            .await?;
        Ok(value.or(default))
    }

    /// Write property `name` of definition `def_id`.
    ///
    /// Losing the peer or the response does not fail the write; an error
    /// raised by the context does.
    pub async fn set(
        &self,
        uid: Option<&str>,
        def_id: u64,
        name: &str,
        value: Option<Value>,
    ) -> NetronResult<()> {
        let invocation = Invocation::Set {
            name: name.to_string(),
            value,
        };
        match self.dispatch(uid, def_id, invocation).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_connection_loss() => {
                debug!(def_id, property = %name, "set not confirmed: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Invoke method `name` of definition `def_id` and return its result.
    pub async fn call(
        &self,
        uid: Option<&str>,
        def_id: u64,
        name: &str,
        args: Vec<Value>,
    ) -> NetronResult<Option<Value>> {
        let invocation = Invocation::Call {
            name: name.to_string(),
            args,
        };
        self.dispatch(uid, def_id, invocation).await
    }

    /// Invoke method `name` of definition `def_id` without waiting for it.
    ///
    /// Only lookup and validation failures are reported. A remote method is
    /// sent and never answered; a local one runs in its own task.
    pub async fn call_void(
        &self,
        uid: Option<&str>,
        def_id: u64,
        name: &str,
        args: Vec<Value>,
    ) -> NetronResult<()> {
        let invocation = Invocation::CallVoid {
            name: name.to_string(),
            args,
        };
        match self.resolve(uid, def_id, &invocation)? {
            Target::Remote { peer, def_id } => {
                if let Err(e) = peer.post(invocation.into_request(def_id)).await {
                    debug!(def_id, method = %name, "call_void not delivered: {e}");
                }
            }
            Target::Local(stub) => {
                let netron = self.arc()?;
                let method = name.to_string();
                tokio::spawn(async move {
                    if let Err(e) = netron.invoke_stub(&stub, None, invocation).await {
                        debug!(def_id, method = %method, "call_void outcome ignored: {e}");
                    }
                });
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        uid: Option<&str>,
        def_id: u64,
        invocation: Invocation,
    ) -> NetronResult<Option<Value>> {
        let target = self.resolve(uid, def_id, &invocation)?;
        self.invoke(target, invocation).await
    }

    fn resolve(
        &self,
        uid: Option<&str>,
        def_id: u64,
        invocation: &Invocation,
    ) -> NetronResult<Target> {
        match uid {
            Some(uid) if self.is_remote(uid) => {
                let peer = self.get_peer(uid)?;
                let definition = peer.definition_by_id(def_id).ok_or_else(|| {
                    NetronError::Unknown(format!("Unknown definition '{def_id}' of peer '{uid}'"))
                })?;
                invocation.check(&definition)?;
                Ok(Target::Remote { peer, def_id })
            }
            _ => {
                let stub = self.local_stub(def_id)?;
                invocation.check(stub.definition())?;
                Ok(Target::Local(stub))
            }
        }
    }

    pub(crate) fn local_stub(&self, def_id: u64) -> NetronResult<Arc<Stub>> {
        self.stubs
            .get(&def_id)
            .map(|stub| Arc::clone(stub.value()))
            .ok_or_else(|| NetronError::Unknown(format!("Unknown definition '{def_id}'")))
    }

    async fn invoke(&self, target: Target, invocation: Invocation) -> NetronResult<Option<Value>> {
        match target {
            Target::Remote { peer, def_id } => self.forward(&peer, def_id, invocation).await,
            Target::Local(stub) => match self.config.response_timeout() {
                Some(limit) => tokio::time::timeout(limit, self.invoke_stub(&stub, None, invocation))
                    .await
                    .map_err(|_| NetronError::Timeout(limit.as_millis() as u64))?,
                None => self.invoke_stub(&stub, None, invocation).await,
            },
        }
    }

    /// Run an already checked invocation on a stub on behalf of peer
    /// `caller`, or of this process when `None`.
    ///
    /// Contexts carried through a relay stub are rewritten so that each side
    /// can reach them through this runtime.
    pub(crate) async fn invoke_stub(
        &self,
        stub: &Stub,
        caller: Option<&str>,
        invocation: Invocation,
    ) -> NetronResult<Option<Value>> {
        let relay_id = stub.definition().id;
        match stub.target() {
            StubTarget::Local(context) => {
                let caller = Caller::new(self.arc()?, caller.map(str::to_string), relay_id);
                Stub::invoke_local(context, &caller, invocation).await
            }
            StubTarget::Relay { origin, def_id } => {
                let peer = self.peers.get_peer(origin).ok_or(NetronError::PeerDisconnected)?;
                let invocation = match caller {
                    Some(caller) => invocation
                        .map_values(|value| self.relay_arguments(value, caller, origin, relay_id))?,
                    None => invocation,
                };
                let value = self.forward(&peer, *def_id, invocation).await?;
                value
                    .map(|value| self.relay_result(value, origin, caller, relay_id))
                    .transpose()
            }
        }
    }

    /// Rewrite contexts sent by peer `caller` toward peer `origin`.
    fn relay_arguments(
        &self,
        value: Value,
        caller: &str,
        origin: &str,
        relay_id: u64,
    ) -> NetronResult<Value> {
        rewrite_embedded(value, &mut |embedded| match embedded {
            Embedded::Definition(definition) => {
                let local = self.relay_reference(caller, definition, Some(origin), relay_id);
                Ok(Embedded::Definition(local).into_value())
            }
            Embedded::Reference(def_id) => self.reference_toward(def_id, origin),
        })
    }

    /// Rewrite contexts returned by peer `origin` toward `caller`.
    fn relay_result(
        &self,
        value: Value,
        origin: &str,
        caller: Option<&str>,
        relay_id: u64,
    ) -> NetronResult<Value> {
        rewrite_embedded(value, &mut |embedded| match embedded {
            Embedded::Definition(definition) => {
                let local = self.relay_reference(origin, definition, caller, relay_id);
                Ok(Embedded::Definition(local).into_value())
            }
            Embedded::Reference(def_id) => match caller {
                Some(caller) => self.reference_toward(def_id, caller),
                None => Ok(Embedded::Reference(def_id).into_value()),
            },
        })
    }

    /// Stub here for a context that peer `source` handed out, to be handed
    /// on to `owner`.
    fn relay_reference(
        &self,
        source: &str,
        definition: Definition,
        owner: Option<&str>,
        parent: u64,
    ) -> Definition {
        if let Some(peer) = self.peers.get_peer(source) {
            peer.insert_reference(definition.clone());
        }
        let existing = self
            .stubs
            .iter()
            .find(|e| e.value().relays(source, definition.id) && e.value().owner() == owner)
            .map(|e| e.value().definition().clone());
        if let Some(local) = existing {
            return local;
        }
        let remote_id = definition.id;
        let local = Definition {
            id: self.allocate_def_id(),
            ..definition
        };
        let stub = Stub::relay(local.clone(), source, remote_id)
            .with_parent(Some(parent))
            .owned_by(owner);
        self.stubs.insert(local.id, Arc::new(stub));
        debug!(uid = %source, def_id = local.id, remote_id, "relaying handed-out context");
        local
    }

    /// Value for local stub `def_id` as seen from peer `peer`.
    fn reference_toward(&self, def_id: u64, peer: &str) -> NetronResult<Value> {
        let stub = self.local_stub(def_id)?;
        Ok(match stub.target() {
            StubTarget::Relay { origin, def_id } if origin == peer => Embedded::Reference(*def_id),
            _ => Embedded::Definition(stub.definition().clone()),
        }
        .into_value())
    }

    async fn forward(
        &self,
        peer: &Peer,
        def_id: u64,
        invocation: Invocation,
    ) -> NetronResult<Option<Value>> {
        if invocation.is_void() {
            peer.post(invocation.into_request(def_id)).await?;
            return Ok(None);
        }
        let response = peer
            .request(invocation.into_request(def_id), self.config.response_timeout())
            .await?;
        response.into_value()
    }

    // ---- listeners ----

    /// Stop accepting connections. Existing peers stay connected.
    pub fn unbind(&self) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if !listeners.is_empty() {
            info!(count = listeners.len(), "listeners stopped");
        }
        for listener in listeners.drain(..) {
            listener.abort();
        }
    }

    pub(crate) fn log_refusal(&self, peer: &Peer, reason: &str) {
        warn!(peer = peer.id(), uid = ?peer.uid(), addr = ?peer.remote_addr(), "{reason}");
    }
}

impl Drop for Netron {
    fn drop(&mut self) {
        let listeners = self.listeners.get_mut().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.drain(..) {
            listener.abort();
        }
        for entry in self.remote_listeners.iter() {
            entry.value().abort();
        }
    }
}

/// Name under which a context is exposed: `name`, or its class name.
pub(crate) fn exposure_name(descriptor: &ContextDescriptor, name: Option<&str>) -> NetronResult<String> {
    descriptor.validate()?;
    let name = name.unwrap_or(&descriptor.class_name).trim().to_string();
    if name.is_empty() {
        return Err(NetronError::NotValid(
            "Context needs a name to be attached".to_string(),
        ));
    }
    Ok(name)
}

enum Target {
    Local(Arc<Stub>),
    Remote { peer: Arc<Peer>, def_id: u64 },
}
