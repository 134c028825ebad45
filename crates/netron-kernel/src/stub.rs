//! Contexts and the stubs that bind them to definitions.
//!
//! A [`Context`] is an application object exposed for remote access. The
//! runtime wraps each attached context in a [`Stub`] that checks every access
//! against the context's [`Definition`] before touching the object. A hub
//! also creates relay stubs for contexts it re-exports on behalf of a peer.
//!
//! Contexts handed out inside values get stubs too. Those are not attached
//! under a name; they belong to the peer they were handed to and to the stub
//! that produced them, and go away with either.

use crate::caller::Caller;
use async_trait::async_trait;
use futures::FutureExt;
use netron_types::definition::{ContextDescriptor, Definition};
use netron_types::error::{NetronError, NetronResult};
use netron_wire::Request;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// An application object that can be attached to a runtime.
///
/// Values are JSON; `None` stands for undefined. Errors returned here reach
/// the caller as [`NetronError::Remote`] carrying the error's message.
#[async_trait]
pub trait Context: Send + Sync + 'static {
    /// The public surface of this context.
    fn descriptor(&self) -> ContextDescriptor;

    /// Read a property.
    async fn get(&self, name: &str) -> anyhow::Result<Option<Value>> {
        anyhow::bail!("Property '{name}' is not readable")
    }

    /// Write a property.
    async fn set(&self, name: &str, _value: Option<Value>) -> anyhow::Result<()> {
        anyhow::bail!("Property '{name}' is not writable")
    }

    /// Invoke a method.
    async fn call(&self, name: &str, _args: Vec<Value>) -> anyhow::Result<Option<Value>> {
        anyhow::bail!("Method '{name}' is not implemented")
    }

    /// Read a property on behalf of `caller`.
    ///
    /// Override the `*_with` methods to hand out contexts or to accept
    /// contexts as values; see [`Caller`].
    async fn get_with(&self, _caller: &Caller, name: &str) -> anyhow::Result<Option<Value>> {
        self.get(name).await
    }

    /// Write a property on behalf of `caller`.
    async fn set_with(
        &self,
        _caller: &Caller,
        name: &str,
        value: Option<Value>,
    ) -> anyhow::Result<()> {
        self.set(name, value).await
    }

    /// Invoke a method on behalf of `caller`.
    async fn call_with(
        &self,
        _caller: &Caller,
        name: &str,
        args: Vec<Value>,
    ) -> anyhow::Result<Option<Value>> {
        self.call(name, args).await
    }
}

/// Whether two handles point at the same context object.
pub fn same_context(a: &Arc<dyn Context>, b: &Arc<dyn Context>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// One member access, independent of where the context lives.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Get { name: String },
    Set { name: String, value: Option<Value> },
    Call { name: String, args: Vec<Value> },
    CallVoid { name: String, args: Vec<Value> },
}

impl Invocation {
    /// Split a member request into its definition id and invocation.
    pub fn from_request(request: Request) -> Option<(u64, Self)> {
        match request {
            Request::Get { def_id, name } => Some((def_id, Invocation::Get { name })),
            Request::Set {
                def_id,
                name,
                value,
            } => Some((def_id, Invocation::Set { name, value })),
            Request::Call { def_id, name, args } => Some((def_id, Invocation::Call { name, args })),
            Request::CallVoid { def_id, name, args } => {
                Some((def_id, Invocation::CallVoid { name, args }))
            }
            _ => None,
        }
    }

    /// Build the request addressed to `def_id`.
    pub fn into_request(self, def_id: u64) -> Request {
        match self {
            Invocation::Get { name } => Request::Get { def_id, name },
            Invocation::Set { name, value } => Request::Set {
                def_id,
                name,
                value,
            },
            Invocation::Call { name, args } => Request::Call { def_id, name, args },
            Invocation::CallVoid { name, args } => Request::CallVoid { def_id, name, args },
        }
    }

    /// Check this access against `definition`.
    pub fn check(&self, definition: &Definition) -> NetronResult<()> {
        match self {
            Invocation::Get { name } => definition.require_property(name).map(|_| ()),
            Invocation::Set { name, .. } => {
                if definition.require_property(name)?.readonly {
                    return Err(NetronError::NotAllowed(format!(
                        "Property '{name}' of context '{}' is read-only",
                        definition.name
                    )));
                }
                Ok(())
            }
            Invocation::Call { name, .. } | Invocation::CallVoid { name, .. } => {
                definition.require_method(name)
            }
        }
    }

    /// Whether the caller expects a value back.
    pub fn returns_value(&self) -> bool {
        matches!(self, Invocation::Get { .. } | Invocation::Call { .. })
    }

    /// Whether the caller expects no answer at all.
    pub fn is_void(&self) -> bool {
        matches!(self, Invocation::CallVoid { .. })
    }

    /// Rewrite every value sent along with this invocation.
    pub fn map_values<F>(self, mut f: F) -> NetronResult<Self>
    where
        F: FnMut(Value) -> NetronResult<Value>,
    {
        Ok(match self {
            Invocation::Get { name } => Invocation::Get { name },
            Invocation::Set { name, value } => Invocation::Set {
                name,
                value: value.map(&mut f).transpose()?,
            },
            Invocation::Call { name, args } => Invocation::Call {
                name,
                args: args.into_iter().map(&mut f).collect::<NetronResult<_>>()?,
            },
            Invocation::CallVoid { name, args } => Invocation::CallVoid {
                name,
                args: args.into_iter().map(&mut f).collect::<NetronResult<_>>()?,
            },
        })
    }

    pub fn member(&self) -> &str {
        match self {
            Invocation::Get { name }
            | Invocation::Set { name, .. }
            | Invocation::Call { name, .. }
            | Invocation::CallVoid { name, .. } => name,
        }
    }
}

/// What a stub forwards to.
#[derive(Clone)]
pub enum StubTarget {
    /// A context attached to this runtime.
    Local(Arc<dyn Context>),
    /// A context owned by peer `origin`, known there as `def_id`.
    Relay { origin: String, def_id: u64 },
}

/// Binding between a definition and what serves it.
#[derive(Clone)]
pub struct Stub {
    definition: Definition,
    target: StubTarget,
    parent: Option<u64>,
    owner: Option<String>,
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Stub");
        s.field("definition", &self.definition);
        if let StubTarget::Relay { origin, def_id } = &self.target {
            s.field("origin", origin).field("origin_def_id", def_id);
        }
        s.field("parent", &self.parent)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Stub {
    pub fn local(definition: Definition, context: Arc<dyn Context>) -> Self {
        Self {
            definition,
            target: StubTarget::Local(context),
            parent: None,
            owner: None,
        }
    }

    pub fn relay(definition: Definition, origin: impl Into<String>, def_id: u64) -> Self {
        Self {
            definition,
            target: StubTarget::Relay {
                origin: origin.into(),
                def_id,
            },
            parent: None,
            owner: None,
        }
    }

    /// Tie this stub to the stub that handed it out.
    pub fn with_parent(mut self, parent: Option<u64>) -> Self {
        self.parent = parent;
        self
    }

    /// Tie this stub to the peer it was handed to.
    pub fn owned_by(mut self, owner: Option<&str>) -> Self {
        self.owner = owner.map(str::to_string);
        self
    }

    /// Id of the stub that handed this one out.
    pub fn parent(&self) -> Option<u64> {
        self.parent
    }

    /// Uid of the peer this stub was handed to.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// The served context, for local stubs.
    pub fn context(&self) -> Option<&Arc<dyn Context>> {
        match &self.target {
            StubTarget::Local(context) => Some(context),
            StubTarget::Relay { .. } => None,
        }
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn target(&self) -> &StubTarget {
        &self.target
    }

    /// Uid of the peer a relayed context comes from.
    pub fn origin(&self) -> Option<&str> {
        match &self.target {
            StubTarget::Local(_) => None,
            StubTarget::Relay { origin, .. } => Some(origin),
        }
    }

    /// Whether this relays definition `def_id` of peer `origin`.
    pub fn relays(&self, origin: &str, def_id: u64) -> bool {
        matches!(&self.target, StubTarget::Relay { origin: o, def_id: d } if o == origin && *d == def_id)
    }

    /// Run an invocation against a local context.
    ///
    /// Errors and panics raised by the context become [`NetronError::Remote`];
    /// a [`NetronError`] returned by the context keeps its kind.
    pub async fn invoke_local(
        context: &Arc<dyn Context>,
        caller: &Caller,
        invocation: Invocation,
    ) -> NetronResult<Option<Value>> {
        let work = async {
            match invocation {
                Invocation::Get { name } => context.get_with(caller, &name).await,
                Invocation::Set { name, value } => context
                    .set_with(caller, &name, value)
                    .await
                    .map(|_| None),
                Invocation::Call { name, args } | Invocation::CallVoid { name, args } => {
                    context.call_with(caller, &name, args).await
                }
            }
        };
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result.map_err(into_remote),
            Err(panic) => Err(NetronError::Remote(panic_message(panic.as_ref()))),
        }
    }
}

fn into_remote(err: anyhow::Error) -> NetronError {
    match err.downcast::<NetronError>() {
        Ok(err) => err,
        Err(err) => NetronError::Remote(err.to_string()),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "context panicked".to_string()
    }
}
