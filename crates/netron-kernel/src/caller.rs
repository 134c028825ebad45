//! The view a context gets of the invocation it is serving.

use crate::interface::Interface;
use crate::netron::Netron;
use crate::stub::Context;
use netron_types::error::NetronResult;
use netron_types::reference::Embedded;
use serde_json::Value;
use std::sync::Arc;

/// Who is invoking a context, and the means to exchange contexts with them.
///
/// A context returns another context by converting it with
/// [`Caller::expose`]; it reads a context passed as an argument with
/// [`Caller::interface`] or [`Caller::context`].
#[derive(Debug, Clone)]
pub struct Caller {
    netron: Arc<Netron>,
    uid: Option<String>,
    def_id: u64,
}

impl Caller {
    pub fn new(netron: Arc<Netron>, uid: Option<String>, def_id: u64) -> Self {
        Self {
            netron,
            uid,
            def_id,
        }
    }

    /// Uid of the calling peer; `None` for a call made in this process.
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Definition id of the context being invoked.
    pub fn def_id(&self) -> u64 {
        self.def_id
    }

    pub fn netron(&self) -> &Arc<Netron> {
        &self.netron
    }

    /// Hand `context` to the caller.
    ///
    /// The context stays reachable until the invoked context is released or
    /// the caller goes offline.
    pub fn expose(&self, context: Arc<dyn Context>) -> NetronResult<Value> {
        self.netron
            .ref_context_under(self.uid(), Some(self.def_id), context)
    }

    /// Interface for a context received from the caller.
    ///
    /// Plain data yields `None`.
    pub fn interface(&self, value: &Value) -> NetronResult<Option<Arc<Interface>>> {
        self.netron.interface_from_value(self.uid(), value)
    }

    /// The local context behind a value the caller passed back.
    pub fn context(&self, value: &Value) -> Option<Arc<dyn Context>> {
        match Embedded::from_value(value)? {
            Embedded::Reference(def_id) => self.netron.local_context(def_id),
            Embedded::Definition(definition) if self.uid.is_none() => {
                self.netron.local_context(definition.id)
            }
            Embedded::Definition(_) => None,
        }
    }
}
