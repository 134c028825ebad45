//! Client-side proxies for contexts.
//!
//! A [`StockInterface`] is generated from a [`Definition`] and turns member
//! accesses into runtime dispatches, local or remote. An [`Interface`] is
//! what callers receive: the stock interface, or the twin registered for
//! the context name.
//!
//! The runtime caches interfaces, so they only hold a weak handle on it.

use crate::netron::Netron;
use crate::stub::Invocation;
use crate::twin::Twin;
use netron_types::definition::Definition;
use netron_types::error::{NetronError, NetronResult};
use netron_types::reference::Embedded;
use serde_json::Value;
use std::sync::{Arc, Weak};

/// Generated proxy dispatching every operation through the runtime.
#[derive(Clone)]
pub struct StockInterface {
    netron: Weak<Netron>,
    uid: Option<String>,
    definition: Definition,
}

impl std::fmt::Debug for StockInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StockInterface")
            .field("uid", &self.uid)
            .field("definition", &self.definition)
            .finish()
    }
}

impl StockInterface {
    pub(crate) fn new(netron: Weak<Netron>, uid: Option<String>, definition: Definition) -> Self {
        Self {
            netron,
            uid,
            definition,
        }
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// Uid of the peer owning the context; `None` for a local context.
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// The runtime this interface dispatches through.
    pub fn netron(&self) -> NetronResult<Arc<Netron>> {
        self.netron
            .upgrade()
            .ok_or_else(|| NetronError::IllegalState("runtime is shutting down".to_string()))
    }

    /// Invoke a method and return its result.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Option<Value>> {
        self.definition.require_method(method)?;
        self.netron()?
            .call(self.uid(), self.definition.id, method, args)
            .await
    }

    /// Invoke a method without waiting for it to run.
    ///
    /// Only lookup and validation failures are reported.
    pub async fn call_void(&self, method: &str, args: Vec<Value>) -> NetronResult<()> {
        self.definition.require_method(method)?;
        self.netron()?
            .call_void(self.uid(), self.definition.id, method, args)
            .await
    }

    /// Read a property, falling back to `default` when it is undefined.
    pub async fn get(&self, property: &str, default: Option<Value>) -> NetronResult<Option<Value>> {
        self.definition.require_property(property)?;
        self.netron()?
            .get(self.uid(), self.definition.id, property, default)
            .await
    }

    /// Write a property.
    pub async fn set(&self, property: &str, value: Option<Value>) -> NetronResult<()> {
        Invocation::Set {
            name: property.to_string(),
            value: None,
        }
        .check(&self.definition)?;
        self.netron()?
            .set(self.uid(), self.definition.id, property, value)
            .await
    }

    /// Invoke a method that returns a context.
    pub async fn call_interface(&self, method: &str, args: Vec<Value>) -> NetronResult<Arc<Interface>> {
        let value = self.call(method, args).await?;
        self.expect_interface(value, method)
    }

    /// Read a property that holds a context.
    pub async fn get_interface(&self, property: &str) -> NetronResult<Arc<Interface>> {
        let value = self.get(property, None).await?;
        self.expect_interface(value, property)
    }

    fn expect_interface(&self, value: Option<Value>, member: &str) -> NetronResult<Arc<Interface>> {
        let netron = self.netron()?;
        value
            .map(|value| netron.interface_from_value(self.uid(), &value))
            .transpose()?
            .flatten()
            .ok_or_else(|| NetronError::NotValid(format!("'{member}' did not yield a context")))
    }

    /// Value standing for this context in arguments and results.
    ///
    /// A remote context is referred to by id, which only the runtime serving
    /// it understands. A local context is handed out in full.
    pub fn reference(&self) -> Value {
        match self.uid {
            Some(_) => Embedded::Reference(self.definition.id).into_value(),
            None => Embedded::Definition(self.definition.clone()).into_value(),
        }
    }
}

enum Inner {
    Stock(StockInterface),
    Twin(Arc<dyn Twin>),
}

/// Proxy for one context, local or remote.
pub struct Interface {
    inner: Inner,
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("stock", self.stock())
            .field("twin", &self.is_twin())
            .finish()
    }
}

impl Interface {
    pub(crate) fn stock_only(stock: StockInterface) -> Self {
        Self {
            inner: Inner::Stock(stock),
        }
    }

    pub(crate) fn with_twin(twin: Arc<dyn Twin>) -> Self {
        Self {
            inner: Inner::Twin(twin),
        }
    }

    /// The generated interface, also reachable when a twin is bound.
    pub fn stock(&self) -> &StockInterface {
        match &self.inner {
            Inner::Stock(stock) => stock,
            Inner::Twin(twin) => twin.stock(),
        }
    }

    /// Whether a twin handles this interface.
    pub fn is_twin(&self) -> bool {
        matches!(self.inner, Inner::Twin(_))
    }

    pub fn definition(&self) -> &Definition {
        self.stock().definition()
    }

    pub fn uid(&self) -> Option<&str> {
        self.stock().uid()
    }

    /// See [`StockInterface::reference`].
    pub fn reference(&self) -> Value {
        self.stock().reference()
    }

    pub async fn call_interface(&self, method: &str, args: Vec<Value>) -> NetronResult<Arc<Interface>> {
        let value = self.call(method, args).await?;
        self.stock().expect_interface(value, method)
    }

    pub async fn get_interface(&self, property: &str) -> NetronResult<Arc<Interface>> {
        let value = self.get(property, None).await?;
        self.stock().expect_interface(value, property)
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Option<Value>> {
        match &self.inner {
            Inner::Stock(stock) => stock.call(method, args).await,
            Inner::Twin(twin) => twin.call(method, args).await,
        }
    }

    pub async fn call_void(&self, method: &str, args: Vec<Value>) -> NetronResult<()> {
        match &self.inner {
            Inner::Stock(stock) => stock.call_void(method, args).await,
            Inner::Twin(twin) => twin.call_void(method, args).await,
        }
    }

    pub async fn get(&self, property: &str, default: Option<Value>) -> NetronResult<Option<Value>> {
        match &self.inner {
            Inner::Stock(stock) => stock.get(property, default).await,
            Inner::Twin(twin) => twin.get(property, default).await,
        }
    }

    pub async fn set(&self, property: &str, value: Option<Value>) -> NetronResult<()> {
        match &self.inner {
            Inner::Stock(stock) => stock.set(property, value).await,
            Inner::Twin(twin) => twin.set(property, value).await,
        }
    }

    /// Handle on one property.
    pub fn property<'a>(&'a self, name: &'a str) -> Property<'a> {
        Property {
            interface: self,
            name,
        }
    }
}

/// A property of an [`Interface`] as a get/set pair.
#[derive(Debug, Clone, Copy)]
pub struct Property<'a> {
    interface: &'a Interface,
    name: &'a str,
}

impl Property<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub async fn get(&self, default: Option<Value>) -> NetronResult<Option<Value>> {
        self.interface.get(self.name, default).await
    }

    pub async fn set(&self, value: Option<Value>) -> NetronResult<()> {
        self.interface.set(self.name, value).await
    }
}
