//! Twins: application-supplied interfaces bound to a context name.
//!
//! A twin wraps the stock interface of a context and may override any of its
//! operations. Operations a twin does not override fall through to the stock
//! interface it was built with.

use crate::interface::StockInterface;
use async_trait::async_trait;
use netron_types::error::NetronResult;
use serde_json::Value;
use std::sync::Arc;

/// A custom interface for one context name.
#[async_trait]
pub trait Twin: Send + Sync + 'static {
    /// The stock interface this twin was created with.
    fn stock(&self) -> &StockInterface;

    async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Option<Value>> {
        self.stock().call(method, args).await
    }

    async fn call_void(&self, method: &str, args: Vec<Value>) -> NetronResult<()> {
        self.stock().call_void(method, args).await
    }

    async fn get(&self, property: &str, default: Option<Value>) -> NetronResult<Option<Value>> {
        self.stock().get(property, default).await
    }

    async fn set(&self, property: &str, value: Option<Value>) -> NetronResult<()> {
        self.stock().set(property, value).await
    }
}

/// Builds a twin around a freshly generated stock interface.
pub type TwinFactory = Arc<dyn Fn(StockInterface) -> Arc<dyn Twin> + Send + Sync>;

/// Wrap a constructor function as a [`TwinFactory`].
pub fn twin_factory<T, F>(build: F) -> TwinFactory
where
    T: Twin,
    F: Fn(StockInterface) -> T + Send + Sync + 'static,
{
    Arc::new(move |stock| Arc::new(build(stock)) as Arc<dyn Twin>)
}
