//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use netron_kernel::stub::same_context;
use netron_kernel::{Caller, Context, Netron};
use netron_types::config::{ConnectConfig, NetronConfig};
use netron_types::definition::ContextDescriptor;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Sample context
// ---------------------------------------------------------------------------

/// A context with one member of every shape the runtime deals with.
///
/// Properties: `counter` (starts at 0), `undefined_prop` (starts undefined),
/// `store`, `blackhole` (writes never complete), `version` (read-only).
/// Methods: `increment(n)`, `echo(v)`, `error()` (fails), `slow()` (never
/// returns).
pub struct Sample {
    state: Mutex<HashMap<String, Option<Value>>>,
}

impl Sample {
    pub fn new() -> Self {
        let mut state = HashMap::new();
        state.insert("counter".to_string(), Some(json!(0)));
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn arc() -> Arc<dyn Context> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Context for Sample {
    fn descriptor(&self) -> ContextDescriptor {
        ContextDescriptor::new("Sample")
            .property("counter")
            .property("undefined_prop")
            .property("store")
            .property("blackhole")
            .readonly_property("version")
            .method("increment")
            .method("echo")
            .method("error")
            .method("slow")
    }

    async fn get(&self, name: &str) -> anyhow::Result<Option<Value>> {
        if name == "version" {
            return Ok(Some(json!("1.0")));
        }
        Ok(self.state.lock().unwrap().get(name).cloned().flatten())
    }

    async fn set(&self, name: &str, value: Option<Value>) -> anyhow::Result<()> {
        if name == "blackhole" {
            std::future::pending::<()>().await;
        }
        self.state.lock().unwrap().insert(name.to_string(), value);
        Ok(())
    }

    async fn call(&self, name: &str, args: Vec<Value>) -> anyhow::Result<Option<Value>> {
        match name {
            "increment" => {
                let step = args.first().and_then(Value::as_i64).unwrap_or(1);
                let mut state = self.state.lock().unwrap();
                let current = state
                    .get("counter")
                    .cloned()
                    .flatten()
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                let next = json!(current + step);
                state.insert("counter".to_string(), Some(next.clone()));
                Ok(Some(next))
            }
            "echo" => Ok(args.into_iter().next()),
            "error" => anyhow::bail!("I'm an error!"),
            "slow" => {
                std::future::pending::<()>().await;
                Ok(None)
            }
            other => anyhow::bail!("no method {other}"),
        }
    }
}

/// A context that hands out and takes contexts.
///
/// Property `current` is a fixed [`Sample`]. Methods: `spawn()` returns a new
/// [`Sample`], `visit(ctx)` increments `ctx` by 10 and returns the result,
/// `owns(ctx)` tells whether `ctx` is `current`.
pub struct Factory {
    pub current: Arc<dyn Context>,
}

impl Factory {
    pub fn arc() -> Arc<dyn Context> {
        Arc::new(Self {
            current: Sample::arc(),
        })
    }
}

#[async_trait]
impl Context for Factory {
    fn descriptor(&self) -> ContextDescriptor {
        ContextDescriptor::new("Factory")
            .readonly_property("current")
            .method("spawn")
            .method("visit")
            .method("owns")
    }

    async fn get_with(&self, caller: &Caller, name: &str) -> anyhow::Result<Option<Value>> {
        match name {
            "current" => Ok(Some(caller.expose(Arc::clone(&self.current))?)),
            other => anyhow::bail!("no property {other}"),
        }
    }

    async fn call_with(
        &self,
        caller: &Caller,
        name: &str,
        args: Vec<Value>,
    ) -> anyhow::Result<Option<Value>> {
        let arg = args.into_iter().next().unwrap_or(Value::Null);
        match name {
            "spawn" => Ok(Some(caller.expose(Sample::arc())?)),
            "visit" => {
                let Some(visited) = caller.interface(&arg)? else {
                    anyhow::bail!("visit needs a context");
                };
                Ok(visited.call("increment", vec![json!(10)]).await?)
            }
            "owns" => {
                let owned = caller
                    .context(&arg)
                    .is_some_and(|c| same_context(&c, &self.current));
                Ok(Some(json!(owned)))
            }
            other => anyhow::bail!("no method {other}"),
        }
    }
}

/// A context exposing nothing.
pub struct Opaque;

#[async_trait]
impl Context for Opaque {
    fn descriptor(&self) -> ContextDescriptor {
        ContextDescriptor::new("Opaque")
    }
}

/// An anonymous context, optionally private.
pub struct Anonymous {
    pub private: bool,
}

#[async_trait]
impl Context for Anonymous {
    fn descriptor(&self) -> ContextDescriptor {
        let descriptor = ContextDescriptor::anonymous().method("run");
        if self.private {
            descriptor.private()
        } else {
            descriptor
        }
    }

    async fn call(&self, _name: &str, _args: Vec<Value>) -> anyhow::Result<Option<Value>> {
        Ok(Some(json!("ran")))
    }
}

// ---------------------------------------------------------------------------
// Runtimes
// ---------------------------------------------------------------------------

/// Config with short timeouts and a fast dial backoff.
pub fn config(uid: &str) -> NetronConfig {
    NetronConfig {
        uid: Some(uid.to_string()),
        handshake_timeout_ms: 2_000,
        connect: ConnectConfig {
            min_delay_ms: 5,
            max_delay_ms: 20,
            jitter: 0.0,
        },
        ..Default::default()
    }
}

pub fn hub_config(uid: &str) -> NetronConfig {
    NetronConfig {
        is_super: true,
        ..config(uid)
    }
}

/// Start a runtime listening on an ephemeral loopback port.
pub async fn listening(config: NetronConfig) -> (Arc<Netron>, String) {
    let netron = Netron::new(config);
    let addr = netron.bind(Some("127.0.0.1:0")).await.unwrap();
    (netron, addr.to_string())
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Poll an async `condition` until it holds or two seconds pass.
pub async fn eventually_async<F, Fut>(condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}
