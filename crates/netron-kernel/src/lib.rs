//! Core runtime for Netron.
//!
//! The [`Netron`] runtime exposes local objects as contexts, connects to other
//! runtimes and lets callers reach their contexts through interfaces as if
//! they were local. A runtime in hub mode relays contexts between peers that
//! are not connected to each other.

pub mod auth;
pub mod caller;
pub mod config;
pub mod connect;
pub mod event_bus;
pub mod handler;
pub mod hooks;
pub mod interface;
pub mod netron;
pub mod remote;
pub mod retry;
pub mod stub;
pub mod twin;

pub use caller::Caller;
pub use hooks::{Confirm, DefaultHooks, NetronHooks};
pub use interface::{Interface, Property, StockInterface};
pub use netron::Netron;
pub use remote::RemoteHandler;
pub use stub::{Context, Invocation, Stub};
pub use twin::{twin_factory, Twin, TwinFactory};
