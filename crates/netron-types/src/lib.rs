//! Core types for the Netron remote-object runtime.
//!
//! This crate defines the data structures shared by the wire protocol and the
//! runtime kernel: error taxonomy, context definitions, peer status, runtime
//! events and configuration. It contains no business logic.

pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod reference;
pub mod serde_compat;
pub mod status;
