//! Coordinator-side bridge connectivity.

mod client;

pub use client::{BridgeClient, BridgeError, CommandStream};
