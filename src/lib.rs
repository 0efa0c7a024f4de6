//! host-agent: remote-control agent for a trusted client.
//!
//! Exposes the host process's exec, dynamic-loader and raw-memory surface
//! over a framed TCP protocol. One OS thread serves each connection; the
//! per-connection dispatcher reads a frame, routes it to a handler and
//! loops until the client sends CLOSE or disconnects.
//!
//! The transport is assumed trusted. There is no authentication and no
//! isolation between connections: they all share this process's address
//! space and loader state.

pub mod exec;
pub mod gadget;
pub mod loader;
pub mod logging;
pub mod memory;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
