//! pyengine - a local Python execution service
//!
//! This crate provides the two halves of the service:
//! - The broker (`pyengine-server`) owns a per-host Unix-socket endpoint,
//!   decrypts and dispatches client commands, and supervises Python child
//!   processes for script execution and package management.
//! - The client library hides framing, encryption, reconnection, and broker
//!   process supervision behind an asynchronous notification API.
//!
//! # Architecture
//!
//! Both processes independently derive the same endpoint name and transport
//! key from host identity, so no coordination or key exchange happens.
//! Every command carries a caller-chosen `executionId`; the broker answers
//! with any number of progress events followed by exactly one terminal
//! response per id.

pub mod client;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod python;
pub mod server;
