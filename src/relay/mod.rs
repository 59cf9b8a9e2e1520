//! # Relay Module
//!
//! Everything that turns the audio building blocks into a running call.
//!
//! ## Key Components:
//! - **supervisor**: sidecar connection lifecycle with retry and degraded fallback
//! - **session**: the four tasks of one call and their shutdown
//! - **events**: session event sink, recorder and summaries
//! - **protocol**: JSON control messages exchanged with the client
//! - **registry**: running calls and the concurrency limit

pub mod events;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod supervisor;
