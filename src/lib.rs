//! CloudNet - Cluster communication substrate
//!
//! Framed packets over TCP or TLS, query correlation, listener dispatch,
//! addressed channel messages and chunked transfers of large payloads.

pub mod chunk;
pub mod config;
pub mod dispatch;
pub mod messaging;
pub mod network;
pub mod node;
pub mod protocol;
