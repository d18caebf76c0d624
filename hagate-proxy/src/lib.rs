//! hagate HTTP proxy.
//!
//! The transport around `hagate-core`: command-line settings, the gating
//! reverse proxy with its WebSocket tunnel, the accept loop, the admin server
//! and request logging.

pub mod admin;
pub mod cli;
pub mod error;
pub mod logging_layer;
pub mod ports;
pub mod proxy_config;
pub mod proxy_service;
pub mod server;
pub mod websocket;
