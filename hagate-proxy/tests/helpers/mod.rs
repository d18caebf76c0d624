//! Test helpers for hagate integration tests.
//!
//! - Mock Home Assistant upstream that records what it receives
//! - Mock WebSocket endpoint that echoes text frames
//! - A builder that runs the real proxy stack on an ephemeral port

#![allow(dead_code)]

pub mod gate;
pub mod mock_socket;
pub mod mock_upstream;

pub use gate::*;
pub use mock_socket::*;
pub use mock_upstream::*;
