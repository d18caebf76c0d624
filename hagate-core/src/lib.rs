//! hagate core: the whitelist engine behind the hagate proxy.
//!
//! This crate is transport-agnostic. It provides:
//!
//! - [`pattern`]: endpoint template and entity pattern matching
//! - [`extract`]: entity extraction from paths, queries and service-call bodies
//! - [`whitelist`]: the whitelist aggregate, its synchronized store, YAML
//!   persistence and the background persister
//! - [`mode`]: the learn/limit decision engine
//! - [`socket`]: the same decisions applied to WebSocket API commands
//! - [`config`], [`lifecycle`], [`metrics`]: settings, health/readiness and
//!   Prometheus metrics shared with `hagate-proxy`

pub mod config;
pub mod extract;
pub mod lifecycle;
pub mod metrics;
pub mod mode;
pub mod pattern;
pub mod socket;
pub mod whitelist;

pub use mode::{AllowReason, Decision, DenyReason, Mode, ModeController};
pub use whitelist::{Whitelist, WhitelistError, WhitelistStore};
