//! Port layout.
//!
//! | Port | Name  | Purpose                                  |
//! |------|-------|------------------------------------------|
//! | 8080 | Proxy | Client requests → Home Assistant         |
//! | 8081 | Admin | Liveness, readiness, Prometheus metrics  |
//!
//! The proxy port is set with `--port` / `PORT`; the admin port with
//! `HAGATE_ADMIN_PORT`.

use hagate_core::config::parse_env_warn;

pub use hagate_core::config::DEFAULT_PORT as DEFAULT_PROXY_PORT;

/// Default admin port for health checks and metrics.
///
/// Endpoints served on this port:
/// - `GET /health` - Liveness probe
/// - `GET /ready` - Readiness probe
/// - `GET /metrics` - Prometheus metrics
pub const DEFAULT_ADMIN_PORT: u16 = 8081;

/// Get the admin port from environment or default.
///
/// ```rust
/// use hagate_proxy::ports::admin_port;
///
/// let port = admin_port();
/// assert!(port > 0);
/// ```
pub fn admin_port() -> u16 {
    parse_env_warn("HAGATE_ADMIN_PORT", DEFAULT_ADMIN_PORT)
}
