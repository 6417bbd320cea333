//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is accepting sessions.
    pub status: String,
    pub uptime_secs: u64,
    /// Users with a connection entry.
    pub users: usize,
    /// Live connections across all users.
    pub connections: usize,
    /// Running broker consumers.
    pub consumers: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    users: usize,
    connections: usize,
    consumers: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        users,
        connections,
        consumers,
    }
}
