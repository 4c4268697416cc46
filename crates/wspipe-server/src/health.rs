//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while admitting connections, `"closing"` after shutdown began.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered client count.
    pub clients: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, clients: usize, closing: bool) -> HealthResponse {
    HealthResponse {
        status: if closing { "closing" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        clients,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, false);
        assert_eq!(resp.status, "ok");
    }

    #[test]
    fn status_reports_closing() {
        let resp = health_check(Instant::now(), 0, true);
        assert_eq!(resp.status, "closing");
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, 0, false);
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let resp = health_check(Instant::now(), 2, false);
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["clients"], 2);
        assert!(parsed["uptime_secs"].is_number());
    }
}
