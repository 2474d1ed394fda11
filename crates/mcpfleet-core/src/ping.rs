use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one health-monitor ping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub response_time_ms: f64,
    pub error: Option<String>,
}

impl PingRecord {
    pub fn success(response_time_ms: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            success: true,
            response_time_ms,
            error: None,
        }
    }

    pub fn failure(response_time_ms: f64, error: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            success: false,
            response_time_ms,
            error: Some(error.into()),
        }
    }
}

/// Aggregate health of a set of monitored connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub monitored: usize,
    pub healthy: usize,
    pub unhealthy: Vec<String>,
    /// Success ratio over every record in the lookback window
    pub success_rate: Option<f64>,
    pub average_response_time_ms: Option<f64>,
}
