use serde::{Deserialize, Serialize};

/// Deployment configuration, loaded from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub thresholds: PriorityThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Monetary-impact boundaries for priority classification. A "missing
/// receipt" exception is always URGENT irrespective of these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriorityThresholds {
    pub urgent: i64,
    pub high: i64,
    pub normal: i64,
}

impl Default for PriorityThresholds {
    fn default() -> Self {
        Self {
            urgent: 100_000,
            high: 50_000,
            normal: 10_000,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/invoice_match".to_string()),
            },
            thresholds: PriorityThresholds::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = PriorityThresholds::default();
        Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/invoice_match".to_string()),
            },
            thresholds: PriorityThresholds {
                urgent: env_i64("PRIORITY_URGENT_AT", defaults.urgent),
                high: env_i64("PRIORITY_HIGH_AT", defaults.high),
                normal: env_i64("PRIORITY_NORMAL_AT", defaults.normal),
            },
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
