use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::exception::ExceptionKind;

/// Per-company match tolerances and payment policy flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToleranceConfig {
    /// Maximum acceptable quantity variance, percent.
    pub quantity_pct: BigDecimal,
    /// Maximum acceptable price variance, percent.
    pub price_pct: BigDecimal,
    /// When false, an over-receipt beyond tolerance blocks the line.
    pub allow_excess_receipt: bool,
    /// When true, a blocked or pending match may still be paid (with sign-off).
    pub allow_pay_without_match: bool,
    /// When true, a warning-level match may not be paid.
    pub block_pay_on_warning: bool,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            quantity_pct: BigDecimal::from(5),
            price_pct: BigDecimal::from(2),
            allow_excess_receipt: false,
            allow_pay_without_match: false,
            block_pay_on_warning: false,
        }
    }
}

/// Per (company, exception kind) SLA and ownership rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaRule {
    pub base_sla_hours: i64,
    pub owner_role: String,
    pub escalate_after_hours: i64,
    pub escalate_to_role: Option<String>,
}

impl Default for SlaRule {
    fn default() -> Self {
        Self {
            base_sla_hours: 24,
            owner_role: "purchasing_analyst".to_string(),
            escalate_after_hours: 48,
            escalate_to_role: Some("purchasing_supervisor".to_string()),
        }
    }
}

impl SlaRule {
    /// Fallback applied when no configuration row exists for the
    /// (company, kind) pair.
    pub fn fallback(_kind: ExceptionKind) -> Self {
        Self::default()
    }
}

/// One append-only audit-log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entity: String,
    pub entity_id: i64,
    pub action: String,
    pub payload: serde_json::Value,
    pub company_id: i64,
    pub user_id: Option<i64>,
    pub at: DateTime<Utc>,
}
