use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::result::GlobalStatus;

/// Supplier invoice header plus its ordered lines.
///
/// Owned by the invoicing collaborator; this core reads the lines and
/// writes the cached match fields (`match_status`, `match_checked_at`,
/// `match_block_reason`) and, on a block, `pay_approval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: i64,
    pub company_id: i64,
    pub supplier: String,
    pub validated: bool,
    pub lines: Vec<InvoiceLine>,
    pub match_status: GlobalStatus,
    pub match_checked_at: Option<DateTime<Utc>>,
    pub match_block_reason: Option<String>,
    pub pay_approval: PayApproval,
}

/// One billed line. The discount may be a percentage, a fixed amount, or a
/// precomputed discounted price; at most one is expected to be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub id: i64,
    pub description: String,
    pub item_code: Option<String>,
    pub quantity: BigDecimal,
    pub unit_price: BigDecimal,
    pub discount_pct: Option<BigDecimal>,
    pub discount_amount: Option<BigDecimal>,
    pub discounted_price: Option<BigDecimal>,
}

/// Manual payment approval state on the invoice. `Approved` and `Rejected`
/// are human overrides and are never clobbered by the matcher;
/// `BlockedByMatch` is written by the orchestrator on a blocked match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayApproval {
    Unset,
    Approved,
    Rejected,
    BlockedByMatch,
}

impl PayApproval {
    /// True for the two human-set states that must never be overwritten.
    pub fn is_manual(self) -> bool {
        matches!(self, PayApproval::Approved | PayApproval::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PayApproval::Unset => "UNSET",
            PayApproval::Approved => "APPROVED",
            PayApproval::Rejected => "REJECTED",
            PayApproval::BlockedByMatch => "BLOCKED_BY_MATCH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNSET" => Some(PayApproval::Unset),
            "APPROVED" => Some(PayApproval::Approved),
            "REJECTED" => Some(PayApproval::Rejected),
            "BLOCKED_BY_MATCH" => Some(PayApproval::BlockedByMatch),
            _ => None,
        }
    }
}
