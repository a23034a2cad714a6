use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Document-level verdict of one evaluator run.
///
/// Fully determined by the line statuses via the precedence
/// BLOCKED > WARNING > PENDING (only with zero receipts) > OK.
/// `Resolved` is terminal and is reached only when every exception of the
/// match has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlobalStatus {
    Pending,
    Ok,
    Warning,
    Blocked,
    Resolved,
}

impl GlobalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GlobalStatus::Pending => "PENDING",
            GlobalStatus::Ok => "OK",
            GlobalStatus::Warning => "WARNING",
            GlobalStatus::Blocked => "BLOCKED",
            GlobalStatus::Resolved => "RESOLVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(GlobalStatus::Pending),
            "OK" => Some(GlobalStatus::Ok),
            "WARNING" => Some(GlobalStatus::Warning),
            "BLOCKED" => Some(GlobalStatus::Blocked),
            "RESOLVED" => Some(GlobalStatus::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineStatus {
    Ok,
    Warning,
    Blocked,
    MissingReceipt,
    MissingInvoice,
}

impl LineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LineStatus::Ok => "OK",
            LineStatus::Warning => "WARNING",
            LineStatus::Blocked => "BLOCKED",
            LineStatus::MissingReceipt => "MISSING_RECEIPT",
            LineStatus::MissingInvoice => "MISSING_INVOICE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(LineStatus::Ok),
            "WARNING" => Some(LineStatus::Warning),
            "BLOCKED" => Some(LineStatus::Blocked),
            "MISSING_RECEIPT" => Some(LineStatus::MissingReceipt),
            "MISSING_INVOICE" => Some(LineStatus::MissingInvoice),
            _ => None,
        }
    }
}

/// One compared line: an invoice line, an over-received line, or a
/// missing-receipt line. Percentages carry scale 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchLine {
    /// Matching key: catalog item code when present, else the normalized
    /// description.
    pub line_key: String,
    pub description: String,
    pub invoice_line_id: Option<i64>,
    pub invoiced_qty: BigDecimal,
    pub received_qty: BigDecimal,
    pub effective_price: BigDecimal,
    pub received_price: Option<BigDecimal>,
    pub diff_qty: BigDecimal,
    pub diff_pct: BigDecimal,
    pub diff_price: Option<BigDecimal>,
    pub price_pct: Option<BigDecimal>,
    pub status: LineStatus,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub total: usize,
    pub ok: usize,
    pub warning: usize,
    pub blocked: usize,
    pub missing: usize,
}

/// Persisted outcome of one evaluator run; exactly one per invoice,
/// globally replaced on every re-evaluation. The id stays stable across
/// replacements so resolved exceptions keep a valid reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub id: i64,
    pub invoice_id: i64,
    pub global_status: GlobalStatus,
    pub summary: MatchSummary,
    pub receipt_ids: Vec<i64>,
    pub checked_at: DateTime<Utc>,
    pub lines: Vec<MatchLine>,
}
