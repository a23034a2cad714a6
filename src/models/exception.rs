use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discrepancy class derived from a non-OK match line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionKind {
    PriceVariance,
    QuantityVariance,
    MissingReceipt,
    MissingInvoice,
}

impl ExceptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExceptionKind::PriceVariance => "PRICE_VARIANCE",
            ExceptionKind::QuantityVariance => "QUANTITY_VARIANCE",
            ExceptionKind::MissingReceipt => "MISSING_RECEIPT",
            ExceptionKind::MissingInvoice => "MISSING_INVOICE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PRICE_VARIANCE" => Some(ExceptionKind::PriceVariance),
            "QUANTITY_VARIANCE" => Some(ExceptionKind::QuantityVariance),
            "MISSING_RECEIPT" => Some(ExceptionKind::MissingReceipt),
            "MISSING_INVOICE" => Some(ExceptionKind::MissingInvoice),
            _ => None,
        }
    }
}

/// Field the discrepancy affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionField {
    Quantity,
    Price,
    Line,
}

impl ExceptionField {
    pub fn as_str(self) -> &'static str {
        match self {
            ExceptionField::Quantity => "QUANTITY",
            ExceptionField::Price => "PRICE",
            ExceptionField::Line => "LINE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUANTITY" => Some(ExceptionField::Quantity),
            "PRICE" => Some(ExceptionField::Price),
            "LINE" => Some(ExceptionField::Line),
            _ => None,
        }
    }
}

/// Ordered so that `Urgent` compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(Priority::Low),
            "NORMAL" => Some(Priority::Normal),
            "HIGH" => Some(Priority::High),
            "URGENT" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

/// Disposition chosen by the human resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionAction {
    ApproveDifference,
    AdjustInvoice,
    AdjustReceipt,
    RejectInvoice,
    Escalate,
    CloseNoAction,
}

impl ExceptionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ExceptionAction::ApproveDifference => "APPROVE_DIFFERENCE",
            ExceptionAction::AdjustInvoice => "ADJUST_INVOICE",
            ExceptionAction::AdjustReceipt => "ADJUST_RECEIPT",
            ExceptionAction::RejectInvoice => "REJECT_INVOICE",
            ExceptionAction::Escalate => "ESCALATE",
            ExceptionAction::CloseNoAction => "CLOSE_NO_ACTION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVE_DIFFERENCE" => Some(ExceptionAction::ApproveDifference),
            "ADJUST_INVOICE" => Some(ExceptionAction::AdjustInvoice),
            "ADJUST_RECEIPT" => Some(ExceptionAction::AdjustReceipt),
            "REJECT_INVOICE" => Some(ExceptionAction::RejectInvoice),
            "ESCALATE" => Some(ExceptionAction::Escalate),
            "CLOSE_NO_ACTION" => Some(ExceptionAction::CloseNoAction),
            _ => None,
        }
    }
}

/// A discrepancy awaiting human disposition.
///
/// Created by the orchestrator right after a match result is persisted;
/// mutated by the workflow engine (assignment, escalation) and by a human
/// resolver. `resolved` is monotonic and never reverts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchException {
    pub id: i64,
    pub match_id: i64,
    pub invoice_id: i64,
    pub company_id: i64,
    pub kind: ExceptionKind,
    pub field: ExceptionField,
    pub line_key: String,
    pub expected: BigDecimal,
    pub received: BigDecimal,
    /// Monetary impact of the discrepancy, used for prioritization.
    pub impact: BigDecimal,
    pub priority: Priority,
    pub owner_user: Option<i64>,
    pub owner_role: Option<String>,
    pub sla_deadline: Option<DateTime<Utc>>,
    pub breached: bool,
    pub escalated_at: Option<DateTime<Utc>>,
    pub escalated_to: Option<String>,
    pub resolved: bool,
    pub resolution: Option<ResolutionRecord>,
    pub created_at: DateTime<Utc>,
}

impl MatchException {
    /// Stable identity of the discrepancy across re-matches; resolved
    /// exceptions are preserved by this key.
    pub fn key(&self) -> (ExceptionKind, ExceptionField, String) {
        (self.kind, self.field, self.line_key.clone())
    }
}

/// Terminal resolution metadata stored on the exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub action: ExceptionAction,
    pub reason_code: String,
    pub reason_text: Option<String>,
    pub adjusted_amount: Option<BigDecimal>,
    pub note_reference: Option<String>,
    pub resolved_by: i64,
    pub resolved_at: DateTime<Utc>,
}

/// What the human resolver supplies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub action: ExceptionAction,
    pub reason_code: String,
    pub reason_text: Option<String>,
    pub adjusted_amount: Option<BigDecimal>,
    pub note_reference: Option<String>,
}

/// Structured non-error outcome of a resolve call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub success: bool,
    pub message: String,
    /// Set when this resolution was the last open exception of its match.
    pub match_resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryAction {
    Create,
    Escalate,
    Resolve,
}

impl HistoryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryAction::Create => "CREATE",
            HistoryAction::Escalate => "ESCALATE",
            HistoryAction::Resolve => "RESOLVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(HistoryAction::Create),
            "ESCALATE" => Some(HistoryAction::Escalate),
            "RESOLVE" => Some(HistoryAction::Resolve),
            _ => None,
        }
    }
}

/// Append-only audit trail row for one exception transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub exception_id: i64,
    pub action: HistoryAction,
    pub from_owner: Option<i64>,
    pub to_owner: Option<i64>,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    /// Human disposition on a RESOLVE transition.
    pub disposition: Option<ExceptionAction>,
    pub reason_code: Option<String>,
    pub actor: Option<i64>,
    pub at: DateTime<Utc>,
}

/// Filters for the "pending exceptions visible to user" surface.
#[derive(Debug, Clone, Default)]
pub struct PendingFilter {
    /// Only exceptions directly assigned to the user, ignoring role matches.
    pub mine_only: bool,
    pub kind: Option<ExceptionKind>,
    pub priority: Option<Priority>,
}

/// Aggregate unresolved-exception statistics for one company.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExceptionStats {
    pub open_total: usize,
    pub by_kind: std::collections::BTreeMap<String, usize>,
    pub by_priority: std::collections::BTreeMap<String, usize>,
    pub breached: usize,
    pub total_impact: BigDecimal,
    pub mean_age_hours: f64,
}

/// Counters returned by one escalation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepOutcome {
    pub examined: usize,
    pub breached: usize,
    pub escalated: usize,
}
