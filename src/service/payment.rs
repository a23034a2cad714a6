//! Payment gate: read-mostly decision consumed by the payment-approval
//! collaborator.

use crate::error::MatchError;
use crate::models::{GlobalStatus, Invoice, PayApproval, ToleranceConfig};
use crate::store::Backend;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentDecision {
    pub allowed: bool,
    pub requires_approval: bool,
    pub message: String,
}

impl PaymentDecision {
    fn new(allowed: bool, requires_approval: bool, message: &str) -> Self {
        Self {
            allowed,
            requires_approval,
            message: message.to_string(),
        }
    }
}

/// Can this invoice be paid now, and does it need sign-off?
///
/// Manual overrides win over the cached match status; an unvalidated
/// invoice is never payable.
pub fn decide(invoice: &Invoice, tolerance: &ToleranceConfig) -> PaymentDecision {
    if !invoice.validated {
        return PaymentDecision::new(false, false, "invoice is not validated");
    }
    match invoice.pay_approval {
        PayApproval::Rejected => {
            return PaymentDecision::new(false, false, "payment manually rejected");
        }
        PayApproval::Approved => {
            return PaymentDecision::new(true, false, "payment manually approved");
        }
        PayApproval::Unset | PayApproval::BlockedByMatch => {}
    }
    match invoice.match_status {
        GlobalStatus::Ok | GlobalStatus::Resolved => {
            PaymentDecision::new(true, false, "match is clean")
        }
        GlobalStatus::Warning => PaymentDecision::new(
            !tolerance.block_pay_on_warning,
            true,
            "match has warnings; sign-off required",
        ),
        GlobalStatus::Blocked => PaymentDecision::new(
            tolerance.allow_pay_without_match,
            true,
            "match is blocked awaiting resolution",
        ),
        GlobalStatus::Pending => PaymentDecision::new(
            tolerance.allow_pay_without_match,
            true,
            "match is pending; no confirmed receipt yet",
        ),
    }
}

/// Store-backed convenience wrapper around [`decide`].
pub struct PaymentGate<S> {
    store: S,
}

impl<S: Backend> PaymentGate<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn check(&self, invoice_id: i64) -> Result<PaymentDecision, MatchError> {
        use crate::store::{ConfigStore, InvoiceStore};
        let invoice = self
            .store
            .invoice(invoice_id)
            .await?
            .ok_or(MatchError::InvoiceNotFound(invoice_id))?;
        let tolerance = self
            .store
            .tolerance(invoice.company_id)
            .await?
            .unwrap_or_default();
        Ok(decide(&invoice, &tolerance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice(validated: bool, approval: PayApproval, status: GlobalStatus) -> Invoice {
        Invoice {
            id: 1,
            company_id: 1,
            supplier: "acme".to_string(),
            validated,
            lines: Vec::new(),
            match_status: status,
            match_checked_at: None,
            match_block_reason: None,
            pay_approval: approval,
        }
    }

    #[test]
    fn unvalidated_invoice_is_never_payable() {
        let inv = invoice(false, PayApproval::Approved, GlobalStatus::Ok);
        let d = decide(&inv, &ToleranceConfig::default());
        assert!(!d.allowed);
    }

    #[test]
    fn manual_rejection_wins_over_clean_match() {
        let inv = invoice(true, PayApproval::Rejected, GlobalStatus::Ok);
        let d = decide(&inv, &ToleranceConfig::default());
        assert!(!d.allowed);
    }

    #[test]
    fn manual_approval_wins_over_blocked_match() {
        let inv = invoice(true, PayApproval::Approved, GlobalStatus::Blocked);
        let d = decide(&inv, &ToleranceConfig::default());
        assert!(d.allowed);
        assert!(!d.requires_approval);
    }

    #[test]
    fn clean_match_is_payable_without_signoff() {
        let inv = invoice(true, PayApproval::Unset, GlobalStatus::Ok);
        let d = decide(&inv, &ToleranceConfig::default());
        assert!(d.allowed);
        assert!(!d.requires_approval);
    }

    #[test]
    fn resolved_match_counts_as_clean() {
        let inv = invoice(true, PayApproval::BlockedByMatch, GlobalStatus::Resolved);
        let d = decide(&inv, &ToleranceConfig::default());
        assert!(d.allowed);
        assert!(!d.requires_approval);
    }

    #[test]
    fn warning_needs_signoff_and_respects_policy() {
        let inv = invoice(true, PayApproval::Unset, GlobalStatus::Warning);
        let d = decide(&inv, &ToleranceConfig::default());
        assert!(d.allowed);
        assert!(d.requires_approval);

        let strict = ToleranceConfig {
            block_pay_on_warning: true,
            ..Default::default()
        };
        let d = decide(&inv, &strict);
        assert!(!d.allowed);
        assert!(d.requires_approval);
    }

    #[test]
    fn blocked_and_pending_follow_pay_without_match_policy() {
        for status in [GlobalStatus::Blocked, GlobalStatus::Pending] {
            let inv = invoice(true, PayApproval::BlockedByMatch, status);
            let d = decide(&inv, &ToleranceConfig::default());
            assert!(!d.allowed);
            assert!(d.requires_approval);

            let lax = ToleranceConfig {
                allow_pay_without_match: true,
                ..Default::default()
            };
            let d = decide(&inv, &lax);
            assert!(d.allowed);
            assert!(d.requires_approval);
        }
    }
}
