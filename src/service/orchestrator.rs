//! Match persistence orchestrator.
//!
//! Recomputes an invoice's match, destructively replaces the persisted
//! result and its unresolved exceptions in one atomic store operation,
//! refreshes the invoice's cached match fields, writes one audit record,
//! and hands new exceptions to the workflow engine best-effort.

use std::sync::Arc;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::PriorityThresholds;
use crate::error::MatchError;
use crate::models::{
    AuditEntry, ExceptionField, ExceptionKind, GlobalStatus, Invoice, MatchException, MatchLine,
    MatchResult, MatchSummary,
};
use crate::service::evaluator::{self, Evaluation};
use crate::service::workflow::{classify_priority, log_assignment_failure, ExceptionWorkflow};
use crate::store::{AuditSink, Backend, ConfigStore, InvoiceStore, MatchStore, ReceiptStore};

pub struct MatchOrchestrator<S> {
    store: S,
    workflow: ExceptionWorkflow<S>,
    thresholds: PriorityThresholds,
    // serializes concurrent re-evaluation of the same invoice
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl<S: Backend + Clone> MatchOrchestrator<S> {
    pub fn new(store: S, thresholds: PriorityThresholds) -> Self {
        let workflow = ExceptionWorkflow::new(store.clone(), thresholds);
        Self {
            store,
            workflow,
            thresholds,
            locks: DashMap::new(),
        }
    }

    /// Recompute and fully replace the invoice's match result, line rows
    /// and exceptions, then update the cached invoice fields and append an
    /// audit record. Per-exception ownership/SLA assignment runs
    /// best-effort afterwards: one failed assignment never aborts the rest.
    pub async fn recompute_match(
        &self,
        invoice_id: i64,
        actor: Option<i64>,
    ) -> Result<MatchResult, MatchError> {
        let lock = self
            .locks
            .entry(invoice_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let invoice = self
            .store
            .invoice(invoice_id)
            .await?
            .ok_or(MatchError::InvoiceNotFound(invoice_id))?;
        let receipts = self.store.confirmed_receipts(invoice_id).await?;
        let tolerance = self
            .store
            .tolerance(invoice.company_id)
            .await?
            .unwrap_or_default();

        let eval = evaluator::evaluate(&invoice.lines, &receipts, &tolerance);
        let now = Utc::now();

        let exceptions = derive_exceptions(&invoice, &eval, &self.thresholds, now);
        let had_discrepancies = !exceptions.is_empty();
        let result = MatchResult {
            id: 0,
            invoice_id,
            global_status: eval.global_status,
            summary: eval.summary,
            receipt_ids: receipts.iter().map(|r| r.id).collect(),
            checked_at: now,
            lines: eval.lines,
        };

        let (mut result, new_exceptions) = self
            .store
            .replace_match(invoice_id, result, exceptions)
            .await?;

        // Every discrepancy collided with an already-resolved exception, so
        // nothing is left to resolve; re-blocking here would make the invoice
        // permanently unpayable. The terminal state stands.
        if had_discrepancies && new_exceptions.is_empty() {
            result.global_status = GlobalStatus::Resolved;
            self.store.resolve_match(result.id).await?;
        }

        self.store
            .update_match_fields(
                invoice_id,
                result.global_status,
                now,
                block_reason(result.global_status, &result.summary),
            )
            .await?;
        if result.global_status == GlobalStatus::Blocked {
            // never clobbers an explicit human approval/rejection
            self.store.set_pay_approval_on_block(invoice_id).await?;
        }

        self.store
            .append_audit(AuditEntry {
                entity: "match_result".to_string(),
                entity_id: result.id,
                action: "MATCH_RECOMPUTED".to_string(),
                payload: json!({
                    "invoice_id": invoice_id,
                    "global_status": result.global_status.as_str(),
                    "summary": result.summary,
                    "receipt_ids": result.receipt_ids,
                }),
                company_id: invoice.company_id,
                user_id: actor,
                at: now,
            })
            .await?;

        info!(
            invoice_id,
            status = result.global_status.as_str(),
            lines = result.summary.total,
            blocked = result.summary.blocked,
            exceptions = new_exceptions.len(),
            "match recomputed"
        );

        for exception in &new_exceptions {
            if let Err(err) = self.workflow.assign(exception).await {
                log_assignment_failure(exception.id, &err);
            }
        }

        Ok(result)
    }
}

fn block_reason(status: GlobalStatus, summary: &MatchSummary) -> Option<String> {
    match status {
        GlobalStatus::Blocked => Some(format!(
            "match blocked: {} of {} lines discrepant",
            summary.blocked + summary.missing,
            summary.total
        )),
        GlobalStatus::Pending => Some("awaiting confirmed goods receipt".to_string()),
        _ => None,
    }
}

/// One or more typed exceptions per non-OK line, each carrying the
/// monetary impact used for prioritization.
fn derive_exceptions(
    invoice: &Invoice,
    eval: &Evaluation,
    thresholds: &PriorityThresholds,
    now: DateTime<Utc>,
) -> Vec<MatchException> {
    let mut out = Vec::new();
    for line in &eval.lines {
        match line.status {
            crate::models::LineStatus::Ok => {}
            crate::models::LineStatus::MissingReceipt => {
                let impact = &line.invoiced_qty * &line.effective_price;
                out.push(draft(
                    invoice,
                    line,
                    ExceptionKind::MissingReceipt,
                    ExceptionField::Line,
                    line.invoiced_qty.clone(),
                    BigDecimal::zero(),
                    impact,
                    thresholds,
                    now,
                ));
            }
            crate::models::LineStatus::MissingInvoice => {
                let price = line.received_price.clone().unwrap_or_else(BigDecimal::zero);
                let impact = &line.received_qty * &price;
                out.push(draft(
                    invoice,
                    line,
                    ExceptionKind::MissingInvoice,
                    ExceptionField::Line,
                    BigDecimal::zero(),
                    line.received_qty.clone(),
                    impact,
                    thresholds,
                    now,
                ));
            }
            crate::models::LineStatus::Warning | crate::models::LineStatus::Blocked => {
                if !line.diff_qty.is_zero() {
                    let impact = &line.diff_qty * &line.effective_price;
                    out.push(draft(
                        invoice,
                        line,
                        ExceptionKind::QuantityVariance,
                        ExceptionField::Quantity,
                        line.invoiced_qty.clone(),
                        line.received_qty.clone(),
                        impact,
                        thresholds,
                        now,
                    ));
                }
                if let (Some(diff_price), Some(price_pct)) = (&line.diff_price, &line.price_pct) {
                    if !price_pct.is_zero() {
                        let impact = diff_price * &line.received_qty;
                        out.push(draft(
                            invoice,
                            line,
                            ExceptionKind::PriceVariance,
                            ExceptionField::Price,
                            line.effective_price.clone(),
                            line.received_price.clone().unwrap_or_else(BigDecimal::zero),
                            impact,
                            thresholds,
                            now,
                        ));
                    }
                }
            }
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn draft(
    invoice: &Invoice,
    line: &MatchLine,
    kind: ExceptionKind,
    field: ExceptionField,
    expected: BigDecimal,
    received: BigDecimal,
    impact: BigDecimal,
    thresholds: &PriorityThresholds,
    now: DateTime<Utc>,
) -> MatchException {
    let priority = classify_priority(kind, &impact, thresholds);
    MatchException {
        id: 0,
        match_id: 0,
        invoice_id: invoice.id,
        company_id: invoice.company_id,
        kind,
        field,
        line_key: line.line_key.clone(),
        expected,
        received,
        impact,
        priority,
        owner_user: None,
        owner_role: None,
        sla_deadline: None,
        breached: false,
        escalated_at: None,
        escalated_to: None,
        resolved: false,
        resolution: None,
        created_at: now,
    }
}
