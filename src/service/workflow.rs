//! Exception workflow engine: ownership and SLA assignment, the periodic
//! escalation sweep, human resolution, and the read-only query surfaces.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::PriorityThresholds;
use crate::error::MatchError;
use crate::models::{
    ExceptionKind, ExceptionStats, GlobalStatus, HistoryAction, HistoryEntry, MatchException,
    PendingFilter, Priority, ResolutionOutcome, ResolutionRecord, ResolutionRequest, SlaRule,
    SweepOutcome,
};
use crate::store::{
    Backend, ConfigStore, ExceptionStore, InvoiceStore, MatchStore, RoleDirectory,
};

pub const REASON_SLA_BREACH: &str = "SLA_BREACH";

/// Priority tier for an exception. A missing receipt always lands in the
/// top tier because it blocks all payment; the other kinds are classified
/// by monetary impact against the configured boundaries.
pub fn classify_priority(
    kind: ExceptionKind,
    impact: &BigDecimal,
    thresholds: &PriorityThresholds,
) -> Priority {
    if kind == ExceptionKind::MissingReceipt {
        return Priority::Urgent;
    }
    if *impact >= BigDecimal::from(thresholds.urgent) {
        Priority::Urgent
    } else if *impact >= BigDecimal::from(thresholds.high) {
        Priority::High
    } else if *impact >= BigDecimal::from(thresholds.normal) {
        Priority::Normal
    } else {
        Priority::Low
    }
}

/// SLA hours after priority adjustment of the configured base.
pub fn adjusted_sla_hours(priority: Priority, base_hours: i64) -> i64 {
    match priority {
        Priority::Urgent => (base_hours / 4).max(4),
        Priority::High => (base_hours / 2).max(8),
        Priority::Normal | Priority::Low => base_hours,
    }
}

/// Picks one assignee from the role-holder candidate set. Injectable so
/// ownership distribution stays deterministic and testable.
pub trait OwnerSelector: Send + Sync {
    fn select(&self, company_id: i64, role: &str, candidates: &[i64]) -> Option<i64>;
}

/// Default selector: round-robin per (company, role).
#[derive(Default)]
pub struct RoundRobinSelector {
    cursors: DashMap<(i64, String), usize>,
}

impl OwnerSelector for RoundRobinSelector {
    fn select(&self, company_id: i64, role: &str, candidates: &[i64]) -> Option<i64> {
        if candidates.is_empty() {
            return None;
        }
        let mut cursor = self
            .cursors
            .entry((company_id, role.to_string()))
            .or_insert(0);
        let picked = candidates[*cursor % candidates.len()];
        *cursor += 1;
        Some(picked)
    }
}

pub struct ExceptionWorkflow<S> {
    store: S,
    selector: Arc<dyn OwnerSelector>,
    thresholds: PriorityThresholds,
}

impl<S: Backend> ExceptionWorkflow<S> {
    pub fn new(store: S, thresholds: PriorityThresholds) -> Self {
        Self {
            store,
            selector: Arc::new(RoundRobinSelector::default()),
            thresholds,
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn OwnerSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn thresholds(&self) -> &PriorityThresholds {
        &self.thresholds
    }

    async fn rule_for(&self, company_id: i64, kind: ExceptionKind) -> Result<SlaRule, MatchError> {
        Ok(self
            .store
            .sla_rule(company_id, kind)
            .await?
            .unwrap_or_else(|| SlaRule::fallback(kind)))
    }

    /// Assign ownership and an SLA deadline to a freshly created exception
    /// and record the CREATE history entry.
    pub async fn assign(&self, exception: &MatchException) -> Result<(), MatchError> {
        let rule = self.rule_for(exception.company_id, exception.kind).await?;
        let hours = adjusted_sla_hours(exception.priority, rule.base_sla_hours);
        let deadline = exception.created_at + Duration::hours(hours);

        let candidates = self
            .store
            .active_users_in_role(exception.company_id, &rule.owner_role)
            .await?;
        let owner = self
            .selector
            .select(exception.company_id, &rule.owner_role, &candidates);
        if owner.is_none() {
            info!(
                exception_id = exception.id,
                role = %rule.owner_role,
                "no active user holds the owner role; exception left unassigned"
            );
        }

        self.store
            .set_assignment(exception.id, owner, &rule.owner_role, deadline)
            .await?;
        self.store
            .insert_history(HistoryEntry {
                exception_id: exception.id,
                action: HistoryAction::Create,
                from_owner: None,
                to_owner: owner,
                from_status: None,
                to_status: Some("PENDING".to_string()),
                disposition: None,
                reason_code: None,
                actor: None,
                at: exception.created_at,
            })
            .await?;
        Ok(())
    }

    /// Periodic, company-scoped escalation sweep. Idempotent: the breached
    /// flag is flipped by a compare-and-set, so repeated or concurrent
    /// sweeps never double-escalate one exception.
    pub async fn run_escalation_sweep(
        &self,
        company_id: i64,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome, MatchError> {
        let due = self.store.due_unbreached(company_id, now).await?;
        let mut outcome = SweepOutcome {
            examined: due.len(),
            ..Default::default()
        };

        for exception in due {
            if !self.store.mark_breached(exception.id).await? {
                continue;
            }
            outcome.breached += 1;

            let rule = self.rule_for(company_id, exception.kind).await?;
            let Some(escalate_to) = rule.escalate_to_role.as_deref() else {
                continue;
            };
            // full-duration comparison, so 48h30m exceeds a 48h threshold
            if now - exception.created_at <= Duration::hours(rule.escalate_after_hours) {
                continue;
            }

            let candidates = self
                .store
                .active_users_in_role(company_id, escalate_to)
                .await?;
            let to_owner = self.selector.select(company_id, escalate_to, &candidates);

            self.store
                .mark_escalated(exception.id, to_owner, escalate_to, now)
                .await?;
            self.store
                .set_priority(exception.id, Priority::Urgent)
                .await?;
            self.store
                .insert_history(HistoryEntry {
                    exception_id: exception.id,
                    action: HistoryAction::Escalate,
                    from_owner: exception.owner_user,
                    to_owner,
                    from_status: None,
                    to_status: None,
                    disposition: None,
                    reason_code: Some(REASON_SLA_BREACH.to_string()),
                    actor: None,
                    at: now,
                })
                .await?;
            outcome.escalated += 1;

            info!(
                exception_id = exception.id,
                company_id,
                to_role = escalate_to,
                "exception escalated after SLA breach"
            );
        }

        Ok(outcome)
    }

    /// Apply a human disposition. An already-resolved exception yields a
    /// non-error `{ success: false }` outcome; a missing one is a hard
    /// error.
    pub async fn resolve(
        &self,
        exception_id: i64,
        request: ResolutionRequest,
        resolver: i64,
    ) -> Result<ResolutionOutcome, MatchError> {
        let exception = self
            .store
            .exception(exception_id)
            .await?
            .ok_or(MatchError::ExceptionNotFound(exception_id))?;

        if exception.resolved {
            return Ok(ResolutionOutcome {
                success: false,
                message: format!("exception {exception_id} is already resolved"),
                match_resolved: false,
            });
        }

        let now = Utc::now();
        self.store
            .insert_history(HistoryEntry {
                exception_id,
                action: HistoryAction::Resolve,
                from_owner: exception.owner_user,
                to_owner: exception.owner_user,
                from_status: Some("PENDING".to_string()),
                to_status: Some("RESOLVED".to_string()),
                disposition: Some(request.action),
                reason_code: Some(request.reason_code.clone()),
                actor: Some(resolver),
                at: now,
            })
            .await?;
        self.store
            .mark_resolved(
                exception_id,
                ResolutionRecord {
                    action: request.action,
                    reason_code: request.reason_code,
                    reason_text: request.reason_text,
                    adjusted_amount: request.adjusted_amount,
                    note_reference: request.note_reference,
                    resolved_by: resolver,
                    resolved_at: now,
                },
            )
            .await?;

        // Last open exception of the match unblocks payment.
        let remaining = self.store.unresolved_for_match(exception.match_id).await?;
        let match_resolved = remaining.is_empty();
        if match_resolved {
            self.store.resolve_match(exception.match_id).await?;
            self.store
                .update_match_fields(exception.invoice_id, GlobalStatus::Resolved, now, None)
                .await?;
            info!(
                invoice_id = exception.invoice_id,
                match_id = exception.match_id,
                "all exceptions resolved; match flipped to RESOLVED"
            );
        }

        Ok(ResolutionOutcome {
            success: true,
            message: "exception resolved".to_string(),
            match_resolved,
        })
    }

    /// Pending exceptions visible to the user: directly assigned, or (unless
    /// `mine_only`) matching any role the user holds in the company.
    pub async fn pending_for_user(
        &self,
        company_id: i64,
        user_id: i64,
        filter: PendingFilter,
    ) -> Result<Vec<MatchException>, MatchError> {
        let roles = if filter.mine_only {
            Vec::new()
        } else {
            self.store.roles_of(company_id, user_id).await?
        };
        self.store
            .pending_for(company_id, user_id, &roles, &filter)
            .await
    }

    /// Aggregate unresolved-exception statistics for one company. Purely
    /// derived, no side effects.
    pub async fn statistics(
        &self,
        company_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ExceptionStats, MatchError> {
        let open = self.store.unresolved_for_company(company_id).await?;
        let mut stats = ExceptionStats {
            open_total: open.len(),
            ..Default::default()
        };
        let mut age_minutes_total: i64 = 0;
        for ex in &open {
            *stats.by_kind.entry(ex.kind.as_str().to_string()).or_insert(0) += 1;
            *stats
                .by_priority
                .entry(ex.priority.as_str().to_string())
                .or_insert(0) += 1;
            if ex.breached {
                stats.breached += 1;
            }
            stats.total_impact += &ex.impact;
            age_minutes_total += (now - ex.created_at).num_minutes().max(0);
        }
        if !open.is_empty() {
            stats.mean_age_hours = age_minutes_total as f64 / 60.0 / open.len() as f64;
        }
        Ok(stats)
    }
}

// Assignment failures inside the orchestrator are logged through this so
// the primary persistence never aborts.
pub(crate) fn log_assignment_failure(exception_id: i64, err: &MatchError) {
    warn!(
        exception_id,
        error = %err,
        "owner/SLA assignment failed; exception left for the next sweep"
    );
}
