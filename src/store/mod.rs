//! Store contracts consumed by the match core.
//!
//! Each trait mirrors one external collaborator: invoice store, receipt
//! store, configuration store, role directory, audit sink and the match
//! entities themselves. `db::PgStore` implements them against PostgreSQL;
//! `MemoryStore` backs the tests.

use chrono::{DateTime, Utc};

use crate::error::MatchError;
use crate::models::{
    AuditEntry, ExceptionKind, GlobalStatus, GoodsReceipt, HistoryEntry, Invoice, MatchException,
    MatchResult, PendingFilter, Priority, ResolutionRecord, SlaRule, ToleranceConfig,
};

pub mod memory;

pub use memory::MemoryStore;

pub trait InvoiceStore {
    async fn invoice(&self, id: i64) -> Result<Option<Invoice>, MatchError>;

    /// Write the cached match fields on the invoice header.
    async fn update_match_fields(
        &self,
        id: i64,
        status: GlobalStatus,
        checked_at: DateTime<Utc>,
        block_reason: Option<String>,
    ) -> Result<(), MatchError>;

    /// Set pay approval to "blocked by match" unless a human has already
    /// explicitly approved or rejected payment.
    async fn set_pay_approval_on_block(&self, id: i64) -> Result<(), MatchError>;
}

pub trait ReceiptStore {
    /// Confirmed receipts linked to the invoice; drafts and cancellations
    /// never participate in matching.
    async fn confirmed_receipts(&self, invoice_id: i64) -> Result<Vec<GoodsReceipt>, MatchError>;
}

pub trait ConfigStore {
    async fn tolerance(&self, company_id: i64) -> Result<Option<ToleranceConfig>, MatchError>;

    async fn sla_rule(
        &self,
        company_id: i64,
        kind: ExceptionKind,
    ) -> Result<Option<SlaRule>, MatchError>;
}

pub trait RoleDirectory {
    async fn active_users_in_role(
        &self,
        company_id: i64,
        role: &str,
    ) -> Result<Vec<i64>, MatchError>;

    async fn roles_of(&self, company_id: i64, user_id: i64) -> Result<Vec<String>, MatchError>;
}

pub trait AuditSink {
    async fn append_audit(&self, entry: AuditEntry) -> Result<(), MatchError>;
}

pub trait MatchStore {
    async fn match_result(&self, invoice_id: i64) -> Result<Option<MatchResult>, MatchError>;

    /// Atomically replace the invoice's match result, its line rows and its
    /// unresolved exceptions (history rows of deleted exceptions go with
    /// them). Resolved exceptions are preserved by their stable key and
    /// never recreated; an incoming exception whose key collides with a
    /// resolved one is dropped.
    ///
    /// `result.id` and the exceptions' `id`/`match_id` are assigned by the
    /// store (the match id stays stable per invoice across replacements).
    /// Returns the persisted result and the newly inserted exceptions.
    async fn replace_match(
        &self,
        invoice_id: i64,
        result: MatchResult,
        exceptions: Vec<MatchException>,
    ) -> Result<(MatchResult, Vec<MatchException>), MatchError>;

    /// Flip the match result to its terminal resolved state.
    async fn resolve_match(&self, match_id: i64) -> Result<(), MatchError>;
}

pub trait ExceptionStore {
    async fn exception(&self, id: i64) -> Result<Option<MatchException>, MatchError>;

    async fn set_assignment(
        &self,
        id: i64,
        owner_user: Option<i64>,
        owner_role: &str,
        deadline: DateTime<Utc>,
    ) -> Result<(), MatchError>;

    async fn set_priority(&self, id: i64, priority: Priority) -> Result<(), MatchError>;

    /// Compare-and-set of the breached flag. Returns false when the
    /// exception is already breached or resolved, so two concurrent sweeps
    /// never double-escalate one row.
    async fn mark_breached(&self, id: i64) -> Result<bool, MatchError>;

    async fn mark_escalated(
        &self,
        id: i64,
        owner_user: Option<i64>,
        role: &str,
        at: DateTime<Utc>,
    ) -> Result<(), MatchError>;

    async fn mark_resolved(&self, id: i64, record: ResolutionRecord) -> Result<(), MatchError>;

    async fn insert_history(&self, entry: HistoryEntry) -> Result<(), MatchError>;

    async fn history(&self, exception_id: i64) -> Result<Vec<HistoryEntry>, MatchError>;

    async fn unresolved_for_match(&self, match_id: i64)
        -> Result<Vec<MatchException>, MatchError>;

    /// Unresolved, not-yet-breached exceptions whose SLA deadline has
    /// passed, company-scoped. Input to the escalation sweep.
    async fn due_unbreached(
        &self,
        company_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<MatchException>, MatchError>;

    /// Unresolved exceptions visible to the user: directly assigned, or
    /// (unless `mine_only`) owned by any of the given roles. Ordered by
    /// priority tier, then soonest deadline, then oldest creation.
    async fn pending_for(
        &self,
        company_id: i64,
        user_id: i64,
        roles: &[String],
        filter: &PendingFilter,
    ) -> Result<Vec<MatchException>, MatchError>;

    async fn unresolved_for_company(
        &self,
        company_id: i64,
    ) -> Result<Vec<MatchException>, MatchError>;
}

/// Full backend bound used by the services.
pub trait Backend:
    InvoiceStore
    + ReceiptStore
    + ConfigStore
    + RoleDirectory
    + AuditSink
    + MatchStore
    + ExceptionStore
    + Send
    + Sync
{
}

impl<T> Backend for T where
    T: InvoiceStore
        + ReceiptStore
        + ConfigStore
        + RoleDirectory
        + AuditSink
        + MatchStore
        + ExceptionStore
        + Send
        + Sync
{
}
