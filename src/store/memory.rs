//! In-memory reference backend.
//!
//! Deterministic, fully synchronous behind the async trait surface; backs
//! the test suites and doubles as executable documentation of the store
//! semantics the PostgreSQL backend must match.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::error::MatchError;
use crate::models::{
    AuditEntry, ExceptionKind, GlobalStatus, GoodsReceipt, HistoryEntry, Invoice, MatchException,
    MatchResult, PendingFilter, Priority, ReceiptStatus, ResolutionRecord, SlaRule,
    ToleranceConfig,
};

use super::{
    AuditSink, ConfigStore, ExceptionStore, InvoiceStore, MatchStore, ReceiptStore, RoleDirectory,
};

#[derive(Default)]
struct State {
    invoices: HashMap<i64, Invoice>,
    receipts: Vec<GoodsReceipt>,
    tolerances: HashMap<i64, ToleranceConfig>,
    sla_rules: HashMap<(i64, ExceptionKind), SlaRule>,
    role_members: HashMap<(i64, String), Vec<i64>>,
    // keyed by invoice id; the match id inside stays stable across replaces
    matches: HashMap<i64, MatchResult>,
    exceptions: BTreeMap<i64, MatchException>,
    history: Vec<HistoryEntry>,
    audit: Vec<AuditEntry>,
    next_id: i64,
}

impl State {
    fn alloc_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ----- seeding / inspection (test fixtures and embedders) -----

    pub fn insert_invoice(&self, invoice: Invoice) {
        self.inner.write().unwrap().invoices.insert(invoice.id, invoice);
    }

    pub fn insert_receipt(&self, receipt: GoodsReceipt) {
        self.inner.write().unwrap().receipts.push(receipt);
    }

    pub fn set_tolerance(&self, company_id: i64, tolerance: ToleranceConfig) {
        self.inner.write().unwrap().tolerances.insert(company_id, tolerance);
    }

    pub fn set_sla_rule(&self, company_id: i64, kind: ExceptionKind, rule: SlaRule) {
        self.inner.write().unwrap().sla_rules.insert((company_id, kind), rule);
    }

    pub fn add_role_member(&self, company_id: i64, role: &str, user_id: i64) {
        self.inner
            .write()
            .unwrap()
            .role_members
            .entry((company_id, role.to_string()))
            .or_default()
            .push(user_id);
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.inner.read().unwrap().audit.clone()
    }

    /// Direct exception write, bypassing the orchestrator. Test seam for
    /// workflow scenarios that need a crafted exception row.
    pub fn insert_exception(&self, mut exception: MatchException) -> i64 {
        let mut st = self.inner.write().unwrap();
        if exception.id == 0 {
            exception.id = st.alloc_id();
        }
        let id = exception.id;
        st.exceptions.insert(id, exception);
        id
    }
}

impl InvoiceStore for MemoryStore {
    async fn invoice(&self, id: i64) -> Result<Option<Invoice>, MatchError> {
        Ok(self.inner.read().unwrap().invoices.get(&id).cloned())
    }

    async fn update_match_fields(
        &self,
        id: i64,
        status: GlobalStatus,
        checked_at: DateTime<Utc>,
        block_reason: Option<String>,
    ) -> Result<(), MatchError> {
        let mut st = self.inner.write().unwrap();
        let inv = st.invoices.get_mut(&id).ok_or(MatchError::InvoiceNotFound(id))?;
        inv.match_status = status;
        inv.match_checked_at = Some(checked_at);
        inv.match_block_reason = block_reason;
        Ok(())
    }

    async fn set_pay_approval_on_block(&self, id: i64) -> Result<(), MatchError> {
        let mut st = self.inner.write().unwrap();
        let inv = st.invoices.get_mut(&id).ok_or(MatchError::InvoiceNotFound(id))?;
        if !inv.pay_approval.is_manual() {
            inv.pay_approval = crate::models::PayApproval::BlockedByMatch;
        }
        Ok(())
    }
}

impl ReceiptStore for MemoryStore {
    async fn confirmed_receipts(&self, invoice_id: i64) -> Result<Vec<GoodsReceipt>, MatchError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .receipts
            .iter()
            .filter(|r| r.invoice_id == invoice_id && r.status == ReceiptStatus::Confirmed)
            .cloned()
            .collect())
    }
}

impl ConfigStore for MemoryStore {
    async fn tolerance(&self, company_id: i64) -> Result<Option<ToleranceConfig>, MatchError> {
        Ok(self.inner.read().unwrap().tolerances.get(&company_id).cloned())
    }

    async fn sla_rule(
        &self,
        company_id: i64,
        kind: ExceptionKind,
    ) -> Result<Option<SlaRule>, MatchError> {
        Ok(self.inner.read().unwrap().sla_rules.get(&(company_id, kind)).cloned())
    }
}

impl RoleDirectory for MemoryStore {
    async fn active_users_in_role(
        &self,
        company_id: i64,
        role: &str,
    ) -> Result<Vec<i64>, MatchError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .role_members
            .get(&(company_id, role.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn roles_of(&self, company_id: i64, user_id: i64) -> Result<Vec<String>, MatchError> {
        let st = self.inner.read().unwrap();
        let mut roles: Vec<String> = st
            .role_members
            .iter()
            .filter(|((company, _), members)| *company == company_id && members.contains(&user_id))
            .map(|((_, role), _)| role.clone())
            .collect();
        roles.sort();
        Ok(roles)
    }
}

impl AuditSink for MemoryStore {
    async fn append_audit(&self, entry: AuditEntry) -> Result<(), MatchError> {
        self.inner.write().unwrap().audit.push(entry);
        Ok(())
    }
}

impl MatchStore for MemoryStore {
    async fn match_result(&self, invoice_id: i64) -> Result<Option<MatchResult>, MatchError> {
        Ok(self.inner.read().unwrap().matches.get(&invoice_id).cloned())
    }

    async fn replace_match(
        &self,
        invoice_id: i64,
        mut result: MatchResult,
        exceptions: Vec<MatchException>,
    ) -> Result<(MatchResult, Vec<MatchException>), MatchError> {
        let mut st = self.inner.write().unwrap();

        let match_id = match st.matches.get(&invoice_id) {
            Some(existing) => existing.id,
            None => st.alloc_id(),
        };

        let resolved_keys: HashSet<_> = st
            .exceptions
            .values()
            .filter(|e| e.match_id == match_id && e.resolved)
            .map(|e| e.key())
            .collect();

        // history rows of the deleted unresolved exceptions go with them
        let removed: HashSet<i64> = st
            .exceptions
            .values()
            .filter(|e| e.match_id == match_id && !e.resolved)
            .map(|e| e.id)
            .collect();
        st.exceptions.retain(|_, e| e.match_id != match_id || e.resolved);
        st.history.retain(|h| !removed.contains(&h.exception_id));

        let mut inserted = Vec::with_capacity(exceptions.len());
        for mut ex in exceptions {
            if resolved_keys.contains(&ex.key()) {
                continue;
            }
            ex.id = st.alloc_id();
            ex.match_id = match_id;
            ex.invoice_id = invoice_id;
            st.exceptions.insert(ex.id, ex.clone());
            inserted.push(ex);
        }

        result.id = match_id;
        result.invoice_id = invoice_id;
        st.matches.insert(invoice_id, result.clone());

        Ok((result, inserted))
    }

    async fn resolve_match(&self, match_id: i64) -> Result<(), MatchError> {
        let mut st = self.inner.write().unwrap();
        let result = st
            .matches
            .values_mut()
            .find(|m| m.id == match_id)
            .ok_or(MatchError::MatchResultNotFound(match_id))?;
        result.global_status = GlobalStatus::Resolved;
        Ok(())
    }
}

impl ExceptionStore for MemoryStore {
    async fn exception(&self, id: i64) -> Result<Option<MatchException>, MatchError> {
        Ok(self.inner.read().unwrap().exceptions.get(&id).cloned())
    }

    async fn set_assignment(
        &self,
        id: i64,
        owner_user: Option<i64>,
        owner_role: &str,
        deadline: DateTime<Utc>,
    ) -> Result<(), MatchError> {
        let mut st = self.inner.write().unwrap();
        let ex = st.exceptions.get_mut(&id).ok_or(MatchError::ExceptionNotFound(id))?;
        ex.owner_user = owner_user;
        ex.owner_role = Some(owner_role.to_string());
        ex.sla_deadline = Some(deadline);
        Ok(())
    }

    async fn set_priority(&self, id: i64, priority: Priority) -> Result<(), MatchError> {
        let mut st = self.inner.write().unwrap();
        let ex = st.exceptions.get_mut(&id).ok_or(MatchError::ExceptionNotFound(id))?;
        ex.priority = priority;
        Ok(())
    }

    async fn mark_breached(&self, id: i64) -> Result<bool, MatchError> {
        let mut st = self.inner.write().unwrap();
        let ex = st.exceptions.get_mut(&id).ok_or(MatchError::ExceptionNotFound(id))?;
        if ex.resolved || ex.breached {
            return Ok(false);
        }
        ex.breached = true;
        Ok(true)
    }

    async fn mark_escalated(
        &self,
        id: i64,
        owner_user: Option<i64>,
        role: &str,
        at: DateTime<Utc>,
    ) -> Result<(), MatchError> {
        let mut st = self.inner.write().unwrap();
        let ex = st.exceptions.get_mut(&id).ok_or(MatchError::ExceptionNotFound(id))?;
        ex.owner_user = owner_user;
        ex.owner_role = Some(role.to_string());
        ex.escalated_at = Some(at);
        ex.escalated_to = Some(role.to_string());
        Ok(())
    }

    async fn mark_resolved(&self, id: i64, record: ResolutionRecord) -> Result<(), MatchError> {
        let mut st = self.inner.write().unwrap();
        let ex = st.exceptions.get_mut(&id).ok_or(MatchError::ExceptionNotFound(id))?;
        ex.resolved = true;
        ex.resolution = Some(record);
        Ok(())
    }

    async fn insert_history(&self, entry: HistoryEntry) -> Result<(), MatchError> {
        self.inner.write().unwrap().history.push(entry);
        Ok(())
    }

    async fn history(&self, exception_id: i64) -> Result<Vec<HistoryEntry>, MatchError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .history
            .iter()
            .filter(|h| h.exception_id == exception_id)
            .cloned()
            .collect())
    }

    async fn unresolved_for_match(
        &self,
        match_id: i64,
    ) -> Result<Vec<MatchException>, MatchError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .exceptions
            .values()
            .filter(|e| e.match_id == match_id && !e.resolved)
            .cloned()
            .collect())
    }

    async fn due_unbreached(
        &self,
        company_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<MatchException>, MatchError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .exceptions
            .values()
            .filter(|e| {
                e.company_id == company_id
                    && !e.resolved
                    && !e.breached
                    && e.sla_deadline.map(|d| d <= now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn pending_for(
        &self,
        company_id: i64,
        user_id: i64,
        roles: &[String],
        filter: &PendingFilter,
    ) -> Result<Vec<MatchException>, MatchError> {
        let st = self.inner.read().unwrap();
        let mut out: Vec<MatchException> = st
            .exceptions
            .values()
            .filter(|e| e.company_id == company_id && !e.resolved)
            .filter(|e| {
                e.owner_user == Some(user_id)
                    || (!filter.mine_only
                        && e.owner_role
                            .as_deref()
                            .map(|r| roles.iter().any(|have| have == r))
                            .unwrap_or(false))
            })
            .filter(|e| filter.kind.map(|k| e.kind == k).unwrap_or(true))
            .filter(|e| filter.priority.map(|p| e.priority == p).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| {
                    let da = a.sla_deadline.unwrap_or(DateTime::<Utc>::MAX_UTC);
                    let db = b.sla_deadline.unwrap_or(DateTime::<Utc>::MAX_UTC);
                    da.cmp(&db)
                })
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(out)
    }

    async fn unresolved_for_company(
        &self,
        company_id: i64,
    ) -> Result<Vec<MatchException>, MatchError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .exceptions
            .values()
            .filter(|e| e.company_id == company_id && !e.resolved)
            .cloned()
            .collect())
    }
}
