//! Exception workflow scenarios: SLA breach, escalation, resolution and
//! the read-only query surfaces.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use invoice_match::models::{
    ExceptionAction, ExceptionField, ExceptionKind, HistoryAction, MatchException, PendingFilter,
    Priority, ResolutionRequest, SlaRule,
};
use invoice_match::store::ExceptionStore;
use invoice_match::{ExceptionWorkflow, MemoryStore, PriorityThresholds};

fn dec(v: i64) -> BigDecimal {
    BigDecimal::from(v)
}

fn exception(company_id: i64, kind: ExceptionKind, created_at: DateTime<Utc>) -> MatchException {
    MatchException {
        id: 0,
        match_id: 500,
        invoice_id: 1,
        company_id,
        kind,
        field: ExceptionField::Quantity,
        line_key: "A".to_string(),
        expected: dec(100),
        received: dec(80),
        impact: dec(200),
        priority: Priority::Normal,
        owner_user: Some(7),
        owner_role: Some("purchasing_analyst".to_string()),
        sla_deadline: None,
        breached: false,
        escalated_at: None,
        escalated_to: None,
        resolved: false,
        resolution: None,
        created_at,
    }
}

fn workflow(store: &MemoryStore) -> ExceptionWorkflow<MemoryStore> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    ExceptionWorkflow::new(store.clone(), PriorityThresholds::default())
}

#[tokio::test]
async fn sweep_escalates_a_breached_overdue_exception() {
    let store = MemoryStore::new();
    store.add_role_member(1, "purchasing_supervisor", 9);
    let now = Utc::now();

    // created well past the 48h escalate-after threshold, deadline long gone
    let mut ex = exception(1, ExceptionKind::QuantityVariance, now - Duration::hours(80));
    ex.sla_deadline = Some(now - Duration::hours(10));
    let id = store.insert_exception(ex);

    let outcome = workflow(&store).run_escalation_sweep(1, now).await.unwrap();
    assert_eq!(outcome.examined, 1);
    assert_eq!(outcome.breached, 1);
    assert_eq!(outcome.escalated, 1);

    let ex = store.exception(id).await.unwrap().unwrap();
    assert!(ex.breached);
    assert_eq!(ex.priority, Priority::Urgent);
    assert_eq!(ex.owner_user, Some(9));
    assert_eq!(ex.owner_role.as_deref(), Some("purchasing_supervisor"));
    assert_eq!(ex.escalated_to.as_deref(), Some("purchasing_supervisor"));
    assert_eq!(ex.escalated_at, Some(now));

    let history = store.history(id).await.unwrap();
    let escalations: Vec<_> = history
        .iter()
        .filter(|h| h.action == HistoryAction::Escalate)
        .collect();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].from_owner, Some(7));
    assert_eq!(escalations[0].to_owner, Some(9));
    assert_eq!(escalations[0].reason_code.as_deref(), Some("SLA_BREACH"));
}

#[tokio::test]
async fn sweep_is_idempotent_under_repeated_runs() {
    let store = MemoryStore::new();
    store.add_role_member(1, "purchasing_supervisor", 9);
    let now = Utc::now();

    let mut ex = exception(1, ExceptionKind::QuantityVariance, now - Duration::hours(80));
    ex.sla_deadline = Some(now - Duration::hours(10));
    let id = store.insert_exception(ex);

    let wf = workflow(&store);
    let first = wf.run_escalation_sweep(1, now).await.unwrap();
    let second = wf.run_escalation_sweep(1, now).await.unwrap();

    assert_eq!(first.breached, 1);
    assert_eq!(second.examined, 0);
    assert_eq!(second.breached, 0);
    assert_eq!(second.escalated, 0);

    let history = store.history(id).await.unwrap();
    assert_eq!(
        history.iter().filter(|h| h.action == HistoryAction::Escalate).count(),
        1
    );
}

#[tokio::test]
async fn breach_without_escalation_when_age_is_under_threshold() {
    let store = MemoryStore::new();
    store.add_role_member(1, "purchasing_supervisor", 9);
    let now = Utc::now();

    // deadline passed, but only 20h old: breach yes, escalate no
    let mut ex = exception(1, ExceptionKind::QuantityVariance, now - Duration::hours(20));
    ex.sla_deadline = Some(now - Duration::hours(1));
    let id = store.insert_exception(ex);

    let outcome = workflow(&store).run_escalation_sweep(1, now).await.unwrap();
    assert_eq!(outcome.breached, 1);
    assert_eq!(outcome.escalated, 0);

    let ex = store.exception(id).await.unwrap().unwrap();
    assert!(ex.breached);
    assert_eq!(ex.owner_user, Some(7));
    assert_eq!(ex.priority, Priority::Normal);
    assert!(ex.escalated_at.is_none());
}

#[tokio::test]
async fn escalation_threshold_counts_partial_hours() {
    let store = MemoryStore::new();
    store.add_role_member(1, "purchasing_supervisor", 9);
    let now = Utc::now();

    // 48h30m old: past the 48h threshold even without a full 49th hour
    let mut ex = exception(
        1,
        ExceptionKind::QuantityVariance,
        now - Duration::minutes(48 * 60 + 30),
    );
    ex.sla_deadline = Some(now - Duration::hours(1));
    let id = store.insert_exception(ex);

    let outcome = workflow(&store).run_escalation_sweep(1, now).await.unwrap();
    assert_eq!(outcome.breached, 1);
    assert_eq!(outcome.escalated, 1);

    let ex = store.exception(id).await.unwrap().unwrap();
    assert_eq!(ex.owner_user, Some(9));
    assert_eq!(ex.priority, Priority::Urgent);
}

#[tokio::test]
async fn sweep_honours_configured_sla_rule_without_escalation_role() {
    let store = MemoryStore::new();
    store.set_sla_rule(
        1,
        ExceptionKind::QuantityVariance,
        SlaRule {
            base_sla_hours: 12,
            owner_role: "purchasing_analyst".to_string(),
            escalate_after_hours: 24,
            escalate_to_role: None,
        },
    );
    let now = Utc::now();

    let mut ex = exception(1, ExceptionKind::QuantityVariance, now - Duration::hours(80));
    ex.sla_deadline = Some(now - Duration::hours(10));
    let id = store.insert_exception(ex);

    let outcome = workflow(&store).run_escalation_sweep(1, now).await.unwrap();
    assert_eq!(outcome.breached, 1);
    assert_eq!(outcome.escalated, 0, "no escalate-to role configured");

    let ex = store.exception(id).await.unwrap().unwrap();
    assert!(ex.breached);
    assert_eq!(ex.owner_user, Some(7));
}

#[tokio::test]
async fn resolution_is_monotonic() {
    let store = MemoryStore::new();
    let now = Utc::now();
    // a sibling keeps the match open so resolve() skips the match flip
    let id = store.insert_exception(exception(1, ExceptionKind::QuantityVariance, now));
    store.insert_exception(exception(1, ExceptionKind::PriceVariance, now));

    let wf = workflow(&store);
    let request = ResolutionRequest {
        action: ExceptionAction::ApproveDifference,
        reason_code: "OK_TO_PAY".to_string(),
        reason_text: None,
        adjusted_amount: None,
        note_reference: None,
    };

    let first = wf.resolve(id, request.clone(), 50).await.unwrap();
    assert!(first.success);

    let second = wf.resolve(id, request, 51).await.unwrap();
    assert!(!second.success);
    assert!(second.message.contains("already resolved"));

    let ex = store.exception(id).await.unwrap().unwrap();
    let resolution = ex.resolution.expect("resolution recorded");
    assert_eq!(resolution.resolved_by, 50, "second call left state unchanged");

    let history = store.history(id).await.unwrap();
    assert_eq!(
        history.iter().filter(|h| h.action == HistoryAction::Resolve).count(),
        1
    );
}

#[tokio::test]
async fn resolving_unknown_exception_is_a_hard_error() {
    let store = MemoryStore::new();
    let err = workflow(&store)
        .resolve(
            999,
            ResolutionRequest {
                action: ExceptionAction::CloseNoAction,
                reason_code: "X".to_string(),
                reason_text: None,
                adjusted_amount: None,
                note_reference: None,
            },
            1,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, invoice_match::MatchError::ExceptionNotFound(999)));
}

#[tokio::test]
async fn pending_queue_orders_by_priority_then_deadline_then_age() {
    let store = MemoryStore::new();
    store.add_role_member(1, "purchasing_analyst", 7);
    let now = Utc::now();

    let mut normal = exception(1, ExceptionKind::QuantityVariance, now - Duration::hours(9));
    normal.sla_deadline = Some(now + Duration::hours(5));
    let normal_id = store.insert_exception(normal);

    let mut urgent_late = exception(1, ExceptionKind::PriceVariance, now - Duration::hours(1));
    urgent_late.priority = Priority::Urgent;
    urgent_late.sla_deadline = Some(now + Duration::hours(50));
    let urgent_late_id = store.insert_exception(urgent_late);

    // unassigned but owned by a role the user holds
    let mut urgent_soon = exception(1, ExceptionKind::PriceVariance, now - Duration::hours(2));
    urgent_soon.priority = Priority::Urgent;
    urgent_soon.owner_user = None;
    urgent_soon.sla_deadline = Some(now + Duration::hours(1));
    let urgent_soon_id = store.insert_exception(urgent_soon);

    // other company, never visible
    store.insert_exception(exception(2, ExceptionKind::PriceVariance, now));

    let wf = workflow(&store);
    let queue = wf
        .pending_for_user(1, 7, PendingFilter::default())
        .await
        .unwrap();
    let ids: Vec<i64> = queue.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![urgent_soon_id, urgent_late_id, normal_id]);

    let mine = wf
        .pending_for_user(
            1,
            7,
            PendingFilter {
                mine_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let ids: Vec<i64> = mine.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![urgent_late_id, normal_id]);

    let only_quantity = wf
        .pending_for_user(
            1,
            7,
            PendingFilter {
                kind: Some(ExceptionKind::QuantityVariance),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(only_quantity.len(), 1);
    assert_eq!(only_quantity[0].id, normal_id);
}

#[tokio::test]
async fn statistics_aggregate_open_exceptions() {
    let store = MemoryStore::new();
    let now = Utc::now();

    let mut a = exception(1, ExceptionKind::QuantityVariance, now - Duration::hours(2));
    a.impact = dec(1_500);
    store.insert_exception(a);

    let mut b = exception(1, ExceptionKind::MissingReceipt, now - Duration::hours(4));
    b.impact = dec(500);
    b.priority = Priority::Urgent;
    b.breached = true;
    store.insert_exception(b);

    let mut resolved = exception(1, ExceptionKind::PriceVariance, now - Duration::hours(90));
    resolved.resolved = true;
    store.insert_exception(resolved);

    let stats = workflow(&store).statistics(1, now).await.unwrap();
    assert_eq!(stats.open_total, 2);
    assert_eq!(stats.by_kind.get("QUANTITY_VARIANCE"), Some(&1));
    assert_eq!(stats.by_kind.get("MISSING_RECEIPT"), Some(&1));
    assert_eq!(stats.by_priority.get("NORMAL"), Some(&1));
    assert_eq!(stats.by_priority.get("URGENT"), Some(&1));
    assert_eq!(stats.breached, 1);
    assert_eq!(stats.total_impact, dec(2_000));
    assert!((stats.mean_age_hours - 3.0).abs() < 0.05);
}
