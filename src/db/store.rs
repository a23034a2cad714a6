//! PostgreSQL backend for the store traits.
//!
//! Runtime queries only; row structs decode the f-prefixed columns and are
//! converted to the domain types, with closed-enum columns stored as TEXT.
//!
//! Tables: t_ap_invoice, t_ap_invoice_line, t_ap_receipt, t_ap_receipt_line,
//! t_ap_tolerance, t_ap_sla_rule, t_ap_role_member, t_ap_match_result,
//! t_ap_match_line, t_ap_exception, t_ap_exception_history, t_ap_audit_log.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};

use crate::error::MatchError;
use crate::models::{
    AuditEntry, ExceptionAction, ExceptionField, ExceptionKind, GlobalStatus, GoodsReceipt,
    HistoryAction, HistoryEntry, Invoice, InvoiceLine, LineStatus, MatchException, MatchLine,
    MatchResult, MatchSummary, PayApproval, PendingFilter, Priority, ReceiptLine, ReceiptStatus,
    ResolutionRecord, SlaRule, ToleranceConfig,
};
use crate::store::{
    AuditSink, ConfigStore, ExceptionStore, InvoiceStore, MatchStore, ReceiptStore, RoleDirectory,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode<T>(value: Option<T>, what: &str, raw: &str) -> Result<T, MatchError> {
    value.ok_or_else(|| MatchError::Decode(format!("bad {what}: {raw:?}")))
}

#[derive(FromRow)]
struct InvoiceRow {
    fid: i64,
    fcompanyid: i64,
    fsupplier: String,
    fvalidated: bool,
    fmatchstatus: String,
    fmatchcheckedat: Option<DateTime<Utc>>,
    fmatchblockreason: Option<String>,
    fpayapproval: String,
}

#[derive(FromRow)]
struct InvoiceLineRow {
    fid: i64,
    fdescription: String,
    fitemcode: Option<String>,
    fqty: BigDecimal,
    funitprice: BigDecimal,
    fdiscountpct: Option<BigDecimal>,
    fdiscountamount: Option<BigDecimal>,
    fdiscountedprice: Option<BigDecimal>,
}

#[derive(FromRow)]
struct ReceiptRow {
    fid: i64,
    finvoiceid: i64,
    fstatus: String,
}

#[derive(FromRow)]
struct ReceiptLineRow {
    freceiptid: i64,
    fitemcode: Option<String>,
    fdescription: String,
    fqty: BigDecimal,
    frefprice: BigDecimal,
}

#[derive(FromRow)]
struct ToleranceRow {
    fqtypct: BigDecimal,
    fpricepct: BigDecimal,
    fallowexcess: bool,
    fallowpaywithoutmatch: bool,
    fblockpayonwarning: bool,
}

#[derive(FromRow)]
struct SlaRuleRow {
    fbasehours: i64,
    fownerrole: String,
    fescalateafter: i64,
    fescalatetorole: Option<String>,
}

#[derive(FromRow)]
struct MatchResultRow {
    fid: i64,
    finvoiceid: i64,
    fglobalstatus: String,
    ftotal: i64,
    fok: i64,
    fwarning: i64,
    fblocked: i64,
    fmissing: i64,
    freceiptids: Vec<i64>,
    fcheckedat: DateTime<Utc>,
}

#[derive(FromRow)]
struct MatchLineRow {
    flinekey: String,
    fdescription: String,
    finvoicelineid: Option<i64>,
    finvoicedqty: BigDecimal,
    freceivedqty: BigDecimal,
    feffectiveprice: BigDecimal,
    freceivedprice: Option<BigDecimal>,
    fdiffqty: BigDecimal,
    fdiffpct: BigDecimal,
    fdiffprice: Option<BigDecimal>,
    fpricepct: Option<BigDecimal>,
    fstatus: String,
    freason: String,
}

#[derive(FromRow)]
struct ExceptionRow {
    fid: i64,
    fmatchid: i64,
    finvoiceid: i64,
    fcompanyid: i64,
    fkind: String,
    ffield: String,
    flinekey: String,
    fexpected: BigDecimal,
    freceived: BigDecimal,
    fimpact: BigDecimal,
    fpriority: String,
    fowneruser: Option<i64>,
    fownerrole: Option<String>,
    fsladeadline: Option<DateTime<Utc>>,
    fbreached: bool,
    fescalatedat: Option<DateTime<Utc>>,
    fescalatedto: Option<String>,
    fresolved: bool,
    fresaction: Option<String>,
    freasoncode: Option<String>,
    freasontext: Option<String>,
    fadjustedamount: Option<BigDecimal>,
    fnoteref: Option<String>,
    fresolvedby: Option<i64>,
    fresolvedat: Option<DateTime<Utc>>,
    fcreatedat: DateTime<Utc>,
}

#[derive(FromRow)]
struct HistoryRow {
    fexceptionid: i64,
    faction: String,
    ffromowner: Option<i64>,
    ftoowner: Option<i64>,
    ffromstatus: Option<String>,
    ftostatus: Option<String>,
    fdisposition: Option<String>,
    freasoncode: Option<String>,
    factor: Option<i64>,
    fat: DateTime<Utc>,
}

impl ExceptionRow {
    fn into_domain(self) -> Result<MatchException, MatchError> {
        let kind = decode(ExceptionKind::parse(&self.fkind), "exception kind", &self.fkind)?;
        let field = decode(ExceptionField::parse(&self.ffield), "exception field", &self.ffield)?;
        let priority = decode(Priority::parse(&self.fpriority), "priority", &self.fpriority)?;
        let resolution = match (&self.fresaction, self.fresolvedby, self.fresolvedat) {
            (Some(action), Some(by), Some(at)) => Some(ResolutionRecord {
                action: decode(ExceptionAction::parse(action), "resolution action", action)?,
                reason_code: self.freasoncode.clone().unwrap_or_default(),
                reason_text: self.freasontext.clone(),
                adjusted_amount: self.fadjustedamount.clone(),
                note_reference: self.fnoteref.clone(),
                resolved_by: by,
                resolved_at: at,
            }),
            _ => None,
        };
        Ok(MatchException {
            id: self.fid,
            match_id: self.fmatchid,
            invoice_id: self.finvoiceid,
            company_id: self.fcompanyid,
            kind,
            field,
            line_key: self.flinekey,
            expected: self.fexpected,
            received: self.freceived,
            impact: self.fimpact,
            priority,
            owner_user: self.fowneruser,
            owner_role: self.fownerrole,
            sla_deadline: self.fsladeadline,
            breached: self.fbreached,
            escalated_at: self.fescalatedat,
            escalated_to: self.fescalatedto,
            resolved: self.fresolved,
            resolution,
            created_at: self.fcreatedat,
        })
    }
}

impl MatchLineRow {
    fn into_domain(self) -> Result<MatchLine, MatchError> {
        let status = decode(LineStatus::parse(&self.fstatus), "line status", &self.fstatus)?;
        Ok(MatchLine {
            line_key: self.flinekey,
            description: self.fdescription,
            invoice_line_id: self.finvoicelineid,
            invoiced_qty: self.finvoicedqty,
            received_qty: self.freceivedqty,
            effective_price: self.feffectiveprice,
            received_price: self.freceivedprice,
            diff_qty: self.fdiffqty,
            diff_pct: self.fdiffpct,
            diff_price: self.fdiffprice,
            price_pct: self.fpricepct,
            status,
            reason: self.freason,
        })
    }
}

const EXCEPTION_COLUMNS: &str = "fid, fmatchid, finvoiceid, fcompanyid, fkind, ffield, flinekey, \
     fexpected, freceived, fimpact, fpriority, fowneruser, fownerrole, fsladeadline, fbreached, \
     fescalatedat, fescalatedto, fresolved, fresaction, freasoncode, freasontext, \
     fadjustedamount, fnoteref, fresolvedby, fresolvedat, fcreatedat";

impl PgStore {
    async fn fetch_exceptions(
        &self,
        qb: &mut QueryBuilder<'_, Postgres>,
    ) -> Result<Vec<MatchException>, MatchError> {
        let rows: Vec<ExceptionRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ExceptionRow::into_domain).collect()
    }
}

impl InvoiceStore for PgStore {
    async fn invoice(&self, id: i64) -> Result<Option<Invoice>, MatchError> {
        let Some(row) = sqlx::query_as::<_, InvoiceRow>(
            r#"
            SELECT fid, fcompanyid, fsupplier, fvalidated, fmatchstatus,
                   fmatchcheckedat, fmatchblockreason, fpayapproval
            FROM t_ap_invoice
            WHERE fid = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let line_rows = sqlx::query_as::<_, InvoiceLineRow>(
            r#"
            SELECT fid, fdescription, fitemcode, fqty, funitprice,
                   fdiscountpct, fdiscountamount, fdiscountedprice
            FROM t_ap_invoice_line
            WHERE finvoiceid = $1
            ORDER BY fid
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let match_status = decode(
            GlobalStatus::parse(&row.fmatchstatus),
            "match status",
            &row.fmatchstatus,
        )?;
        let pay_approval = decode(
            PayApproval::parse(&row.fpayapproval),
            "pay approval",
            &row.fpayapproval,
        )?;

        Ok(Some(Invoice {
            id: row.fid,
            company_id: row.fcompanyid,
            supplier: row.fsupplier,
            validated: row.fvalidated,
            lines: line_rows
                .into_iter()
                .map(|l| InvoiceLine {
                    id: l.fid,
                    description: l.fdescription,
                    item_code: l.fitemcode,
                    quantity: l.fqty,
                    unit_price: l.funitprice,
                    discount_pct: l.fdiscountpct,
                    discount_amount: l.fdiscountamount,
                    discounted_price: l.fdiscountedprice,
                })
                .collect(),
            match_status,
            match_checked_at: row.fmatchcheckedat,
            match_block_reason: row.fmatchblockreason,
            pay_approval,
        }))
    }

    async fn update_match_fields(
        &self,
        id: i64,
        status: GlobalStatus,
        checked_at: DateTime<Utc>,
        block_reason: Option<String>,
    ) -> Result<(), MatchError> {
        sqlx::query(
            r#"
            UPDATE t_ap_invoice
            SET fmatchstatus = $2, fmatchcheckedat = $3, fmatchblockreason = $4
            WHERE fid = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(checked_at)
        .bind(block_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_pay_approval_on_block(&self, id: i64) -> Result<(), MatchError> {
        // manual APPROVED/REJECTED must survive
        sqlx::query(
            r#"
            UPDATE t_ap_invoice
            SET fpayapproval = 'BLOCKED_BY_MATCH'
            WHERE fid = $1 AND fpayapproval NOT IN ('APPROVED', 'REJECTED')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl ReceiptStore for PgStore {
    async fn confirmed_receipts(&self, invoice_id: i64) -> Result<Vec<GoodsReceipt>, MatchError> {
        let receipt_rows = sqlx::query_as::<_, ReceiptRow>(
            r#"
            SELECT fid, finvoiceid, fstatus
            FROM t_ap_receipt
            WHERE finvoiceid = $1 AND fstatus = 'CONFIRMED'
            ORDER BY fid
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        if receipt_rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = receipt_rows.iter().map(|r| r.fid).collect();
        let line_rows = sqlx::query_as::<_, ReceiptLineRow>(
            r#"
            SELECT freceiptid, fitemcode, fdescription, fqty, frefprice
            FROM t_ap_receipt_line
            WHERE freceiptid = ANY($1)
            ORDER BY fid
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut receipts: Vec<GoodsReceipt> = receipt_rows
            .into_iter()
            .map(|r| {
                let status =
                    decode(ReceiptStatus::parse(&r.fstatus), "receipt status", &r.fstatus)?;
                Ok(GoodsReceipt {
                    id: r.fid,
                    invoice_id: r.finvoiceid,
                    status,
                    lines: Vec::new(),
                })
            })
            .collect::<Result<_, MatchError>>()?;
        for line in line_rows {
            if let Some(receipt) = receipts.iter_mut().find(|r| r.id == line.freceiptid) {
                receipt.lines.push(ReceiptLine {
                    item_code: line.fitemcode,
                    description: line.fdescription,
                    quantity: line.fqty,
                    reference_price: line.frefprice,
                });
            }
        }
        Ok(receipts)
    }
}

impl ConfigStore for PgStore {
    async fn tolerance(&self, company_id: i64) -> Result<Option<ToleranceConfig>, MatchError> {
        let row = sqlx::query_as::<_, ToleranceRow>(
            r#"
            SELECT fqtypct, fpricepct, fallowexcess, fallowpaywithoutmatch, fblockpayonwarning
            FROM t_ap_tolerance
            WHERE fcompanyid = $1
            "#,
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ToleranceConfig {
            quantity_pct: r.fqtypct,
            price_pct: r.fpricepct,
            allow_excess_receipt: r.fallowexcess,
            allow_pay_without_match: r.fallowpaywithoutmatch,
            block_pay_on_warning: r.fblockpayonwarning,
        }))
    }

    async fn sla_rule(
        &self,
        company_id: i64,
        kind: ExceptionKind,
    ) -> Result<Option<SlaRule>, MatchError> {
        let row = sqlx::query_as::<_, SlaRuleRow>(
            r#"
            SELECT fbasehours, fownerrole, fescalateafter, fescalatetorole
            FROM t_ap_sla_rule
            WHERE fcompanyid = $1 AND fkind = $2
            "#,
        )
        .bind(company_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| SlaRule {
            base_sla_hours: r.fbasehours,
            owner_role: r.fownerrole,
            escalate_after_hours: r.fescalateafter,
            escalate_to_role: r.fescalatetorole,
        }))
    }
}

impl RoleDirectory for PgStore {
    async fn active_users_in_role(
        &self,
        company_id: i64,
        role: &str,
    ) -> Result<Vec<i64>, MatchError> {
        let users: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT fuserid
            FROM t_ap_role_member
            WHERE fcompanyid = $1 AND frole = $2 AND factive
            ORDER BY fuserid
            "#,
        )
        .bind(company_id)
        .bind(role)
        .fetch_all(&self.pool)
        .await?;
        Ok(users.into_iter().map(|(id,)| id).collect())
    }

    async fn roles_of(&self, company_id: i64, user_id: i64) -> Result<Vec<String>, MatchError> {
        let roles: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT frole
            FROM t_ap_role_member
            WHERE fcompanyid = $1 AND fuserid = $2 AND factive
            ORDER BY frole
            "#,
        )
        .bind(company_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles.into_iter().map(|(r,)| r).collect())
    }
}

impl AuditSink for PgStore {
    async fn append_audit(&self, entry: AuditEntry) -> Result<(), MatchError> {
        sqlx::query(
            r#"
            INSERT INTO t_ap_audit_log (fentity, fentityid, faction, fpayload, fcompanyid, fuserid, fat)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.entity)
        .bind(entry.entity_id)
        .bind(entry.action)
        .bind(entry.payload)
        .bind(entry.company_id)
        .bind(entry.user_id)
        .bind(entry.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl MatchStore for PgStore {
    async fn match_result(&self, invoice_id: i64) -> Result<Option<MatchResult>, MatchError> {
        let Some(row) = sqlx::query_as::<_, MatchResultRow>(
            r#"
            SELECT fid, finvoiceid, fglobalstatus, ftotal, fok, fwarning, fblocked, fmissing,
                   freceiptids, fcheckedat
            FROM t_ap_match_result
            WHERE finvoiceid = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let line_rows = sqlx::query_as::<_, MatchLineRow>(
            r#"
            SELECT flinekey, fdescription, finvoicelineid, finvoicedqty, freceivedqty,
                   feffectiveprice, freceivedprice, fdiffqty, fdiffpct, fdiffprice, fpricepct,
                   fstatus, freason
            FROM t_ap_match_line
            WHERE fmatchid = $1
            ORDER BY fid
            "#,
        )
        .bind(row.fid)
        .fetch_all(&self.pool)
        .await?;

        let global_status = decode(
            GlobalStatus::parse(&row.fglobalstatus),
            "global status",
            &row.fglobalstatus,
        )?;
        Ok(Some(MatchResult {
            id: row.fid,
            invoice_id: row.finvoiceid,
            global_status,
            summary: MatchSummary {
                total: row.ftotal as usize,
                ok: row.fok as usize,
                warning: row.fwarning as usize,
                blocked: row.fblocked as usize,
                missing: row.fmissing as usize,
            },
            receipt_ids: row.freceiptids,
            checked_at: row.fcheckedat,
            lines: line_rows
                .into_iter()
                .map(MatchLineRow::into_domain)
                .collect::<Result<_, _>>()?,
        }))
    }

    async fn replace_match(
        &self,
        invoice_id: i64,
        mut result: MatchResult,
        exceptions: Vec<MatchException>,
    ) -> Result<(MatchResult, Vec<MatchException>), MatchError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT fid FROM t_ap_match_result WHERE finvoiceid = $1 FOR UPDATE")
                .bind(invoice_id)
                .fetch_optional(&mut *tx)
                .await?;

        let match_id = match existing {
            Some((id,)) => {
                sqlx::query(
                    r#"
                    UPDATE t_ap_match_result
                    SET fglobalstatus = $2, ftotal = $3, fok = $4, fwarning = $5, fblocked = $6,
                        fmissing = $7, freceiptids = $8, fcheckedat = $9
                    WHERE fid = $1
                    "#,
                )
                .bind(id)
                .bind(result.global_status.as_str())
                .bind(result.summary.total as i64)
                .bind(result.summary.ok as i64)
                .bind(result.summary.warning as i64)
                .bind(result.summary.blocked as i64)
                .bind(result.summary.missing as i64)
                .bind(&result.receipt_ids)
                .bind(result.checked_at)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM t_ap_match_line WHERE fmatchid = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            None => {
                let (id,): (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO t_ap_match_result
                        (finvoiceid, fglobalstatus, ftotal, fok, fwarning, fblocked, fmissing,
                         freceiptids, fcheckedat)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    RETURNING fid
                    "#,
                )
                .bind(invoice_id)
                .bind(result.global_status.as_str())
                .bind(result.summary.total as i64)
                .bind(result.summary.ok as i64)
                .bind(result.summary.warning as i64)
                .bind(result.summary.blocked as i64)
                .bind(result.summary.missing as i64)
                .bind(&result.receipt_ids)
                .bind(result.checked_at)
                .fetch_one(&mut *tx)
                .await?;
                id
            }
        };

        if !result.lines.is_empty() {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO t_ap_match_line (
                    fmatchid, flinekey, fdescription, finvoicelineid, finvoicedqty, freceivedqty,
                    feffectiveprice, freceivedprice, fdiffqty, fdiffpct, fdiffprice, fpricepct,
                    fstatus, freason
                ) ",
            );
            qb.push_values(&result.lines, |mut b, line| {
                b.push_bind(match_id)
                    .push_bind(&line.line_key)
                    .push_bind(&line.description)
                    .push_bind(line.invoice_line_id)
                    .push_bind(&line.invoiced_qty)
                    .push_bind(&line.received_qty)
                    .push_bind(&line.effective_price)
                    .push_bind(&line.received_price)
                    .push_bind(&line.diff_qty)
                    .push_bind(&line.diff_pct)
                    .push_bind(&line.diff_price)
                    .push_bind(&line.price_pct)
                    .push_bind(line.status.as_str())
                    .push_bind(&line.reason);
            });
            qb.build().execute(&mut *tx).await?;
        }

        // resolved exceptions survive the replace by their stable key
        let resolved_keys: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT fkind, ffield, flinekey
            FROM t_ap_exception
            WHERE fmatchid = $1 AND fresolved
            "#,
        )
        .bind(match_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM t_ap_exception_history
            WHERE fexceptionid IN (
                SELECT fid FROM t_ap_exception WHERE fmatchid = $1 AND NOT fresolved
            )
            "#,
        )
        .bind(match_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM t_ap_exception WHERE fmatchid = $1 AND NOT fresolved")
            .bind(match_id)
            .execute(&mut *tx)
            .await?;

        let mut inserted = Vec::new();
        for mut ex in exceptions {
            let keep = resolved_keys.iter().any(|(kind, field, key)| {
                kind == ex.kind.as_str() && field == ex.field.as_str() && *key == ex.line_key
            });
            if keep {
                continue;
            }
            let (id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO t_ap_exception
                    (fmatchid, finvoiceid, fcompanyid, fkind, ffield, flinekey, fexpected,
                     freceived, fimpact, fpriority, fbreached, fresolved, fcreatedat)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE, FALSE, $11)
                RETURNING fid
                "#,
            )
            .bind(match_id)
            .bind(invoice_id)
            .bind(ex.company_id)
            .bind(ex.kind.as_str())
            .bind(ex.field.as_str())
            .bind(&ex.line_key)
            .bind(&ex.expected)
            .bind(&ex.received)
            .bind(&ex.impact)
            .bind(ex.priority.as_str())
            .bind(ex.created_at)
            .fetch_one(&mut *tx)
            .await?;
            ex.id = id;
            ex.match_id = match_id;
            ex.invoice_id = invoice_id;
            inserted.push(ex);
        }

        tx.commit().await?;

        result.id = match_id;
        result.invoice_id = invoice_id;
        Ok((result, inserted))
    }

    async fn resolve_match(&self, match_id: i64) -> Result<(), MatchError> {
        let done = sqlx::query("UPDATE t_ap_match_result SET fglobalstatus = 'RESOLVED' WHERE fid = $1")
            .bind(match_id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(MatchError::MatchResultNotFound(match_id));
        }
        Ok(())
    }
}

impl ExceptionStore for PgStore {
    async fn exception(&self, id: i64) -> Result<Option<MatchException>, MatchError> {
        let row = sqlx::query_as::<_, ExceptionRow>(&format!(
            "SELECT {EXCEPTION_COLUMNS} FROM t_ap_exception WHERE fid = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ExceptionRow::into_domain).transpose()
    }

    async fn set_assignment(
        &self,
        id: i64,
        owner_user: Option<i64>,
        owner_role: &str,
        deadline: DateTime<Utc>,
    ) -> Result<(), MatchError> {
        sqlx::query(
            r#"
            UPDATE t_ap_exception
            SET fowneruser = $2, fownerrole = $3, fsladeadline = $4
            WHERE fid = $1
            "#,
        )
        .bind(id)
        .bind(owner_user)
        .bind(owner_role)
        .bind(deadline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_priority(&self, id: i64, priority: Priority) -> Result<(), MatchError> {
        sqlx::query("UPDATE t_ap_exception SET fpriority = $2 WHERE fid = $1")
            .bind(id)
            .bind(priority.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_breached(&self, id: i64) -> Result<bool, MatchError> {
        // single compare-and-set; concurrent sweeps race here and only one wins
        let done = sqlx::query(
            r#"
            UPDATE t_ap_exception
            SET fbreached = TRUE
            WHERE fid = $1 AND NOT fbreached AND NOT fresolved
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn mark_escalated(
        &self,
        id: i64,
        owner_user: Option<i64>,
        role: &str,
        at: DateTime<Utc>,
    ) -> Result<(), MatchError> {
        sqlx::query(
            r#"
            UPDATE t_ap_exception
            SET fowneruser = $2, fownerrole = $3, fescalatedat = $4, fescalatedto = $3
            WHERE fid = $1
            "#,
        )
        .bind(id)
        .bind(owner_user)
        .bind(role)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_resolved(&self, id: i64, record: ResolutionRecord) -> Result<(), MatchError> {
        sqlx::query(
            r#"
            UPDATE t_ap_exception
            SET fresolved = TRUE, fresaction = $2, freasoncode = $3, freasontext = $4,
                fadjustedamount = $5, fnoteref = $6, fresolvedby = $7, fresolvedat = $8
            WHERE fid = $1
            "#,
        )
        .bind(id)
        .bind(record.action.as_str())
        .bind(record.reason_code)
        .bind(record.reason_text)
        .bind(record.adjusted_amount)
        .bind(record.note_reference)
        .bind(record.resolved_by)
        .bind(record.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_history(&self, entry: HistoryEntry) -> Result<(), MatchError> {
        sqlx::query(
            r#"
            INSERT INTO t_ap_exception_history
                (fexceptionid, faction, ffromowner, ftoowner, ffromstatus, ftostatus,
                 fdisposition, freasoncode, factor, fat)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.exception_id)
        .bind(entry.action.as_str())
        .bind(entry.from_owner)
        .bind(entry.to_owner)
        .bind(entry.from_status)
        .bind(entry.to_status)
        .bind(entry.disposition.map(|d| d.as_str()))
        .bind(entry.reason_code)
        .bind(entry.actor)
        .bind(entry.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn history(&self, exception_id: i64) -> Result<Vec<HistoryEntry>, MatchError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT fexceptionid, faction, ffromowner, ftoowner, ffromstatus, ftostatus,
                   fdisposition, freasoncode, factor, fat
            FROM t_ap_exception_history
            WHERE fexceptionid = $1
            ORDER BY fat, fid
            "#,
        )
        .bind(exception_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                let action = decode(HistoryAction::parse(&r.faction), "history action", &r.faction)?;
                let disposition = r
                    .fdisposition
                    .as_deref()
                    .map(|d| decode(ExceptionAction::parse(d), "disposition", d))
                    .transpose()?;
                Ok(HistoryEntry {
                    exception_id: r.fexceptionid,
                    action,
                    from_owner: r.ffromowner,
                    to_owner: r.ftoowner,
                    from_status: r.ffromstatus,
                    to_status: r.ftostatus,
                    disposition,
                    reason_code: r.freasoncode,
                    actor: r.factor,
                    at: r.fat,
                })
            })
            .collect()
    }

    async fn unresolved_for_match(
        &self,
        match_id: i64,
    ) -> Result<Vec<MatchException>, MatchError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {EXCEPTION_COLUMNS} FROM t_ap_exception WHERE NOT fresolved AND fmatchid = "
        ));
        qb.push_bind(match_id);
        self.fetch_exceptions(&mut qb).await
    }

    async fn due_unbreached(
        &self,
        company_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<MatchException>, MatchError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {EXCEPTION_COLUMNS} FROM t_ap_exception \
             WHERE NOT fresolved AND NOT fbreached AND fcompanyid = "
        ));
        qb.push_bind(company_id);
        qb.push(" AND fsladeadline IS NOT NULL AND fsladeadline <= ");
        qb.push_bind(now);
        self.fetch_exceptions(&mut qb).await
    }

    async fn pending_for(
        &self,
        company_id: i64,
        user_id: i64,
        roles: &[String],
        filter: &PendingFilter,
    ) -> Result<Vec<MatchException>, MatchError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {EXCEPTION_COLUMNS} FROM t_ap_exception \
             WHERE NOT fresolved AND fcompanyid = "
        ));
        qb.push_bind(company_id);

        qb.push(" AND (fowneruser = ");
        qb.push_bind(user_id);
        if !filter.mine_only {
            qb.push(" OR fownerrole = ANY(");
            qb.push_bind(roles.to_vec());
            qb.push(")");
        }
        qb.push(")");

        if let Some(kind) = filter.kind {
            qb.push(" AND fkind = ");
            qb.push_bind(kind.as_str());
        }
        if let Some(priority) = filter.priority {
            qb.push(" AND fpriority = ");
            qb.push_bind(priority.as_str());
        }

        qb.push(
            " ORDER BY CASE fpriority \
                WHEN 'URGENT' THEN 3 WHEN 'HIGH' THEN 2 WHEN 'NORMAL' THEN 1 ELSE 0 END DESC, \
              fsladeadline ASC NULLS LAST, fcreatedat ASC",
        );
        self.fetch_exceptions(&mut qb).await
    }

    async fn unresolved_for_company(
        &self,
        company_id: i64,
    ) -> Result<Vec<MatchException>, MatchError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {EXCEPTION_COLUMNS} FROM t_ap_exception WHERE NOT fresolved AND fcompanyid = "
        ));
        qb.push_bind(company_id);
        self.fetch_exceptions(&mut qb).await
    }
}
