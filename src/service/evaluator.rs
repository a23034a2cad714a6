//! Pure three-way comparison algorithm.
//!
//! Compares an invoice's lines against the aggregate of all confirmed
//! goods receipts and produces a line-by-line and document-level verdict.
//! No I/O; persistence is the orchestrator's job.

use bigdecimal::{BigDecimal, Zero};
use indexmap::IndexMap;

use crate::models::{
    GlobalStatus, GoodsReceipt, InvoiceLine, LineStatus, MatchLine, MatchSummary, ToleranceConfig,
};

/// Output of one evaluator run.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub global_status: GlobalStatus,
    pub lines: Vec<MatchLine>,
    pub summary: MatchSummary,
}

/// Received quantities and reference price, aggregated per matching key
/// across all confirmed receipts.
struct ReceiptAggregate {
    description: String,
    quantity: BigDecimal,
    // quantity-weighted price accumulator over lines with price > 0
    priced_qty: BigDecimal,
    price_value: BigDecimal,
    first_price: Option<BigDecimal>,
    matched: bool,
}

impl ReceiptAggregate {
    fn reference_price(&self) -> Option<BigDecimal> {
        if self.priced_qty > BigDecimal::zero() {
            Some(&self.price_value / &self.priced_qty)
        } else {
            self.first_price.clone()
        }
    }
}

/// Matching key: catalog item code when present, else the normalized
/// description (lower-cased, trimmed, internal whitespace collapsed).
pub fn line_key(item_code: Option<&str>, description: &str) -> String {
    match item_code {
        Some(code) if !code.trim().is_empty() => code.trim().to_string(),
        _ => normalize_description(description),
    }
}

fn normalize_description(description: &str) -> String {
    description
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Unit price net of any discount: percentage first, then fixed amount,
/// then a precomputed discounted price. Returns the price and whether a
/// discount was applied.
pub fn effective_price(line: &InvoiceLine) -> (BigDecimal, bool) {
    if let Some(pct) = &line.discount_pct {
        let factor = BigDecimal::from(1) - pct / BigDecimal::from(100);
        return (&line.unit_price * factor, true);
    }
    if let Some(amount) = &line.discount_amount {
        return (&line.unit_price - amount, true);
    }
    if let Some(discounted) = &line.discounted_price {
        return (discounted.clone(), true);
    }
    (line.unit_price.clone(), false)
}

fn hundred() -> BigDecimal {
    BigDecimal::from(100)
}

/// `diff / base × 100` at scale 2; a zero base yields 0 rather than failing.
fn pct_of(diff: &BigDecimal, base: &BigDecimal) -> BigDecimal {
    if base.is_zero() {
        return BigDecimal::zero();
    }
    ((diff / base) * hundred()).round(2)
}

fn raise_to_warning(global: &mut GlobalStatus) {
    if *global == GlobalStatus::Ok {
        *global = GlobalStatus::Warning;
    }
}

pub fn evaluate(
    lines: &[InvoiceLine],
    receipts: &[GoodsReceipt],
    tol: &ToleranceConfig,
) -> Evaluation {
    // No confirmed receipts: every line is missing its receipt and the
    // document stays pending rather than blocked.
    if receipts.is_empty() {
        let out: Vec<MatchLine> = lines
            .iter()
            .map(|line| {
                let (price, _) = effective_price(line);
                MatchLine {
                    line_key: line_key(line.item_code.as_deref(), &line.description),
                    description: line.description.clone(),
                    invoice_line_id: Some(line.id),
                    invoiced_qty: line.quantity.clone(),
                    received_qty: BigDecimal::zero(),
                    effective_price: price,
                    received_price: None,
                    diff_qty: line.quantity.clone(),
                    diff_pct: hundred(),
                    diff_price: None,
                    price_pct: None,
                    status: LineStatus::MissingReceipt,
                    reason: "no confirmed goods receipt".to_string(),
                }
            })
            .collect();
        let summary = summarize(&out);
        return Evaluation {
            global_status: GlobalStatus::Pending,
            lines: out,
            summary,
        };
    }

    // Aggregate received quantity and reference price per key, in
    // first-seen order so over-received lines come out deterministically.
    let mut aggregates: IndexMap<String, ReceiptAggregate> = IndexMap::new();
    for receipt in receipts {
        for rl in &receipt.lines {
            let key = line_key(rl.item_code.as_deref(), &rl.description);
            let agg = aggregates.entry(key).or_insert_with(|| ReceiptAggregate {
                description: rl.description.clone(),
                quantity: BigDecimal::zero(),
                priced_qty: BigDecimal::zero(),
                price_value: BigDecimal::zero(),
                first_price: None,
                matched: false,
            });
            agg.quantity += &rl.quantity;
            if rl.reference_price > BigDecimal::zero() {
                if rl.quantity > BigDecimal::zero() {
                    agg.priced_qty += &rl.quantity;
                    agg.price_value += &rl.quantity * &rl.reference_price;
                }
                if agg.first_price.is_none() {
                    agg.first_price = Some(rl.reference_price.clone());
                }
            }
        }
    }

    let mut global = GlobalStatus::Ok;
    let mut out: Vec<MatchLine> = Vec::with_capacity(lines.len());

    for line in lines {
        let key = line_key(line.item_code.as_deref(), &line.description);
        let (price, discount_applied) = effective_price(line);

        let agg = match aggregates.get_mut(&key) {
            Some(agg) if !agg.quantity.is_zero() => agg,
            _ => {
                global = GlobalStatus::Blocked;
                out.push(MatchLine {
                    line_key: key,
                    description: line.description.clone(),
                    invoice_line_id: Some(line.id),
                    invoiced_qty: line.quantity.clone(),
                    received_qty: BigDecimal::zero(),
                    effective_price: price,
                    received_price: None,
                    diff_qty: line.quantity.clone(),
                    diff_pct: hundred(),
                    diff_price: None,
                    price_pct: None,
                    status: LineStatus::MissingReceipt,
                    reason: "invoiced line has no received counterpart".to_string(),
                });
                continue;
            }
        };
        agg.matched = true;

        let received = agg.quantity.clone();
        let reference_price = agg.reference_price();

        let diff_qty = (&received - &line.quantity).abs();
        let diff_pct = pct_of(&diff_qty, &line.quantity);

        let mut status;
        let mut reasons: Vec<String> = Vec::new();

        if diff_pct.is_zero() {
            status = LineStatus::Ok;
        } else if diff_pct <= tol.quantity_pct {
            status = LineStatus::Warning;
            raise_to_warning(&mut global);
            reasons.push(format!(
                "quantity variance {}% within tolerance {}%",
                diff_pct, tol.quantity_pct
            ));
        } else {
            status = LineStatus::Blocked;
            global = GlobalStatus::Blocked;
            reasons.push(format!(
                "quantity variance {}% exceeds tolerance {}%",
                diff_pct, tol.quantity_pct
            ));
        }

        if received > line.quantity && !tol.allow_excess_receipt && diff_pct > tol.quantity_pct {
            status = LineStatus::Blocked;
            global = GlobalStatus::Blocked;
            if reasons.iter().all(|r| !r.contains("over-receipt")) {
                reasons.push("over-receipt not allowed".to_string());
            }
        }

        let mut diff_price = None;
        let mut price_pct = None;
        if price > BigDecimal::zero() {
            if let Some(rp) = reference_price.as_ref().filter(|p| **p > BigDecimal::zero()) {
                let dp = (&price - rp).abs();
                let pp = pct_of(&dp, rp);
                if pp > tol.price_pct {
                    // price block appends to, never discards, the quantity reason
                    status = LineStatus::Blocked;
                    global = GlobalStatus::Blocked;
                    reasons.push(format!(
                        "price variance {}% exceeds tolerance {}%",
                        pp, tol.price_pct
                    ));
                } else if !pp.is_zero() && status == LineStatus::Ok {
                    status = LineStatus::Warning;
                    raise_to_warning(&mut global);
                    reasons.push(format!(
                        "price variance {}% within tolerance {}%",
                        pp, tol.price_pct
                    ));
                } else if pp.is_zero() && discount_applied {
                    reasons.push("price matches after discount".to_string());
                }
                diff_price = Some(dp);
                price_pct = Some(pp);
            }
        }

        out.push(MatchLine {
            line_key: key,
            description: line.description.clone(),
            invoice_line_id: Some(line.id),
            invoiced_qty: line.quantity.clone(),
            received_qty: received,
            effective_price: price,
            received_price: reference_price,
            diff_qty,
            diff_pct,
            diff_price,
            price_pct,
            status,
            reason: if reasons.is_empty() {
                "quantities and prices match".to_string()
            } else {
                reasons.join("; ")
            },
        });
    }

    // Received-but-never-billed keys surface as warnings, never blocks.
    for (key, agg) in &aggregates {
        if agg.matched {
            continue;
        }
        raise_to_warning(&mut global);
        out.push(MatchLine {
            line_key: key.clone(),
            description: agg.description.clone(),
            invoice_line_id: None,
            invoiced_qty: BigDecimal::zero(),
            received_qty: agg.quantity.clone(),
            effective_price: BigDecimal::zero(),
            received_price: agg.reference_price(),
            diff_qty: agg.quantity.clone(),
            diff_pct: hundred(),
            diff_price: None,
            price_pct: None,
            status: LineStatus::MissingInvoice,
            reason: "received but never invoiced".to_string(),
        });
    }

    let summary = summarize(&out);
    Evaluation {
        global_status: global,
        lines: out,
        summary,
    }
}

fn summarize(lines: &[MatchLine]) -> MatchSummary {
    let mut summary = MatchSummary {
        total: lines.len(),
        ..Default::default()
    };
    for line in lines {
        match line.status {
            LineStatus::Ok => summary.ok += 1,
            LineStatus::Warning => summary.warning += 1,
            LineStatus::Blocked => summary.blocked += 1,
            LineStatus::MissingReceipt | LineStatus::MissingInvoice => summary.missing += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReceiptLine, ReceiptStatus};

    fn dec(s: &str) -> BigDecimal {
        s.parse().unwrap()
    }

    fn inv_line(id: i64, code: &str, qty: &str, price: &str) -> InvoiceLine {
        InvoiceLine {
            id,
            description: format!("item {code}"),
            item_code: Some(code.to_string()),
            quantity: dec(qty),
            unit_price: dec(price),
            discount_pct: None,
            discount_amount: None,
            discounted_price: None,
        }
    }

    fn receipt(invoice_id: i64, lines: Vec<(&str, &str, &str)>) -> GoodsReceipt {
        GoodsReceipt {
            id: 900 + invoice_id,
            invoice_id,
            status: ReceiptStatus::Confirmed,
            lines: lines
                .into_iter()
                .map(|(code, qty, price)| ReceiptLine {
                    item_code: Some(code.to_string()),
                    description: format!("item {code}"),
                    quantity: dec(qty),
                    reference_price: dec(price),
                })
                .collect(),
        }
    }

    #[test]
    fn exact_match_is_ok() {
        let lines = vec![inv_line(1, "A", "100", "10")];
        let receipts = vec![receipt(1, vec![("A", "100", "10")])];
        let eval = evaluate(&lines, &receipts, &ToleranceConfig::default());
        assert_eq!(eval.global_status, GlobalStatus::Ok);
        assert_eq!(eval.lines[0].status, LineStatus::Ok);
        assert_eq!(eval.summary.ok, 1);
    }

    #[test]
    fn variance_within_tolerance_warns() {
        let lines = vec![inv_line(1, "A", "100", "10")];
        let receipts = vec![receipt(1, vec![("A", "96", "10")])];
        let eval = evaluate(&lines, &receipts, &ToleranceConfig::default());
        assert_eq!(eval.lines[0].status, LineStatus::Warning);
        assert_eq!(eval.lines[0].diff_pct, dec("4.00"));
        assert_eq!(eval.global_status, GlobalStatus::Warning);
    }

    #[test]
    fn variance_beyond_tolerance_blocks() {
        let lines = vec![inv_line(1, "A", "100", "10")];
        let receipts = vec![receipt(1, vec![("A", "80", "10")])];
        let eval = evaluate(&lines, &receipts, &ToleranceConfig::default());
        assert_eq!(eval.lines[0].status, LineStatus::Blocked);
        assert_eq!(eval.lines[0].diff_pct, dec("20.00"));
        assert_eq!(eval.global_status, GlobalStatus::Blocked);
    }

    #[test]
    fn zero_receipts_is_pending() {
        let lines = vec![inv_line(1, "A", "100", "10"), inv_line(2, "B", "5", "3")];
        let eval = evaluate(&lines, &[], &ToleranceConfig::default());
        assert_eq!(eval.global_status, GlobalStatus::Pending);
        assert_eq!(eval.summary.missing, 2);
        assert_eq!(eval.summary.total, 2);
        for line in &eval.lines {
            assert_eq!(line.status, LineStatus::MissingReceipt);
            assert_eq!(line.diff_pct, dec("100"));
        }
    }

    #[test]
    fn unmatched_invoice_line_blocks() {
        let lines = vec![inv_line(1, "A", "100", "10"), inv_line(2, "B", "5", "3")];
        let receipts = vec![receipt(1, vec![("A", "100", "10")])];
        let eval = evaluate(&lines, &receipts, &ToleranceConfig::default());
        assert_eq!(eval.lines[1].status, LineStatus::MissingReceipt);
        assert_eq!(eval.global_status, GlobalStatus::Blocked);
    }

    #[test]
    fn over_received_key_warns_only() {
        let lines = vec![inv_line(1, "A", "100", "10")];
        let receipts = vec![receipt(1, vec![("A", "100", "10"), ("C", "7", "2")])];
        let eval = evaluate(&lines, &receipts, &ToleranceConfig::default());
        let extra = eval
            .lines
            .iter()
            .find(|l| l.status == LineStatus::MissingInvoice)
            .expect("over-received line present");
        assert_eq!(extra.line_key, "C");
        assert_eq!(extra.diff_pct, dec("100"));
        assert_eq!(eval.global_status, GlobalStatus::Warning);
    }

    #[test]
    fn partial_deliveries_aggregate_across_receipts() {
        let lines = vec![inv_line(1, "A", "100", "10")];
        let receipts = vec![
            receipt(1, vec![("A", "60", "10")]),
            receipt(1, vec![("A", "40", "10")]),
        ];
        let eval = evaluate(&lines, &receipts, &ToleranceConfig::default());
        assert_eq!(eval.lines[0].status, LineStatus::Ok);
        assert_eq!(eval.lines[0].received_qty, dec("100"));
        assert_eq!(eval.global_status, GlobalStatus::Ok);
    }

    #[test]
    fn percentage_discount_compares_net_price() {
        let mut line = inv_line(1, "A", "100", "100");
        line.discount_pct = Some(dec("10"));
        let receipts = vec![receipt(1, vec![("A", "100", "90")])];
        let eval = evaluate(&[line], &receipts, &ToleranceConfig::default());
        assert_eq!(eval.lines[0].status, LineStatus::Ok);
        assert_eq!(eval.lines[0].effective_price, dec("90"));
        assert!(eval.lines[0].reason.contains("price matches after discount"));
        assert_eq!(eval.global_status, GlobalStatus::Ok);
    }

    #[test]
    fn fixed_discount_compares_net_price() {
        let mut line = inv_line(1, "A", "10", "100");
        line.discount_amount = Some(dec("15"));
        let receipts = vec![receipt(1, vec![("A", "10", "85")])];
        let eval = evaluate(&[line], &receipts, &ToleranceConfig::default());
        assert_eq!(eval.lines[0].status, LineStatus::Ok);
        assert_eq!(eval.lines[0].effective_price, dec("85"));
    }

    #[test]
    fn price_variance_beyond_tolerance_blocks_and_appends_reason() {
        let lines = vec![inv_line(1, "A", "96", "110")];
        // 4% quantity warning plus a 10% price deviation
        let receipts = vec![receipt(1, vec![("A", "100", "100")])];
        let eval = evaluate(&lines, &receipts, &ToleranceConfig::default());
        assert_eq!(eval.lines[0].status, LineStatus::Blocked);
        assert!(eval.lines[0].reason.contains("quantity variance"));
        assert!(eval.lines[0].reason.contains("price variance"));
        assert_eq!(eval.global_status, GlobalStatus::Blocked);
    }

    #[test]
    fn small_price_variance_downgrades_ok_to_warning() {
        let lines = vec![inv_line(1, "A", "100", "101")];
        let receipts = vec![receipt(1, vec![("A", "100", "100")])];
        let eval = evaluate(&lines, &receipts, &ToleranceConfig::default());
        assert_eq!(eval.lines[0].status, LineStatus::Warning);
        assert_eq!(eval.lines[0].price_pct, Some(dec("1.00")));
        assert_eq!(eval.global_status, GlobalStatus::Warning);
    }

    #[test]
    fn description_key_is_normalized() {
        let line = InvoiceLine {
            id: 1,
            description: "  Steel   Bolt M8 ".to_string(),
            item_code: None,
            quantity: dec("10"),
            unit_price: dec("2"),
            discount_pct: None,
            discount_amount: None,
            discounted_price: None,
        };
        let receipts = vec![GoodsReceipt {
            id: 901,
            invoice_id: 1,
            status: ReceiptStatus::Confirmed,
            lines: vec![ReceiptLine {
                item_code: None,
                description: "steel bolt m8".to_string(),
                quantity: dec("10"),
                reference_price: dec("2"),
            }],
        }];
        let eval = evaluate(&[line], &receipts, &ToleranceConfig::default());
        assert_eq!(eval.lines[0].status, LineStatus::Ok);
        assert_eq!(eval.lines[0].line_key, "steel bolt m8");
    }

    #[test]
    fn zero_invoiced_quantity_yields_zero_pct() {
        let lines = vec![inv_line(1, "A", "0", "10")];
        let receipts = vec![receipt(1, vec![("A", "5", "10")])];
        let eval = evaluate(&lines, &receipts, &ToleranceConfig::default());
        assert_eq!(eval.lines[0].diff_pct, BigDecimal::zero());
        assert_eq!(eval.lines[0].status, LineStatus::Ok);
    }

    #[test]
    fn rerun_is_idempotent() {
        let lines = vec![inv_line(1, "A", "100", "10"), inv_line(2, "B", "96", "4")];
        let receipts = vec![receipt(1, vec![("A", "100", "10"), ("B", "100", "4")])];
        let tol = ToleranceConfig::default();
        let first = evaluate(&lines, &receipts, &tol);
        let second = evaluate(&lines, &receipts, &tol);
        assert_eq!(first.global_status, second.global_status);
        assert_eq!(first.summary, second.summary);
        assert_eq!(first.lines, second.lines);
    }
}
