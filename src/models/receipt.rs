use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

/// Goods-receipt confirmation. Zero or more per invoice (partial
/// deliveries); only `Confirmed` receipts participate in matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodsReceipt {
    pub id: i64,
    pub invoice_id: i64,
    pub status: ReceiptStatus,
    pub lines: Vec<ReceiptLine>,
}

/// One received line with its accepted quantity and the reference price
/// implied by the receiving document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub item_code: Option<String>,
    pub description: String,
    pub quantity: BigDecimal,
    pub reference_price: BigDecimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptStatus {
    Draft,
    Confirmed,
    Cancelled,
}

impl ReceiptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReceiptStatus::Draft => "DRAFT",
            ReceiptStatus::Confirmed => "CONFIRMED",
            ReceiptStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(ReceiptStatus::Draft),
            "CONFIRMED" => Some(ReceiptStatus::Confirmed),
            "CANCELLED" => Some(ReceiptStatus::Cancelled),
            _ => None,
        }
    }
}
