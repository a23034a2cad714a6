pub mod exception;
pub mod invoice;
pub mod policy;
pub mod receipt;
pub mod result;

pub use exception::{
    ExceptionAction, ExceptionField, ExceptionKind, ExceptionStats, HistoryAction, HistoryEntry,
    MatchException, PendingFilter, Priority, ResolutionOutcome, ResolutionRecord,
    ResolutionRequest, SweepOutcome,
};
pub use invoice::{Invoice, InvoiceLine, PayApproval};
pub use policy::{AuditEntry, SlaRule, ToleranceConfig};
pub use receipt::{GoodsReceipt, ReceiptLine, ReceiptStatus};
pub use result::{GlobalStatus, LineStatus, MatchLine, MatchResult, MatchSummary};
