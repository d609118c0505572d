pub mod idempotency;
pub mod processed;
pub mod transaction;

pub use idempotency::{IdempotencyRecord, IdempotencyStatus, TransactionReceipt};
pub use processed::{AccountRisk, Alert, AlertType, Decision, ProcessedTransaction, RiskLevel, Severity};
pub use transaction::{
    AcceptedTransaction, TransactionId, TransactionStatus, TransactionSubmission, TransactionType,
    ValidatedSubmission,
};
