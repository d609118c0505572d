pub mod alert_forwarder;
pub mod consumer;
pub mod risk_scorer;
pub mod storage_writer;

pub use alert_forwarder::{AlertForwarder, Notifier, NotifyError, WebhookNotifier};
pub use consumer::{ConsumerLoop, EventHandler, HandlerError};
pub use risk_scorer::{RiskRules, RiskScorer};
pub use storage_writer::StorageWriter;
