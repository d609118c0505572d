pub mod ingest_transaction;

pub use ingest_transaction::{
    BatchItemResult, BatchItemStatus, BatchOutcome, GatewaySettings, IngestionGateway, Operation,
    SubmitOutcome,
};
