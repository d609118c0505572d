//! Concrete implementations of the ports.

pub mod memory;
pub mod postgres_transaction_repository;
pub mod redis_event_log;
pub mod redis_idempotency_store;

pub use memory::{
    InMemoryEventLog, InMemoryEventSource, InMemoryIdempotencyStore, InMemoryTransactionRepository,
};
pub use postgres_transaction_repository::PostgresTransactionRepository;
pub use redis_event_log::{RedisEventLog, RedisEventSource};
pub use redis_idempotency_store::RedisIdempotencyStore;
