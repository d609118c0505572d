//! In-process implementations of the ports, used by tests and local runs
//! without Redis or Postgres.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::{AccountRisk, IdempotencyRecord, ProcessedTransaction};
use crate::ports::{
    partition_for, Delivery, EventLog, EventLogError, EventRecord, EventSource, IdempotencyStore,
    PublishReceipt, RepositoryError, RepositoryResult, SaveOutcome, StoreError,
    TransactionRepository,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Honours TTLs, counts calls and can be switched unavailable or slow.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<String, (IdempotencyRecord, Instant)>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    gets: AtomicUsize,
    sets: AtomicUsize,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Every call sleeps this long first; pair with a short store timeout.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Seeds a record directly, bypassing availability and counters.
    pub fn insert(&self, key: &str, record: IdempotencyRecord, ttl: Duration) {
        lock(&self.entries).insert(key.to_string(), (record, Instant::now() + ttl));
    }

    pub fn record(&self, key: &str) -> Option<IdempotencyRecord> {
        lock(&self.entries)
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(record, _)| record.clone())
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    async fn simulate(&self) -> Result<(), StoreError> {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        Ok(self.record(key))
    }

    async fn set(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        self.insert(key, record.clone(), ttl);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.simulate().await
    }
}

#[derive(Default)]
struct LogState {
    /// (topic, partition) -> entries in append order.
    partitions: BTreeMap<(String, u32), Vec<EventRecord>>,
    /// Publish order across partitions, for assertions.
    history: Vec<(String, u32, EventRecord)>,
    /// (topic, group, partition) -> index of the next undelivered entry.
    cursors: HashMap<(String, String, u32), usize>,
    /// (topic, group) -> delivered but unacknowledged (partition, index).
    pending: HashMap<(String, String), BTreeSet<(u32, usize)>>,
}

struct LogInner {
    partitions: u32,
    state: Mutex<LogState>,
    failing: AtomicBool,
    latency: Mutex<Option<Duration>>,
    publishes: AtomicUsize,
}

/// Partitioned log with consumer groups, mirroring the Redis Streams layout.
#[derive(Clone)]
pub struct InMemoryEventLog {
    inner: Arc<LogInner>,
}

impl InMemoryEventLog {
    pub fn new(partitions: u32) -> Self {
        Self {
            inner: Arc::new(LogInner {
                partitions: partitions.max(1),
                state: Mutex::new(LogState::default()),
                failing: AtomicBool::new(false),
                latency: Mutex::new(None),
                publishes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn fail_publishes(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.inner.latency) = latency;
    }

    /// Publish attempts, including failed ones.
    pub fn publish_calls(&self) -> usize {
        self.inner.publishes.load(Ordering::SeqCst)
    }

    /// Successfully published records on `topic` as (partition, record).
    pub fn published(&self, topic: &str) -> Vec<(u32, EventRecord)> {
        lock(&self.inner.state)
            .history
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, partition, record)| (*partition, record.clone()))
            .collect()
    }

    pub fn source(&self, topic: &str, group: &str) -> InMemoryEventSource {
        InMemoryEventSource {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            group: group.to_string(),
        }
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn publish(
        &self,
        topic: &str,
        record: EventRecord,
    ) -> Result<PublishReceipt, EventLogError> {
        self.inner.publishes.fetch_add(1, Ordering::SeqCst);
        let latency = *lock(&self.inner.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(EventLogError::Unavailable("log switched off".to_string()));
        }

        let partition = partition_for(&record.key, self.inner.partitions);
        let mut state = lock(&self.inner.state);
        let entries = state
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();
        entries.push(record.clone());
        let offset = format!("{}-0", entries.len() - 1);
        state.history.push((topic.to_string(), partition, record));

        Ok(PublishReceipt {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn ping(&self) -> Result<(), EventLogError> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(EventLogError::Unavailable("log switched off".to_string()));
        }
        Ok(())
    }
}

pub struct InMemoryEventSource {
    inner: Arc<LogInner>,
    topic: String,
    group: String,
}

impl InMemoryEventSource {
    fn take(&self, max: usize) -> Vec<Delivery> {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        let mut deliveries = Vec::new();

        for partition in 0..self.inner.partitions {
            let entries = match state.partitions.get(&(self.topic.clone(), partition)) {
                Some(entries) => entries,
                None => continue,
            };
            let cursor = state
                .cursors
                .entry((self.topic.clone(), self.group.clone(), partition))
                .or_insert(0);
            let pending = state
                .pending
                .entry((self.topic.clone(), self.group.clone()))
                .or_default();

            while *cursor < entries.len() && deliveries.len() < max {
                pending.insert((partition, *cursor));
                deliveries.push(Delivery {
                    topic: self.topic.clone(),
                    partition,
                    offset: format!("{}-0", *cursor),
                    record: entries[*cursor].clone(),
                });
                *cursor += 1;
            }
        }

        deliveries
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.state)
            .pending
            .get(&(self.topic.clone(), self.group.clone()))
            .map_or(0, BTreeSet::len)
    }
}

fn parse_offset(offset: &str) -> Option<usize> {
    offset.split('-').next()?.parse().ok()
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn poll(&self, max: usize, block: Duration) -> Result<Vec<Delivery>, EventLogError> {
        let deliveries = self.take(max);
        if deliveries.is_empty() && !block.is_zero() {
            tokio::time::sleep(block).await;
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), EventLogError> {
        let index = parse_offset(&delivery.offset).ok_or_else(|| EventLogError::Malformed {
            id: delivery.offset.clone(),
            reason: "offset is not an entry index".to_string(),
        })?;
        if let Some(pending) = lock(&self.inner.state)
            .pending
            .get_mut(&(self.topic.clone(), self.group.clone()))
        {
            pending.remove(&(delivery.partition, index));
        }
        Ok(())
    }
}

/// Keyed by transaction ID with a unique idempotency key, like the table.
#[derive(Default)]
pub struct InMemoryTransactionRepository {
    rows: Mutex<BTreeMap<String, ProcessedTransaction>>,
    risk: Mutex<HashMap<String, AccountRisk>>,
    failing: AtomicBool,
}

impl InMemoryTransactionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TransactionRepository for InMemoryTransactionRepository {
    async fn save(&self, processed: &ProcessedTransaction) -> RepositoryResult<SaveOutcome> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepositoryError::Database("repository switched off".to_string()));
        }

        let mut rows = lock(&self.rows);
        let id = processed.transaction.id.to_string();
        let key = &processed.transaction.idempotency_key;
        let duplicate = rows.contains_key(&id)
            || rows
                .values()
                .any(|row| &row.transaction.idempotency_key == key);
        if duplicate {
            return Ok(SaveOutcome::Duplicate);
        }

        rows.insert(id, processed.clone());
        lock(&self.risk)
            .entry(processed.transaction.account_id.clone())
            .and_modify(|risk| risk.record(processed))
            .or_insert_with(|| AccountRisk::first(processed));
        Ok(SaveOutcome::Inserted)
    }

    async fn get_by_id(&self, id: &str) -> RepositoryResult<Option<ProcessedTransaction>> {
        Ok(lock(&self.rows).get(id).cloned())
    }

    async fn account_risk(&self, account_id: &str) -> RepositoryResult<Option<AccountRisk>> {
        Ok(lock(&self.risk).get(account_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TransactionId, TransactionReceipt};
    use chrono::Utc;

    fn record() -> IdempotencyRecord {
        IdempotencyRecord::accepted(TransactionReceipt {
            transaction_id: TransactionId::generate(Utc::now()),
            status: "accepted".to_string(),
            message: "queued".to_string(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn store_entries_expire_after_ttl() {
        let store = InMemoryIdempotencyStore::new();
        store.set("k1", &record(), Duration::from_secs(60)).await.unwrap();
        assert!(store.get("k1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get("k1").await.unwrap().is_none());
        assert_eq!(store.get_calls(), 2);
        assert_eq!(store.set_calls(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = InMemoryIdempotencyStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k1").await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn consumer_groups_track_their_own_cursor() {
        let log = InMemoryEventLog::new(3);
        for i in 0..4 {
            let record = EventRecord {
                key: "A".to_string(),
                payload: format!("{i}"),
                headers: BTreeMap::new(),
            };
            log.publish("t", record).await.unwrap();
        }

        let first = log.source("t", "g1");
        let second = log.source("t", "g2");

        let batch = first.poll(10, Duration::ZERO).await.unwrap();
        let payloads: Vec<&str> = batch.iter().map(|d| d.record.payload.as_str()).collect();
        assert_eq!(payloads, vec!["0", "1", "2", "3"]);
        assert!(first.poll(10, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(second.poll(10, Duration::ZERO).await.unwrap().len(), 4);

        assert_eq!(first.pending_count(), 4);
        first.ack(&batch[0]).await.unwrap();
        assert_eq!(first.pending_count(), 3);
    }
}
