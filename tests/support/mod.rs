//! Shared fixtures: sample domain events, a registry for them, a broker
//! whose behaviour each test scripts, and a store that fails on demand.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use outbox_relay::{
    Broker, BrokerMessage, Delivery, DomainEvent, EventMetadata, EventRegistry,
    InMemoryOutboxStore, NewOutboxRecord, OutboxRecord, OutboxStatus, OutboxStore,
    OutboxTransaction, OutboxWriter, PublishError, RecordId, StoreError, StoreResult,
};
use outbox_relay::store::InMemoryTransaction;
use serde::Serialize;

// --- Events ---

#[derive(Serialize, Clone, Debug)]
pub struct MemberJoined {
    pub member_id: String,
    pub name: String,
}

impl DomainEvent for MemberJoined {
    const EVENT_TYPE: &'static str = "MemberJoined";
}

#[derive(Serialize, Clone, Debug)]
pub struct OrderPaid {
    pub order_id: u64,
    pub amount_cents: u64,
}

impl DomainEvent for OrderPaid {
    const EVENT_TYPE: &'static str = "OrderPaid";
}

/// Local-only event: never registered for the broker.
#[derive(Serialize, Clone, Debug)]
pub struct PageViewed {
    pub path: String,
}

impl DomainEvent for PageViewed {
    const EVENT_TYPE: &'static str = "PageViewed";
}

/// Registered, but JSON cannot represent tuple map keys.
#[derive(Serialize, Clone, Debug)]
pub struct GridPainted {
    pub cells: HashMap<(u32, u32), String>,
}

impl DomainEvent for GridPainted {
    const EVENT_TYPE: &'static str = "GridPainted";
}

impl GridPainted {
    pub fn one_cell() -> Self {
        let mut cells = HashMap::new();
        cells.insert((1, 2), "blue".to_string());
        Self { cells }
    }
}

pub fn member(id: &str) -> MemberJoined {
    MemberJoined {
        member_id: id.to_string(),
        name: format!("member {id}"),
    }
}

pub fn registry() -> EventRegistry {
    EventRegistry::new()
        .with::<MemberJoined, _>(|e| EventMetadata::new("Member", e.member_id.clone(), "member.joined"))
        .unwrap()
        .with::<OrderPaid, _>(|e| {
            EventMetadata::new("Order", e.order_id.to_string(), "market.order.paid")
        })
        .unwrap()
        .with::<GridPainted, _>(|_| EventMetadata::new("Grid", "main", "grid.painted"))
        .unwrap()
}

pub fn writer() -> OutboxWriter {
    OutboxWriter::new(Arc::new(registry()))
}

// --- Store helpers ---

/// Insert a SENT record whose `sent_at` is `sent_at`.
pub fn seed_sent<S: OutboxStore>(store: &S, aggregate_id: &str, sent_at: DateTime<Utc>) -> RecordId {
    let mut tx = store.begin().unwrap();
    let id = tx
        .insert(NewOutboxRecord {
            aggregate_type: "Member".into(),
            aggregate_id: aggregate_id.into(),
            event_type: "MemberJoined".into(),
            topic: "member.joined".into(),
            payload: "{}".into(),
            created_at: sent_at,
        })
        .unwrap();
    let mut record = tx
        .fetch_pending(100)
        .unwrap()
        .into_iter()
        .find(|r| r.id == id)
        .unwrap();
    record.status = OutboxStatus::Sent;
    record.sent_at = Some(sent_at);
    tx.update(&record, record.version).unwrap();
    tx.commit().unwrap();
    id
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// --- Scripted broker ---

#[derive(Clone, Debug)]
pub enum Script {
    Ack,
    Reject(String),
    /// Accept the message but never acknowledge it.
    Stall,
}

/// Broker that records every attempt and answers per the current script.
#[derive(Clone)]
pub struct ScriptedBroker {
    script: Arc<Mutex<Script>>,
    attempts: Arc<AtomicUsize>,
    delivered: Arc<Mutex<Vec<BrokerMessage>>>,
    stalled: Arc<Mutex<Vec<outbox_relay::broker::DeliveryHandle>>>,
}

impl ScriptedBroker {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            attempts: Arc::new(AtomicUsize::new(0)),
            delivered: Arc::new(Mutex::new(Vec::new())),
            stalled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Messages the broker acknowledged.
    pub fn delivered(&self) -> Vec<BrokerMessage> {
        self.delivered.lock().unwrap().clone()
    }
}

impl Broker for ScriptedBroker {
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap().clone();
        match script {
            Script::Ack => {
                self.delivered.lock().unwrap().push(BrokerMessage {
                    topic: topic.to_string(),
                    key: key.to_string(),
                    payload: payload.to_vec(),
                });
                Ok(Delivery::acknowledged())
            }
            Script::Reject(reason) => Ok(Delivery::failed(PublishError::Rejected(reason))),
            Script::Stall => {
                let (handle, delivery) = Delivery::pending();
                self.stalled.lock().unwrap().push(handle);
                Ok(delivery)
            }
        }
    }
}

// --- Faulty store ---

/// In-memory store that can be told to fail: the next few `begin` calls,
/// every `delete_older_than`, or the Nth `update` inside a transaction.
#[derive(Clone, Default)]
pub struct FaultyStore {
    pub inner: InMemoryOutboxStore,
    failing_begins: Arc<AtomicUsize>,
    begin_attempts: Arc<AtomicUsize>,
    fail_sweeps: Arc<AtomicBool>,
    sweep_attempts: Arc<AtomicUsize>,
    fail_update_at: Arc<Mutex<Option<usize>>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_begins(&self, count: usize) {
        self.failing_begins.store(count, Ordering::SeqCst);
    }

    pub fn fail_sweeps(&self, fail: bool) {
        self.fail_sweeps.store(fail, Ordering::SeqCst);
    }

    /// Fail the `nth` update (1-based) of each transaction begun from now on.
    pub fn fail_update_at(&self, nth: Option<usize>) {
        *self.fail_update_at.lock().unwrap() = nth;
    }

    pub fn begin_attempts(&self) -> usize {
        self.begin_attempts.load(Ordering::SeqCst)
    }

    pub fn sweep_attempts(&self) -> usize {
        self.sweep_attempts.load(Ordering::SeqCst)
    }
}

pub struct FaultyTransaction<'a> {
    inner: InMemoryTransaction<'a>,
    updates: usize,
    fail_update_at: Option<usize>,
}

impl OutboxTransaction for FaultyTransaction<'_> {
    fn insert(&mut self, record: NewOutboxRecord) -> StoreResult<RecordId> {
        self.inner.insert(record)
    }

    fn fetch_pending(&mut self, limit: usize) -> StoreResult<Vec<OutboxRecord>> {
        self.inner.fetch_pending(limit)
    }

    fn update(&mut self, record: &OutboxRecord, expected_version: u64) -> StoreResult<u64> {
        self.updates += 1;
        if self.fail_update_at == Some(self.updates) {
            return Err(StoreError::Database("disk I/O error".into()));
        }
        self.inner.update(record, expected_version)
    }

    fn commit(self) -> StoreResult<()> {
        self.inner.commit()
    }
}

impl OutboxStore for FaultyStore {
    type Transaction<'a> = FaultyTransaction<'a>;

    fn begin(&self) -> StoreResult<FaultyTransaction<'_>> {
        self.begin_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_begins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Database("connection refused".into()));
        }
        Ok(FaultyTransaction {
            inner: self.inner.begin()?,
            updates: 0,
            fail_update_at: *self.fail_update_at.lock().unwrap(),
        })
    }

    fn delete_older_than(&self, status: OutboxStatus, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        self.sweep_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_sweeps.load(Ordering::SeqCst) {
            return Err(StoreError::Database("database is locked".into()));
        }
        self.inner.delete_older_than(status, cutoff)
    }

    fn find_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> StoreResult<Vec<OutboxRecord>> {
        self.inner.find_by_aggregate(aggregate_type, aggregate_id)
    }

    fn count_by_status(&self, status: OutboxStatus) -> StoreResult<usize> {
        self.inner.count_by_status(status)
    }
}
