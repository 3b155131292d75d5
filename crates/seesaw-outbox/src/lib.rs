//! Transactional outbox pattern: record "this event needs delivering" in
//! the same transaction as the state change that produced it, then deliver
//! it out-of-band via [`OutboxRelay`] polling [`OutboxStore`].
//!
//! Mirrors the job queue's own enqueue shape (caller writes + one more row,
//! one commit) one level up: where [`seesaw_core::job::JobStore`] durably
//! schedules work, an outbox durably schedules a *notification* that work
//! happened, for the [`seesaw_core::contracts::EventDeliverer`] /
//! [`seesaw_core::contracts::DispatcherInvoker`] external collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seesaw_core::contracts::{DispatcherInvoker, EventDeliverer};

/// What an outbox row asks to have delivered once it commits.
#[derive(Debug, Clone)]
pub enum OutboxPayload {
    /// Hand `event_record_id` to the registered [`EventDeliverer`].
    DeliverEvent { event_record_id: String },
    /// Hand `(dispatcher_id, event_record_id)` to the registered
    /// [`DispatcherInvoker`].
    InvokeDispatcher {
        dispatcher_id: String,
        event_record_id: String,
    },
}

/// One durable outbox row.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub payload: OutboxPayload,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}

/// Storage contract for outbox rows. Storage-agnostic, matching
/// [`seesaw_core::job::JobStore`]'s split: a real backend additionally
/// exposes an inherent `insert_in_tx` (co-committing with the caller's own
/// write) that cannot live on this trait because it needs a concrete
/// transaction type.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Leases up to `limit` undelivered rows, oldest first.
    async fn claim_undelivered(&self, limit: i64) -> anyhow::Result<Vec<OutboxEntry>>;

    async fn mark_delivered(&self, id: i64) -> anyhow::Result<()>;

    /// Records a failed delivery attempt; the row stays undelivered and is
    /// eligible for the next `claim_undelivered` poll (spec §9: at-least-once
    /// delivery, retried until the relay is told to stop).
    async fn mark_failed(&self, id: i64, error: String) -> anyhow::Result<()>;

    async fn len(&self) -> anyhow::Result<usize>;
}

struct Row {
    entry: OutboxEntry,
}

/// In-memory [`OutboxStore`], for tests and for single-process deployments
/// that do not need the row to survive a restart.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<HashMap<i64, Row>>,
    next_id: AtomicI64,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Not part of [`OutboxStore`]: real backends insert inside the
    /// caller's own transaction; this in-memory stand-in has no transaction
    /// to join, so it is just another inherent method.
    pub fn insert(&self, payload: OutboxPayload) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.rows.lock().unwrap().insert(
            id,
            Row {
                entry: OutboxEntry {
                    id,
                    payload,
                    created_at: Utc::now(),
                    delivered_at: None,
                    attempts: 0,
                    last_error: None,
                },
            },
        );
        id
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_undelivered(&self, limit: i64) -> anyhow::Result<Vec<OutboxEntry>> {
        let rows = self.rows.lock().unwrap();
        let mut entries: Vec<OutboxEntry> = rows
            .values()
            .filter(|row| !row.entry.is_delivered())
            .map(|row| row.entry.clone())
            .collect();
        entries.sort_by_key(|e| e.id);
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn mark_delivered(&self, id: i64) -> anyhow::Result<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&id) {
            row.entry.delivered_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: String) -> anyhow::Result<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&id) {
            row.entry.attempts += 1;
            row.entry.last_error = Some(error);
        }
        Ok(())
    }

    async fn len(&self) -> anyhow::Result<usize> {
        Ok(self.rows.lock().unwrap().len())
    }
}

/// Polls an [`OutboxStore`] and hands undelivered rows to whichever
/// collaborator their payload names. One misbehaving row (a collaborator
/// that always errors) cannot block the others — failures are recorded and
/// the row is retried on the next poll.
pub struct OutboxRelay<S> {
    store: S,
    deliverer: std::sync::Arc<dyn EventDeliverer>,
    invoker: std::sync::Arc<dyn DispatcherInvoker>,
    poll_interval: Duration,
    batch_size: i64,
}

impl<S: OutboxStore> OutboxRelay<S> {
    pub fn new(
        store: S,
        deliverer: std::sync::Arc<dyn EventDeliverer>,
        invoker: std::sync::Arc<dyn DispatcherInvoker>,
    ) -> Self {
        Self {
            store,
            deliverer,
            invoker,
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs one poll/deliver cycle; returns the number of rows delivered.
    /// Exposed separately from [`OutboxRelay::run`] so tests can drive a
    /// single cycle deterministically instead of racing a spawned loop.
    pub async fn tick(&self) -> anyhow::Result<usize> {
        let claimed = self.store.claim_undelivered(self.batch_size).await?;
        let mut delivered = 0;
        for entry in claimed {
            let result = match &entry.payload {
                OutboxPayload::DeliverEvent { event_record_id } => {
                    self.deliverer.deliver_event(event_record_id.clone()).await
                }
                OutboxPayload::InvokeDispatcher {
                    dispatcher_id,
                    event_record_id,
                } => {
                    self.invoker
                        .invoke_dispatcher(dispatcher_id.clone(), event_record_id.clone())
                        .await
                }
            };
            match result {
                Ok(()) => {
                    self.store.mark_delivered(entry.id).await?;
                    delivered += 1;
                }
                Err(err) => {
                    tracing::warn!(outbox_id = entry.id, error = %err, "outbox delivery failed");
                    self.store.mark_failed(entry.id, err.to_string()).await?;
                }
            }
        }
        Ok(delivered)
    }

    /// Polls forever at `poll_interval`. Intended to be spawned as a
    /// background task alongside [`seesaw_core::scheduler::Scheduler`].
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                tracing::warn!(error = %err, "outbox relay poll failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingDeliverer {
        delivered: AtomicUsize,
        fail_first_n: usize,
    }

    #[async_trait]
    impl EventDeliverer for CountingDeliverer {
        async fn deliver_event(&self, _event_record_id: String) -> anyhow::Result<()> {
            let count = self.delivered.fetch_add(1, Ordering::SeqCst);
            if count < self.fail_first_n {
                anyhow::bail!("simulated transient failure");
            }
            Ok(())
        }
    }

    struct NoopInvoker;

    #[async_trait]
    impl DispatcherInvoker for NoopInvoker {
        async fn invoke_dispatcher(&self, _dispatcher_id: String, _event_record_id: String) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn relay_delivers_and_marks_rows_delivered() {
        let store = InMemoryOutboxStore::new();
        store.insert(OutboxPayload::DeliverEvent {
            event_record_id: "evt_1".into(),
        });
        store.insert(OutboxPayload::DeliverEvent {
            event_record_id: "evt_2".into(),
        });

        let relay = OutboxRelay::new(
            store,
            Arc::new(CountingDeliverer {
                delivered: AtomicUsize::new(0),
                fail_first_n: 0,
            }),
            Arc::new(NoopInvoker),
        );

        let delivered = relay.tick().await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(relay.store.claim_undelivered(10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn failed_delivery_stays_undelivered_for_next_poll() {
        let store = InMemoryOutboxStore::new();
        store.insert(OutboxPayload::DeliverEvent {
            event_record_id: "evt_1".into(),
        });

        let relay = OutboxRelay::new(
            store,
            Arc::new(CountingDeliverer {
                delivered: AtomicUsize::new(0),
                fail_first_n: 1,
            }),
            Arc::new(NoopInvoker),
        );

        assert_eq!(relay.tick().await.unwrap(), 0);
        assert_eq!(relay.store.claim_undelivered(10).await.unwrap().len(), 1);
        assert_eq!(relay.tick().await.unwrap(), 1);
    }
}
