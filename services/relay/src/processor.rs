// Bounded-concurrency ingress from sessions to the Store, with per-event
// retry and deduplication (spec.md §4.3). `2 * NUM_CPUS` worker tasks drain
// a single bounded mpmc queue; producers enqueue non-blockingly.

use crate::membership::MembershipFilter;
use crate::metrics::Metrics;
use crate::store::{InsertOutcome, Store};
use relay_protocol::{Event, EventClass};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Notified on every event that reaches the fan-out path: non-ephemeral
/// events reach it via the Store's CDC notify -> Dispatcher; ephemeral
/// events are never persisted, so the Processor calls this directly
/// (spec.md §4.5's single-process fallback applies structurally to every
/// ephemeral event, not only to changefeed-less deployments).
pub trait DirectPublish: Send + Sync {
    fn publish_direct(&self, event: Event);
}

pub struct Processor {
    tx: mpsc::Sender<Event>,
}

impl Processor {
    pub fn spawn(
        queue_capacity: usize,
        workers: usize,
        store: Arc<Store>,
        membership: Arc<MembershipFilter>,
        metrics: Arc<Metrics>,
        dispatcher: Arc<dyn DirectPublish>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let store = store.clone();
            let membership = membership.clone();
            let metrics = metrics.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                loop {
                    let event = { rx.lock().await.recv().await };
                    match event {
                        Some(e) => process_one(e, &store, &membership, &metrics, dispatcher.as_ref()).await,
                        None => break,
                    }
                }
            });
        }
        Self { tx }
    }

    /// `false` on a full queue — the caller (Session) replies `server busy`.
    #[must_use]
    pub fn enqueue(&self, event: Event) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

async fn process_one(
    e: Event,
    store: &Store,
    membership: &MembershipFilter,
    metrics: &Metrics,
    dispatcher: &(dyn DirectPublish + '_),
) {
    if membership.contains(&e.id) {
        return;
    }

    let class = e.class();
    if matches!(class, EventClass::Ephemeral) {
        metrics.events_processed.with_label_values(&["ephemeral"]).inc();
        dispatcher.publish_direct(e);
        return;
    }

    let mut delay = Duration::from_millis(50);
    for attempt in 0..3 {
        metrics.db_operations.with_label_values(&[class_label(class)]).inc();
        let attempt_result = tokio::time::timeout(Duration::from_secs(3), persist(&e, class, store)).await;
        match attempt_result {
            Ok(Ok(outcome)) => {
                membership.insert(&e.id);
                let label = class_label(class);
                if outcome == InsertOutcome::Inserted {
                    metrics.events_processed.with_label_values(&[label]).inc();
                } else {
                    metrics.duplicate_events.inc();
                }
                return;
            }
            Ok(Err(err)) => {
                metrics.db_errors.with_label_values(&["insert"]).inc();
                tracing::warn!(event_id = %e.id, attempt, error = %err, "store write failed, retrying");
            }
            Err(_) => {
                tracing::warn!(event_id = %e.id, attempt, "store write timed out, retrying");
            }
        }
        if attempt < 2 {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    tracing::warn!(event_id = %e.id, "store write failed after 3 attempts, dropping");
}

async fn persist(e: &Event, class: EventClass, store: &Store) -> Result<InsertOutcome, sqlx::Error> {
    match class {
        EventClass::Deletion => store.persist_deletion(e).await,
        EventClass::Replaceable => store.insert_replaceable(e).await,
        EventClass::Addressable => store.insert_addressable(e).await,
        EventClass::Ephemeral => unreachable!("ephemeral events never reach persist()"),
        EventClass::Regular => store.insert_event(e).await,
    }
}

fn class_label(class: EventClass) -> &'static str {
    match class {
        EventClass::Regular => "regular",
        EventClass::Replaceable => "replaceable",
        EventClass::Ephemeral => "ephemeral",
        EventClass::Addressable => "addressable",
        EventClass::Deletion => "deletion",
    }
}
