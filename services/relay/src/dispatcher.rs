// Single per-process consumer of the store's change-data-capture stream
// (spec.md §4.5). Grounded on `sqlx::postgres::PgListener` + Postgres
// `pg_notify`, the concrete substitute spec.md §9 sanctions for a store
// without a native row-commit changefeed; every write that commits a new
// row issues `pg_notify` inside the same transaction (`store.rs`), so
// `NOTIFY` only ever fires on commit.

use crate::node::Node;
use crate::processor::DirectPublish;
use crate::store::{Store, CDC_CHANNEL};
use relay_protocol::{Event, Filter};
use sqlx::postgres::PgListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct Dispatcher {
    node: Arc<Node>,
    store: Arc<Store>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(node: Arc<Node>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { node, store })
    }

    /// Issues `LISTEN relay_events` and spawns the consumer task. Returns a
    /// handle whose `stop()` tears the listener down and drains in-flight
    /// deliveries within a 5s deadline.
    pub async fn start(self: &Arc<Self>, database_url: &str) -> Result<DispatcherHandle, sqlx::Error> {
        let mut listener = PgListener::connect(database_url).await?;
        listener.listen(CDC_CHANNEL).await?;

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let dispatcher = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    notification = listener.recv() => {
                        match notification {
                            Ok(n) => dispatcher.handle_committed_id(n.payload()).await,
                            Err(e) => {
                                tracing::warn!(error = %e, "cdc listener error, stopping dispatcher");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(DispatcherHandle { stop_tx: Some(stop_tx), task: Some(task) })
    }

    async fn handle_committed_id(&self, id: &str) {
        let filter = Filter { ids: Some(vec![id.to_owned()]), ..Default::default() };
        self.node.metrics.db_operations.with_label_values(&["cdc_fetch"]).inc();
        match self.store.get_events(&filter).await {
            Ok(events) => {
                for event in events {
                    self.node.dispatch(&event).await;
                }
            }
            Err(e) => {
                self.node.metrics.db_errors.with_label_values(&["cdc_fetch"]).inc();
                tracing::warn!(id, error = %e, "failed to fetch committed event for dispatch");
            }
        }
    }
}

impl DirectPublish for Dispatcher {
    fn publish_direct(&self, event: Event) {
        let node = self.node.clone();
        tokio::spawn(async move { node.dispatch(&event).await });
    }
}

pub struct DispatcherHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}
