//! Change-feed reconciler
//!
//! One background task per watched table (the row table and, when the schema
//! has one, its log table). Each task drives the subscription lifecycle
//!
//! ```text
//! Disconnected -> Subscribing -> Active -> Disconnected -> Reconnecting -> Subscribing ...
//! ```
//!
//! and merges every event it receives into the store. Missed events are never
//! replayed: reaching `Active` again after a disruption publishes
//! `ResyncRequired` and leaves the refetch to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use gridsync_api::ChangeEvent;
use gridsync_core::ChangeFeedClient;

use crate::config::GridConfig;
use crate::store::{GridNotice, GridStore, RemoteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Disconnected,
    Subscribing,
    Active,
    Reconnecting,
}

struct TableFeed {
    state: Arc<watch::Sender<SubscriptionState>>,
    task: JoinHandle<()>,
}

pub struct ChangeFeedReconciler {
    feeds: HashMap<String, TableFeed>,
    shutdown: watch::Sender<bool>,
}

impl ChangeFeedReconciler {
    /// Spawn one subscription task per table the store's schema watches.
    pub fn start(store: Arc<GridStore>, feed: Arc<dyn ChangeFeedClient>, config: &GridConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let schema = store.schema();
        let mut tables = vec![schema.table.clone()];
        if let Some(log) = &schema.log {
            tables.push(log.table.clone());
        }

        let mut feeds = HashMap::new();
        for table in tables {
            let (state_tx, _) = watch::channel(SubscriptionState::Disconnected);
            let state = Arc::new(state_tx);
            let task = tokio::spawn(run_table(
                table.clone(),
                store.clone(),
                feed.clone(),
                config.clone(),
                state.clone(),
                shutdown.subscribe(),
            ));
            feeds.insert(table, TableFeed { state, task });
        }
        info!("[Reconciler] Started for {} tables", feeds.len());
        Self { feeds, shutdown }
    }

    pub fn state(&self, table: &str) -> Option<SubscriptionState> {
        self.feeds.get(table).map(|f| *f.state.borrow())
    }

    /// Watch lifecycle transitions of one table.
    pub fn watch_state(&self, table: &str) -> Option<watch::Receiver<SubscriptionState>> {
        self.feeds.get(table).map(|f| f.state.subscribe())
    }

    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.feeds.keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Tear down every subscription without waiting for the tasks.
    ///
    /// Aborting a task drops its stream, which unsubscribes.
    pub fn shutdown(&mut self) {
        if self.feeds.is_empty() {
            return;
        }
        let _ = self.shutdown.send(true);
        for (table, feed) in self.feeds.drain() {
            feed.task.abort();
            feed.state.send_replace(SubscriptionState::Disconnected);
            debug!("[Reconciler] Unsubscribed from {}", table);
        }
        info!("[Reconciler] Shut down");
    }
}

impl Drop for ChangeFeedReconciler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reconnect delay with up to 25% random jitter added.
pub(crate) fn backoff_with_jitter(config: &GridConfig, failures: u32) -> Duration {
    let base = config.resubscribe_backoff(failures);
    let spread = (base.as_millis() as u64) / 4;
    let jitter = if spread == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=spread)
    };
    base + Duration::from_millis(jitter)
}

fn handle_event(store: &GridStore, event: &ChangeEvent) {
    if event.origin.is_local() {
        debug!(
            "[Reconciler] Echo of local change on {}/{} (trace {:?})",
            event.table,
            event.row_id,
            event.origin.trace_id()
        );
    }
    match store.apply_remote_event(event) {
        RemoteOutcome::Inserted { partial: true } | RemoteOutcome::UnknownRow => {
            store.notify(GridNotice::RowRefetchRequested {
                row_id: event.row_id.clone(),
            });
        }
        _ => {}
    }
}

async fn run_table(
    table: String,
    store: Arc<GridStore>,
    feed: Arc<dyn ChangeFeedClient>,
    config: GridConfig,
    state: Arc<watch::Sender<SubscriptionState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let set_state = |next: SubscriptionState| {
        let previous = state.send_replace(next);
        if previous != next {
            info!("[Reconciler] {}: {:?} -> {:?}", table, previous, next);
        }
    };

    let mut failures: u32 = 0;
    let mut disrupted = false;
    let mut stale_notified = false;

    loop {
        if *shutdown.borrow() {
            break;
        }
        set_state(SubscriptionState::Subscribing);
        let subscribed = tokio::select! {
            _ = shutdown.changed() => break,
            result = feed.subscribe(&table) => result,
        };

        match subscribed {
            Ok(mut stream) => {
                set_state(SubscriptionState::Active);
                if disrupted {
                    store.notify(GridNotice::ResyncRequired {
                        table: table.clone(),
                    });
                }
                failures = 0;
                disrupted = false;
                stale_notified = false;

                let reason = loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            set_state(SubscriptionState::Disconnected);
                            return;
                        }
                        item = stream.next() => match item {
                            Some(Ok(event)) => handle_event(&store, &event),
                            Some(Err(e)) => break e.to_string(),
                            None => break "stream closed".to_string(),
                        },
                    }
                };
                warn!("[Reconciler] {} stream disrupted: {}", table, reason);
            }
            Err(e) => {
                warn!("[Reconciler] Subscribe to {} failed: {}", table, e);
            }
        }

        set_state(SubscriptionState::Disconnected);
        disrupted = true;
        failures += 1;
        if failures >= config.stale_notice_after_failures && !stale_notified {
            store.notify(GridNotice::DataMayBeStale {
                table: table.clone(),
            });
            stale_notified = true;
        }

        set_state(SubscriptionState::Reconnecting);
        let delay = backoff_with_jitter(&config, failures);
        debug!(
            "[Reconciler] {} reconnecting in {:?} (failure {})",
            table, delay, failures
        );
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    set_state(SubscriptionState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = GridConfig::default();
        for failures in 1..8 {
            let base = config.resubscribe_backoff(failures);
            let delay = backoff_with_jitter(&config, failures);
            assert!(delay >= base);
            assert!(delay <= base + base / 4);
        }
    }

    #[test]
    fn test_zero_backoff_has_no_jitter() {
        let config = GridConfig {
            resubscribe_initial_backoff_ms: 0,
            ..GridConfig::default()
        };
        assert_eq!(backoff_with_jitter(&config, 3), Duration::ZERO);
    }
}
