#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::broadcast::{self, error::RecvError};

use gridsync::testing::{case_backend, wait_until, MemoryGridBackend};
use gridsync::{GridCollaborators, GridConfig, GridEngine, GridNotice, StoreEvent, SubscriptionState};
use gridsync_core::GridSchema;

pub const WAIT: Duration = Duration::from_secs(2);

/// Reconnect quickly so disruption tests stay short.
pub fn fast_config() -> GridConfig {
    GridConfig {
        resubscribe_initial_backoff_ms: 5,
        resubscribe_max_backoff_ms: 40,
        ..GridConfig::default()
    }
}

pub fn backend() -> Arc<MemoryGridBackend> {
    Arc::new(case_backend())
}

/// Mount the case grid and wait until every feed subscription is live.
/// Calls made during the mount are cleared.
pub async fn mount(backend: &Arc<MemoryGridBackend>) -> Result<GridEngine> {
    mount_with(backend, GridSchema::cases(), fast_config()).await
}

pub async fn mount_with(
    backend: &Arc<MemoryGridBackend>,
    schema: GridSchema,
    config: GridConfig,
) -> Result<GridEngine> {
    let mut tables = vec![schema.table.clone()];
    if let Some(log) = &schema.log {
        tables.push(log.table.clone());
    }
    let engine =
        GridEngine::mount(schema, config, GridCollaborators::from_backend(backend.clone())).await;
    wait_until(WAIT, || {
        tables
            .iter()
            .all(|t| engine.subscription_state(t) == Some(SubscriptionState::Active))
    })
    .await?;
    backend.clear_calls();
    Ok(engine)
}

/// Wait for the first notice accepted by `matches`, skipping everything else.
pub async fn next_notice<F>(
    rx: &mut broadcast::Receiver<StoreEvent>,
    mut matches: F,
) -> Result<GridNotice>
where
    F: FnMut(&GridNotice) -> bool,
{
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(StoreEvent::Notice(notice)) if matches(&notice) => return Some(notice),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await;
    match found {
        Ok(Some(notice)) => Ok(notice),
        Ok(None) => Err(anyhow!("store closed before the notice arrived")),
        Err(_) => Err(anyhow!("no matching notice within {:?}", WAIT)),
    }
}

/// Notices already delivered to `rx`, without waiting.
pub fn drain_notices(rx: &mut broadcast::Receiver<StoreEvent>) -> Vec<GridNotice> {
    let mut notices = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(StoreEvent::Notice(notice)) => notices.push(notice),
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return notices,
        }
    }
}
