//! Background synchronization with the public registry.
//!
//! The worker wakes on a timer, asks upstream for anything newer than what
//! the catalog holds, and appends it. Fetching and decoding happen before
//! the writer lock is taken so readers never wait on upstream.

use crate::catalog::{parse_spec, SyncPlan};
use crate::errors::SyncError;
use crate::CoreContext;
use std::sync::Arc;
use tokio::sync::oneshot;

pub const UPSTREAM_BASE: &str = "https://package.elm-lang.org";

#[derive(Debug, PartialEq)]
pub enum SyncOutcome {
    /// The previous sync is recent enough; nothing was fetched.
    Skipped,
    Synced(usize),
}

/// Long-lived sync task. Runs until the shutdown signal fires; a failed
/// tick is logged and retried at the next interval.
pub async fn worker(ctx: Arc<CoreContext>, mut shutdown: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(ctx.settings.sync_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => match run_once(&ctx).await {
                Ok(SyncOutcome::Skipped) => log::debug!("sync debounced, previous run is recent"),
                Ok(SyncOutcome::Synced(0)) => log::debug!("catalog is up to date"),
                Ok(SyncOutcome::Synced(n)) => log::info!("synced {} new package entries", n),
                Err(e) => log::error!("sync tick failed: {}", e),
            },
            _ = &mut shutdown => {
                log::info!("sync worker stopping");
                return;
            }
        }
    }
}

/// One sync tick. Also invoked directly at boot to warm an empty mirror.
pub async fn run_once(ctx: &CoreContext) -> Result<SyncOutcome, SyncError> {
    if debounced(ctx) {
        return Ok(SyncOutcome::Skipped);
    }
    let since = ctx.catalog.public_count()?;
    let plan = if since == 0 {
        let body = fetch(ctx, &format!("{}/all-packages", UPSTREAM_BASE)).await?;
        SyncPlan::Full(decode_full_index(&body)?)
    } else {
        let url = format!("{}/all-packages/since/{}", UPSTREAM_BASE, since);
        let body = fetch(ctx, &url).await?;
        SyncPlan::Incremental(decode_since(&body)?)
    };
    let applied = ctx.catalog.apply_sync(plan)?;
    Ok(SyncOutcome::Synced(applied))
}

/// Skip the tick when the previous successful sync landed under half a
/// period ago; forced syncs (boot) and the timer would otherwise stack up.
fn debounced(ctx: &CoreContext) -> bool {
    let half = ctx.settings.sync_interval() / 2;
    ctx.catalog
        .last_sync()
        .map(|at| at.elapsed() < half)
        .unwrap_or(false)
}

async fn fetch(ctx: &CoreContext, url: &str) -> Result<Vec<u8>, SyncError> {
    let response = ctx.upstream.get(url).send().await?;
    if !response.status().is_success() {
        return Err(SyncError::UpstreamStatus(response.status().as_u16()));
    }
    Ok(response.bytes().await?.to_vec())
}

/// `/all-packages` is an object of `name: [versions]`, flattened in
/// upstream iteration order.
fn decode_full_index(bytes: &[u8]) -> Result<Vec<(String, String)>, SyncError> {
    let index: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(bytes)?;
    let mut entries = Vec::new();
    for (name, versions) in index {
        let versions: Vec<String> = serde_json::from_value(versions)?;
        for version in versions {
            entries.push((name.clone(), version));
        }
    }
    Ok(entries)
}

/// `/all-packages/since/{n}` is an array of `name@version` specs.
fn decode_since(bytes: &[u8]) -> Result<Vec<(String, String)>, SyncError> {
    let specs: Vec<String> = serde_json::from_slice(bytes)?;
    specs
        .iter()
        .map(|spec| parse_spec(spec).map_err(Into::into))
        .collect()
}
