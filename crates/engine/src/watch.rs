//! Streaming watch loop for one `(namespace, kind)` pair.

use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, WatchParams},
    core::WatchEvent,
};
use tracing::{debug, error, info, warn};

use crate::{
    errors::SyncError,
    reconciler::Reconciler,
    snapshot::{EventKind, Projectable},
    supervisor::LoopContext,
};

/// Watches until a fatal api error occurs. Every connection cycle starts
/// with a full list so the caches (and the resume point) are rebuilt after
/// reconnects; the stream then delivers events until the server closes the
/// connection or something breaks, in which case the loop throttles and
/// reconnects.
pub(crate) async fn watch_resource<K: Projectable>(ctx: LoopContext) -> Result<(), SyncError> {
    let api: Api<K> = ctx.scope.api(&ctx.client);
    let selector = ctx.settings.label_selector();
    let mut reconciler = Reconciler::new(ctx.settings.clone(), ctx.notifier.clone());

    info!(
        "performing watch-based sync on {} resources: namespace {}, selector {selector}",
        <K as Projectable>::kind(),
        ctx.scope
    );

    loop {
        match watch_cycle(&api, &selector, &ctx, &mut reconciler).await {
            Ok(()) => debug!("watch stream for {} in {} ended, reconnecting", <K as Projectable>::kind(), ctx.scope),
            Err(err) if err.is_fatal() => {
                error!("fatal api error while watching {} in {}: {err}", <K as Projectable>::kind(), ctx.scope);
                return Err(err);
            },
            Err(err) => error!("error while watching {} in {}: {err}", <K as Projectable>::kind(), ctx.scope),
        }
        tokio::time::sleep(ctx.settings.error_throttle).await;
    }
}

async fn watch_cycle<K: Projectable>(
    api: &Api<K>,
    selector: &str,
    ctx: &LoopContext,
    reconciler: &mut Reconciler,
) -> Result<(), SyncError> {
    let list = api.list(&ListParams::default().labels(selector)).await?;
    ctx.health.touch();

    let version = list.metadata.resource_version.unwrap_or_else(|| "0".to_string());
    reconciler
        .apply_full_set(list.items.into_iter().map(K::into_snapshot).collect())
        .await;

    let params = WatchParams::default()
        .labels(selector)
        .timeout(ctx.settings.watch_server_timeout);
    let mut stream = api.watch(&params, &version).await?.boxed();

    while let Some(event) = stream.try_next().await? {
        ctx.health.touch();
        match event {
            WatchEvent::Added(object) => {
                reconciler.apply_event(EventKind::Added, object.into_snapshot()).await
            },
            WatchEvent::Modified(object) => {
                reconciler.apply_event(EventKind::Modified, object.into_snapshot()).await
            },
            WatchEvent::Deleted(object) => {
                reconciler.apply_event(EventKind::Deleted, object.into_snapshot()).await
            },
            WatchEvent::Bookmark(_) => {},
            WatchEvent::Error(status) if status.code == 500 => {
                return Err(SyncError::ApiFatal(status))
            },
            WatchEvent::Error(status) => {
                warn!("watch stream reported an error, restarting: {status:?}");
                break;
            },
        }
    }

    Ok(())
}
