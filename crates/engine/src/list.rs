//! Polling list loop, the alternative to the streaming watch.

use kube::api::{Api, ListParams};
use tracing::{error, info};

use crate::{
    errors::SyncError,
    reconciler::Reconciler,
    snapshot::Projectable,
    supervisor::LoopContext,
};

pub(crate) async fn list_resource<K: Projectable>(ctx: LoopContext) -> Result<(), SyncError> {
    let api: Api<K> = ctx.scope.api(&ctx.client);
    let selector = ctx.settings.label_selector();
    let mut reconciler = Reconciler::new(ctx.settings.clone(), ctx.notifier.clone());

    info!(
        "performing list-based sync on {} resources: namespace {}, selector {selector}",
        <K as Projectable>::kind(),
        ctx.scope
    );

    loop {
        match list_cycle(&api, &selector, &ctx, &mut reconciler).await {
            Ok(()) => tokio::time::sleep(ctx.settings.sleep_time).await,
            Err(err) if err.is_fatal() => {
                error!("fatal api error while listing {} in {}: {err}", <K as Projectable>::kind(), ctx.scope);
                return Err(err);
            },
            Err(err) => {
                error!("error while listing {} in {}: {err}", <K as Projectable>::kind(), ctx.scope);
                tokio::time::sleep(ctx.settings.error_throttle).await;
            },
        }
    }
}

async fn list_cycle<K: Projectable>(
    api: &Api<K>,
    selector: &str,
    ctx: &LoopContext,
    reconciler: &mut Reconciler,
) -> Result<(), SyncError> {
    let list = api.list(&ListParams::default().labels(selector)).await?;
    ctx.health.touch();

    reconciler
        .apply_full_set(list.items.into_iter().map(K::into_snapshot).collect())
        .await;

    Ok(())
}
