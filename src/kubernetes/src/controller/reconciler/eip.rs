use std::{net::IpAddr, str::FromStr, sync::Arc};

use futures::{future, StreamExt, TryStreamExt};
use kube::{
    api::{ListParams, Patch, PatchParams},
    runtime::{
        controller::{self, Action, Controller},
        events::EventType,
        finalizer::{finalizer, Event},
        reflector::{self, reflector},
        watcher::{watcher, Config},
        WatchStreamExt,
    },
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::{field, Span};

use elbd_ipam::range::AddressRange;
use elbd_trace::telemetry::get_trace_id;

use crate::{
    controller::{
        context::{error_policy, ContextWith, Ctx, LbComponent, State},
        error::Error,
        metrics::Metrics,
        predicate::EipFilter,
    },
    crd::eip::{node_finalizer, Eip},
};

use super::absorb;

pub const REASON_INVALID_ADDRESS: &str = "InvalidAddress";

#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler(eip: Arc<Eip>, ctx: Arc<ContextWith<LbComponent>>) -> Result<Action, Error> {
    let trace_id = get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics().count_and_measure::<Eip>();
    ctx.touch().await;

    let name = eip.name_any();
    let eips = Api::<Eip>::all(ctx.client().clone());

    let res = match ctx.component.node_name.clone() {
        Some(node) => {
            let node_finalizer = node_finalizer(&node);
            finalizer(&eips, &node_finalizer, eip, |event| async {
                match event {
                    Event::Apply(eip) => reconcile(&eips, &eip, ctx.clone()).await,
                    Event::Cleanup(eip) => cleanup(&eip, ctx.clone()).await,
                }
            })
            .await
            .map_err(|e| Error::Finalizer(Box::new(e)))
        }
        None if eip.metadata.deletion_timestamp.is_some() => {
            tracing::info!(name, "EIP is being deleted");
            forget_pool(&name, &ctx)?;
            Ok(Action::await_change())
        }
        None => reconcile(&eips, &eip, ctx.clone()).await,
    };
    absorb(res, &name, &ctx)
}

#[tracing::instrument(skip_all)]
async fn reconcile(
    api: &Api<Eip>,
    eip: &Eip,
    ctx: Arc<ContextWith<LbComponent>>,
) -> Result<Action, Error> {
    let name = eip.name_any();
    tracing::info!(name, address = eip.spec.address, "reconcile Eip");

    let range = match AddressRange::from_str(&eip.spec.address) {
        Ok(range) => range,
        Err(e) => return reject(api, eip, &ctx, Error::Ipam(e)).await,
    };

    let upserted = {
        let mut registry = ctx
            .component
            .registry
            .inner
            .lock()
            .map_err(|_| Error::FailedToGetLock)?;
        match registry.upsert(&name, range) {
            Ok(changed) => Ok((
                changed,
                registry
                    .get(&name)
                    .map(|p| (p.size(), p.used()))
                    .unwrap_or_default(),
            )),
            Err(e) => Err(e),
        }
    };
    let (changed, (size, used)) = match upserted {
        Ok(res) => res,
        Err(e) => return reject(api, eip, &ctx, Error::Ipam(e)).await,
    };
    ctx.metrics().eip_set(&name, size as i64, used as i64);

    if changed {
        tracing::info!(name, range = %range, size = %size, "registered EIP pool");
        if eip.is_occupied() {
            // addresses outside the new range were dropped
            sync_usage(&ctx, &name).await?;
        }
    }

    if !eip.is_enabled() && !ctx.component.is_agent() {
        patch_enable(api, &name, true).await?;
        tracing::info!(name, "enabled EIP");
    }

    Ok(Action::await_change())
}

// Disables the EIP and keeps it out of the registry until its spec changes.
async fn reject(
    api: &Api<Eip>,
    eip: &Eip,
    ctx: &ContextWith<LbComponent>,
    err: Error,
) -> Result<Action, Error> {
    let name = eip.name_any();
    tracing::warn!(name, address = eip.spec.address, error = %err, "EIP address is rejected");

    forget_pool(&name, ctx)?;

    if !ctx.component.is_agent() {
        if eip.status.as_ref().map(|s| s.enable).unwrap_or(true) {
            patch_enable(api, &name, false).await?;
        }
        ctx.publish(
            eip,
            EventType::Warning,
            REASON_INVALID_ADDRESS,
            "Validate",
            format!("address {} is rejected: {err}", eip.spec.address),
        )
        .await;
    }

    match err {
        // the other pool may go away
        Error::Ipam(elbd_ipam::error::Error::Overlap(_, _)) => Ok(Action::requeue(ctx.interval())),
        _ => Ok(Action::await_change()),
    }
}

#[tracing::instrument(skip_all)]
async fn cleanup(eip: &Eip, ctx: Arc<ContextWith<LbComponent>>) -> Result<Action, Error> {
    let name = eip.name_any();
    tracing::info!(name, "clean up Eip");

    let in_use: Vec<IpAddr> = {
        let registry = ctx
            .component
            .registry
            .inner
            .lock()
            .map_err(|_| Error::FailedToGetLock)?;
        registry
            .get(&name)
            .map(|p| p.in_use().copied().collect())
            .unwrap_or_default()
    };

    for addr in in_use.iter() {
        ctx.component
            .speaker
            .delete_routes(*addr, &[])
            .await
            .map_err(|e| {
                tracing::error!(name, ip = %addr, error = ?e, "failed to withdraw route");
                Error::Route(e)
            })?;
        tracing::info!(name, ip = %addr, "withdrew route");
    }

    forget_pool(&name, &ctx)?;

    Ok(Action::await_change())
}

fn forget_pool(name: &str, ctx: &ContextWith<LbComponent>) -> Result<(), Error> {
    let removed = ctx
        .component
        .registry
        .inner
        .lock()
        .map_err(|_| Error::FailedToGetLock)?
        .remove(name);
    if removed.is_some() {
        tracing::info!(name, "removed EIP pool");
    }
    ctx.metrics().eip_remove(name);
    Ok(())
}

async fn patch_enable(api: &Api<Eip>, name: &str, enable: bool) -> Result<(), Error> {
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({"status": {"enable": enable}})),
    )
    .await
    .map_err(Error::Kube)?;
    Ok(())
}

/// Writes `occupied` and `portsUsage` of the pool named `pool` from the
/// registry and returns the updated EIP. A pool that is unknown or already
/// deleted is skipped, and agents only refresh the gauges.
pub(crate) async fn sync_usage(
    ctx: &ContextWith<LbComponent>,
    pool: &str,
) -> Result<Option<Eip>, Error> {
    let usage = {
        let registry = ctx
            .component
            .registry
            .inner
            .lock()
            .map_err(|_| Error::FailedToGetLock)?;
        registry
            .get(pool)
            .map(|p| (p.is_occupied(), p.ports_usage(), p.size(), p.used()))
    };
    let (occupied, ports_usage, size, used) = match usage {
        Some(usage) => usage,
        None => return Ok(None),
    };
    ctx.metrics().eip_set(pool, size as i64, used as i64);
    if ctx.component.is_agent() {
        return Ok(None);
    }

    let eips = Api::<Eip>::all(ctx.client().clone());
    let patch = json!({"status": {"occupied": occupied, "portsUsage": ports_usage}});
    match eips
        .patch_status(pool, &PatchParams::default(), &Patch::Merge(patch))
        .await
    {
        Ok(eip) => Ok(Some(eip)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            tracing::warn!(eip = pool, "EIP is gone, skip updating its usage");
            Ok(None)
        }
        Err(e) => Err(Error::Kube(e)),
    }
}

pub async fn run(
    state: State,
    client: Client,
    interval: u64,
    component: LbComponent,
    metrics: Metrics,
) {
    let eips = Api::<Eip>::all(client.clone());
    if let Err(e) = eips.list(&ListParams::default().limit(1)).await {
        tracing::error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        tracing::info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    tracing::info!(agent = component.node_name.is_some(), "Start Eip reconciler");

    let ctx = state.to_context_with(client, interval, component, metrics);
    let registry = ctx.component.registry.clone();
    let eip_metrics = ctx.metrics().clone();

    let (reader, writer) = reflector::store();
    let mut filter = EipFilter::default();
    let stream = reflector(
        writer,
        watcher(eips, Config::default().any_semantic()).default_backoff(),
    )
    .touched_objects()
    .try_filter(move |eip| future::ready(filter.admit(eip)));

    Controller::for_stream(stream, reader)
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy::<Eip, ContextWith<LbComponent>>,
            ctx,
        )
        .for_each(|res| {
            match res {
                Ok(_) => {}
                // deleted before it was reconciled
                Err(controller::Error::ObjectNotFound(obj)) => {
                    if let Ok(mut registry) = registry.inner.lock() {
                        registry.remove(&obj.name);
                    }
                    eip_metrics.eip_remove(&obj.name);
                }
                Err(e) => tracing::debug!(error = ?e, "Eip reconciler reported"),
            }
            future::ready(())
        })
        .await;
}
