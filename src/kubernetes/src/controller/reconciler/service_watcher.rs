use std::{collections::BTreeSet, net::IpAddr, str::FromStr, sync::Arc};

use futures::{future, StreamExt, TryStreamExt};
use json_patch::{PatchOperation, RemoveOperation, TestOperation};
use k8s_openapi::api::core::v1::{
    Endpoints, LoadBalancerIngress, LoadBalancerStatus, Node, Service, ServiceStatus,
};
use kube::{
    api::{ListParams, Patch, PatchParams, PostParams},
    runtime::{
        controller::{self, Action, Controller},
        events::EventType,
        finalizer::{finalizer, Event},
        reflector::{self, reflector, ObjectRef},
        watcher::{watcher, Config},
        WatchStreamExt,
    },
    Api, Client, ResourceExt,
};
use tracing::{field, Span};

use elbd_route::speaker::{diff_nexthops, host_prefix_len};
use elbd_trace::telemetry::get_trace_id;

use crate::{
    controller::{
        context::{error_policy, ContextWith, Ctx, LbComponent, State},
        error::Error,
        metrics::Metrics,
        predicate::{endpoint_node_names, EndpointsFilter, ServiceFilter},
        selector::service_ports,
    },
    crd::eip::Eip,
    util::{first_node_address, get_namespaced_name},
};

use super::{absorb, eip::sync_usage};

// The typo is part of the wire contract.
pub const SERVICE_FINALIZER: &str = "finalizer.lb.kubesphere.io/v1apha1";
pub const PORTER_ANNOTATION_KEY: &str = "lb.kubesphere.io/v1alpha1";
pub const PORTER_ANNOTATION_VALUE: &str = "porter";

pub const REASON_ALLOCATED: &str = "Allocated";
pub const REASON_ALLOCATION_FAILED: &str = "AllocationFailed";
pub const REASON_ROUTE_ADDED: &str = "RouteAdded";
pub const REASON_ROUTE_UPDATED: &str = "RouteUpdated";
pub const REASON_RELEASED: &str = "Released";

#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler(
    svc: Arc<Service>,
    ctx: Arc<ContextWith<LbComponent>>,
) -> Result<Action, Error> {
    let trace_id = get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics().count_and_measure::<Service>();
    ctx.touch().await;

    let key = get_namespaced_name(svc.as_ref());
    let ns = svc.namespace().unwrap_or_else(|| "default".to_string());
    let services = Api::<Service>::namespaced(ctx.client().clone(), &ns);

    // the cached object may lag behind
    let cached = svc;
    let svc = match services
        .get_opt(&cached.name_any())
        .await
        .map_err(Error::Kube)?
    {
        Some(svc) => Arc::new(svc),
        None => {
            tracing::info!(name = key, "Service is already gone");
            if ctx.component.is_agent() && holds_address(&cached, &ctx)? {
                teardown(&cached, &ctx).await?;
            }
            ctx.requeue().forget(&key);
            return Ok(Action::await_change());
        }
    };

    let res = if ctx.component.is_agent() {
        advertise(&svc, ctx.clone()).await
    } else if is_porter_lb(&svc) {
        finalizer(&services, SERVICE_FINALIZER, svc, |event| async {
            match event {
                Event::Apply(svc) => reconcile(&services, &svc, ctx.clone()).await,
                Event::Cleanup(svc) => cleanup(&services, &svc, ctx.clone()).await,
            }
        })
        .await
        .map_err(|e| Error::Finalizer(Box::new(e)))
    } else if has_finalizer(&svc) {
        release(&services, &svc, ctx.clone()).await
    } else {
        Ok(Action::await_change())
    };
    absorb(res, &key, &ctx)
}

#[tracing::instrument(skip_all)]
async fn reconcile(
    api: &Api<Service>,
    svc: &Service,
    ctx: Arc<ContextWith<LbComponent>>,
) -> Result<Action, Error> {
    let key = get_namespaced_name(svc);
    tracing::info!(name = key, "reconcile Service");

    let ip = match get_ingress_ip(svc) {
        Some(ip) => ip,
        None => return create_lb(api, svc, ctx, None).await,
    };

    let added = ctx
        .component
        .speaker
        .is_route_added(ip, host_prefix_len(&ip))
        .await
        .map_err(|e| {
            tracing::error!(name = key, ip = %ip, error = ?e, "failed to look up route");
            Error::Route(e)
        })?;
    if !added {
        tracing::info!(name = key, ip = %ip, "route is missing, restoring it");
        return create_lb(api, svc, ctx, Some(ip)).await;
    }

    sync_route(svc, ctx, ip).await
}

// Binds an address to the service and advertises it. `current` is the
// address the service status already carries.
#[tracing::instrument(skip_all)]
async fn create_lb(
    api: &Api<Service>,
    svc: &Service,
    ctx: Arc<ContextWith<LbComponent>>,
    current: Option<IpAddr>,
) -> Result<Action, Error> {
    let key = get_namespaced_name(svc);

    let (ip, pool) = match current {
        Some(ip) => (ip, bind(svc, &ctx, ip).await?),
        None => allocate(svc, &ctx).await?,
    };
    let eip = match pool.as_ref() {
        Some(pool) => sync_usage(&ctx, pool).await?,
        None => None,
    };
    if current.is_none() {
        tracing::info!(name = key, ip = %ip, "allocated address");
        ctx.publish(
            svc,
            EventType::Normal,
            REASON_ALLOCATED,
            "Allocate",
            format!("allocated {ip}"),
        )
        .await;
        if let Some(eip) = eip.as_ref() {
            ctx.publish(
                eip,
                EventType::Normal,
                REASON_ALLOCATED,
                "Allocate",
                format!("allocated {ip} to {key}"),
            )
            .await;
        }
    }

    let nexthops = add_route(svc, &ctx, ip).await?;

    if current.is_none() {
        let new_svc = set_ingress_ip(svc, Some(ip));
        api.replace_status(
            &svc.name_any(),
            &PostParams::default(),
            serde_json::to_vec(&new_svc).map_err(Error::Serialization)?,
        )
        .await
        .map_err(Error::Kube)?;
        tracing::info!(name = key, ip = %ip, "updated Service status");
    }

    announced(svc, &ctx, ip, &nexthops).await
}

// Route programming on a node. The controller owns addresses and status, so
// a Service without an ingress address is left alone here.
#[tracing::instrument(skip_all)]
async fn advertise(svc: &Service, ctx: Arc<ContextWith<LbComponent>>) -> Result<Action, Error> {
    let key = get_namespaced_name(svc);

    if !is_porter_lb(svc) || svc.metadata.deletion_timestamp.is_some() {
        if holds_address(svc, &ctx)? {
            teardown(svc, &ctx).await?;
        }
        return Ok(Action::await_change());
    }

    let ip = match get_ingress_ip(svc) {
        Some(ip) => ip,
        None => {
            tracing::info!(name = key, "no address is allocated yet");
            return Ok(Action::await_change());
        }
    };

    let added = ctx
        .component
        .speaker
        .is_route_added(ip, host_prefix_len(&ip))
        .await
        .map_err(|e| {
            tracing::error!(name = key, ip = %ip, error = ?e, "failed to look up route");
            Error::Route(e)
        })?;
    if added {
        return sync_route(svc, ctx, ip).await;
    }

    bind(svc, &ctx, ip).await?;
    let nexthops = add_route(svc, &ctx, ip).await?;
    announced(svc, &ctx, ip, &nexthops).await
}

// Whether the service was given an address, either in its status or in the
// local registry. External IPs alone do not count.
fn holds_address(svc: &Service, ctx: &ContextWith<LbComponent>) -> Result<bool, Error> {
    if get_ingress_ip(svc).is_some() {
        return Ok(true);
    }
    let registry = ctx
        .component
        .registry
        .inner
        .lock()
        .map_err(|_| Error::FailedToGetLock)?;
    Ok(registry.address_of(&get_namespaced_name(svc)).is_some())
}

// Advertises `ip` via the nodes serving the service, if any.
async fn add_route(
    svc: &Service,
    ctx: &ContextWith<LbComponent>,
    ip: IpAddr,
) -> Result<Vec<IpAddr>, Error> {
    let nexthops = resolve_nexthops(svc, ctx)
        .await?
        .into_iter()
        .collect::<Vec<IpAddr>>();
    if nexthops.is_empty() {
        return Ok(nexthops);
    }
    ctx.component
        .speaker
        .add_route(ip, &nexthops)
        .await
        .map_err(|e| {
            tracing::error!(name = get_namespaced_name(svc), ip = %ip, error = ?e, "failed to add route");
            Error::Route(e)
        })?;
    Ok(nexthops)
}

async fn announced(
    svc: &Service,
    ctx: &ContextWith<LbComponent>,
    ip: IpAddr,
    nexthops: &[IpAddr],
) -> Result<Action, Error> {
    let key = get_namespaced_name(svc);

    if nexthops.is_empty() {
        let after = ctx.requeue().get_requeue_time(&key);
        tracing::warn!(
            name = key,
            ip = %ip,
            requeue_after = after.as_secs(),
            "no node serves this Service yet"
        );
        return Ok(Action::requeue(after));
    }

    tracing::info!(name = key, ip = %ip, nexthops = ?nexthops, "added route");
    ctx.publish(
        svc,
        EventType::Normal,
        REASON_ROUTE_ADDED,
        "AddRoute",
        format!("advertised {ip} via {}", join(nexthops)),
    )
    .await;

    Ok(Action::requeue(ctx.interval()))
}

// Makes the advertised next hops follow the endpoints of the service.
#[tracing::instrument(skip_all)]
async fn sync_route(
    svc: &Service,
    ctx: Arc<ContextWith<LbComponent>>,
    ip: IpAddr,
) -> Result<Action, Error> {
    let key = get_namespaced_name(svc);

    // the registry learns bindings from Service status after a restart
    if let Some(pool) = bind(svc, &ctx, ip).await? {
        sync_usage(&ctx, &pool).await?;
    }

    let desired = resolve_nexthops(svc, &ctx).await?;
    let current = ctx
        .component
        .speaker
        .get_route(ip, host_prefix_len(&ip))
        .await
        .map_err(|e| {
            tracing::error!(name = key, ip = %ip, error = ?e, "failed to get route");
            Error::Route(e)
        })?
        .map(|route| route.nexthops)
        .unwrap_or_default();

    let diff = diff_nexthops(&current, &desired);
    if diff.is_empty() {
        return Ok(Action::requeue(ctx.interval()));
    }
    tracing::info!(name = key, ip = %ip, added = ?diff.added, removed = ?diff.removed, "next hops diverged");

    if !diff.added.is_empty() {
        ctx.component
            .speaker
            .add_route(ip, &diff.added)
            .await
            .map_err(|e| {
                tracing::error!(name = key, ip = %ip, error = ?e, "failed to add next hops");
                Error::Route(e)
            })?;
    }
    if !diff.removed.is_empty() {
        let shared = {
            let registry = ctx
                .component
                .registry
                .inner
                .lock()
                .map_err(|_| Error::FailedToGetLock)?;
            registry.is_shared(&ip, &key)
        };
        if shared {
            tracing::info!(name = key, ip = %ip, "address is shared, keep next hops of others");
        } else {
            ctx.component
                .speaker
                .delete_routes(ip, &diff.removed)
                .await
                .map_err(|e| {
                    tracing::error!(name = key, ip = %ip, error = ?e, "failed to delete next hops");
                    Error::Route(e)
                })?;
        }
    }

    ctx.publish(
        svc,
        EventType::Normal,
        REASON_ROUTE_UPDATED,
        "UpdateRoute",
        format!(
            "advertised {ip} via {}",
            join(&desired.iter().copied().collect::<Vec<IpAddr>>())
        ),
    )
    .await;

    Ok(Action::requeue(ctx.interval()))
}

#[tracing::instrument(skip_all)]
async fn cleanup(
    _api: &Api<Service>,
    svc: &Service,
    ctx: Arc<ContextWith<LbComponent>>,
) -> Result<Action, Error> {
    tracing::info!(name = get_namespaced_name(svc), "clean up Service");
    teardown(svc, &ctx).await?;
    Ok(Action::await_change())
}

// The Service stopped being a porter load balancer while holding our
// finalizer.
#[tracing::instrument(skip_all)]
async fn release(
    api: &Api<Service>,
    svc: &Service,
    ctx: Arc<ContextWith<LbComponent>>,
) -> Result<Action, Error> {
    let key = get_namespaced_name(svc);
    tracing::info!(name = key, "Service is no longer managed, releasing");

    teardown(svc, &ctx).await?;

    if svc.metadata.deletion_timestamp.is_none() && get_ingress_ip(svc).is_some() {
        let new_svc = set_ingress_ip(svc, None);
        api.replace_status(
            &svc.name_any(),
            &PostParams::default(),
            serde_json::to_vec(&new_svc).map_err(Error::Serialization)?,
        )
        .await
        .map_err(Error::Kube)?;
    }

    if let Some(i) = svc.finalizers().iter().position(|f| f == SERVICE_FINALIZER) {
        let path = format!("/metadata/finalizers/{i}");
        let patch = json_patch::Patch(vec![
            PatchOperation::Test(TestOperation {
                path: path.clone(),
                value: SERVICE_FINALIZER.into(),
            }),
            PatchOperation::Remove(RemoveOperation { path }),
        ]);
        api.patch::<Service>(
            &svc.name_any(),
            &PatchParams::default(),
            &Patch::Json(patch),
        )
        .await
        .map_err(Error::Kube)?;
        tracing::info!(name = key, "removed finalizer");
    }

    ctx.requeue().forget(&key);
    Ok(Action::await_change())
}

async fn teardown(svc: &Service, ctx: &ContextWith<LbComponent>) -> Result<(), Error> {
    let key = get_namespaced_name(svc);

    let ip = {
        let registry = ctx
            .component
            .registry
            .inner
            .lock()
            .map_err(|_| Error::FailedToGetLock)?;
        get_ingress_ip(svc)
            .or_else(|| registry.address_of(&key))
            .or_else(|| get_external_ip(svc))
    };
    let ip = match ip {
        Some(ip) => ip,
        None => {
            tracing::info!(name = key, "no address to release");
            return Ok(());
        }
    };

    let (pool, ports) = match withdraw(&key, ip, ctx).await? {
        Some(released) => released,
        None => return Ok(()),
    };
    let eip = sync_usage(ctx, &pool).await?;
    tracing::info!(name = key, ip = %ip, eip = pool, ports = ?ports, "released address");
    if ctx.component.is_agent() {
        return Ok(());
    }

    ctx.publish(
        svc,
        EventType::Normal,
        REASON_RELEASED,
        "Release",
        format!("released {ip}"),
    )
    .await;
    if let Some(eip) = eip.as_ref() {
        ctx.publish(
            eip,
            EventType::Normal,
            REASON_RELEASED,
            "Release",
            format!("released {ip} from {key}"),
        )
        .await;
    }
    Ok(())
}

// Withdraws the route of `ip` unless another owner still uses it, then
// drops the binding of `key`. Returns the pool and ports that were released.
async fn withdraw(
    key: &str,
    ip: IpAddr,
    ctx: &ContextWith<LbComponent>,
) -> Result<Option<(String, Vec<u16>)>, Error> {
    let shared = ctx
        .component
        .registry
        .inner
        .lock()
        .map_err(|_| Error::FailedToGetLock)?
        .is_shared(&ip, key);

    if shared {
        tracing::info!(name = key, ip = %ip, "address is still used by others, keep the route");
    } else {
        ctx.component
            .speaker
            .delete_routes(ip, &[])
            .await
            .map_err(|e| {
                tracing::error!(name = key, ip = %ip, error = ?e, "failed to delete route");
                Error::Route(e)
            })?;
        tracing::info!(name = key, ip = %ip, "deleted route");
    }

    Ok(ctx
        .component
        .registry
        .inner
        .lock()
        .map_err(|_| Error::FailedToGetLock)?
        .release(ip, key))
}

// Picks and binds an address for a service without one. Returns the pool
// whose usage changed.
async fn allocate(
    svc: &Service,
    ctx: &ContextWith<LbComponent>,
) -> Result<(IpAddr, Option<String>), Error> {
    let key = get_namespaced_name(svc);

    // a previous attempt may have bound an address before failing
    let pinned = {
        let registry = ctx
            .component
            .registry
            .inner
            .lock()
            .map_err(|_| Error::FailedToGetLock)?;
        registry.address_of(&key)
    }
    .or_else(|| get_external_ip(svc));
    if let Some(ip) = pinned {
        let pool = bind(svc, ctx, ip).await?;
        return Ok((ip, pool));
    }

    let eips = Api::<Eip>::all(ctx.client().clone())
        .list(&ListParams::default())
        .await
        .map_err(Error::Kube)?
        .items;
    let ports = service_ports(svc);
    let res = {
        let mut registry = ctx
            .component
            .registry
            .inner
            .lock()
            .map_err(|_| Error::FailedToGetLock)?;
        ctx.component
            .selector
            .select(svc, &eips, &registry)
            .and_then(|ip| {
                registry
                    .mark_used(ip, &key, &ports)
                    .map(|pool| (ip, pool))
                    .map_err(Error::Ipam)
            })
    };
    match res {
        Ok(res) => Ok(res),
        Err(e) => Err(reject(svc, ctx, e).await),
    }
}

// Marks `ip` as used by the service. Returns the pool whose usage changed.
async fn bind(
    svc: &Service,
    ctx: &ContextWith<LbComponent>,
    ip: IpAddr,
) -> Result<Option<String>, Error> {
    let key = get_namespaced_name(svc);
    let ports = service_ports(svc);
    let res = ctx
        .component
        .registry
        .inner
        .lock()
        .map_err(|_| Error::FailedToGetLock)?
        .mark_used(ip, &key, &ports)
        .map_err(Error::Ipam);
    match res {
        Ok(pool) => Ok(pool),
        Err(e) => Err(reject(svc, ctx, e).await),
    }
}

async fn reject(svc: &Service, ctx: &ContextWith<LbComponent>, err: Error) -> Error {
    if err.is_validation() && !ctx.component.is_agent() {
        tracing::warn!(name = get_namespaced_name(svc), error = %err, "failed to allocate address");
        ctx.publish(
            svc,
            EventType::Warning,
            REASON_ALLOCATION_FAILED,
            "Allocate",
            err.to_string(),
        )
        .await;
    }
    err
}

async fn resolve_nexthops(
    svc: &Service,
    ctx: &ContextWith<LbComponent>,
) -> Result<BTreeSet<IpAddr>, Error> {
    let key = get_namespaced_name(svc);
    let ns = svc.namespace().unwrap_or_else(|| "default".to_string());

    let endpoints = Api::<Endpoints>::namespaced(ctx.client().clone(), &ns);
    let ep = match endpoints
        .get_opt(&svc.name_any())
        .await
        .map_err(Error::Kube)?
    {
        Some(ep) => ep,
        None => return Ok(BTreeSet::new()),
    };
    let node_names = endpoint_node_names(&ep);
    if node_names.is_empty() {
        return Ok(BTreeSet::new());
    }

    let nodes = Api::<Node>::all(ctx.client().clone())
        .list(&ListParams::default())
        .await
        .map_err(Error::Kube)?;

    let mut nexthops = BTreeSet::new();
    for node_name in node_names.iter() {
        match nodes.iter().find(|n| n.name_any().eq(node_name)) {
            Some(node) => match first_node_address(node) {
                Some(addr) => {
                    nexthops.insert(addr);
                }
                None => {
                    tracing::warn!(name = key, node = node_name, "node has no address")
                }
            },
            None => tracing::warn!(name = key, node = node_name, "node is not found"),
        }
    }
    Ok(nexthops)
}

pub async fn run(
    state: State,
    client: Client,
    interval: u64,
    component: LbComponent,
    metrics: Metrics,
) {
    let services = Api::<Service>::all(client.clone());
    let endpoints = Api::<Endpoints>::all(client.clone());

    tracing::info!("Start Service watcher");

    let ctx = state.to_context_with(client, interval, component, metrics);
    let gone_ctx = ctx.clone();

    let (reader, writer) = reflector::store();
    let mut svc_filter = ServiceFilter::default();
    let svc_stream = reflector(
        writer,
        watcher(services, Config::default().any_semantic()).default_backoff(),
    )
    .touched_objects()
    .try_filter(move |svc| future::ready(svc_filter.admit(svc)));

    let mut ep_filter = EndpointsFilter::new(reader.clone());
    let ep_stream = watcher(endpoints, Config::default().any_semantic())
        .default_backoff()
        .touched_objects()
        .try_filter(move |ep| future::ready(ep_filter.admit(ep)));

    Controller::for_stream(svc_stream, reader)
        .watches_stream(ep_stream, |ep: Endpoints| {
            ep.namespace()
                .map(|ns| ObjectRef::<Service>::new(&ep.name_any()).within(&ns))
        })
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy::<Service, ContextWith<LbComponent>>,
            ctx,
        )
        .for_each(|res| {
            let ctx = gone_ctx.clone();
            async move {
                match res {
                    Ok(_) => {}
                    Err(controller::Error::ObjectNotFound(obj)) => {
                        let key = match obj.namespace.as_deref() {
                            Some(ns) => format!("{ns}/{}", obj.name),
                            None => obj.name.clone(),
                        };
                        ctx.requeue().forget(&key);
                        if let Err(e) = forget_binding(&key, &ctx).await {
                            tracing::warn!(name = key, error = ?e, "failed to withdraw route of deleted Service");
                        }
                    }
                    Err(e) => tracing::debug!(error = ?e, "Service watcher reported"),
                }
            }
        })
        .await;
}

// An agent may miss the terminating state of a Service whose finalizer the
// controller already dropped. Its local binding is all that is left.
async fn forget_binding(key: &str, ctx: &ContextWith<LbComponent>) -> Result<(), Error> {
    if !ctx.component.is_agent() {
        return Ok(());
    }
    let ip = ctx
        .component
        .registry
        .inner
        .lock()
        .map_err(|_| Error::FailedToGetLock)?
        .address_of(key);
    if let Some(ip) = ip {
        withdraw(key, ip, ctx).await?;
    }
    Ok(())
}

pub fn is_loadbalancer(svc: &Service) -> bool {
    match svc.spec.as_ref().and_then(|spec| spec.type_.as_ref()) {
        Some(t) => t.eq("LoadBalancer"),
        None => false,
    }
}

pub fn has_porter_annotation(svc: &Service) -> bool {
    svc.annotations()
        .get(PORTER_ANNOTATION_KEY)
        .map(|v| v.eq(PORTER_ANNOTATION_VALUE))
        .unwrap_or(false)
}

pub fn is_porter_lb(svc: &Service) -> bool {
    is_loadbalancer(svc) && has_porter_annotation(svc)
}

pub fn has_finalizer(svc: &Service) -> bool {
    svc.finalizers().iter().any(|f| f == SERVICE_FINALIZER)
}

pub fn get_ingress_ip(svc: &Service) -> Option<IpAddr> {
    svc.status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|ingress| ingress.ip.as_ref())
        .and_then(|ip| IpAddr::from_str(ip).ok())
}

fn get_external_ip(svc: &Service) -> Option<IpAddr> {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.external_ips.as_ref())
        .and_then(|ips| ips.first())
        .and_then(|ip| IpAddr::from_str(ip).ok())
}

fn set_ingress_ip(svc: &Service, ip: Option<IpAddr>) -> Service {
    let mut new_svc = svc.clone();
    let ingress = ip.map(|ip| {
        vec![LoadBalancerIngress {
            ip: Some(ip.to_string()),
            ..Default::default()
        }]
    });
    let status = new_svc.status.get_or_insert_with(ServiceStatus::default);
    status.load_balancer = Some(LoadBalancerStatus { ingress });
    new_svc
}

fn join(addrs: &[IpAddr]) -> String {
    addrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<String>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, net::IpAddr, str::FromStr, sync::Arc, time::Duration};

    use assert_json_diff::assert_json_include;
    use chrono::Utc;
    use http::Response;
    use hyper::{body::to_bytes, Body};
    use k8s_openapi::{
        api::core::v1::{Endpoints, Node, Service},
        apimachinery::pkg::apis::meta::v1::Time,
    };
    use kube::{core::ObjectList, runtime::controller::Action, ResourceExt};
    use rstest::rstest;

    use elbd_ipam::range::AddressRange;
    use elbd_mock::speaker::{Call, MockSpeaker};

    use crate::{
        controller::{
            context::{error_policy, ContextWith, LbComponent},
            error::Error,
        },
        crd::eip::Eip,
        fixture::reconciler::{
            api_server_response_not_found, api_server_response_resource, assert_resource_request,
            test_component, test_eip, test_eps, test_node_list, test_svc, test_svc_with_name,
            timeout_after_1s, ApiServerVerifier,
        },
    };

    use super::*;

    const EIP_ADDR: &str = "192.168.1.10";

    fn addr(s: &str) -> IpAddr {
        IpAddr::from_str(s).unwrap()
    }

    fn addrs(a: &[&str]) -> BTreeSet<IpAddr> {
        a.iter().map(|s| addr(s)).collect()
    }

    fn bound_svc(name: &str) -> Service {
        set_ingress_ip(&test_svc_with_name(name), Some(addr(EIP_ADDR)))
    }

    fn register_eip(ctx: &ContextWith<LbComponent>, bound: &[&str]) {
        let mut registry = ctx.component.registry.inner.lock().unwrap();
        registry
            .upsert("eip-a", AddressRange::from_str("192.168.1.10/32").unwrap())
            .unwrap();
        for owner in bound {
            registry.mark_used(addr(EIP_ADDR), owner, &[80]).unwrap();
        }
    }

    enum Scenario {
        AddFinalizer(Service),
        Create(Service, Vec<&'static str>),
        CreateWithoutEndpoints(Service),
        Restore(Service),
        UpdateEndpoints(Service, Vec<&'static str>),
        Delete(Service),
        Exhausted(Service),
        Shared(Service),
        Unannotated(Service),
        NotFound(Service),
        Restart(Vec<Eip>, Vec<Service>, Service),
        Advertise(Service),
        Unallocated(Service),
        Terminating(Service),
    }

    impl ApiServerVerifier {
        fn service_run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                match scenario {
                    Scenario::AddFinalizer(svc) => {
                        self.get_svc(&svc).await.unwrap().add_finalizer(&svc).await
                    }
                    Scenario::Create(svc, nodes) => {
                        self.get_svc(&svc)
                            .await
                            .unwrap()
                            .list_eips()
                            .await
                            .unwrap()
                            .patch_eip_usage(true, vec![80])
                            .await
                            .unwrap()
                            .handle_event_on("Service", REASON_ALLOCATED, "Normal")
                            .await
                            .unwrap()
                            .handle_event_on("Eip", REASON_ALLOCATED, "Normal")
                            .await
                            .unwrap()
                            .get_endpoints(&svc, &nodes)
                            .await
                            .unwrap()
                            .list_nodes()
                            .await
                            .unwrap()
                            .replace_svc_status(&svc, Some(EIP_ADDR))
                            .await
                            .unwrap()
                            .handle_event(REASON_ROUTE_ADDED, "Normal")
                            .await
                    }
                    Scenario::CreateWithoutEndpoints(svc) => {
                        self.get_svc(&svc)
                            .await
                            .unwrap()
                            .list_eips()
                            .await
                            .unwrap()
                            .patch_eip_usage(true, vec![80])
                            .await
                            .unwrap()
                            .handle_event_on("Service", REASON_ALLOCATED, "Normal")
                            .await
                            .unwrap()
                            .handle_event_on("Eip", REASON_ALLOCATED, "Normal")
                            .await
                            .unwrap()
                            .get_endpoints(&svc, &[])
                            .await
                            .unwrap()
                            .replace_svc_status(&svc, Some(EIP_ADDR))
                            .await
                    }
                    Scenario::Restore(svc) => {
                        self.get_svc(&svc)
                            .await
                            .unwrap()
                            .patch_eip_usage(true, vec![80])
                            .await
                            .unwrap()
                            .get_endpoints(&svc, &["n1", "n2"])
                            .await
                            .unwrap()
                            .list_nodes()
                            .await
                            .unwrap()
                            .handle_event(REASON_ROUTE_ADDED, "Normal")
                            .await
                    }
                    Scenario::UpdateEndpoints(svc, nodes) => {
                        self.get_svc(&svc)
                            .await
                            .unwrap()
                            .get_endpoints(&svc, &nodes)
                            .await
                            .unwrap()
                            .list_nodes()
                            .await
                            .unwrap()
                            .handle_event(REASON_ROUTE_UPDATED, "Normal")
                            .await
                    }
                    Scenario::Delete(svc) => {
                        self.get_svc(&svc)
                            .await
                            .unwrap()
                            .patch_eip_usage(false, vec![])
                            .await
                            .unwrap()
                            .handle_event_on("Service", REASON_RELEASED, "Normal")
                            .await
                            .unwrap()
                            .handle_event_on("Eip", REASON_RELEASED, "Normal")
                            .await
                            .unwrap()
                            .remove_finalizer(&svc)
                            .await
                    }
                    Scenario::Exhausted(svc) => {
                        self.get_svc(&svc)
                            .await
                            .unwrap()
                            .list_eips()
                            .await
                            .unwrap()
                            .handle_event(REASON_ALLOCATION_FAILED, "Warning")
                            .await
                    }
                    Scenario::Shared(_) => {
                        self.patch_eip_usage(true, vec![443])
                            .await
                            .unwrap()
                            .handle_event_on("Service", REASON_RELEASED, "Normal")
                            .await
                            .unwrap()
                            .handle_event_on("Eip", REASON_RELEASED, "Normal")
                            .await
                    }
                    Scenario::Unannotated(svc) => {
                        self.get_svc(&svc)
                            .await
                            .unwrap()
                            .patch_eip_usage(false, vec![])
                            .await
                            .unwrap()
                            .handle_event_on("Service", REASON_RELEASED, "Normal")
                            .await
                            .unwrap()
                            .handle_event_on("Eip", REASON_RELEASED, "Normal")
                            .await
                            .unwrap()
                            .replace_svc_status(&svc, None)
                            .await
                            .unwrap()
                            .remove_finalizer(&svc)
                            .await
                    }
                    Scenario::NotFound(svc) => self.get_svc_not_found(&svc).await,
                    Scenario::Restart(eips, services, svc) => {
                        self.list_eip_items(eips)
                            .await
                            .unwrap()
                            .list_services(services)
                            .await
                            .unwrap()
                            .get_svc(&svc)
                            .await
                            .unwrap()
                            .list_eips()
                            .await
                            .unwrap()
                            .handle_event(REASON_ALLOCATION_FAILED, "Warning")
                            .await
                    }
                    Scenario::Advertise(svc) => {
                        self.get_svc(&svc)
                            .await
                            .unwrap()
                            .get_endpoints(&svc, &["n1", "n2"])
                            .await
                            .unwrap()
                            .list_nodes()
                            .await
                            .unwrap()
                            .handle_event_on("Service", REASON_ROUTE_ADDED, "Normal")
                            .await
                    }
                    Scenario::Unallocated(svc) | Scenario::Terminating(svc) => {
                        self.get_svc(&svc).await
                    }
                }
                .expect("reconcile completed without error");
            })
        }

        async fn get_svc(mut self, svc: &Service) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(&request, svc, None, false, None, http::Method::GET);
            send.send_response(
                Response::builder()
                    .body(Body::from(api_server_response_resource(svc)))
                    .unwrap(),
            );
            Ok(self)
        }

        async fn get_svc_not_found(mut self, svc: &Service) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(&request, svc, None, false, None, http::Method::GET);
            send.send_response(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::from(api_server_response_not_found(svc)))
                    .unwrap(),
            );
            Ok(self)
        }

        async fn add_finalizer(mut self, svc: &Service) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(&request, svc, None, false, None, http::Method::PATCH);
            let req_body = to_bytes(request.into_body()).await.unwrap();
            let runtime_patch: serde_json::Value =
                serde_json::from_slice(&req_body).expect("valid document from runtime");
            assert_json_include!(
                actual: runtime_patch,
                expected: serde_json::json!([
                    { "op": "test", "path": "/metadata/finalizers", "value": null },
                    { "op": "add", "path": "/metadata/finalizers", "value": vec![SERVICE_FINALIZER] }
                ])
            );
            let mut new_svc = svc.clone();
            new_svc.metadata.finalizers = Some(vec![SERVICE_FINALIZER.to_string()]);
            send.send_response(
                Response::builder()
                    .body(Body::from(api_server_response_resource(&new_svc)))
                    .unwrap(),
            );
            Ok(self)
        }

        async fn remove_finalizer(mut self, svc: &Service) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(&request, svc, None, false, None, http::Method::PATCH);
            let req_body = to_bytes(request.into_body()).await.unwrap();
            let runtime_patch: serde_json::Value =
                serde_json::from_slice(&req_body).expect("valid document from runtime");
            assert_json_include!(
                actual: runtime_patch,
                expected: serde_json::json!([
                    { "op": "test", "path": "/metadata/finalizers/0", "value": SERVICE_FINALIZER },
                    { "op": "remove", "path": "/metadata/finalizers/0" }
                ])
            );
            let mut new_svc = svc.clone();
            new_svc.metadata.finalizers = None;
            send.send_response(
                Response::builder()
                    .body(Body::from(api_server_response_resource(&new_svc)))
                    .unwrap(),
            );
            Ok(self)
        }

        async fn list_eips(self) -> Result<Self, Error> {
            self.list_eip_items(vec![test_eip("eip-a", "192.168.1.10/32")])
                .await
        }

        async fn list_eip_items(mut self, items: Vec<Eip>) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(
                &request,
                &test_eip("eip-a", "192.168.1.10/32"),
                None,
                true,
                None,
                http::Method::GET,
            );
            let list = ObjectList::<Eip> {
                metadata: Default::default(),
                items,
            };
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&list).unwrap()))
                    .unwrap(),
            );
            Ok(self)
        }

        async fn patch_eip_usage(mut self, occupied: bool, ports: Vec<i32>) -> Result<Self, Error> {
            let eip = test_eip("eip-a", "192.168.1.10/32");
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(
                &request,
                &eip,
                Some("status"),
                false,
                None,
                http::Method::PATCH,
            );
            let req_body = to_bytes(request.into_body()).await.unwrap();
            let runtime_patch: serde_json::Value =
                serde_json::from_slice(&req_body).expect("valid document from runtime");
            assert_eq!(
                runtime_patch,
                serde_json::json!({"status": {"occupied": occupied, "portsUsage": ports}})
            );
            send.send_response(
                Response::builder()
                    .body(Body::from(api_server_response_resource(&eip)))
                    .unwrap(),
            );
            Ok(self)
        }

        async fn get_endpoints(mut self, svc: &Service, nodes: &[&str]) -> Result<Self, Error> {
            let eps = test_eps(&svc.name_any(), nodes);
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(&request, &eps, None, false, None, http::Method::GET);
            send.send_response(
                Response::builder()
                    .body(Body::from(api_server_response_resource(&eps)))
                    .unwrap(),
            );
            Ok(self)
        }

        async fn list_services(mut self, items: Vec<Service>) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(
                &request,
                &Service::default(),
                None,
                true,
                None,
                http::Method::GET,
            );
            let list = ObjectList::<Service> {
                metadata: Default::default(),
                items,
            };
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&list).unwrap()))
                    .unwrap(),
            );
            Ok(self)
        }

        async fn list_nodes(mut self) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(
                &request,
                &Node::default(),
                None,
                true,
                None,
                http::Method::GET,
            );
            let list = ObjectList::<Node> {
                metadata: Default::default(),
                items: test_node_list(),
            };
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&list).unwrap()))
                    .unwrap(),
            );
            Ok(self)
        }

        async fn replace_svc_status(mut self, svc: &Service, ip: Option<&str>) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(
                &request,
                svc,
                Some("status"),
                false,
                None,
                http::Method::PUT,
            );
            let req_body = to_bytes(request.into_body()).await.unwrap();
            let req_svc: Service = serde_json::from_slice(&req_body).unwrap();
            assert_eq!(get_ingress_ip(&req_svc), ip.map(addr));
            send.send_response(
                Response::builder()
                    .body(Body::from(api_server_response_resource(&req_svc)))
                    .unwrap(),
            );
            Ok(self)
        }
    }

    #[tokio::test]
    async fn works_add_finalizer() {
        let (testctx, fakeserver, _) = ContextWith::test(test_component(MockSpeaker::new(), None));
        let mut svc = test_svc();
        svc.metadata.finalizers = None;

        let mocksvr = fakeserver.service_run(Scenario::AddFinalizer(svc.clone()));
        let action = reconciler(Arc::new(svc), testctx)
            .await
            .expect("reconciler");
        timeout_after_1s(mocksvr).await;
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn works_create_lb() {
        let speaker = MockSpeaker::new();
        let (testctx, fakeserver, _) = ContextWith::test(test_component(speaker.clone(), None));
        register_eip(&testctx, &[]);
        let svc = test_svc();

        let mocksvr = fakeserver.service_run(Scenario::Create(svc.clone(), vec!["n1", "n2"]));
        let action = reconciler(Arc::new(svc), testctx.clone())
            .await
            .expect("reconciler");
        timeout_after_1s(mocksvr).await;

        assert_eq!(action, Action::requeue(testctx.interval()));
        assert_eq!(
            speaker.routes().get(&addr(EIP_ADDR)),
            Some(&addrs(&["10.0.0.1", "10.0.0.2"]))
        );
        assert_eq!(
            testctx
                .component
                .registry
                .inner
                .lock()
                .unwrap()
                .address_of("default/svc-1"),
            Some(addr(EIP_ADDR))
        );
    }

    #[tokio::test]
    async fn works_create_lb_without_endpoints() {
        let speaker = MockSpeaker::new();
        let (testctx, fakeserver, _) = ContextWith::test(test_component(speaker.clone(), None));
        register_eip(&testctx, &[]);
        let svc = test_svc();

        let mocksvr = fakeserver.service_run(Scenario::CreateWithoutEndpoints(svc.clone()));
        let action = reconciler(Arc::new(svc), testctx.clone())
            .await
            .expect("reconciler");
        timeout_after_1s(mocksvr).await;

        // bound, but nothing to advertise until a node serves it
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert!(speaker.calls().is_empty());
    }

    #[tokio::test]
    async fn works_restore_route_after_restart() {
        let speaker = MockSpeaker::new();
        let (testctx, fakeserver, _) = ContextWith::test(test_component(speaker.clone(), None));
        // the registry knows the pool but not the binding
        register_eip(&testctx, &[]);
        let svc = bound_svc("svc-1");

        let mocksvr = fakeserver.service_run(Scenario::Restore(svc.clone()));
        let action = reconciler(Arc::new(svc), testctx.clone())
            .await
            .expect("reconciler");
        timeout_after_1s(mocksvr).await;

        assert_eq!(action, Action::requeue(testctx.interval()));
        assert_eq!(
            speaker.calls(),
            vec![Call::Add(addr(EIP_ADDR), vec![addr("10.0.0.1"), addr("10.0.0.2")])]
        );
    }

    #[rstest]
    #[case(vec!["n2", "n3"], vec!["10.0.0.2", "10.0.0.3"], vec![Call::Add(addr(EIP_ADDR), vec![addr("10.0.0.3")]), Call::Delete(addr(EIP_ADDR), vec![addr("10.0.0.1")])])]
    #[case(vec!["n1", "n2", "n3"], vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"], vec![Call::Add(addr(EIP_ADDR), vec![addr("10.0.0.3")])])]
    #[case(vec!["n2"], vec!["10.0.0.2"], vec![Call::Delete(addr(EIP_ADDR), vec![addr("10.0.0.1")])])]
    #[tokio::test]
    async fn works_update_endpoints(
        #[case] nodes: Vec<&'static str>,
        #[case] expected: Vec<&str>,
        #[case] calls: Vec<Call>,
    ) {
        let speaker =
            MockSpeaker::new().with_route(addr(EIP_ADDR), &[addr("10.0.0.1"), addr("10.0.0.2")]);
        let (testctx, fakeserver, _) = ContextWith::test(test_component(speaker.clone(), None));
        register_eip(&testctx, &["default/svc-1"]);
        let svc = bound_svc("svc-1");

        let mocksvr = fakeserver.service_run(Scenario::UpdateEndpoints(svc.clone(), nodes));
        let action = reconciler(Arc::new(svc), testctx.clone())
            .await
            .expect("reconciler");
        timeout_after_1s(mocksvr).await;

        assert_eq!(action, Action::requeue(testctx.interval()));
        assert_eq!(speaker.calls(), calls);
        assert_eq!(speaker.routes().get(&addr(EIP_ADDR)), Some(&addrs(&expected)));
    }

    #[tokio::test]
    async fn works_delete_service() {
        let speaker =
            MockSpeaker::new().with_route(addr(EIP_ADDR), &[addr("10.0.0.1"), addr("10.0.0.2")]);
        let (testctx, fakeserver, _) = ContextWith::test(test_component(speaker.clone(), None));
        register_eip(&testctx, &["default/svc-1"]);
        let mut svc = bound_svc("svc-1");
        svc.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mocksvr = fakeserver.service_run(Scenario::Delete(svc.clone()));
        let action = reconciler(Arc::new(svc), testctx.clone())
            .await
            .expect("reconciler");
        timeout_after_1s(mocksvr).await;

        assert_eq!(action, Action::await_change());
        assert!(speaker.routes().is_empty());
        let registry = testctx.component.registry.inner.lock().unwrap();
        assert_eq!(registry.address_of("default/svc-1"), None);
        assert_eq!(registry.get("eip-a").unwrap().next_free(), Some(addr(EIP_ADDR)));
    }

    #[tokio::test]
    async fn fail_eip_exhausted() {
        let speaker = MockSpeaker::new();
        let (testctx, fakeserver, _) = ContextWith::test(test_component(speaker.clone(), None));
        register_eip(&testctx, &["default/svc-1"]);
        let svc = test_svc_with_name("svc-2");

        let mocksvr = fakeserver.service_run(Scenario::Exhausted(svc.clone()));
        let res = reconciler(Arc::new(svc.clone()), testctx.clone()).await;
        timeout_after_1s(mocksvr).await;

        let err = res.expect_err("no address is left");
        assert!(err.is_validation());
        assert!(speaker.calls().is_empty());

        // backoff grows with every failure
        let svc = Arc::new(svc);
        for secs in [10, 20, 30] {
            assert_eq!(
                error_policy(svc.clone(), &err, testctx.clone()),
                Action::requeue(Duration::from_secs(secs))
            );
        }
    }

    #[tokio::test]
    async fn works_release_unannotated_service() {
        let speaker = MockSpeaker::new().with_route(addr(EIP_ADDR), &[addr("10.0.0.1")]);
        let (testctx, fakeserver, _) = ContextWith::test(test_component(speaker.clone(), None));
        register_eip(&testctx, &["default/svc-1"]);
        let mut svc = bound_svc("svc-1");
        svc.annotations_mut().remove(PORTER_ANNOTATION_KEY);

        let mocksvr = fakeserver.service_run(Scenario::Unannotated(svc.clone()));
        let action = reconciler(Arc::new(svc), testctx.clone())
            .await
            .expect("reconciler");
        timeout_after_1s(mocksvr).await;

        assert_eq!(action, Action::await_change());
        assert_eq!(speaker.calls(), vec![Call::Delete(addr(EIP_ADDR), vec![])]);
    }

    #[tokio::test]
    async fn works_shared_address_keeps_route() {
        let speaker = MockSpeaker::new().with_route(addr(EIP_ADDR), &[addr("10.0.0.1")]);
        let (testctx, fakeserver, _) = ContextWith::test(test_component(speaker.clone(), None));
        {
            let mut registry = testctx.component.registry.inner.lock().unwrap();
            registry
                .upsert("eip-a", AddressRange::from_str("192.168.1.10/32").unwrap())
                .unwrap();
            registry
                .mark_used(addr(EIP_ADDR), "default/svc-1", &[80])
                .unwrap();
            registry
                .mark_used(addr(EIP_ADDR), "default/svc-2", &[443])
                .unwrap();
        }
        let svc = bound_svc("svc-1");

        let mocksvr = fakeserver.service_run(Scenario::Shared(svc.clone()));
        teardown(&svc, &testctx).await.expect("teardown");
        timeout_after_1s(mocksvr).await;

        assert!(speaker.calls().is_empty());
        let registry = testctx.component.registry.inner.lock().unwrap();
        assert_eq!(registry.address_of("default/svc-1"), None);
        assert_eq!(registry.address_of("default/svc-2"), Some(addr(EIP_ADDR)));
    }

    #[tokio::test]
    async fn works_service_not_found() {
        let (testctx, fakeserver, _) = ContextWith::test(test_component(MockSpeaker::new(), None));
        let svc = test_svc();
        testctx.inner.requeue.get_requeue_time("default/svc-1");

        let mocksvr = fakeserver.service_run(Scenario::NotFound(svc.clone()));
        let action = reconciler(Arc::new(svc), testctx.clone())
            .await
            .expect("reconciler");
        timeout_after_1s(mocksvr).await;

        assert_eq!(action, Action::await_change());
        assert!(testctx.inner.requeue.is_empty());
    }

    #[tokio::test]
    async fn fail_allocate_address_held_before_restart() {
        let speaker = MockSpeaker::new();
        let (testctx, fakeserver, _) = ContextWith::test(test_component(speaker.clone(), None));
        let mut disabled = test_eip("eip-b", "10.0.0.0/30");
        disabled.status = None;
        let eips = vec![test_eip("eip-a", "192.168.1.10/32"), disabled];
        let mut plain = test_svc_with_name("svc-3");
        plain.annotations_mut().remove(PORTER_ANNOTATION_KEY);
        plain.metadata.finalizers = None;
        let plain = set_ingress_ip(&plain, Some(addr("192.168.1.30")));
        let services = vec![bound_svc("svc-1"), plain];
        let svc = test_svc_with_name("svc-2");

        let mocksvr = fakeserver.service_run(Scenario::Restart(eips, services, svc.clone()));
        crate::controller::reconciler::restore(testctx.inner.client.clone(), &testctx.component)
            .await
            .expect("restore");
        {
            let registry = testctx.component.registry.inner.lock().unwrap();
            assert_eq!(registry.address_of("default/svc-1"), Some(addr(EIP_ADDR)));
            assert_eq!(registry.address_of("default/svc-3"), None);
            assert!(registry.get("eip-b").is_none());
        }

        // svc-1 has not been reconciled since the restart
        let res = reconciler(Arc::new(svc), testctx.clone()).await;
        timeout_after_1s(mocksvr).await;

        assert!(res.expect_err("the only address is held by svc-1").is_validation());
        assert!(speaker.calls().is_empty());
        let registry = testctx.component.registry.inner.lock().unwrap();
        assert_eq!(registry.address_of("default/svc-2"), None);
        assert_eq!(registry.address_of("default/svc-1"), Some(addr(EIP_ADDR)));
    }

    #[tokio::test]
    async fn works_agent_advertises_allocated_service() {
        let speaker = MockSpeaker::new();
        let (testctx, fakeserver, _) =
            ContextWith::test(test_component(speaker.clone(), Some("n1")));
        register_eip(&testctx, &[]);
        let svc = bound_svc("svc-1");

        // no status or finalizer writes
        let mocksvr = fakeserver.service_run(Scenario::Advertise(svc.clone()));
        let action = reconciler(Arc::new(svc), testctx.clone())
            .await
            .expect("reconciler");
        timeout_after_1s(mocksvr).await;

        assert_eq!(action, Action::requeue(testctx.interval()));
        assert_eq!(
            speaker.routes().get(&addr(EIP_ADDR)),
            Some(&addrs(&["10.0.0.1", "10.0.0.2"]))
        );
        assert_eq!(
            testctx
                .component
                .registry
                .inner
                .lock()
                .unwrap()
                .address_of("default/svc-1"),
            Some(addr(EIP_ADDR))
        );
    }

    #[tokio::test]
    async fn works_agent_leaves_allocation_to_controller() {
        let speaker = MockSpeaker::new();
        let (testctx, fakeserver, _) =
            ContextWith::test(test_component(speaker.clone(), Some("n1")));
        register_eip(&testctx, &[]);
        let svc = test_svc();

        let mocksvr = fakeserver.service_run(Scenario::Unallocated(svc.clone()));
        let action = reconciler(Arc::new(svc), testctx.clone())
            .await
            .expect("reconciler");
        timeout_after_1s(mocksvr).await;

        assert_eq!(action, Action::await_change());
        assert!(speaker.calls().is_empty());
        let registry = testctx.component.registry.inner.lock().unwrap();
        assert_eq!(registry.address_of("default/svc-1"), None);
        assert_eq!(registry.get("eip-a").unwrap().next_free(), Some(addr(EIP_ADDR)));
    }

    #[tokio::test]
    async fn works_agent_withdraws_terminating_service() {
        let speaker =
            MockSpeaker::new().with_route(addr(EIP_ADDR), &[addr("10.0.0.1"), addr("10.0.0.2")]);
        let (testctx, fakeserver, _) =
            ContextWith::test(test_component(speaker.clone(), Some("n1")));
        register_eip(&testctx, &["default/svc-1"]);
        let mut svc = bound_svc("svc-1");
        svc.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mocksvr = fakeserver.service_run(Scenario::Terminating(svc.clone()));
        let action = reconciler(Arc::new(svc), testctx.clone())
            .await
            .expect("reconciler");
        timeout_after_1s(mocksvr).await;

        assert_eq!(action, Action::await_change());
        assert_eq!(speaker.calls(), vec![Call::Delete(addr(EIP_ADDR), vec![])]);
        assert_eq!(
            testctx
                .component
                .registry
                .inner
                .lock()
                .unwrap()
                .address_of("default/svc-1"),
            None
        );
    }

    #[tokio::test]
    async fn works_agent_forgets_binding_of_gone_service() {
        let speaker = MockSpeaker::new().with_route(addr(EIP_ADDR), &[addr("10.0.0.1")]);
        let (testctx, _fakeserver, _) =
            ContextWith::test(test_component(speaker.clone(), Some("n1")));
        register_eip(&testctx, &["default/svc-1"]);

        forget_binding("default/svc-1", &testctx)
            .await
            .expect("forget binding");

        assert!(speaker.routes().is_empty());
        assert_eq!(
            testctx
                .component
                .registry
                .inner
                .lock()
                .unwrap()
                .address_of("default/svc-1"),
            None
        );
    }

    #[rstest(
        type_,
        annotation,
        expected,
        case(Some("LoadBalancer"), Some("porter"), true),
        case(Some("LoadBalancer"), Some("other"), false),
        case(Some("LoadBalancer"), None, false),
        case(Some("ClusterIP"), Some("porter"), false),
        case(None, Some("porter"), false),
    )]
    fn works_is_porter_lb(type_: Option<&str>, annotation: Option<&str>, expected: bool) {
        let mut svc = test_svc();
        svc.spec.as_mut().unwrap().type_ = type_.map(String::from);
        svc.annotations_mut().remove(PORTER_ANNOTATION_KEY);
        if let Some(v) = annotation {
            svc.annotations_mut()
                .insert(PORTER_ANNOTATION_KEY.to_string(), v.to_string());
        }
        assert_eq!(is_porter_lb(&svc), expected);
    }

    #[test]
    fn works_ingress_and_external_ip() {
        let mut svc = test_svc();
        assert_eq!(get_ingress_ip(&svc), None);
        svc.spec.as_mut().unwrap().external_ips = Some(vec!["192.168.1.20".to_string()]);
        assert_eq!(get_external_ip(&svc), Some(addr("192.168.1.20")));

        let svc = set_ingress_ip(&svc, Some(addr(EIP_ADDR)));
        assert_eq!(get_ingress_ip(&svc), Some(addr(EIP_ADDR)));
        let svc = set_ingress_ip(&svc, None);
        assert_eq!(get_ingress_ip(&svc), None);
    }

    #[test]
    fn works_endpoints_fixture() {
        let eps: Endpoints = test_eps("svc-1", &["n1", "n2"]);
        assert_eq!(
            crate::controller::predicate::endpoint_node_names(&eps),
            BTreeSet::from(["n1".to_string(), "n2".to_string()])
        );
    }
}
