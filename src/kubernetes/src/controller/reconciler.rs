pub mod eip;
pub mod service_watcher;

use std::str::FromStr;

use k8s_openapi::api::core::v1::Service;
use kube::{api::ListParams, runtime::controller::Action, Api, Client, ResourceExt};

use elbd_ipam::range::AddressRange;

use crate::{crd::eip::Eip, util::get_namespaced_name};

use super::{
    context::{ContextWith, Ctx, LbComponent},
    error::Error,
    selector::service_ports,
};

use service_watcher::{get_ingress_ip, has_finalizer, is_porter_lb};

// NotFound means the object went away while we worked on it, which is
// what a deletion asked for anyway.
pub(crate) fn absorb<T: Clone>(
    res: Result<Action, Error>,
    key: &str,
    ctx: &ContextWith<T>,
) -> Result<Action, Error> {
    match res {
        Err(e) if e.is_not_found() => {
            tracing::info!(name = key, "object is gone");
            ctx.requeue().forget(key);
            Ok(Action::await_change())
        }
        res => res,
    }
}

/// Loads enabled pools and the bindings recorded in Service status into the
/// registry. Runs once before the reconcilers start, so that an address held
/// by a Service not reconciled yet is never handed to another one.
#[tracing::instrument(skip_all)]
pub async fn restore(client: Client, component: &LbComponent) -> Result<(), Error> {
    let eips = Api::<Eip>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(Error::Kube)?;
    let services = Api::<Service>::all(client)
        .list(&ListParams::default())
        .await
        .map_err(Error::Kube)?;

    let mut registry = component
        .registry
        .inner
        .lock()
        .map_err(|_| Error::FailedToGetLock)?;

    for eip in eips
        .iter()
        .filter(|eip| eip.is_enabled() && eip.metadata.deletion_timestamp.is_none())
    {
        let name = eip.name_any();
        let res = AddressRange::from_str(&eip.spec.address)
            .and_then(|range| registry.upsert(&name, range));
        if let Err(e) = res {
            tracing::warn!(name, address = eip.spec.address, error = %e, "skip EIP pool");
        }
    }

    let mut bindings = 0;
    for svc in services
        .iter()
        .filter(|svc| is_porter_lb(svc) || has_finalizer(svc))
    {
        let ip = match get_ingress_ip(svc) {
            Some(ip) => ip,
            None => continue,
        };
        let key = get_namespaced_name(svc);
        match registry.mark_used(ip, &key, &service_ports(svc)) {
            Ok(_) => bindings += 1,
            Err(e) => {
                tracing::warn!(name = key, ip = %ip, error = %e, "failed to restore binding")
            }
        }
    }

    tracing::info!(
        pools = registry.pools().count(),
        bindings,
        "restored pool registry"
    );
    Ok(())
}
