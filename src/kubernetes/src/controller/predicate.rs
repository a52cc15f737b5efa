use std::collections::{BTreeSet, HashMap, HashSet};

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::{
    runtime::{reflector::ObjectRef, reflector::Store},
    ResourceExt,
};

use crate::{crd::eip::Eip, util::get_namespaced_name};

use super::reconciler::service_watcher::{has_finalizer, is_porter_lb};

/// Node names backing the first subset, ready or not.
pub fn endpoint_node_names(ep: &Endpoints) -> BTreeSet<String> {
    let subset = match ep.subsets.as_ref().and_then(|s| s.first()) {
        Some(subset) => subset,
        None => return BTreeSet::new(),
    };
    subset
        .addresses
        .iter()
        .chain(subset.not_ready_addresses.iter())
        .flatten()
        .filter_map(|addr| addr.node_name.clone())
        .collect()
}

pub fn is_node_changed_when_endpoint_updated(old: &Endpoints, new: &Endpoints) -> bool {
    let old_len = old.subsets.as_ref().map(|s| s.len()).unwrap_or(0);
    let new_len = new.subsets.as_ref().map(|s| s.len()).unwrap_or(0);
    if old_len != new_len {
        return true;
    }
    if old_len == 0 {
        return false;
    }
    endpoint_node_names(old) != endpoint_node_names(new)
}

/// Passes services that are, or just stopped being, porter load balancers.
#[derive(Debug, Default)]
pub struct ServiceFilter {
    // services last seen as porter load balancers
    porter: HashSet<String>,
}

impl ServiceFilter {
    pub fn admit(&mut self, svc: &Service) -> bool {
        let key = get_namespaced_name(svc);
        let now = is_porter_lb(svc);
        let before = if now {
            !self.porter.insert(key.clone())
        } else {
            self.porter.remove(&key)
        };
        if svc.metadata.deletion_timestamp.is_some() && !has_finalizer(svc) {
            self.porter.remove(&key);
        }
        now || before || has_finalizer(svc)
    }
}

/// Passes endpoints of porter load balancers whose node set moved.
pub struct EndpointsFilter {
    services: Store<Service>,
    last: HashMap<String, Endpoints>,
}

impl EndpointsFilter {
    pub fn new(services: Store<Service>) -> EndpointsFilter {
        EndpointsFilter {
            services,
            last: HashMap::new(),
        }
    }

    pub fn admit(&mut self, ep: &Endpoints) -> bool {
        let key = get_namespaced_name(ep);
        let matching = ep
            .namespace()
            .and_then(|ns| {
                self.services
                    .get(&ObjectRef::new(&ep.name_any()).within(&ns))
            })
            .map(|svc| is_porter_lb(&svc))
            .unwrap_or(false);
        if !matching {
            self.last.remove(&key);
            return false;
        }
        let prev = self.last.insert(key, ep.clone()).unwrap_or_default();
        is_node_changed_when_endpoint_updated(&prev, ep)
    }
}

/// Passes EIP creations, deletions, spec changes and flips of `occupied`.
#[derive(Debug, Default)]
pub struct EipFilter {
    seen: HashMap<String, (Option<i64>, bool)>,
}

impl EipFilter {
    pub fn admit(&mut self, eip: &Eip) -> bool {
        let current = (eip.metadata.generation, eip.is_occupied());
        let prev = self.seen.insert(eip.name_any(), current);
        if eip.metadata.deletion_timestamp.is_some() {
            return true;
        }
        match prev {
            None => true,
            Some(prev) => prev != current,
        }
    }
}
