use std::{collections::HashMap, net::IpAddr, sync::Arc};

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use elbd_ipam::{allocator::digest, pool::PoolRegistryInner};

use crate::{crd::eip::Eip, util::get_namespaced_name};

use super::error::Error;

pub const DEFAULT_STRATEGY: &str = "default";
pub const HASH_STRATEGY: &str = "hash";

/// Picks an address for a service among the candidate EIPs.
///
/// Implementations only read the registry. Binding the returned address is
/// up to the caller.
pub trait Selector: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(
        &self,
        svc: &Service,
        eips: &[Eip],
        registry: &PoolRegistryInner,
    ) -> Result<IpAddr, Error>;
}

/// Ports a service listens on, deduplicated across protocols.
pub fn service_ports(svc: &Service) -> Vec<u16> {
    let mut ports = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| u16::try_from(p.port).ok())
                .filter(|p| *p != 0)
                .collect::<Vec<u16>>()
        })
        .unwrap_or_default();
    ports.sort_unstable();
    ports.dedup();
    ports
}

fn candidates<'a>(eips: &'a [Eip]) -> impl Iterator<Item = &'a Eip> {
    eips.iter()
        .filter(|eip| eip.metadata.deletion_timestamp.is_none() && eip.is_enabled())
}

// an address already bound to others that still has room for `ports`
fn shareable(
    eip: &Eip,
    owner: &str,
    ports: &[u16],
    registry: &PoolRegistryInner,
) -> Option<IpAddr> {
    let pool = registry.get(&eip.name_any())?;
    pool.in_use()
        .find(|addr| pool.fits(addr, owner, ports))
        .copied()
}

/// First EIP in order with room for the service. Within an EIP, an address
/// already bound to other services is preferred when none of the ports
/// collide, otherwise the lowest unbound address is taken.
#[derive(Debug, Default)]
pub struct DefaultSelector;

impl Selector for DefaultSelector {
    fn name(&self) -> &'static str {
        DEFAULT_STRATEGY
    }

    fn select(
        &self,
        svc: &Service,
        eips: &[Eip],
        registry: &PoolRegistryInner,
    ) -> Result<IpAddr, Error> {
        let owner = get_namespaced_name(svc);
        let ports = service_ports(svc);
        for eip in candidates(eips) {
            let pool = match registry.get(&eip.name_any()) {
                Some(pool) => pool,
                None => continue,
            };
            if let Some(addr) = shareable(eip, &owner, &ports, registry) {
                return Ok(addr);
            }
            if let Some(addr) = pool.next_free() {
                return Ok(addr);
            }
        }
        Err(Error::NoAvailableAddress(owner))
    }
}

/// Stable placement: the same service lands on the same address of an EIP
/// for as long as that address stays free.
#[derive(Debug, Default)]
pub struct HashSelector;

impl Selector for HashSelector {
    fn name(&self) -> &'static str {
        HASH_STRATEGY
    }

    fn select(
        &self,
        svc: &Service,
        eips: &[Eip],
        registry: &PoolRegistryInner,
    ) -> Result<IpAddr, Error> {
        let owner = get_namespaced_name(svc);
        let ports = service_ports(svc);
        let d = digest(&owner);
        for eip in candidates(eips) {
            let pool = match registry.get(&eip.name_any()) {
                Some(pool) => pool,
                None => continue,
            };
            if let Some(addr) = pool.hashed_free(&d) {
                return Ok(addr);
            }
            if let Some(addr) = shareable(eip, &owner, &ports, registry) {
                return Ok(addr);
            }
        }
        Err(Error::NoAvailableAddress(owner))
    }
}

pub struct StrategyRegistry {
    strategies: HashMap<&'static str, Arc<dyn Selector>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut registry = StrategyRegistry {
            strategies: HashMap::new(),
        };
        registry.register(Arc::new(DefaultSelector));
        registry.register(Arc::new(HashSelector));
        registry
    }
}

impl StrategyRegistry {
    pub fn new() -> StrategyRegistry {
        StrategyRegistry::default()
    }

    pub fn register(&mut self, selector: Arc<dyn Selector>) {
        self.strategies.insert(selector.name(), selector);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Selector>, Error> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))
    }
}
