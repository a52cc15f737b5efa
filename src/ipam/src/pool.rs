use std::{
    collections::BTreeMap,
    net::IpAddr,
    sync::{Arc, Mutex},
};

use super::{allocator::IdAllocator, error::Error, range::AddressRange};

const PORT_IDS: u32 = 1 << 16;
pub const MAX_POOL_SIZE: u128 = 1 << 24;

/// Registry of every EIP pool known to this process.
///
/// It is rebuilt from the cluster on startup: pools come from EIP objects and
/// usage comes from the ingress addresses recorded on services.
#[derive(Debug, Clone, Default)]
pub struct PoolRegistry {
    pub inner: Arc<Mutex<PoolRegistryInner>>,
}

impl PoolRegistry {
    pub fn new() -> PoolRegistry {
        PoolRegistry::default()
    }
}

#[derive(Debug, Default)]
pub struct PoolRegistryInner {
    pools: BTreeMap<String, Pool>,
}

impl PoolRegistryInner {
    /// Registers a pool or replaces its range. Usage that still fits the new
    /// range is carried over. Returns false when nothing changed.
    pub fn upsert(&mut self, name: &str, range: AddressRange) -> Result<bool, Error> {
        if let Some(other) = self
            .pools
            .values()
            .find(|p| p.name != name && p.range.overlaps(&range))
        {
            return Err(Error::Overlap(name.to_string(), other.name.clone()));
        }
        let mut pool = Pool::new(name, range)?;
        if let Some(old) = self.pools.get(name) {
            if old.range == range {
                return Ok(false);
            }
            for (addr, usage) in old.usage.iter() {
                if !range.contains(addr) {
                    continue;
                }
                for (owner, ports) in usage.owners.iter() {
                    pool.mark_used(*addr, owner, ports)?;
                }
            }
        }
        self.pools.insert(name.to_string(), pool);
        Ok(true)
    }

    pub fn remove(&mut self, name: &str) -> Option<Pool> {
        self.pools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    pub fn pool_of(&self, addr: &IpAddr) -> Option<&Pool> {
        self.pools.values().find(|p| p.range.contains(addr))
    }

    /// Records that `owner` listens on `ports` at `addr`. Marking the same
    /// owner again is a no-op, marking with a different port set replaces the
    /// owner's previous ports. Returns the name of the pool holding `addr`
    /// when its usage changed.
    pub fn mark_used(
        &mut self,
        addr: IpAddr,
        owner: &str,
        ports: &[u16],
    ) -> Result<Option<String>, Error> {
        let pool = self
            .pools
            .values_mut()
            .find(|p| p.range.contains(&addr))
            .ok_or(Error::NoPoolForAddress(addr))?;
        if pool.mark_used(addr, owner, ports)? {
            Ok(Some(pool.name.clone()))
        } else {
            Ok(None)
        }
    }

    /// Releases whatever `owner` holds at `addr`. Returns the pool name and
    /// the ports that were released, or None when nothing was held.
    pub fn release(&mut self, addr: IpAddr, owner: &str) -> Option<(String, Vec<u16>)> {
        let pool = self
            .pools
            .values_mut()
            .find(|p| p.range.contains(&addr))?;
        pool.release(addr, owner).map(|ports| (pool.name.clone(), ports))
    }

    pub fn address_of(&self, owner: &str) -> Option<IpAddr> {
        self.pools.values().find_map(|p| p.address_of(owner))
    }

    /// Whether any owner other than `owner` is bound to `addr`.
    pub fn is_shared(&self, addr: &IpAddr, owner: &str) -> bool {
        self.pool_of(addr)
            .and_then(|p| p.usage.get(addr))
            .map(|u| u.owners.keys().any(|o| o != owner))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct Pool {
    pub name: String,
    pub range: AddressRange,
    // slot i + 1 stands for the i-th address of the range
    slots: IdAllocator,
    usage: BTreeMap<IpAddr, AddressUsage>,
}

#[derive(Debug, Clone)]
struct AddressUsage {
    ports: IdAllocator,
    owners: BTreeMap<String, Vec<u16>>,
}

impl AddressUsage {
    fn new() -> AddressUsage {
        AddressUsage {
            ports: IdAllocator::new(PORT_IDS),
            owners: BTreeMap::new(),
        }
    }

    fn owner_of(&self, port: u16) -> Option<&str> {
        self.owners
            .iter()
            .find(|(_, ports)| ports.contains(&port))
            .map(|(o, _)| o.as_str())
    }

    fn release(&mut self, owner: &str) -> Option<Vec<u16>> {
        let ports = self.owners.remove(owner)?;
        for port in ports.iter().filter(|p| **p != 0) {
            self.ports.free(*port as u32);
        }
        Some(ports)
    }
}

impl Pool {
    pub fn new(name: &str, range: AddressRange) -> Result<Pool, Error> {
        let size = range.size();
        if size >= MAX_POOL_SIZE {
            return Err(Error::PoolTooLarge(size));
        }
        let num_ids = ((size as u32 + 1) + 63) / 64 * 64;
        let mut slots = IdAllocator::new(num_ids);
        // slots past the end of the range are never handed out
        for id in (size as u32 + 1)..num_ids {
            slots.allocate_at(id)?;
        }
        Ok(Pool {
            name: name.to_string(),
            range,
            slots,
            usage: BTreeMap::new(),
        })
    }

    pub fn size(&self) -> u128 {
        self.range.size()
    }

    /// Number of addresses with at least one owner.
    pub fn used(&self) -> usize {
        self.usage.len()
    }

    pub fn is_occupied(&self) -> bool {
        !self.usage.is_empty()
    }

    pub fn in_use(&self) -> impl Iterator<Item = &IpAddr> {
        self.usage.keys()
    }

    /// Whether every port in `ports` is free at `addr`, or already held by `owner`.
    pub fn fits(&self, addr: &IpAddr, owner: &str, ports: &[u16]) -> bool {
        if !self.range.contains(addr) {
            return false;
        }
        match self.usage.get(addr) {
            None => true,
            Some(u) => ports.iter().all(|p| {
                !u.ports.is_allocated(*p as u32) || u.owner_of(*p) == Some(owner)
            }),
        }
    }

    /// The lowest address nobody is bound to yet.
    pub fn next_free(&self) -> Option<IpAddr> {
        let mut probe = self.slots.clone();
        let id = probe.allocate().ok()?;
        self.range.addr_at(id as u128 - 1)
    }

    /// An unbound address chosen deterministically from `digest`.
    pub fn hashed_free(&self, digest: &[u8; 32]) -> Option<IpAddr> {
        let mut probe = self.slots.clone();
        let id = probe.allocate_with_hash(digest).ok()?;
        self.range.addr_at(id as u128 - 1)
    }

    pub fn address_of(&self, owner: &str) -> Option<IpAddr> {
        self.usage
            .iter()
            .find(|(_, u)| u.owners.contains_key(owner))
            .map(|(a, _)| *a)
    }

    /// One entry per bound (address, port), ordered by address then port.
    pub fn ports_usage(&self) -> Vec<i32> {
        self.usage
            .values()
            .flat_map(|u| {
                let mut ports = u.owners.values().flatten().map(|p| *p as i32).collect::<Vec<i32>>();
                ports.sort_unstable();
                ports
            })
            .collect()
    }

    fn mark_used(&mut self, addr: IpAddr, owner: &str, ports: &[u16]) -> Result<bool, Error> {
        let index = self.range.index_of(&addr)? as u32 + 1;
        if let Some(u) = self.usage.get(&addr) {
            if u.owners.get(owner).map(|p| p.as_slice()) == Some(ports) {
                return Ok(false);
            }
            for port in ports.iter() {
                match u.owner_of(*port) {
                    Some(o) if o != owner => {
                        return Err(Error::PortInUse {
                            addr,
                            port: *port,
                            owner: o.to_string(),
                        })
                    }
                    _ => {}
                }
            }
        }
        self.slots.allocate_at(index)?;
        let usage = self.usage.entry(addr).or_insert_with(AddressUsage::new);
        usage.release(owner);
        for port in ports.iter().filter(|p| **p != 0) {
            usage.ports.allocate_at(*port as u32)?;
        }
        usage.owners.insert(owner.to_string(), ports.to_vec());
        Ok(true)
    }

    fn release(&mut self, addr: IpAddr, owner: &str) -> Option<Vec<u16>> {
        let usage = self.usage.get_mut(&addr)?;
        let ports = usage.release(owner)?;
        if usage.owners.is_empty() {
            self.usage.remove(&addr);
            if let Ok(index) = self.range.index_of(&addr) {
                self.slots.free(index as u32 + 1);
            }
        }
        Some(ports)
    }
}
