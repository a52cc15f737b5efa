use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use ipnet::IpNet;

use super::error::Error;

/// An inclusive span of addresses of one family.
///
/// Accepted forms are a single address (`192.168.1.10`), a CIDR
/// (`192.168.1.0/24`) and a dash separated range (`192.168.1.10-192.168.1.20`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    first: IpAddr,
    last: IpAddr,
}

impl AddressRange {
    pub fn new(first: IpAddr, last: IpAddr) -> Result<AddressRange, Error> {
        if first.is_ipv4() != last.is_ipv4() {
            return Err(Error::ProtocolMismatch);
        }
        if to_bits(&first) > to_bits(&last) {
            return Err(Error::InvalidAddress(format!("{first}-{last}")));
        }
        Ok(AddressRange { first, last })
    }

    pub fn first(&self) -> IpAddr {
        self.first
    }

    pub fn last(&self) -> IpAddr {
        self.last
    }

    /// Number of addresses in the range. Saturates for the whole IPv6 space.
    pub fn size(&self) -> u128 {
        (to_bits(&self.last) - to_bits(&self.first)).saturating_add(1)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        addr.is_ipv4() == self.first.is_ipv4()
            && to_bits(addr) >= to_bits(&self.first)
            && to_bits(addr) <= to_bits(&self.last)
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.first.is_ipv4() == other.first.is_ipv4()
            && to_bits(&self.first) <= to_bits(&other.last)
            && to_bits(&other.first) <= to_bits(&self.last)
    }

    pub fn index_of(&self, addr: &IpAddr) -> Result<u128, Error> {
        if addr.is_ipv4() != self.first.is_ipv4() {
            return Err(Error::ProtocolMismatch);
        }
        if !self.contains(addr) {
            return Err(Error::NotContains);
        }
        Ok(to_bits(addr) - to_bits(&self.first))
    }

    pub fn addr_at(&self, index: u128) -> Option<IpAddr> {
        if index >= self.size() {
            return None;
        }
        let bits = to_bits(&self.first) + index;
        Some(match self.first {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
        })
    }
}

impl FromStr for AddressRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains('/') {
            let net = IpNet::from_str(s).map_err(|_| Error::InvalidAddress(s.to_string()))?;
            return AddressRange::new(net.network(), net.broadcast());
        }
        if let Some((first, last)) = s.split_once('-') {
            let first = IpAddr::from_str(first.trim())
                .map_err(|_| Error::InvalidAddress(s.to_string()))?;
            let last = IpAddr::from_str(last.trim())
                .map_err(|_| Error::InvalidAddress(s.to_string()))?;
            return AddressRange::new(first, last);
        }
        let addr = IpAddr::from_str(s).map_err(|_| Error::InvalidAddress(s.to_string()))?;
        AddressRange::new(addr, addr)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

fn to_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(*a) as u128,
        IpAddr::V6(a) => u128::from(*a),
    }
}
