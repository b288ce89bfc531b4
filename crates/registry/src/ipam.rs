//! Overlay IP allocation over the fixed /24.
//!
//! Allocation scans the network in ascending order and hands out the
//! first free host address. The network address, the gateway (`.1`,
//! reserved for the hub) and the broadcast address are never allocated.
//! The allocator itself is not persisted; the registry rebuilds it from
//! the node table at load time.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use nw_domain::{Error, Result};

/// Who holds an address lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum IpOwner {
    Node(u64),
    Client(u64),
}

/// Sequential first-free allocator over one IPv4 network.
pub struct IpAllocator {
    network: Ipv4Net,
    gateway: Ipv4Addr,
    low_threshold: usize,
    owners: BTreeMap<Ipv4Addr, IpOwner>,
}

impl IpAllocator {
    pub fn new(network: Ipv4Net, low_threshold: usize) -> Self {
        let gateway = Ipv4Addr::from(u32::from(network.network()) + 1);
        IpAllocator {
            network,
            gateway,
            low_threshold,
            owners: BTreeMap::new(),
        }
    }

    /// The hub's address inside the overlay (`.1`).
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// Mark an address as leased without scanning (registry reload).
    pub fn adopt(&mut self, ip: Ipv4Addr, owner: IpOwner) {
        self.owners.insert(ip, owner);
    }

    /// Lease the first free address in ascending order.
    pub fn allocate(&mut self, owner: IpOwner) -> Result<Ipv4Addr> {
        for ip in self.network.hosts() {
            if ip == self.gateway || self.owners.contains_key(&ip) {
                continue;
            }
            self.owners.insert(ip, owner);
            return Ok(ip);
        }
        Err(Error::PoolExhausted)
    }

    /// Release a lease. Returns the previous owner, if any.
    pub fn release(&mut self, ip: Ipv4Addr) -> Option<IpOwner> {
        self.owners.remove(&ip)
    }

    pub fn owner_of(&self, ip: Ipv4Addr) -> Option<IpOwner> {
        self.owners.get(&ip).copied()
    }

    /// Current leases in address order.
    pub fn allocations(&self) -> impl Iterator<Item = (Ipv4Addr, IpOwner)> + '_ {
        self.owners.iter().map(|(ip, owner)| (*ip, *owner))
    }

    /// Number of allocatable addresses (hosts minus the gateway).
    pub fn capacity(&self) -> usize {
        self.network.hosts().count().saturating_sub(1)
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.owners.len()
    }

    /// True once the free pool has shrunk to the configured threshold.
    pub fn is_low(&self) -> bool {
        self.available() <= self.low_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> IpAllocator {
        IpAllocator::new("10.0.0.0/24".parse().unwrap(), 10)
    }

    #[test]
    fn first_allocation_is_dot_two() {
        let mut ipam = allocator();
        let ip = ipam.allocate(IpOwner::Node(1)).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn allocations_are_sequential() {
        let mut ipam = allocator();
        let a = ipam.allocate(IpOwner::Node(1)).unwrap();
        let b = ipam.allocate(IpOwner::Node(2)).unwrap();
        let c = ipam.allocate(IpOwner::Client(1)).unwrap();
        assert_eq!(
            (a, b, c),
            (
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
                Ipv4Addr::new(10, 0, 0, 4)
            )
        );
    }

    #[test]
    fn released_address_is_reused_first() {
        let mut ipam = allocator();
        let a = ipam.allocate(IpOwner::Node(1)).unwrap();
        let _b = ipam.allocate(IpOwner::Node(2)).unwrap();
        assert_eq!(ipam.release(a), Some(IpOwner::Node(1)));
        let again = ipam.allocate(IpOwner::Node(3)).unwrap();
        assert_eq!(again, a);
    }

    #[test]
    fn capacity_excludes_network_gateway_broadcast() {
        let ipam = allocator();
        // 256 addresses minus network, broadcast, and the hub gateway.
        assert_eq!(ipam.capacity(), 253);
        assert_eq!(ipam.available(), 253);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let mut ipam = IpAllocator::new("10.0.0.0/29".parse().unwrap(), 1);
        // /29: hosts .1-.6, gateway .1 reserved, so 5 allocatable.
        for i in 0..5 {
            ipam.allocate(IpOwner::Node(i)).unwrap();
        }
        assert!(matches!(
            ipam.allocate(IpOwner::Node(99)),
            Err(Error::PoolExhausted)
        ));
    }

    #[test]
    fn low_watermark_trips_at_threshold() {
        let mut ipam = IpAllocator::new("10.0.0.0/28".parse().unwrap(), 3);
        // 13 allocatable (.2-.14).
        assert!(!ipam.is_low());
        for i in 0..10 {
            ipam.allocate(IpOwner::Node(i)).unwrap();
        }
        assert!(ipam.is_low());
    }

    #[test]
    fn gateway_is_never_allocated() {
        let mut ipam = allocator();
        for i in 0..253 {
            let ip = ipam.allocate(IpOwner::Node(i)).unwrap();
            assert_ne!(ip, Ipv4Addr::new(10, 0, 0, 1));
            assert_ne!(ip, Ipv4Addr::new(10, 0, 0, 0));
            assert_ne!(ip, Ipv4Addr::new(10, 0, 0, 255));
        }
        assert!(ipam.allocate(IpOwner::Node(999)).is_err());
    }

    #[test]
    fn adopt_rebuilds_lease_table() {
        let mut ipam = allocator();
        ipam.adopt(Ipv4Addr::new(10, 0, 0, 2), IpOwner::Node(1));
        ipam.adopt(Ipv4Addr::new(10, 0, 0, 4), IpOwner::Node(2));
        // .3 was never adopted, so it is the first free address.
        let ip = ipam.allocate(IpOwner::Node(3)).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(ipam.owner_of(Ipv4Addr::new(10, 0, 0, 4)), Some(IpOwner::Node(2)));
    }
}
