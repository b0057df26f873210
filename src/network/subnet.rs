//! Per-sandbox subnet allocation and interface addressing.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use rand::Rng;

use crate::error::SandboxError;

/// Addressing for one sandbox network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetLease {
    /// `a.b.c.0/24`
    pub cidr: String,
    pub gateway: Ipv4Addr,
    /// Address handed to the sandbox: gateway + 1.
    pub address: Ipv4Addr,
    /// Third octet taken from the pool, when the subnet came from it.
    pub pool_slot: Option<u8>,
}

/// Hands out `/24` subnets from a private `/16` pool.
#[derive(Debug)]
pub struct SubnetPool {
    prefix: (u8, u8),
    used: BTreeSet<u8>,
}

impl SubnetPool {
    pub fn new(prefix: (u8, u8)) -> Self {
        Self {
            prefix,
            used: BTreeSet::new(),
        }
    }

    /// Lease the lowest free `/24`.
    pub fn allocate(&mut self) -> Result<SubnetLease, SandboxError> {
        let slot = (1..=254u8)
            .find(|slot| !self.used.contains(slot))
            .ok_or_else(|| {
                SandboxError::ResourceExhaustion(format!(
                    "subnet pool {}.{}.0.0/16 is exhausted",
                    self.prefix.0, self.prefix.1
                ))
            })?;
        self.used.insert(slot);

        let gateway = Ipv4Addr::new(self.prefix.0, self.prefix.1, slot, 1);
        Ok(SubnetLease {
            cidr: format!("{}.{}.{}.0/24", self.prefix.0, self.prefix.1, slot),
            gateway,
            address: next_address(gateway),
            pool_slot: Some(slot),
        })
    }

    pub fn release(&mut self, slot: u8) {
        self.used.remove(&slot);
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }
}

/// Lease for a caller-supplied subnet. The gateway defaults to the first
/// host address of the block.
pub fn explicit_lease(cidr: &str, gateway: Option<&str>) -> Result<SubnetLease, SandboxError> {
    let invalid = |reason: &str| {
        SandboxError::Config(crate::error::ConfigError::ValidationError(format!(
            "invalid subnet '{}': {}",
            cidr, reason
        )))
    };

    let (network, prefix) = cidr.split_once('/').ok_or_else(|| invalid("missing prefix length"))?;
    let network: Ipv4Addr = network.parse().map_err(|_| invalid("not an IPv4 network"))?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid("bad prefix length"))?;
    if !(8..=30).contains(&prefix) {
        return Err(invalid("prefix length must be between 8 and 30"));
    }

    let gateway = match gateway {
        Some(gw) => gw
            .parse::<Ipv4Addr>()
            .map_err(|_| invalid("gateway is not an IPv4 address"))?,
        None => next_address(network),
    };

    // usable hosts exclude the network and broadcast addresses
    let mask = u32::MAX << (32 - prefix);
    let base = u32::from(network) & mask;
    let hosts = (base + 1)..=(base | !mask) - 1;
    if !hosts.contains(&u32::from(gateway)) {
        return Err(invalid("gateway is not a host address of the subnet"));
    }
    let address = next_address(gateway);
    if !hosts.contains(&u32::from(address)) {
        return Err(invalid("no host address left after the gateway"));
    }

    Ok(SubnetLease {
        cidr: cidr.to_string(),
        gateway,
        address,
        pool_slot: None,
    })
}

fn next_address(addr: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr).wrapping_add(1))
}

/// Random unicast, locally administered MAC address.
pub fn random_mac() -> String {
    let mut bytes: [u8; 6] = rand::thread_rng().gen();
    bytes[0] = (bytes[0] & 0xfe) | 0x02;
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
