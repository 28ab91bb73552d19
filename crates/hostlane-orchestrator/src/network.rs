// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network allocator.
//!
//! Hands out unique IPv4 addresses from the private subnet that instance
//! containers are attached to. State lives only in memory; on startup it is
//! rebuilt from the instances that currently hold an address, so there is no
//! separate ledger that could drift from the instance records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors from address allocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Every host address in the subnet is taken or reserved.
    #[error("Address space exhausted in subnet {0}")]
    AddressSpaceExhausted(Subnet),

    /// The address does not belong to the subnet.
    #[error("Address {address} is outside subnet {subnet}")]
    OutOfRange {
        /// Offending address.
        address: Ipv4Addr,
        /// Configured subnet.
        subnet: Subnet,
    },
}

/// Error parsing a CIDR block.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid subnet '{input}': {reason}")]
pub struct SubnetParseError {
    input: String,
    reason: &'static str,
}

/// An IPv4 CIDR block such as `10.1.2.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    /// Create a subnet, normalizing the address to its network address.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, SubnetParseError> {
        // /31 and /32 have no usable host range once network/broadcast are excluded.
        if prefix_len > 30 {
            return Err(SubnetParseError {
                input: format!("{}/{}", address, prefix_len),
                reason: "prefix length must be at most 30",
            });
        }
        let mask = Self::mask_for(prefix_len);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(address) & mask),
            prefix_len,
        })
    }

    fn mask_for(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len as u32)
        }
    }

    /// The network address.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// The prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !Self::mask_for(self.prefix_len))
    }

    /// Whether `address` falls inside this block (network/broadcast included).
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & Self::mask_for(self.prefix_len) == u32::from(self.network)
    }

    /// Whether `address` is a usable host address (not network or broadcast).
    pub fn is_host(&self, address: Ipv4Addr) -> bool {
        self.contains(address) && address != self.network && address != self.broadcast()
    }

    /// First usable host address.
    pub fn first_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    /// Last usable host address.
    pub fn last_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.broadcast()) - 1)
    }

    /// Number of usable host addresses.
    pub fn host_count(&self) -> u32 {
        u32::from(self.broadcast()) - u32::from(self.network) - 1
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = SubnetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| SubnetParseError {
            input: s.to_string(),
            reason,
        };
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(|| err("missing '/'"))?;
        let address: Ipv4Addr = addr.parse().map_err(|_| err("invalid IPv4 address"))?;
        let prefix_len: u8 = prefix.parse().map_err(|_| err("invalid prefix length"))?;
        if prefix_len > 32 {
            return Err(err("prefix length must be at most 32"));
        }
        Self::new(address, prefix_len).map_err(|mut e| {
            e.input = s.to_string();
            e
        })
    }
}

#[derive(Debug, Default)]
struct AllocationTable {
    by_address: BTreeMap<u32, Uuid>,
}

/// Assigns and releases unique host addresses from a subnet.
///
/// Allocation always picks the lowest free address, so the first instance in
/// `10.1.2.0/24` receives `10.1.2.1`, the next `10.1.2.2`, and a released
/// address is reused before any higher one.
#[derive(Debug)]
pub struct NetworkAllocator {
    subnet: Subnet,
    reserved: BTreeSet<u32>,
    table: Mutex<AllocationTable>,
}

impl NetworkAllocator {
    /// Create an allocator for `subnet`, never handing out any of `reserved`.
    pub fn new(subnet: Subnet, reserved: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        let reserved = reserved
            .into_iter()
            .filter(|addr| {
                let inside = subnet.is_host(*addr);
                if !inside {
                    warn!(address = %addr, subnet = %subnet, "Ignoring reserved address outside subnet");
                }
                inside
            })
            .map(u32::from)
            .collect();

        Self {
            subnet,
            reserved,
            table: Mutex::new(AllocationTable::default()),
        }
    }

    /// The subnet addresses are drawn from.
    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    fn table(&self) -> std::sync::MutexGuard<'_, AllocationTable> {
        // The table holds no invariants that a panic mid-update could break.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve the lowest unused host address for `instance_id`.
    pub fn allocate(&self, instance_id: Uuid) -> Result<Ipv4Addr, AllocError> {
        let first = u32::from(self.subnet.first_host());
        let last = u32::from(self.subnet.last_host());

        let mut table = self.table();
        let candidate = (first..=last)
            .find(|ip| !self.reserved.contains(ip) && !table.by_address.contains_key(ip))
            .ok_or(AllocError::AddressSpaceExhausted(self.subnet))?;

        table.by_address.insert(candidate, instance_id);
        let address = Ipv4Addr::from(candidate);
        debug!(instance_id = %instance_id, address = %address, "Allocated address");
        Ok(address)
    }

    /// Release `address`. Releasing an unallocated address is a no-op.
    ///
    /// Returns the instance that held it, if any.
    pub fn release(&self, address: Ipv4Addr) -> Option<Uuid> {
        let released = self.table().by_address.remove(&u32::from(address));
        if let Some(instance_id) = released {
            debug!(instance_id = %instance_id, address = %address, "Released address");
        }
        released
    }

    /// Mark `address` as held by `instance_id` (used when rebuilding state).
    ///
    /// Returns the current holder if the address is already claimed by another instance.
    pub fn claim(&self, address: Ipv4Addr, instance_id: Uuid) -> Result<Option<Uuid>, AllocError> {
        if !self.subnet.contains(address) {
            return Err(AllocError::OutOfRange {
                address,
                subnet: self.subnet,
            });
        }
        let mut table = self.table();
        match table.by_address.get(&u32::from(address)) {
            Some(holder) if *holder != instance_id => Ok(Some(*holder)),
            _ => {
                table.by_address.insert(u32::from(address), instance_id);
                Ok(None)
            }
        }
    }

    /// Replace all allocation state with the given `(address, instance)` pairs.
    ///
    /// Pairs that conflict with an earlier pair or fall outside the subnet are
    /// skipped and returned so the caller can report them.
    pub fn rebuild(
        &self,
        holders: impl IntoIterator<Item = (Ipv4Addr, Uuid)>,
    ) -> Vec<(Ipv4Addr, Uuid)> {
        self.table().by_address.clear();

        let mut rejected = Vec::new();
        for (address, instance_id) in holders {
            match self.claim(address, instance_id) {
                Ok(None) => {}
                Ok(Some(holder)) => {
                    warn!(
                        address = %address,
                        instance_id = %instance_id,
                        holder = %holder,
                        "Address already held by another instance"
                    );
                    rejected.push((address, instance_id));
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Skipping address during rebuild");
                    rejected.push((address, instance_id));
                }
            }
        }
        rejected
    }

    /// The instance holding `address`, if any.
    pub fn holder(&self, address: Ipv4Addr) -> Option<Uuid> {
        self.table().by_address.get(&u32::from(address)).copied()
    }

    /// Number of allocated addresses.
    pub fn allocated_count(&self) -> usize {
        self.table().by_address.len()
    }

    /// Number of addresses still available.
    pub fn available_count(&self) -> usize {
        self.subnet.host_count() as usize - self.reserved.len() - self.allocated_count()
    }
}
