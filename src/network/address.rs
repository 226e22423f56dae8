//! IPv4 prefixes and per-prefix host allocation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{SimError, SimResult};

/// An IPv4 network prefix such as `192.168.0.0/24`.
///
/// Accepts both the length form and the dotted mask form
/// (`192.168.0.0/255.255.255.0`). Host bits of the base address are cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Prefix {
    network: Ipv4Addr,
    len: u8,
}

impl Ipv4Prefix {
    pub fn new(address: Ipv4Addr, len: u8) -> SimResult<Self> {
        if len > 32 {
            return Err(SimError::InvalidConfig(format!("prefix length {len} is larger than 32")));
        }
        Ok(Self::truncated(address, len))
    }

    /// Like [`Ipv4Prefix::new`] but clamps the length to 32.
    pub fn truncated(address: Ipv4Addr, len: u8) -> Self {
        let len = len.min(32);
        let network = Ipv4Addr::from(u32::from(address) & mask_bits(len));
        Self { network, len }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_bits(self.len))
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & mask_bits(self.len) == u32::from(self.network)
    }

    /// Number of usable host identifiers (network and broadcast excluded).
    pub fn host_capacity(&self) -> u32 {
        match self.len {
            31 | 32 => 0,
            len => (1u32 << (32 - len)) - 2,
        }
    }

    /// Address of host number `n` (1-based) within the prefix.
    pub fn host(&self, n: u32) -> Option<Ipv4Addr> {
        if n == 0 || n > self.host_capacity() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network) + n))
    }
}

fn mask_bits(len: u8) -> u32 {
    if len == 0 { 0 } else { u32::MAX << (32 - u32::from(len)) }
}

impl FromStr for Ipv4Prefix {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SimError::InvalidConfig(format!("invalid IPv4 prefix '{s}'"));
        let (address, suffix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let address: Ipv4Addr = address.parse().map_err(|_| invalid())?;
        let len = if let Ok(len) = suffix.parse::<u8>() {
            len
        } else {
            let mask = u32::from(suffix.parse::<Ipv4Addr>().map_err(|_| invalid())?);
            // A netmask must be a contiguous run of ones.
            if mask.leading_ones() + mask.trailing_zeros() != 32 {
                return Err(invalid());
            }
            mask.leading_ones() as u8
        };
        Ipv4Prefix::new(address, len)
    }
}

impl TryFrom<String> for Ipv4Prefix {
    type Error = SimError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Prefix> for String {
    fn from(prefix: Ipv4Prefix) -> Self {
        prefix.to_string()
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.len)
    }
}

/// Hands out host addresses per prefix in request order.
///
/// Allocation is staged: callers reserve addresses while walking the links and
/// only commit the result once every reservation succeeded.
#[derive(Debug, Default, Clone)]
pub struct AddressAllocator {
    next_host: BTreeMap<Ipv4Prefix, u32>,
}

impl AddressAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next free address in `prefix`.
    pub fn allocate(&mut self, prefix: Ipv4Prefix) -> SimResult<Ipv4Addr> {
        let next = self.next_host.entry(prefix).or_insert(1);
        let address = prefix.host(*next).ok_or(SimError::ExhaustedAddressSpace {
            prefix,
            capacity: prefix.host_capacity(),
        })?;
        *next += 1;
        Ok(address)
    }

    /// Number of addresses handed out from `prefix` so far.
    pub fn allocated(&self, prefix: Ipv4Prefix) -> u32 {
        self.next_host.get(&prefix).map_or(0, |next| next - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_length_and_mask_forms() {
        let a: Ipv4Prefix = "192.168.0.0/24".parse().unwrap();
        let b: Ipv4Prefix = "192.168.0.0/255.255.255.0".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.mask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(a.to_string(), "192.168.0.0/24");

        // Host bits are cleared.
        let c: Ipv4Prefix = "10.1.1.7/24".parse().unwrap();
        assert_eq!(c.network(), Ipv4Addr::new(10, 1, 1, 0));
    }

    #[test]
    fn rejects_malformed_prefixes() {
        assert!("192.168.0.0".parse::<Ipv4Prefix>().is_err());
        assert!("192.168.0.0/33".parse::<Ipv4Prefix>().is_err());
        assert!("192.168.0.0/255.0.255.0".parse::<Ipv4Prefix>().is_err());
        assert!("300.1.1.0/24".parse::<Ipv4Prefix>().is_err());
    }

    #[test]
    fn capacity_and_membership() {
        let p: Ipv4Prefix = "192.168.0.0/24".parse().unwrap();
        assert_eq!(p.host_capacity(), 254);
        assert!(p.contains(Ipv4Addr::new(192, 168, 0, 200)));
        assert!(!p.contains(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(p.host(1), Some(Ipv4Addr::new(192, 168, 0, 1)));
        assert_eq!(p.host(254), Some(Ipv4Addr::new(192, 168, 0, 254)));
        assert_eq!(p.host(255), None);
        assert_eq!("10.0.0.0/30".parse::<Ipv4Prefix>().unwrap().host_capacity(), 2);
    }

    #[test]
    fn allocator_counts_per_prefix_and_exhausts() {
        let small: Ipv4Prefix = "10.0.0.0/30".parse().unwrap();
        let other: Ipv4Prefix = "10.0.1.0/24".parse().unwrap();
        let mut allocator = AddressAllocator::new();

        assert_eq!(allocator.allocate(small).unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(allocator.allocate(other).unwrap(), Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(allocator.allocate(small).unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(allocator.allocate(small), Err(SimError::ExhaustedAddressSpace { prefix: small, capacity: 2 }));
        assert_eq!(allocator.allocated(small), 2);
    }

    #[test]
    fn serde_uses_string_form() {
        #[derive(Deserialize)]
        struct Wrapper {
            prefix: Ipv4Prefix,
        }
        let w: Wrapper = toml::from_str("prefix = \"10.1.1.0/255.255.255.0\"").unwrap();
        assert_eq!(w.prefix.to_string(), "10.1.1.0/24");
    }
}
