//! IPv4 CIDR blocks.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::{Error, Result};

/// An IPv4 address with a prefix length, e.g. `192.168.64.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    address: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Creates a block from an address and prefix length.
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::InvalidArgument(format!(
                "prefix length {prefix} exceeds 32"
            )));
        }
        Ok(Self { address, prefix })
    }

    /// Parses `a.b.c.d/len`.
    pub fn parse(value: &str) -> Result<Self> {
        let (address, prefix) = value
            .split_once('/')
            .ok_or_else(|| Error::InvalidArgument(format!("missing prefix in {value}")))?;
        let address: Ipv4Addr = address
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid address in {value}")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid prefix in {value}")))?;
        Self::new(address, prefix)
    }

    /// The address as written.
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// The prefix length.
    pub fn prefix_length(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    /// The lowest address of the block (the network address).
    pub fn lower(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.mask())
    }

    /// The highest address of the block (the broadcast address).
    pub fn upper(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) | !self.mask())
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    /// Returns `true` when `ip` falls inside the block.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.lower())
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_block_bounds() {
        let cidr = Ipv4Cidr::parse("192.168.64.0/24").unwrap();
        assert_eq!(cidr.lower(), Ipv4Addr::new(192, 168, 64, 0));
        assert_eq!(cidr.upper(), Ipv4Addr::new(192, 168, 64, 255));
        assert_eq!(cidr.prefix_length(), 24);
        assert_eq!(cidr.size(), 256);
        assert!(cidr.contains(Ipv4Addr::new(192, 168, 64, 10)));
        assert!(!cidr.contains(Ipv4Addr::new(192, 168, 65, 1)));
    }

    #[test]
    fn non_aligned_address_keeps_bounds() {
        let cidr = Ipv4Cidr::parse("10.0.5.77/16").unwrap();
        assert_eq!(cidr.lower(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(cidr.upper(), Ipv4Addr::new(10, 0, 255, 255));
        assert!(cidr.contains(Ipv4Addr::new(10, 0, 200, 1)));
        assert!(!cidr.contains(Ipv4Addr::new(10, 1, 0, 1)));
    }

    #[test]
    fn edge_prefixes() {
        let host = Ipv4Cidr::parse("172.16.0.1/32").unwrap();
        assert_eq!(host.lower(), host.upper());
        assert_eq!(host.size(), 1);
        assert!(host.contains(Ipv4Addr::new(172, 16, 0, 1)));

        let all = Ipv4Cidr::parse("0.0.0.0/0").unwrap();
        assert_eq!(all.size(), 1 << 32);
        assert!(all.contains(Ipv4Addr::new(255, 255, 255, 255)));
    }

    #[test]
    fn rejects_malformed() {
        assert!(Ipv4Cidr::parse("192.168.64.0").is_err());
        assert!(Ipv4Cidr::parse("192.168.64.0/33").is_err());
        assert!(Ipv4Cidr::parse("not-an-ip/24").is_err());
    }

    #[test]
    fn display_round_trip() {
        let cidr = Ipv4Cidr::parse("192.168.64.0/24").unwrap();
        assert_eq!(cidr.to_string(), "192.168.64.0/24");
        assert_eq!(cidr.to_string().parse::<Ipv4Cidr>().unwrap(), cidr);
    }
}
