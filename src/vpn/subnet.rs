//! Address/prefix values used by the route controller

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubnetError {
    #[error("Invalid address in {0}")]
    InvalidAddress(String),
    #[error("Invalid prefix length in {0}")]
    InvalidPrefix(String),
}

/// An interface address together with its prefix length, e.g. `10.8.0.1/24`.
///
/// Host bits are kept: the address is the one assigned to the interface,
/// not the network base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    addr: IpAddr,
    prefix: u8,
}

impl Subnet {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, SubnetError> {
        if prefix > max_prefix(&addr) {
            return Err(SubnetError::InvalidPrefix(format!("{}/{}", addr, prefix)));
        }
        Ok(Self { addr, prefix })
    }

    /// A single-address subnet (/32 or /128).
    pub fn host(addr: IpAddr) -> Self {
        Self {
            prefix: max_prefix(&addr),
            addr,
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Point-to-point peer for a tunnel interface.
    ///
    /// Only the last byte changes: 1 becomes 2, anything else becomes 1.
    pub fn peer(&self) -> IpAddr {
        let toggle = |last: u8| if last == 1 { 2 } else { 1 };
        match self.addr {
            IpAddr::V4(v4) => {
                let mut octets = v4.octets();
                octets[3] = toggle(octets[3]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            IpAddr::V6(v6) => {
                let mut octets = v6.octets();
                octets[15] = toggle(octets[15]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        }
    }

    /// Same prefix length with `peer()` as the address.
    pub fn with_peer(&self) -> Subnet {
        Subnet {
            addr: self.peer(),
            prefix: self.prefix,
        }
    }

    /// Dotted netmask for an IPv4 subnet, e.g. `255.255.255.0`.
    pub fn netmask(&self) -> Option<Ipv4Addr> {
        match self.addr {
            IpAddr::V4(_) => {
                let bits = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                Some(Ipv4Addr::from(bits))
            }
            IpAddr::V6(_) => None,
        }
    }

    /// First and last IPv4 address covered, as integers.
    pub fn ipv4_range(&self) -> Option<(u32, u32)> {
        let IpAddr::V4(v4) = self.addr else {
            return None;
        };
        let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
        let start = u32::from(v4) & mask;
        Some((start, start | !mask))
    }
}

/// The two /1 routes that together cover the whole IPv4 space.
///
/// Each is more specific than `0.0.0.0/0`, so they win over the existing
/// default route without deleting it.
pub fn split_default_routes() -> [Subnet; 2] {
    [
        Subnet {
            addr: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            prefix: 1,
        },
        Subnet {
            addr: IpAddr::V4(Ipv4Addr::new(128, 0, 0, 0)),
            prefix: 1,
        },
    ]
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, prefix_str) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_str
            .trim()
            .parse()
            .map_err(|_| SubnetError::InvalidAddress(s.to_string()))?;
        let prefix = match prefix_str {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .map_err(|_| SubnetError::InvalidPrefix(s.to_string()))?,
            None => max_prefix(&addr),
        };
        Subnet::new(addr, prefix)
    }
}

impl serde::Serialize for Subnet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Subnet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
