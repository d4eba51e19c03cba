//! Per-location network ranges and random address selection.
//!
//! The range table lives in its own snapshot next to the document. It is
//! read-mostly reference data, so it is loaded on demand without the
//! document cache.

use std::{
    collections::BTreeMap,
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    path::Path,
    str::FromStr,
};

use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use crate::{error::StoreError, snapshot::SnapshotFile};

/// Offsets handed out inside very large IPv6 networks stay below this bound.
const IPV6_OFFSET_CAP: u128 = 1_000_000;

/// Error returned when a CIDR string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrParseError(String);

impl fmt::Display for CidrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid CIDR {:?}", self.0)
    }
}

impl std::error::Error for CidrParseError {}

fn split_cidr(input: &str, max_prefix: u8) -> Result<(&str, u8), CidrParseError> {
    let invalid = || CidrParseError(input.to_string());
    let (addr, prefix) = input.trim().split_once('/').ok_or_else(invalid)?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > max_prefix {
        return Err(invalid());
    }
    Ok((addr, prefix))
}

/// IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Network address with host bits cleared.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    /// Address at `index` within the network.
    pub fn nth(&self, index: u64) -> Option<Ipv4Addr> {
        (index < self.size()).then(|| Ipv4Addr::from(u32::from(self.network) + index as u32))
    }

    /// Whether `addr` lies inside the network.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_v4(u32::from(addr), self.prefix) == u32::from(self.network)
    }

    /// Random host address. Network and broadcast addresses are skipped when
    /// the network has more than two addresses; a /31 yields its second
    /// address and a /32 its only one.
    pub fn random_host<R: Rng + ?Sized>(&self, rng: &mut R) -> Ipv4Addr {
        let max_index = self.size() - 1;
        let index = match max_index {
            0 => 0,
            1 => 1,
            _ => rng.gen_range(1..max_index),
        };
        Ipv4Addr::from(u32::from(self.network) + index as u32)
    }
}

fn mask_v4(addr: u32, prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        _ => addr & (u32::MAX << (32 - u32::from(prefix))),
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CidrParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = split_cidr(input, 32)?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| CidrParseError(input.to_string()))?;
        Ok(Self {
            network: Ipv4Addr::from(mask_v4(u32::from(addr), prefix)),
            prefix,
        })
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = CidrParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(value: Ipv4Cidr) -> Self {
        value.to_string()
    }
}

/// IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv6Cidr {
    network: Ipv6Addr,
    prefix: u8,
}

impl Ipv6Cidr {
    /// Network address with host bits cleared.
    pub fn network(&self) -> Ipv6Addr {
        self.network
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn last_offset(&self) -> u128 {
        match 128 - u32::from(self.prefix) {
            128 => u128::MAX,
            host_bits => (1u128 << host_bits) - 1,
        }
    }

    /// Whether `addr` lies inside the network.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        mask_v6(u128::from(addr), self.prefix) == u128::from(self.network)
    }

    /// Random address at a non-zero offset from the network address. Offsets
    /// are capped for networks wider than a /64; a network with fewer than
    /// three addresses yields the network address itself.
    pub fn random_host<R: Rng + ?Sized>(&self, rng: &mut R) -> Ipv6Addr {
        let max_offset = if self.prefix < 64 {
            IPV6_OFFSET_CAP.min(self.last_offset())
        } else {
            self.last_offset()
        };
        if max_offset <= 1 {
            return self.network;
        }
        let offset = rng.gen_range(1..=max_offset);
        Ipv6Addr::from(u128::from(self.network) + offset)
    }
}

fn mask_v6(addr: u128, prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        _ => addr & (u128::MAX << (128 - u32::from(prefix))),
    }
}

impl FromStr for Ipv6Cidr {
    type Err = CidrParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = split_cidr(input, 128)?;
        let addr: Ipv6Addr = addr
            .parse()
            .map_err(|_| CidrParseError(input.to_string()))?;
        Ok(Self {
            network: Ipv6Addr::from(mask_v6(u128::from(addr), prefix)),
            prefix,
        })
    }
}

impl fmt::Display for Ipv6Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl TryFrom<String> for Ipv6Cidr {
    type Error = CidrParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv6Cidr> for String {
    fn from(value: Ipv6Cidr) -> Self {
        value.to_string()
    }
}

/// Ranges addresses for one location are drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRanges {
    /// Blocks DNS addresses are drawn from.
    pub ipv4: Vec<Ipv4Cidr>,
    /// Blocks the two DNS v6 addresses are drawn from.
    pub ipv6: Vec<Ipv6Cidr>,
}

impl LocationRanges {
    /// Random IPv4 host from one of the location's ranges.
    pub fn random_ipv4<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Ipv4Addr> {
        self.ipv4.choose(rng).map(|cidr| cidr.random_host(rng))
    }

    /// Random IPv6 address from one of the location's ranges.
    pub fn random_ipv6<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Ipv6Addr> {
        self.ipv6.choose(rng).map(|cidr| cidr.random_host(rng))
    }
}

/// Range table keyed by location slug.
pub type RangeTable = BTreeMap<String, LocationRanges>;

/// Built-in table written when no ranges file exists yet.
pub fn default_ranges() -> RangeTable {
    [
        ("germany", "192.0.2.0/26", "2001:db8:de::/48"),
        ("uae", "192.0.2.64/26", "2001:db8:ae::/48"),
        ("russia", "198.51.100.0/24", "2001:db8:7::/48"),
        ("france", "203.0.113.0/24", "2001:db8:f7::/48"),
    ]
    .into_iter()
    .filter_map(|(key, v4, v6)| {
        Some((
            key.to_string(),
            LocationRanges {
                ipv4: vec![v4.parse().ok()?],
                ipv6: vec![v6.parse().ok()?],
            },
        ))
    })
    .collect()
}

/// Snapshot-backed range table.
#[derive(Debug, Clone)]
pub struct NetworkRanges {
    file: SnapshotFile<RangeTable>,
}

impl NetworkRanges {
    /// Bind to the ranges snapshot at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            file: SnapshotFile::new(path.as_ref()),
        }
    }

    /// Current table; a missing or unreadable file is reset to the defaults.
    pub fn load(&self) -> RangeTable {
        self.file.load_or_else(default_ranges)
    }

    /// Ranges for a single location.
    pub fn for_location(&self, location: &str) -> Option<LocationRanges> {
        self.load().remove(location)
    }

    /// Replace the whole table.
    pub fn save(&self, table: &RangeTable) -> Result<(), StoreError> {
        self.file.save(table)
    }

    /// Replace the ranges of one location.
    pub fn set_location(&self, location: &str, ranges: LocationRanges) -> Result<(), StoreError> {
        let mut table = self.load();
        table.insert(location.to_string(), ranges);
        self.save(&table)
    }
}
