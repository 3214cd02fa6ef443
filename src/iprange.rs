//! IP address ranges for whitelists and trusted proxy lists
//!
//! Accepted forms: a single address (`192.0.2.7`), an inclusive span
//! (`192.0.2.1 - 192.0.2.99`) and a CIDR subnet (`2001:db8::/32`).

use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpRange {
    Single(IpAddr),
    Span { start: IpAddr, end: IpAddr },
    Subnet(IpNet),
}

impl IpRange {
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        match self {
            IpRange::Single(addr) => *addr == ip,
            IpRange::Subnet(net) => net.contains(&ip),
            IpRange::Span { start, end } => match (start, end, ip) {
                (IpAddr::V4(s), IpAddr::V4(e), IpAddr::V4(v)) => {
                    (u32::from(*s)..=u32::from(*e)).contains(&u32::from(v))
                }
                (IpAddr::V6(s), IpAddr::V6(e), IpAddr::V6(v)) => {
                    (u128::from(*s)..=u128::from(*e)).contains(&u128::from(v))
                }
                _ => false,
            },
        }
    }
}

impl FromStr for IpRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty IP range".to_string());
        }

        if s.contains('/') {
            return s
                .parse::<IpNet>()
                .map(|net| IpRange::Subnet(net.trunc()))
                .map_err(|e| format!("invalid subnet \"{}\": {}", s, e));
        }

        if let Some((a, b)) = s.split_once('-') {
            let start: IpAddr = parse_addr(a)?;
            let end: IpAddr = parse_addr(b)?;
            if start.is_ipv4() != end.is_ipv4() {
                return Err(format!("range \"{}\" mixes IPv4 and IPv6", s));
            }
            if start > end {
                return Err(format!("range \"{}\" starts after it ends", s));
            }
            return Ok(IpRange::Span { start, end });
        }

        parse_addr(s).map(IpRange::Single)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpRange::Single(ip) => write!(f, "{}", ip),
            IpRange::Span { start, end } => write!(f, "{} - {}", start, end),
            IpRange::Subnet(net) => write!(f, "{}", net),
        }
    }
}

fn parse_addr(s: &str) -> Result<IpAddr, String> {
    s.trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_canonical())
        .map_err(|_| format!("invalid IP address \"{}\"", s.trim()))
}

/// Union of ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpRangeSet {
    ranges: Vec<IpRange>,
}

impl IpRangeSet {
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self, String> {
        let ranges = items
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<IpRange>, _>>()?;
        Ok(Self { ranges })
    }

    pub fn extend(&mut self, other: IpRangeSet) {
        self.ranges.extend(other.ranges);
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.ranges.iter().any(|r| r.contains(ip))
    }
}
