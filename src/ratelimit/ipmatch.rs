// src/ratelimit/ipmatch.rs
use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// One allow/deny entry: a single address or a CIDR range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum IpRule {
    Addr(IpAddr),
    Net { base: IpAddr, prefix: u8 },
}

#[derive(Debug, thiserror::Error)]
#[error("invalid ip rule {0:?}")]
pub struct BadIpRule(String);

impl FromStr for IpRule {
    type Err = BadIpRule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || BadIpRule(s.to_string());
        match s.split_once('/') {
            None => s.parse::<IpAddr>().map(|ip| IpRule::Addr(canonical(ip))).map_err(|_| bad()),
            Some((addr, bits)) => {
                let base = canonical(addr.parse::<IpAddr>().map_err(|_| bad())?);
                let prefix: u8 = bits.parse().map_err(|_| bad())?;
                let max = if base.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(bad());
                }
                Ok(IpRule::Net { base, prefix })
            }
        }
    }
}

impl TryFrom<String> for IpRule {
    type Error = BadIpRule;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for IpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpRule::Addr(ip) => write!(f, "{ip}"),
            IpRule::Net { base, prefix } => write!(f, "{base}/{prefix}"),
        }
    }
}

impl IpRule {
    pub fn matches(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        match *self {
            IpRule::Addr(a) => a == ip,
            IpRule::Net { base, prefix } => match (base, ip) {
                (IpAddr::V4(b), IpAddr::V4(i)) => {
                    let mask = mask32(prefix);
                    u32::from(b) & mask == u32::from(i) & mask
                }
                (IpAddr::V6(b), IpAddr::V6(i)) => {
                    let mask = mask128(prefix);
                    u128::from(b) & mask == u128::from(i) & mask
                }
                _ => false,
            },
        }
    }
}

pub fn any_match(rules: &[IpRule], ip: IpAddr) -> bool {
    rules.iter().any(|r| r.matches(ip))
}

/// `::ffff:a.b.c.d` compares as `a.b.c.d`.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    }
}

fn mask32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}
