//! IP allow-list with exact and CIDR entries.

use crate::{AgentError, Result};
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpRule {
    Exact(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
}

impl IpRule {
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        let invalid = || AgentError::Config(format!("invalid allowed_ips entry: {entry}"));

        match entry.split_once('/') {
            None => entry.parse().map(IpRule::Exact).map_err(|_| invalid()),
            Some((addr, prefix)) => {
                let network: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                let max = if network.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(invalid());
                }
                Ok(IpRule::Cidr { network, prefix })
            }
        }
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        match *self {
            IpRule::Exact(allowed) => canonical(allowed) == ip,
            IpRule::Cidr { network, prefix } => match (canonical(network), ip) {
                (IpAddr::V4(net), IpAddr::V4(addr)) => {
                    let mask = prefix_mask(prefix, 32) as u32;
                    u32::from(net) & mask == u32::from(addr) & mask
                }
                (IpAddr::V6(net), IpAddr::V6(addr)) => {
                    let mask = prefix_mask(prefix, 128);
                    u128::from(net) & mask == u128::from(addr) & mask
                }
                _ => false,
            },
        }
    }
}

/// IPv4-mapped IPv6 addresses compare as IPv4.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

fn prefix_mask(prefix: u8, bits: u32) -> u128 {
    if prefix == 0 {
        0
    } else {
        (u128::MAX << (128 - u32::from(prefix))) >> (128 - bits)
    }
}

/// Parsed allow-list; empty admits every address.
#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    rules: Vec<IpRule>,
}

impl IpAllowList {
    pub fn parse(entries: &[String]) -> Result<Self> {
        let rules = entries
            .iter()
            .filter(|e| !e.trim().is_empty())
            .map(|e| IpRule::parse(e))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|rule| rule.matches(ip))
    }
}
