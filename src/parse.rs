use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::types::DeviceRecord;

/// Minimum whitespace-separated fields in a `/proc/net/arp` row (ip, hw type, flags, hw address).
pub const ARP_MIN_FIELDS: usize = 4;

/// One accepted subnet, written either as a textual prefix (`192.168.`) or a CIDR (`172.16.0.0/12`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetRule {
    Prefix(String),
    Cidr(Ipv4Net),
}

impl SubnetRule {
    pub fn matches(&self, addr: &str) -> bool {
        match self {
            SubnetRule::Prefix(p) => addr.starts_with(p.as_str()),
            SubnetRule::Cidr(net) => addr
                .parse::<Ipv4Addr>()
                .map(|ip| net.contains(&ip))
                .unwrap_or(false),
        }
    }
}

impl FromStr for SubnetRule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty subnet rule");
        }
        if s.contains('/') {
            let net = s
                .parse::<Ipv4Net>()
                .map_err(|e| anyhow!("invalid CIDR {s}: {e}"))?;
            return Ok(SubnetRule::Cidr(net));
        }
        if !s.chars().all(|c| c.is_ascii_digit() || c == '.') {
            bail!("invalid address prefix: {s}");
        }
        Ok(SubnetRule::Prefix(s.to_string()))
    }
}

impl fmt::Display for SubnetRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubnetRule::Prefix(p) => f.write_str(p),
            SubnetRule::Cidr(n) => write!(f, "{n}"),
        }
    }
}

/// The set of subnets whose addresses count as hotspot clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct SubnetFilter {
    rules: Vec<SubnetRule>,
}

impl SubnetFilter {
    pub fn new(rules: Vec<SubnetRule>) -> Self {
        Self { rules }
    }

    /// Parse a list like `["192.168.", "172.16.0.0/12"]`.
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        let rules = items
            .iter()
            .map(|s| s.as_ref().parse::<SubnetRule>())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[SubnetRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn accepts(&self, addr: &str) -> bool {
        self.rules.iter().any(|r| r.matches(addr))
    }
}

impl Default for SubnetFilter {
    fn default() -> Self {
        Self::new(vec![
            SubnetRule::Prefix("192.168.".into()),
            SubnetRule::Prefix("172.16.".into()),
        ])
    }
}

impl TryFrom<Vec<String>> for SubnetFilter {
    type Error = anyhow::Error;

    fn try_from(v: Vec<String>) -> Result<Self> {
        SubnetFilter::parse(&v)
    }
}

impl From<SubnetFilter> for Vec<String> {
    fn from(f: SubnetFilter) -> Self {
        f.rules.iter().map(ToString::to_string).collect()
    }
}

/// Whether an `ip neigh` line must carry a particular NUD state token to be accepted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateFilter {
    #[default]
    Any,
    States(Vec<String>),
}

impl StateFilter {
    pub fn accepts(&self, fields: &[&str]) -> bool {
        match self {
            StateFilter::Any => true,
            StateFilter::States(states) => fields
                .iter()
                .any(|f| states.iter().any(|s| s.eq_ignore_ascii_case(f))),
        }
    }
}

/// Parse `ip neigh show` output.
///
/// Expected line shape: `192.168.43.12 dev wlan0 lladdr aa:bb:cc:dd:ee:ff REACHABLE`.
/// The first field is the address and must fall in `subnets` and parse as IPv4; the
/// token after `lladdr`, when present, becomes the MAC. Lines that fail any check are skipped.
pub fn parse_neigh_output(s: &str, subnets: &SubnetFilter, states: &StateFilter) -> Vec<DeviceRecord> {
    let mut out = Vec::new();
    for (idx, raw_line) in s.lines().enumerate() {
        let fields: Vec<&str> = raw_line.split_whitespace().collect();
        let Some(&addr) = fields.first() else {
            continue;
        };
        if !subnets.accepts(addr) {
            continue;
        }
        let Ok(ip) = addr.parse::<Ipv4Addr>() else {
            trace!(line = idx + 1, addr, "skipping neigh line with unparsable address");
            continue;
        };
        if !states.accepts(&fields[1..]) {
            trace!(line = idx + 1, %ip, "skipping neigh line without accepted state");
            continue;
        }
        let mac = fields
            .iter()
            .position(|f| *f == "lladdr")
            .and_then(|i| fields.get(i + 1))
            .map(|m| m.to_string());
        out.push(DeviceRecord::new(ip, mac));
    }
    out
}

/// Parse the kernel neighbor cache (`/proc/net/arp`).
///
/// The first line is a header. Every other row needs at least four fields:
/// field 0 is the address, field 3 the hardware address. The flags column is not used.
pub fn parse_arp_table(s: &str, subnets: &SubnetFilter) -> Vec<DeviceRecord> {
    let mut out = Vec::new();
    for (idx, raw_line) in s.lines().enumerate().skip(1) {
        let fields: Vec<&str> = raw_line.split_whitespace().collect();
        if fields.len() < ARP_MIN_FIELDS {
            if !fields.is_empty() {
                trace!(line = idx + 1, fields = fields.len(), "skipping short arp row");
            }
            continue;
        }
        if !subnets.accepts(fields[0]) {
            continue;
        }
        let Ok(ip) = fields[0].parse::<Ipv4Addr>() else {
            trace!(line = idx + 1, addr = fields[0], "skipping arp row with unparsable address");
            continue;
        };
        out.push(DeviceRecord::new(ip, Some(fields[3].to_string())));
    }
    out
}
