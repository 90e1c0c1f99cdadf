use std::collections::HashSet;
use std::net::Ipv4Addr;

use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Serialize};

/// One device seen in the neighbor table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    ip: Ipv4Addr,
    mac: Option<String>,
}

impl DeviceRecord {
    pub fn new(ip: Ipv4Addr, mac: Option<String>) -> Self {
        Self { ip, mac }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }
}

/// Which source a snapshot was taken from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    None,
    NeighCommand,
    ArpCache,
    UnprivilegedNeighCommand,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceKind::None => "none",
            SourceKind::NeighCommand => "ip-neigh",
            SourceKind::ArpCache => "arp-cache",
            SourceKind::UnprivilegedNeighCommand => "ip-neigh (unprivileged)",
        };
        f.write_str(s)
    }
}

/// Snapshot of the devices found in one poll cycle, unique by IP and in discovery order.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DeviceSet {
    devices: Vec<DeviceRecord>,
    source: SourceKind,
    captured_at: String,
}

impl DeviceSet {
    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn captured_at(&self) -> &str {
        &self.captured_at
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.devices.iter().any(|d| d.ip == ip)
    }
}

// Snapshots taken at different times with the same devices are equal.
impl PartialEq for DeviceSet {
    fn eq(&self, other: &Self) -> bool {
        self.devices == other.devices
    }
}

impl Eq for DeviceSet {}

/// Accumulates records for one cycle, keeping the first record seen for each IP.
#[derive(Debug, Default)]
pub struct DeviceSetBuilder {
    seen: HashSet<Ipv4Addr>,
    devices: Vec<DeviceRecord>,
    source: SourceKind,
}

impl DeviceSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the IP was already present.
    pub fn push(&mut self, record: DeviceRecord) -> bool {
        if !self.seen.insert(record.ip) {
            return false;
        }
        self.devices.push(record);
        true
    }

    /// Merge records from `source`; the first source that contributes anything is recorded.
    pub fn extend_from(&mut self, source: SourceKind, records: impl IntoIterator<Item = DeviceRecord>) {
        let mut added = false;
        for r in records {
            added |= self.push(r);
        }
        if added && self.source == SourceKind::None {
            self.source = source;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn build(self) -> DeviceSet {
        DeviceSet {
            devices: self.devices,
            source: self.source,
            captured_at: now_rfc3339(),
        }
    }
}

impl FromIterator<DeviceRecord> for DeviceSet {
    fn from_iter<I: IntoIterator<Item = DeviceRecord>>(iter: I) -> Self {
        let mut b = DeviceSetBuilder::new();
        for r in iter {
            b.push(r);
        }
        b.build()
    }
}

/// Coarse classification of a failed cycle, as exposed through `PollerState`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    PrivilegeDenied,
    Timeout,
}

/// Observable poller state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PollerState {
    pub running: bool,
    pub interval_ms: u64,
    pub last_error: Option<ErrorKind>,
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
