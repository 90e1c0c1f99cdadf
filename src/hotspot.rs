use anyhow::Result;
use if_addrs::{get_if_addrs, IfAddr};
use std::net::Ipv4Addr;
use tracing::debug;

use crate::parse::SubnetFilter;

/// Tells the owner whether the hotspot is up, so polling only runs while it is.
pub trait HotspotController: Send + Sync {
    fn is_active(&self) -> bool;
}

/// Used when no hotspot interface is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysActive;

impl HotspotController for AlwaysActive {
    fn is_active(&self) -> bool {
        true
    }
}

/// Treats the hotspot as active while `interface` holds an IPv4 address in one of `subnets`.
#[derive(Debug, Clone)]
pub struct InterfaceHotspot {
    interface: String,
    subnets: SubnetFilter,
}

impl InterfaceHotspot {
    pub fn new(interface: impl Into<String>, subnets: SubnetFilter) -> Self {
        Self {
            interface: interface.into(),
            subnets,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        match hotspot_address(Some(&self.interface), &self.subnets) {
            Ok(ip) => ip,
            Err(e) => {
                debug!(error = %e, interface = %self.interface, "interface lookup failed");
                None
            }
        }
    }
}

impl HotspotController for InterfaceHotspot {
    fn is_active(&self) -> bool {
        self.address().is_some()
    }
}

/// Find this host's own address on the hotspot network.
///
/// Returns the first non-loopback IPv4 address accepted by `subnets`, restricted to
/// `interface` when given.
pub fn hotspot_address(interface: Option<&str>, subnets: &SubnetFilter) -> Result<Option<Ipv4Addr>> {
    let addrs = get_if_addrs()?
        .into_iter()
        .filter(|iface| interface.map_or(true, |name| iface.name == name))
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) => Some(v4.ip),
            IfAddr::V6(_) => None,
        });
    Ok(first_accepted(addrs, subnets))
}

fn first_accepted(addrs: impl IntoIterator<Item = Ipv4Addr>, subnets: &SubnetFilter) -> Option<Ipv4Addr> {
    addrs
        .into_iter()
        .find(|ip| !ip.is_loopback() && subnets.accepts(&ip.to_string()))
}
