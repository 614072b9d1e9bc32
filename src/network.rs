//! Shared bridge network and instance profile definitions
//!
//! Instances reach the host through a bridge on the VM's host-only
//! interface. Addresses on the bridge are derived from the host-side IP.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::{Error, Result};

pub const NETWORK_NAME: &str = "yurt-int";
pub const PROFILE_NAME: &str = "yurt";
pub const STORAGE_POOL: &str = "yurtpool";
pub const EXTERNAL_INTERFACE: &str = "enp0s8";

const BRIDGE_OFFSET: u32 = 1;
const DHCP_LOW_OFFSET: u32 = 10;
const DHCP_HIGH_OFFSET: u32 = 249;

/// Bridge and DHCP addressing derived from the host interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpConfig {
    /// Bridge address in CIDR form, e.g. `10.0.0.2/24`
    pub bridge_address: String,
    pub dhcp_range_low: Ipv4Addr,
    pub dhcp_range_high: Ipv4Addr,
}

impl IpConfig {
    /// Derive addressing from the host interface IP and netmask
    pub fn derive(host_ip: &str, netmask: &str) -> Result<Self> {
        let host: Ipv4Addr = host_ip.trim().parse().map_err(|_| {
            Error::Configuration(format!("Bad IP configuration. ip: {}, mask: {}", host_ip, netmask))
        })?;
        let prefix = prefix_len(netmask)?;

        Ok(Self {
            bridge_address: format!("{}/{}", offset(host, BRIDGE_OFFSET)?, prefix),
            dhcp_range_low: offset(host, DHCP_LOW_OFFSET)?,
            dhcp_range_high: offset(host, DHCP_HIGH_OFFSET)?,
        })
    }

    pub fn dhcp_ranges(&self) -> String {
        format!("{}-{}", self.dhcp_range_low, self.dhcp_range_high)
    }
}

fn offset(addr: Ipv4Addr, by: u32) -> Result<Ipv4Addr> {
    u32::from(addr)
        .checked_add(by)
        .map(Ipv4Addr::from)
        .ok_or_else(|| Error::Configuration(format!("IP address {} + {} is out of range", addr, by)))
}

/// Prefix length of a dotted-quad netmask; rejects non-contiguous masks
fn prefix_len(netmask: &str) -> Result<u32> {
    let mask: Ipv4Addr = netmask
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("Bad netmask: {}", netmask)))?;
    let bits = u32::from(mask);
    let prefix = bits.leading_ones();
    if bits.checked_shl(prefix).unwrap_or(0) != 0 {
        return Err(Error::Configuration(format!("Netmask is not contiguous: {}", netmask)));
    }
    Ok(prefix)
}

/// Body of `POST /1.0/networks`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub network_type: String,
    pub description: String,
    pub config: BTreeMap<String, String>,
}

impl NetworkSpec {
    /// The shared NAT bridge with DHCP on the derived range
    pub fn bridge(name: &str, ip: &IpConfig, dns_domain: &str) -> Self {
        let config = [
            ("bridge.external_interfaces", EXTERNAL_INTERFACE.to_string()),
            ("ipv6.address", "none".to_string()),
            ("ipv4.nat", "true".to_string()),
            ("ipv4.dhcp", "true".to_string()),
            ("ipv4.dhcp.expiry", "24h".to_string()),
            ("ipv4.address", ip.bridge_address.clone()),
            ("ipv4.dhcp.ranges", ip.dhcp_ranges()),
            ("dns.domain", dns_domain.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            name: name.to_string(),
            network_type: "bridge".into(),
            description: String::new(),
            config,
        }
    }
}

/// Body of `POST /1.0/profiles`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSpec {
    pub name: String,
    pub description: String,
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
}

impl ProfileSpec {
    /// Profile attaching a bridged NIC on `network` and a root disk in `pool`
    pub fn bridged(name: &str, network: &str, pool: &str) -> Self {
        let device = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };

        let mut devices = BTreeMap::new();
        devices.insert(
            "eth0".to_string(),
            device(&[
                ("type", "nic"),
                ("name", "eth0"),
                ("nictype", "bridged"),
                ("parent", network),
            ]),
        );
        devices.insert(
            "root".to_string(),
            device(&[("type", "disk"), ("path", "/"), ("pool", pool)]),
        );

        Self {
            name: name.to_string(),
            description: "Yurt Default Profile".into(),
            config: BTreeMap::new(),
            devices,
        }
    }
}
