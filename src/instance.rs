//! Instances as reported by the daemon, and the requests that create them

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").unwrap());

/// Check an instance name against the daemon's naming rules
pub fn validate_name(name: &str) -> Result<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// Image server an instance can be created from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Remote {
    Images,
    Ubuntu,
}

impl Remote {
    pub const ALL: [Remote; 2] = [Remote::Images, Remote::Ubuntu];

    pub fn name(&self) -> &'static str {
        match self {
            Remote::Images => "images",
            Remote::Ubuntu => "ubuntu",
        }
    }

    pub fn url(&self) -> &'static str {
        match self {
            Remote::Images => "https://images.linuxcontainers.org",
            Remote::Ubuntu => "https://cloud-images.ubuntu.com/releases",
        }
    }

    /// Find the remote serving images from `url`
    pub fn from_url(url: &str) -> Option<Remote> {
        Self::ALL.into_iter().find(|r| r.url() == url)
    }
}

impl FromStr for Remote {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.name() == s)
            .ok_or_else(|| Error::UnsupportedRemote(s.to_string()))
    }
}

impl std::fmt::Display for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Image source of a creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub alias: String,
    pub mode: String,
    pub server: String,
    pub protocol: String,
}

/// Body of `POST /1.0/instances`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub profiles: Vec<String>,
    pub source: InstanceSource,
}

impl CreateInstanceRequest {
    /// Pull `alias` from `remote` and apply `profiles`
    pub fn from_image(name: &str, remote: Remote, alias: &str, profiles: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            profiles: profiles.iter().map(|p| p.to_string()).collect(),
            source: InstanceSource {
                source_type: "image".into(),
                alias: alias.to_string(),
                mode: "pull".into(),
                server: remote.url().to_string(),
                protocol: "simplestreams".into(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfaceAddress {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkInterface {
    #[serde(default)]
    pub addresses: Vec<InterfaceAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceState {
    #[serde(default)]
    pub network: Option<HashMap<String, NetworkInterface>>,
}

/// An instance known to the daemon
#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub state: Option<InstanceState>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }

    /// First IPv4 address on eth0, empty when the instance has no network
    pub fn ipv4_address(&self) -> String {
        self.state
            .as_ref()
            .and_then(|s| s.network.as_ref())
            .and_then(|n| n.get("eth0"))
            .and_then(|eth0| eth0.addresses.iter().find(|a| a.family == "inet"))
            .map(|a| a.address.clone())
            .unwrap_or_default()
    }

    /// `<os>/<release> (<arch>)` from the image tags recorded at creation
    pub fn image_description(&self) -> String {
        let tag = |key: &str| self.config.get(key);
        match (
            tag("image.os"),
            tag("image.release"),
            tag("image.architecture"),
        ) {
            (Some(os), Some(release), Some(arch)) => format!("{}/{} ({})", os, release, arch),
            _ => {
                tracing::error!(instance = %self.name, "Instance is missing image tags");
                String::new()
            }
        }
    }
}

/// Row of the instance listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRecord {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "IP Address")]
    pub ip_address: String,
    #[serde(rename = "Image")]
    pub image: String,
}

impl From<&Instance> for InstanceRecord {
    fn from(instance: &Instance) -> Self {
        Self {
            name: instance.name.clone(),
            status: instance.status.clone(),
            ip_address: instance.ipv4_address(),
            image: instance.image_description(),
        }
    }
}
