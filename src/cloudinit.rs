//! Cloud-init documents shared by the providers that speak them:
//! `network-config` (v1 and v2), `meta-data`, and the provisioning hints
//! carried in the SMBIOS serial number.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use log::{debug, warn};
use serde::Deserialize;

use crate::error::PlatformError;

pub const DATASOURCE_NOCLOUD_NET: &str = "nocloud-net";

#[derive(Clone, Debug, PartialEq)]
pub enum NetworkConfig {
    V1(NetworkConfigV1),
    V2(NetworkConfigV2),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkConfigV1 {
    pub config: Vec<V1Entry>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkConfigV2 {
    pub ethernets: BTreeMap<String, Ethernet>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct V1Entry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub name: Option<String>,
    pub mac_address: Option<String>,
    pub mtu: Option<u32>,
    // Nameserver entries list their servers here.
    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default)]
    pub subnets: Vec<V1Subnet>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct V1Subnet {
    #[serde(rename = "type")]
    pub subnet_type: String,
    pub address: Option<String>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    #[serde(default)]
    pub ipv4: bool,
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default)]
    pub dns_nameservers: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Ethernet {
    #[serde(rename = "match")]
    pub match_rule: Option<EthernetMatch>,
    #[serde(default)]
    pub dhcp4: bool,
    #[serde(default)]
    pub dhcp6: bool,
    #[serde(default)]
    pub addresses: Vec<String>,
    pub gateway4: Option<String>,
    pub gateway6: Option<String>,
    pub mtu: Option<u32>,
    #[serde(default)]
    pub nameservers: Nameservers,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct EthernetMatch {
    pub name: Option<String>,
    pub macaddress: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Nameservers {
    #[serde(default)]
    pub search: Vec<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

// Every dialect's fields in one place; `version` picks which ones count.
#[derive(Debug, Default, Deserialize)]
struct RawNetworkConfig {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    config: Vec<V1Entry>,
    #[serde(default)]
    ethernets: BTreeMap<String, Ethernet>,
    // Some generators nest the document under a top-level `network` key.
    network: Option<Box<RawNetworkConfig>>,
}

impl TryFrom<RawNetworkConfig> for NetworkConfig {
    type Error = anyhow::Error;

    fn try_from(raw: RawNetworkConfig) -> Result<Self> {
        match raw.version {
            0 if raw.network.is_some() => {
                let inner = raw.network.map(|n| *n).unwrap_or_default();
                NetworkConfig::try_from(inner)
            }
            1 => Ok(NetworkConfig::V1(NetworkConfigV1 { config: raw.config })),
            2 => Ok(NetworkConfig::V2(NetworkConfigV2 {
                ethernets: raw.ethernets,
            })),
            v => Err(PlatformError::UnsupportedVersion(v).into()),
        }
    }
}

impl NetworkConfig {
    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| anyhow!("network-config is not valid UTF-8: {}", e))?;
        let raw = serde_yaml2::from_str::<RawNetworkConfig>(text)
            .map_err(|e| anyhow!("unable to parse network-config: {}", e))?;
        raw.try_into()
    }

    pub fn version(&self) -> u32 {
        match self {
            NetworkConfig::V1(_) => 1,
            NetworkConfig::V2(_) => 2,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig::V1(NetworkConfigV1::default())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MetaData {
    pub hostname: Option<String>,
    pub local_hostname: Option<String>,
    pub instance_id: Option<String>,
}

impl MetaData {
    /// Parse `meta-data`. A malformed document yields no fields.
    pub fn from_yaml(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        match serde_yaml2::from_str::<MetaData>(&text) {
            Ok(mut metadata) => {
                if metadata.hostname.is_none() {
                    metadata.hostname = metadata.local_hostname.take();
                }
                metadata
            }
            Err(e) => {
                warn!("Ignoring malformed meta-data: {}", e);
                MetaData::default()
            }
        }
    }
}

/// Treat a missing, empty, or whitespace-only document as absent.
pub fn non_empty(data: Option<Vec<u8>>) -> Option<Vec<u8>> {
    data.filter(|d| d.iter().any(|b| !b.is_ascii_whitespace()))
}

/// Options encoded as `key=value;...` in the SMBIOS system serial number.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvisioningHints {
    pub datasource: Option<String>,
    pub base_url: Option<String>,
    pub hostname: Option<String>,
}

impl ProvisioningHints {
    pub fn parse(serial: &str) -> Self {
        let mut hints = ProvisioningHints::default();
        for option in serial.split(';') {
            let Some((key, value)) = option.trim().split_once('=') else {
                continue;
            };
            match key {
                "ds" => hints.datasource = Some(value.into()),
                "s" => match base_url(value) {
                    Some(url) => hints.base_url = Some(url),
                    None => debug!("Ignoring seed URL {:?}", value),
                },
                "h" if !value.is_empty() => hints.hostname = Some(value.into()),
                _ => {}
            }
        }
        hints
    }

    /// The seed URL to fetch from, if the network datasource was selected.
    pub fn network_source(&self) -> Option<&str> {
        match (self.datasource.as_deref(), self.base_url.as_deref()) {
            (Some(DATASOURCE_NOCLOUD_NET), Some(url)) => Some(url),
            _ => None,
        }
    }
}

fn base_url(value: &str) -> Option<String> {
    let url = reqwest::Url::parse(value).ok()?;
    if !url.scheme().starts_with("http") {
        return None;
    }
    if value.ends_with('/') {
        Some(value.into())
    } else {
        Some(format!("{}/", value))
    }
}
