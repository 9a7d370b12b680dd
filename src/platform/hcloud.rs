use anyhow::{Result, anyhow};
use log::{debug, info};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use super::{KernelArgs, Mode, Platform, console_params, deliver, require_config};
use crate::cloudinit::{NetworkConfig, NetworkConfigV1};
use crate::constants::{
    HCLOUD_METADATA_ENDPOINT, HCLOUD_NETWORK_ENDPOINT, HCLOUD_USER_DATA_ENDPOINT,
};
use crate::error::PlatformError;
use crate::netconf::{
    AddressSpec, LinkSpec, OperatorKind, OperatorSpec, PlatformMetadata, PlatformNetworkConfig,
    RouteSpec, parse_addr, parse_prefix,
};
use crate::transport::{Downloader, HttpDownloader, cancellable};

pub const NAME: &str = "hcloud";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataConfig {
    pub hostname: String,
    pub instance_id: String,
    pub public_ipv4: String,
}

#[derive(Debug)]
pub struct Hcloud<D = HttpDownloader> {
    downloader: D,
}

impl Hcloud {
    pub fn new() -> Result<Self> {
        Ok(Self::with_downloader(HttpDownloader::new()?))
    }
}

impl<D: Downloader> Hcloud<D> {
    pub fn with_downloader(downloader: D) -> Self {
        Self { downloader }
    }

    async fn get_key(&self, ctx: &CancellationToken, key: &str) -> Result<String> {
        let url = format!("{}/{}", HCLOUD_METADATA_ENDPOINT, key);
        let value = cancellable(ctx, self.downloader.download(&url)).await?;
        Ok(value
            .map(|v| String::from_utf8_lossy(&v).trim().to_string())
            .unwrap_or_default())
    }

    pub async fn get_metadata(&self, ctx: &CancellationToken) -> Result<MetadataConfig> {
        Ok(MetadataConfig {
            hostname: self.get_key(ctx, "hostname").await?,
            instance_id: self.get_key(ctx, "instance-id").await?,
            public_ipv4: self.get_key(ctx, "public-ipv4").await?,
        })
    }

    async fn get_network_config(&self, ctx: &CancellationToken) -> Result<NetworkConfigV1> {
        info!("Fetching hcloud network config from {}", HCLOUD_NETWORK_ENDPOINT);
        let data = cancellable(ctx, self.downloader.download(HCLOUD_NETWORK_ENDPOINT))
            .await?
            .ok_or_else(|| anyhow!("network config not found at {}", HCLOUD_NETWORK_ENDPOINT))?;
        match NetworkConfig::from_yaml(&data)? {
            NetworkConfig::V1(config) => Ok(config),
            other => Err(PlatformError::UnsupportedVersion(other.version()).into()),
        }
    }
}

pub fn parse_metadata(
    network: &NetworkConfigV1,
    meta: &MetadataConfig,
) -> Result<PlatformNetworkConfig> {
    let mut config = PlatformNetworkConfig::default();

    if !meta.hostname.is_empty() {
        config.add_hostname(&meta.hostname)?;
    }
    if !meta.public_ipv4.is_empty() {
        match parse_addr("public-ipv4", &meta.public_ipv4) {
            Ok(ip) => config.add_external_ip(ip),
            Err(e) => debug!("Ignoring public IPv4: {}", e),
        }
    }

    for entry in network.config.iter().filter(|e| e.entry_type == "physical") {
        let link = entry.name.as_deref().unwrap_or_default();
        config.add_link(LinkSpec::up(link));

        for subnet in &entry.subnets {
            if subnet.subnet_type == "dhcp" && subnet.ipv4 {
                config.add_operator(OperatorSpec::dhcp(OperatorKind::Dhcp4, link));
            }
            if subnet.subnet_type == "static" {
                let address = subnet.address.as_deref().unwrap_or_default();
                config.add_address(AddressSpec::new(link, parse_prefix(address)?));
            }
            if let Some(gateway) = subnet.gateway.as_deref().filter(|g| !g.is_empty())
                && subnet.ipv6
            {
                let gateway = parse_addr("gateway", gateway)?;
                config.add_route(RouteSpec::static_via(link, gateway))?;
            }
        }
    }

    config.metadata = Some(PlatformMetadata {
        platform: NAME.into(),
        hostname: meta.hostname.clone(),
        instance_id: meta.instance_id.clone(),
        provider_id: format!("hcloud://{}", meta.instance_id),
        ..Default::default()
    });

    Ok(config)
}

impl<D: Downloader> Platform for Hcloud<D> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn mode(&self) -> Mode {
        Mode::Cloud
    }

    fn kernel_args(&self) -> KernelArgs {
        KernelArgs(vec![console_params()])
    }

    async fn configuration(&self, ctx: &CancellationToken) -> Result<Vec<u8>> {
        info!("Fetching machine config from {}", HCLOUD_USER_DATA_ENDPOINT);
        let data = cancellable(ctx, self.downloader.download(HCLOUD_USER_DATA_ENDPOINT)).await?;
        require_config(data)
    }

    async fn network_configuration(
        &self,
        ctx: &CancellationToken,
        ch: &Sender<PlatformNetworkConfig>,
    ) -> Result<()> {
        let meta = self.get_metadata(ctx).await?;
        let network = self
            .get_network_config(ctx)
            .await
            .map_err(|e| e.context("failed to fetch network config from metadata service"))?;
        let config = parse_metadata(&network, &meta)?;
        deliver(ctx, ch, config).await
    }
}
