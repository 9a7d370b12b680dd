//! NoCloud: configuration from a seed URL named in the SMBIOS serial, or from
//! a volume labeled `cidata`.

mod metadata;

pub use metadata::parse_metadata;

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use super::{KernelArgs, Mode, Platform, console_params, deliver};
use crate::cloudinit::{MetaData, NetworkConfig, ProvisioningHints, non_empty};
use crate::constants::{
    CIDATA_LABEL, CIDATA_META_DATA, CIDATA_NETWORK_CONFIG, CIDATA_USER_DATA, CLOUD_CONFIG_HEADER,
};
use crate::error::{PlatformError, is_cancelled, is_no_config_source};
use crate::fs::{BlockVolumes, MountPoint, VolumeManager, read_optional};
use crate::netconf::PlatformNetworkConfig;
use crate::transport::{Downloader, HttpDownloader, Smbios, SysfsSmbios, cancellable};

pub const NAME: &str = "nocloud";

/// The three documents a NoCloud source offers. Absent or empty documents
/// are `None`.
#[derive(Debug, Default)]
struct Acquired {
    meta_data: Option<Vec<u8>>,
    network_config: Option<Vec<u8>>,
    user_data: Option<Vec<u8>>,
    metadata: MetaData,
}

#[derive(Debug)]
pub struct Nocloud<D = HttpDownloader, S = SysfsSmbios, V = BlockVolumes> {
    downloader: D,
    smbios: S,
    volumes: V,
    mount_point: Arc<MountPoint>,
}

impl Nocloud {
    pub fn new() -> Result<Self> {
        Ok(Self::with_sources(
            HttpDownloader::new()?,
            SysfsSmbios::default(),
            BlockVolumes::default(),
            MountPoint::shared(),
        ))
    }
}

impl<D, S, V> Nocloud<D, S, V>
where
    D: Downloader,
    S: Smbios,
    V: VolumeManager,
{
    pub fn with_sources(downloader: D, smbios: S, volumes: V, mount_point: Arc<MountPoint>) -> Self {
        Self {
            downloader,
            smbios,
            volumes,
            mount_point,
        }
    }

    // Failures other than cancellation become `None` with a warning.
    async fn fetch_tolerant(&self, ctx: &CancellationToken, url: &str) -> Result<Option<Vec<u8>>> {
        info!("Fetching {}", url);
        match cancellable(ctx, self.downloader.download(url)).await {
            Ok(data) => Ok(non_empty(data)),
            Err(e) if is_cancelled(&e) => Err(e),
            Err(e) => {
                warn!("Ignoring {}: {}", url, e);
                Ok(None)
            }
        }
    }

    async fn from_network(&self, ctx: &CancellationToken, base_url: &str) -> Result<Acquired> {
        let meta_data_url = format!("{}{}", base_url, CIDATA_META_DATA);
        let network_config_url = format!("{}{}", base_url, CIDATA_NETWORK_CONFIG);
        let user_data_url = format!("{}{}", base_url, CIDATA_USER_DATA);

        let (meta_data, network_config, user_data) = futures::future::join3(
            self.fetch_tolerant(ctx, &meta_data_url),
            self.fetch_tolerant(ctx, &network_config_url),
            async {
                info!("Fetching machine config from {}", user_data_url);
                cancellable(ctx, self.downloader.download(&user_data_url)).await
            },
        )
        .await;

        Ok(Acquired {
            meta_data: meta_data?,
            network_config: network_config?,
            user_data: non_empty(user_data?),
            ..Default::default()
        })
    }

    async fn from_volume(&self, ctx: &CancellationToken) -> Result<Acquired> {
        let Some(device) = self.volumes.find_by_label(CIDATA_LABEL)? else {
            return Err(PlatformError::NoConfigSource.into());
        };
        info!("Found config volume ({}) at {:?}", CIDATA_LABEL, device);

        self.mount_point
            .with_mounted(&self.volumes, &device, ctx, |dir| {
                let read = |name: &str| match read_optional(dir, name) {
                    Ok(data) => non_empty(data),
                    Err(e) => {
                        warn!("Ignoring {}/{}: {}", CIDATA_LABEL, name, e);
                        None
                    }
                };
                Ok(Acquired {
                    meta_data: read(CIDATA_META_DATA),
                    network_config: read(CIDATA_NETWORK_CONFIG),
                    user_data: read(CIDATA_USER_DATA),
                    ..Default::default()
                })
            })
            .await
    }

    async fn acquire(&self, ctx: &CancellationToken) -> Result<Acquired> {
        let hints = ProvisioningHints::parse(&self.smbios.system_serial()?);

        let mut acquired = match hints.network_source() {
            Some(base_url) => self.from_network(ctx, base_url).await?,
            None => self.from_volume(ctx).await?,
        };

        if let Some(data) = &acquired.meta_data {
            acquired.metadata = MetaData::from_yaml(data);
        }
        if let Some(hostname) = hints.hostname {
            acquired.metadata.hostname = Some(hostname);
        }
        Ok(acquired)
    }
}

impl<D, S, V> Platform for Nocloud<D, S, V>
where
    D: Downloader,
    S: Smbios,
    V: VolumeManager,
{
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
        let user_data = self
            .acquire(ctx)
            .await?
            .user_data
            .ok_or(PlatformError::NoConfigSource)?;
        if user_data.starts_with(CLOUD_CONFIG_HEADER) {
            return Err(PlatformError::NoConfigSource.into());
        }
        Ok(user_data)
    }

    async fn network_configuration(
        &self,
        ctx: &CancellationToken,
        ch: &Sender<PlatformNetworkConfig>,
    ) -> Result<()> {
        let acquired = match self.acquire(ctx).await {
            Ok(acquired) => acquired,
            Err(e) if is_no_config_source(&e) => return Ok(()),
            Err(e) => return Err(e),
        };

        if acquired.meta_data.is_none() && acquired.network_config.is_none() {
            info!("No NoCloud network metadata found");
            return Ok(());
        }

        let network = match &acquired.network_config {
            Some(data) => NetworkConfig::from_yaml(data)?,
            None => NetworkConfig::default(),
        };
        let config = parse_metadata(&network, &acquired.metadata)?;
        deliver(ctx, ch, config).await
    }
}
