mod imds;

pub use imds::{Imds, ImdsClient};

use anyhow::Result;
use log::{debug, info};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use super::{KernelArgs, KernelParam, Mode, Platform, console_params, deliver, require_config};
use crate::netconf::{PlatformMetadata, PlatformNetworkConfig, parse_addr};
use crate::transport::cancellable;

pub const NAME: &str = "aws";

const KEY_HOSTNAME: &str = "hostname";
const KEY_INSTANCE_TYPE: &str = "instance-type";
const KEY_INSTANCE_ID: &str = "instance-id";
const KEY_PUBLIC_IPV4: &str = "public-ipv4";
const KEY_IPV6: &str = "ipv6";
const KEY_REGION: &str = "placement/region";
const KEY_ZONE: &str = "placement/availability-zone";

/// Values read from IMDS. A key the service does not know is an empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataConfig {
    pub hostname: String,
    pub instance_type: String,
    pub instance_id: String,
    pub public_ipv4: String,
    pub public_ipv6: String,
    pub region: String,
    pub zone: String,
}

#[derive(Debug)]
pub struct Aws<I = ImdsClient> {
    imds: I,
}

impl Aws {
    pub fn new() -> Self {
        Self::with_imds(ImdsClient::default())
    }
}

impl Default for Aws {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Imds> Aws<I> {
    pub fn with_imds(imds: I) -> Self {
        Self { imds }
    }

    async fn get_key(&self, ctx: &CancellationToken, key: &str) -> Result<String> {
        let value = cancellable(ctx, self.imds.get_metadata(key))
            .await
            .map_err(|e| e.context(format!("failed to fetch {:?} from IMDS", key)))?;
        Ok(value.map(|v| v.trim().to_string()).unwrap_or_default())
    }

    pub async fn get_metadata(&self, ctx: &CancellationToken) -> Result<MetadataConfig> {
        Ok(MetadataConfig {
            hostname: self.get_key(ctx, KEY_HOSTNAME).await?,
            instance_type: self.get_key(ctx, KEY_INSTANCE_TYPE).await?,
            instance_id: self.get_key(ctx, KEY_INSTANCE_ID).await?,
            public_ipv4: self.get_key(ctx, KEY_PUBLIC_IPV4).await?,
            public_ipv6: self.get_key(ctx, KEY_IPV6).await?,
            region: self.get_key(ctx, KEY_REGION).await?,
            zone: self.get_key(ctx, KEY_ZONE).await?,
        })
    }
}

/// Normalize IMDS values. AWS links are left to the default DHCP setup, so
/// only the hostname, external addresses and the metadata record are set.
pub fn parse_metadata(meta: &MetadataConfig) -> Result<PlatformNetworkConfig> {
    let mut config = PlatformNetworkConfig::default();

    if !meta.hostname.is_empty() {
        config.add_hostname(&meta.hostname)?;
    }
    for (field, value) in [
        (KEY_PUBLIC_IPV4, &meta.public_ipv4),
        (KEY_IPV6, &meta.public_ipv6),
    ] {
        if !value.is_empty() {
            config.add_external_ip(parse_addr(field, value)?);
        }
    }

    config.metadata = Some(PlatformMetadata {
        platform: NAME.into(),
        hostname: meta.hostname.clone(),
        region: meta.region.clone(),
        zone: meta.zone.clone(),
        instance_type: meta.instance_type.clone(),
        instance_id: meta.instance_id.clone(),
        provider_id: format!("aws:///{}/{}", meta.zone, meta.instance_id),
    });

    Ok(config)
}

impl<I: Imds> Platform for Aws<I> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn mode(&self) -> Mode {
        Mode::Cloud
    }

    fn kernel_args(&self) -> KernelArgs {
        KernelArgs(vec![
            console_params(),
            KernelParam::new("net.ifnames").append("0"),
        ])
    }

    async fn configuration(&self, ctx: &CancellationToken) -> Result<Vec<u8>> {
        info!("Fetching machine config from AWS IMDS");
        let data = cancellable(ctx, self.imds.get_user_data())
            .await
            .map_err(|e| e.context("failed to fetch user data from IMDS"))?;
        require_config(data)
    }

    async fn network_configuration(
        &self,
        ctx: &CancellationToken,
        ch: &Sender<PlatformNetworkConfig>,
    ) -> Result<()> {
        let meta = self.get_metadata(ctx).await?;
        debug!("AWS metadata: {:?}", meta);
        let config = parse_metadata(&meta)
            .map_err(|e| e.context("failed to normalize AWS metadata"))?;
        deliver(ctx, ch, config).await
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use anyhow::anyhow;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::{is_cancelled, is_no_config_source};

    #[derive(Default)]
    struct FakeImds {
        metadata: HashMap<&'static str, &'static str>,
        failing: Option<&'static str>,
        user_data: Option<&'static str>,
    }

    impl Imds for FakeImds {
        async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
            if self.failing == Some(key) {
                return Err(anyhow!("connection reset"));
            }
            Ok(self.metadata.get(key).map(|v| v.to_string()))
        }

        async fn get_user_data(&self) -> Result<Option<Vec<u8>>> {
            Ok(self.user_data.map(|d| d.as_bytes().to_vec()))
        }
    }

    fn instance() -> FakeImds {
        FakeImds {
            metadata: HashMap::from([
                (KEY_HOSTNAME, "ip-10-0-0-12.us-west-2.compute.internal"),
                (KEY_INSTANCE_TYPE, "t3.small"),
                (KEY_INSTANCE_ID, "i-0123456789abcdef0"),
                (KEY_PUBLIC_IPV4, "198.51.100.7"),
                (KEY_IPV6, "2600:1f14::7"),
                (KEY_REGION, "us-west-2"),
                (KEY_ZONE, "us-west-2a"),
            ]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_network_configuration() {
        let aws = Aws::with_imds(instance());
        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        aws.network_configuration(&ctx, &tx).await.unwrap();
        let config = rx.recv().await.unwrap();

        assert_eq!(config.hostnames.len(), 1);
        assert_eq!(config.hostnames[0].hostname, "ip-10-0-0-12");
        assert_eq!(
            config.hostnames[0].domainname,
            "us-west-2.compute.internal"
        );
        assert_eq!(
            config.external_ips,
            vec![
                "198.51.100.7".parse::<std::net::IpAddr>().unwrap(),
                "2600:1f14::7".parse().unwrap()
            ]
        );
        assert!(config.links.is_empty());
        assert!(config.routes.is_empty());
        let metadata = config.metadata.unwrap();
        assert_eq!(metadata.platform, "aws");
        assert_eq!(metadata.instance_type, "t3.small");
        assert_eq!(metadata.provider_id, "aws:///us-west-2a/i-0123456789abcdef0");
    }

    #[tokio::test]
    async fn test_missing_public_ip_is_empty() {
        let mut imds = instance();
        imds.metadata.remove(KEY_PUBLIC_IPV4);
        imds.metadata.remove(KEY_IPV6);
        let aws = Aws::with_imds(imds);
        let meta = aws.get_metadata(&CancellationToken::new()).await.unwrap();
        assert_eq!(meta.public_ipv4, "");
        assert_eq!(meta.public_ipv6, "");
        let config = parse_metadata(&meta).unwrap();
        assert!(config.external_ips.is_empty());
    }

    #[tokio::test]
    async fn test_failing_key_is_named() {
        let mut imds = instance();
        imds.failing = Some(KEY_REGION);
        let aws = Aws::with_imds(imds);
        let err = aws
            .get_metadata(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("placement/region"));
    }

    #[test]
    fn test_invalid_public_ip_is_fatal() {
        let meta = MetadataConfig {
            public_ipv4: "not-an-ip".into(),
            ..Default::default()
        };
        assert!(parse_metadata(&meta).is_err());
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let aws = Aws::with_imds(instance());
        let ctx = CancellationToken::new();
        ctx.cancel();
        let (tx, mut rx) = mpsc::channel(1);
        let err = aws.network_configuration(&ctx, &tx).await.unwrap_err();
        assert!(is_cancelled(&err));
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_configuration() {
        let ctx = CancellationToken::new();
        let mut imds = instance();
        imds.user_data = Some("version: v1alpha1\n");
        let aws = Aws::with_imds(imds);
        assert_eq!(
            aws.configuration(&ctx).await.unwrap(),
            b"version: v1alpha1\n".to_vec()
        );

        let aws = Aws::with_imds(instance());
        assert!(is_no_config_source(
            &aws.configuration(&ctx).await.unwrap_err()
        ));
    }

    #[test]
    fn test_kernel_args() {
        let aws = Aws::with_imds(FakeImds::default());
        assert_eq!(
            aws.kernel_args().to_string(),
            "console=tty1 console=ttyS0 net.ifnames=0"
        );
        assert_eq!(aws.mode(), Mode::Cloud);
    }
}
