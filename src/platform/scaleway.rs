use anyhow::{Result, anyhow};
use ipnetwork::IpNetwork;
use log::info;
use serde::{Deserialize, Deserializer};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use super::{KernelArgs, Mode, Platform, console_params, deliver, require_config};
use crate::constants::{SCALEWAY_METADATA_ENDPOINT, SCALEWAY_USER_DATA_ENDPOINT};
use crate::netconf::{
    AddressSpec, Family, LinkSpec, OperatorKind, OperatorSpec, PlatformMetadata,
    PlatformNetworkConfig, ROUTE_PRIORITY_INET4, RouteSpec, parse_addr, parse_prefix,
    prefix_from_netmask,
};
use crate::transport::{Downloader, HttpDownloader, LowPortDownloader, cancellable};

pub const NAME: &str = "scaleway";

const LINK: &str = "eth0";
const METADATA_SERVICE_PREFIX: &str = "169.254.42.42/32";

/// The instance document served by the Scaleway metadata service.
///
/// Sections the instance lacks are sent as `null`, which reads as empty.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScalewayMetadata {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub hostname: String,
    #[serde(deserialize_with = "null_as_default")]
    pub commercial_type: String,
    #[serde(deserialize_with = "null_as_default")]
    pub public_ip: PublicIp,
    #[serde(deserialize_with = "null_as_default")]
    pub ipv6: Ipv6,
    #[serde(deserialize_with = "null_as_default")]
    pub location: Location,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PublicIp {
    pub address: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Ipv6 {
    pub address: String,
    pub gateway: String,
    pub netmask: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Location {
    pub zone_id: String,
}

/// `metadata` fetches the instance document. `user_data` must connect from
/// a privileged port or the service refuses it.
#[derive(Debug)]
pub struct Scaleway<D = HttpDownloader, U = LowPortDownloader> {
    metadata: D,
    user_data: U,
}

impl Scaleway {
    pub fn new() -> Result<Self> {
        Ok(Self::with_downloaders(
            HttpDownloader::new()?,
            LowPortDownloader::default(),
        ))
    }
}

impl<D: Downloader, U: Downloader> Scaleway<D, U> {
    pub fn with_downloaders(metadata: D, user_data: U) -> Self {
        Self {
            metadata,
            user_data,
        }
    }

    pub async fn get_metadata(&self, ctx: &CancellationToken) -> Result<ScalewayMetadata> {
        info!("Fetching scaleway instance config from {}", SCALEWAY_METADATA_ENDPOINT);
        let data = cancellable(ctx, self.metadata.download(SCALEWAY_METADATA_ENDPOINT))
            .await?
            .ok_or_else(|| anyhow!("instance metadata not found at {}", SCALEWAY_METADATA_ENDPOINT))?;
        serde_json::from_slice(&data)
            .map_err(|e| anyhow!("unable to parse scaleway instance metadata: {}", e))
    }
}

/// Region is the zone without its trailing index, e.g. `fr-par-1` is in
/// `fr-par`.
fn region_of(zone: &str) -> String {
    zone.split('-').take(2).collect::<Vec<_>>().join("-")
}

// The netmask is usually a bit count but may be a dotted mask.
fn ipv6_prefix(address: &str, netmask: &str) -> Result<IpNetwork> {
    match netmask.trim().parse::<u8>() {
        Ok(_) => parse_prefix(&format!("{}/{}", address.trim(), netmask.trim())),
        Err(_) => prefix_from_netmask(address, netmask),
    }
}

pub fn parse_metadata(meta: &ScalewayMetadata) -> Result<PlatformNetworkConfig> {
    let mut config = PlatformNetworkConfig::default();

    if !meta.hostname.is_empty() {
        config.add_hostname(&meta.hostname)?;
    }
    if !meta.public_ip.address.is_empty() {
        config.add_external_ip(parse_addr("public_ip", &meta.public_ip.address)?);
    }

    config.add_link(LinkSpec::up(LINK));
    config.add_route(
        RouteSpec::new(LINK, Family::Inet4)
            .with_destination(parse_prefix(METADATA_SERVICE_PREFIX)?)
            .with_priority(ROUTE_PRIORITY_INET4),
    )?;
    config.add_operator(OperatorSpec::dhcp(OperatorKind::Dhcp4, LINK));

    if !meta.ipv6.address.is_empty() && !meta.ipv6.gateway.is_empty() {
        let address = ipv6_prefix(&meta.ipv6.address, &meta.ipv6.netmask)?;
        config.add_address(AddressSpec::new(LINK, address));
        let gateway = parse_addr("ipv6 gateway", &meta.ipv6.gateway)?;
        config.add_route(RouteSpec::static_via(LINK, gateway))?;
    }

    let zone = &meta.location.zone_id;
    config.metadata = Some(PlatformMetadata {
        platform: NAME.into(),
        hostname: meta.hostname.clone(),
        region: region_of(zone),
        zone: zone.clone(),
        instance_type: meta.commercial_type.clone(),
        instance_id: meta.id.clone(),
        provider_id: format!("scaleway://instance/{}/{}", zone, meta.id),
    });

    Ok(config)
}

impl<D: Downloader, U: Downloader> Platform for Scaleway<D, U> {
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
        info!("Fetching machine config from {}", SCALEWAY_USER_DATA_ENDPOINT);
        let data = cancellable(ctx, self.user_data.download(SCALEWAY_USER_DATA_ENDPOINT)).await?;
        require_config(data)
    }

    async fn network_configuration(
        &self,
        ctx: &CancellationToken,
        ch: &Sender<PlatformNetworkConfig>,
    ) -> Result<()> {
        let meta = self.get_metadata(ctx).await?;
        let config = parse_metadata(&meta)?;
        deliver(ctx, ch, config).await
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::{is_cancelled, is_no_config_source};
    use crate::netconf::Scope;
    use crate::platform::fake::{FakeDownloader, Response};

    const INSTANCE: &str = r#"{
        "id": "11111111-2222-3333-4444-555555555555",
        "hostname": "scw-node",
        "commercial_type": "DEV1-S",
        "public_ip": {"address": "51.15.0.10", "dynamic": false},
        "ipv6": {"address": "2001:bc8:1200::1", "gateway": "2001:bc8:1200::", "netmask": "64"},
        "location": {"zone_id": "fr-par-1"},
        "tags": []
    }"#;

    fn scaleway(metadata: FakeDownloader) -> Scaleway<FakeDownloader, FakeDownloader> {
        Scaleway::with_downloaders(metadata, FakeDownloader::default())
    }

    #[test]
    fn test_region_of() {
        struct Case {
            zone: &'static str,
            region: &'static str,
        }
        let cases = [
            Case {
                zone: "fr-par-1",
                region: "fr-par",
            },
            Case {
                zone: "nl-ams",
                region: "nl-ams",
            },
            Case {
                zone: "pl",
                region: "pl",
            },
            Case {
                zone: "",
                region: "",
            },
        ];
        for case in cases {
            assert_eq!(case.region, region_of(case.zone));
        }
    }

    #[tokio::test]
    async fn test_network_configuration() {
        let scaleway = scaleway(
            FakeDownloader::default().with(SCALEWAY_METADATA_ENDPOINT, Response::Body(INSTANCE)),
        );
        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        scaleway.network_configuration(&ctx, &tx).await.unwrap();
        let config = rx.recv().await.unwrap();

        assert_eq!(config.hostnames[0].hostname, "scw-node");
        assert_eq!(config.external_ips, vec!["51.15.0.10".parse::<std::net::IpAddr>().unwrap()]);
        assert_eq!(config.links, vec![LinkSpec::up("eth0")]);
        assert_eq!(
            config.operators,
            vec![OperatorSpec::dhcp(OperatorKind::Dhcp4, "eth0")]
        );
        assert_eq!(config.addresses.len(), 1);
        assert_eq!(config.addresses[0].address.to_string(), "2001:bc8:1200::1/64");

        assert_eq!(config.routes.len(), 2);
        let metadata_route = &config.routes[0];
        assert_eq!(
            metadata_route.destination,
            Some(parse_prefix("169.254.42.42/32").unwrap())
        );
        assert_eq!(metadata_route.gateway, None);
        assert_eq!(metadata_route.scope, Scope::Link);
        assert_eq!(metadata_route.priority, 1024);
        let ipv6_route = &config.routes[1];
        assert_eq!(ipv6_route.gateway, Some("2001:bc8:1200::".parse().unwrap()));
        assert_eq!(ipv6_route.family, Family::Inet6);
        assert_eq!(ipv6_route.priority, 2048);

        let metadata = config.metadata.unwrap();
        assert_eq!(metadata.region, "fr-par");
        assert_eq!(metadata.zone, "fr-par-1");
        assert_eq!(metadata.instance_type, "DEV1-S");
        assert_eq!(
            metadata.provider_id,
            "scaleway://instance/fr-par-1/11111111-2222-3333-4444-555555555555"
        );
    }

    #[test]
    fn test_ipv6_needs_address_and_gateway() {
        let meta = ScalewayMetadata {
            ipv6: Ipv6 {
                address: "2001:bc8:1200::1".into(),
                gateway: "".into(),
                netmask: "64".into(),
            },
            ..Default::default()
        };
        let config = parse_metadata(&meta).unwrap();
        assert!(config.addresses.is_empty());
        assert_eq!(config.routes.len(), 1);
    }

    #[test]
    fn test_invalid_public_ip_is_fatal() {
        let meta = ScalewayMetadata {
            public_ip: PublicIp {
                address: "51.15.0".into(),
            },
            ..Default::default()
        };
        assert!(parse_metadata(&meta).is_err());
    }

    #[test]
    fn test_ipv6_prefix_dotted_netmask() {
        assert_eq!(
            ipv6_prefix("2001:bc8:1200::1", "ffff:ffff:ffff:ffff::")
                .unwrap()
                .to_string(),
            "2001:bc8:1200::1/64"
        );
        assert!(ipv6_prefix("2001:bc8:1200::1", "129").is_err());
    }

    #[tokio::test]
    async fn test_missing_document_is_error() {
        let scaleway = scaleway(FakeDownloader::default());
        assert!(scaleway.get_metadata(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled() {
        let scaleway = scaleway(
            FakeDownloader::default().with(SCALEWAY_METADATA_ENDPOINT, Response::Body(INSTANCE)),
        );
        let ctx = CancellationToken::new();
        ctx.cancel();
        let (tx, _rx) = mpsc::channel(1);
        let err = scaleway.network_configuration(&ctx, &tx).await.unwrap_err();
        assert!(is_cancelled(&err));
    }

    #[tokio::test]
    async fn test_configuration() {
        let ctx = CancellationToken::new();
        let scaleway = Scaleway::with_downloaders(
            FakeDownloader::default(),
            FakeDownloader::default().with(SCALEWAY_USER_DATA_ENDPOINT, Response::NotFound),
        );
        assert!(is_no_config_source(
            &scaleway.configuration(&ctx).await.unwrap_err()
        ));

        let scaleway = Scaleway::with_downloaders(
            FakeDownloader::default(),
            FakeDownloader::default()
                .with(SCALEWAY_USER_DATA_ENDPOINT, Response::Body("machine:\n  type: worker\n")),
        );
        assert_eq!(
            scaleway.configuration(&ctx).await.unwrap(),
            b"machine:\n  type: worker\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_user_data_uses_its_own_downloader() {
        let metadata = FakeDownloader::default()
            .with(SCALEWAY_USER_DATA_ENDPOINT, Response::Body("wrong transport"));
        let scaleway = Scaleway::with_downloaders(metadata, FakeDownloader::default());
        let err = scaleway
            .configuration(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(is_no_config_source(&err));
        assert!(scaleway.metadata.requests().is_empty());
        assert_eq!(
            scaleway.user_data.requests(),
            vec![SCALEWAY_USER_DATA_ENDPOINT.to_string()]
        );
    }

    #[test]
    fn test_null_sections_read_as_empty() {
        let doc = r#"{
            "id": "11111111-2222-3333-4444-555555555555",
            "hostname": "scw-node",
            "commercial_type": "DEV1-S",
            "public_ip": null,
            "ipv6": null,
            "location": {"zone_id": "nl-ams-1"}
        }"#;
        let meta: ScalewayMetadata = serde_json::from_str(doc).unwrap();
        assert_eq!(meta.public_ip, PublicIp::default());
        assert_eq!(meta.ipv6, Ipv6::default());

        let config = parse_metadata(&meta).unwrap();
        assert!(config.external_ips.is_empty());
        assert!(config.addresses.is_empty());
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.metadata.unwrap().region, "nl-ams");
    }

    #[tokio::test]
    async fn test_network_configuration_without_ipv6() {
        let doc = r#"{"id": "i-2", "hostname": "scw-v4", "ipv6": null, "public_ip": {"address": "51.15.0.11"}, "location": {"zone_id": "fr-par-2"}}"#;
        let scaleway =
            scaleway(FakeDownloader::default().with(SCALEWAY_METADATA_ENDPOINT, Response::Body(doc)));
        let (tx, mut rx) = mpsc::channel(1);
        scaleway
            .network_configuration(&CancellationToken::new(), &tx)
            .await
            .unwrap();
        let config = rx.recv().await.unwrap();
        assert_eq!(config.hostnames[0].hostname, "scw-v4");
        assert!(config.routes.iter().all(|r| r.family == Family::Inet4));
    }
}
