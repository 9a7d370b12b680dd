use std::net::IpAddr;

use anyhow::{Result, anyhow};
use ipnetwork::IpNetwork;
use log::debug;

use crate::cloudinit::{MetaData, NetworkConfig, NetworkConfigV1, NetworkConfigV2, V1Subnet};
use crate::netconf::{
    AddressSpec, Family, LinkSpec, OperatorKind, OperatorSpec, PlatformMetadata,
    PlatformNetworkConfig, RouteSpec, parse_addr, parse_prefix, prefix_from_netmask,
};

use super::NAME;

/// Normalize a decoded `network-config` and `meta-data` pair.
pub fn parse_metadata(network: &NetworkConfig, meta: &MetaData) -> Result<PlatformNetworkConfig> {
    let mut config = PlatformNetworkConfig::default();
    let hostname = meta.hostname.clone().unwrap_or_default();

    if !hostname.is_empty() {
        config.add_hostname(&hostname)?;
    }

    match network {
        NetworkConfig::V1(v1) => apply_v1(v1, &mut config)?,
        NetworkConfig::V2(v2) => apply_v2(v2, &mut config)?,
    }

    config.metadata = Some(PlatformMetadata {
        platform: NAME.into(),
        hostname,
        instance_id: meta.instance_id.clone().unwrap_or_default(),
        ..Default::default()
    });

    Ok(config)
}

fn parse_dns_servers(addresses: &[String]) -> Result<Vec<IpAddr>> {
    addresses
        .iter()
        .map(|a| parse_addr("nameserver", a))
        .collect()
}

// `address` is a prefix, or a bare address with the length in `netmask`.
fn subnet_address(subnet: &V1Subnet) -> Result<IpNetwork> {
    let address = subnet
        .address
        .as_deref()
        .ok_or_else(|| anyhow!("{} subnet has no address", subnet.subnet_type))?;
    if address.contains('/') {
        return parse_prefix(address);
    }
    let netmask = subnet
        .netmask
        .as_deref()
        .ok_or_else(|| anyhow!("subnet address {:?} has no prefix or netmask", address))?;
    prefix_from_netmask(address, netmask)
}

pub(crate) fn apply_v1(network: &NetworkConfigV1, config: &mut PlatformNetworkConfig) -> Result<()> {
    for entry in &network.config {
        match entry.entry_type.as_str() {
            "nameserver" => {
                config.add_resolver(parse_dns_servers(&entry.address)?);
            }
            "physical" => {
                let link = entry.name.as_deref().unwrap_or_default();
                config.add_link(LinkSpec::up(link).with_mtu(entry.mtu));

                for subnet in &entry.subnets {
                    match subnet.subnet_type.as_str() {
                        "dhcp" | "dhcp4" => {
                            config.add_operator(OperatorSpec::dhcp(OperatorKind::Dhcp4, link));
                        }
                        "ipv6_dhcpv6-stateful" => {
                            config.add_operator(OperatorSpec::dhcp(OperatorKind::Dhcp6, link));
                        }
                        "static" | "static6" => {
                            config.add_address(AddressSpec::new(link, subnet_address(subnet)?));
                            if let Some(gateway) =
                                subnet.gateway.as_deref().filter(|g| !g.is_empty())
                            {
                                let gateway = parse_addr("gateway", gateway)?;
                                config.add_route(RouteSpec::static_via(link, gateway))?;
                            }
                        }
                        other => debug!("Skipping {:?} subnet on {}", other, link),
                    }
                    config.add_resolver(parse_dns_servers(&subnet.dns_nameservers)?);
                }
            }
            other => debug!("Skipping network-config entry of type {:?}", other),
        }
    }
    Ok(())
}

fn gateway_of(family: Family, field: &str, value: &str) -> Result<IpAddr> {
    let gateway = parse_addr(field, value)?;
    if Family::of(&gateway) != family {
        return Err(anyhow!("{} {} is not an {} address", field, gateway, family));
    }
    Ok(gateway)
}

pub(crate) fn apply_v2(network: &NetworkConfigV2, config: &mut PlatformNetworkConfig) -> Result<()> {
    let mut dns_servers = Vec::new();

    for (name, eth) in &network.ethernets {
        if !name.starts_with("eth") {
            debug!("Skipping interface {}", name);
            continue;
        }

        config.add_link(LinkSpec::up(name).with_mtu(eth.mtu));

        if eth.dhcp4 {
            config.add_operator(OperatorSpec::dhcp(OperatorKind::Dhcp4, name));
        }
        if eth.dhcp6 {
            config.add_operator(OperatorSpec::dhcp(OperatorKind::Dhcp6, name));
        }

        for address in &eth.addresses {
            config.add_address(AddressSpec::new(name, parse_prefix(address)?));
        }

        if let Some(gateway) = eth.gateway4.as_deref().filter(|g| !g.is_empty()) {
            let gateway = gateway_of(Family::Inet4, "gateway4", gateway)?;
            config.add_route(RouteSpec::static_via(name, gateway))?;
        }
        if let Some(gateway) = eth.gateway6.as_deref().filter(|g| !g.is_empty()) {
            let gateway = gateway_of(Family::Inet6, "gateway6", gateway)?;
            config.add_route(RouteSpec::static_via(name, gateway))?;
        }

        dns_servers.extend(parse_dns_servers(&eth.nameservers.addresses)?);
    }

    config.add_resolver(dns_servers);
    Ok(())
}
