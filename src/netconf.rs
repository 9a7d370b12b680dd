//! Provider-agnostic network configuration produced by every platform.
//!
//! A [`PlatformNetworkConfig`] is built fresh for each normalization and handed
//! to the consumer whole. Every spec in it is tagged with
//! [`ConfigLayer::Platform`] so reconciliation can rank it against
//! configuration of the same shape coming from the kernel command line or the
//! machine configuration.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{Result, anyhow};
use ipnetwork::IpNetwork;
use serde::Serialize;

use crate::error::PlatformError;

pub const DEFAULT_ROUTE_METRIC: u32 = 1024;
pub const ROUTE_PRIORITY_INET4: u32 = 1024;
pub const ROUTE_PRIORITY_INET6: u32 = 2048;

const MAX_HOSTNAME_LEN: usize = 63;
const MAX_DOMAINNAME_LEN: usize = 253;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLayer {
    #[default]
    Default,
    Cmdline,
    Platform,
    Operator,
    Configuration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Inet4,
    Inet6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::Inet4,
            IpAddr::V6(_) => Family::Inet6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Inet4 => write!(f, "inet4"),
            Family::Inet6 => write!(f, "inet6"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Global,
    Link,
    Host,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AddressFlags(u32);

impl AddressFlags {
    // Matches IFA_F_PERMANENT.
    pub const PERMANENT: Self = Self(0x80);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteTable {
    #[default]
    Main,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteProtocol {
    #[default]
    Static,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    #[default]
    Unicast,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSpec {
    pub name: String,
    pub up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    pub layer: ConfigLayer,
}

impl LinkSpec {
    /// A platform link that should be brought up administratively.
    pub fn up(name: &str) -> Self {
        Self {
            name: name.into(),
            up: true,
            mtu: None,
            layer: ConfigLayer::Platform,
        }
    }

    pub fn with_mtu(mut self, mtu: Option<u32>) -> Self {
        self.mtu = mtu.filter(|m| *m > 0);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressSpec {
    pub link_name: String,
    pub address: IpNetwork,
    pub family: Family,
    pub scope: Scope,
    pub flags: AddressFlags,
    pub layer: ConfigLayer,
}

impl AddressSpec {
    /// Static global address; the family always follows the prefix.
    pub fn new(link_name: &str, address: IpNetwork) -> Self {
        Self {
            link_name: link_name.into(),
            family: Family::of(&address.ip()),
            address,
            scope: Scope::Global,
            flags: AddressFlags::PERMANENT,
            layer: ConfigLayer::Platform,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<IpNetwork>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    pub out_link_name: String,
    pub table: RouteTable,
    pub protocol: RouteProtocol,
    #[serde(rename = "type")]
    pub route_type: RouteType,
    pub family: Family,
    pub scope: Scope,
    pub priority: u32,
    pub layer: ConfigLayer,
}

impl RouteSpec {
    pub fn new(out_link_name: &str, family: Family) -> Self {
        Self {
            destination: None,
            gateway: None,
            out_link_name: out_link_name.into(),
            table: RouteTable::Main,
            protocol: RouteProtocol::Static,
            route_type: RouteType::Unicast,
            family,
            scope: Scope::Global,
            priority: 0,
            layer: ConfigLayer::Platform,
        }
    }

    /// Static default route through `gateway`, prioritized by family.
    pub fn static_via(out_link_name: &str, gateway: IpAddr) -> Self {
        let family = Family::of(&gateway);
        let priority = match family {
            Family::Inet4 => ROUTE_PRIORITY_INET4,
            Family::Inet6 => ROUTE_PRIORITY_INET6,
        };
        let mut route = Self::new(out_link_name, family)
            .with_gateway(gateway)
            .with_priority(priority);
        route.normalize();
        route
    }

    pub fn with_destination(mut self, destination: IpNetwork) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Fill in the fields implied by destination and gateway.
    ///
    /// A zero-length destination becomes the default route (no destination)
    /// and an unspecified gateway is dropped. The family follows the gateway
    /// when there is one, otherwise the destination. Routes without a gateway
    /// are link scoped. Calling this on a normalized route changes nothing.
    pub fn normalize(&mut self) {
        if self.destination.is_some_and(|d| d.prefix() == 0) {
            self.destination = None;
        }
        if self.gateway.is_some_and(|g| g.is_unspecified()) {
            self.gateway = None;
        }
        if let Some(gateway) = &self.gateway {
            self.family = Family::of(gateway);
        } else if let Some(destination) = &self.destination {
            self.family = Family::of(&destination.ip());
        }
        self.scope = if self.gateway.is_some() {
            Scope::Global
        } else {
            Scope::Link
        };
    }

    pub fn is_default(&self) -> bool {
        self.destination.is_none()
    }

    fn validate(&self) -> Result<()> {
        if let (Some(destination), Some(gateway)) = (&self.destination, &self.gateway)
            && Family::of(&destination.ip()) != Family::of(gateway)
        {
            return Err(anyhow!(
                "route to {} via {} mixes address families",
                destination,
                gateway
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorKind {
    Dhcp4,
    Dhcp6,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSpec {
    pub kind: OperatorKind,
    pub link_name: String,
    pub require_up: bool,
    pub route_metric: u32,
    pub layer: ConfigLayer,
}

impl OperatorSpec {
    pub fn dhcp(kind: OperatorKind, link_name: &str) -> Self {
        Self {
            kind,
            link_name: link_name.into(),
            require_up: true,
            route_metric: DEFAULT_ROUTE_METRIC,
            layer: ConfigLayer::Platform,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverSpec {
    pub dns_servers: Vec<IpAddr>,
    pub layer: ConfigLayer,
}

impl ResolverSpec {
    pub fn new(dns_servers: Vec<IpAddr>) -> Self {
        Self {
            dns_servers,
            layer: ConfigLayer::Platform,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostnameSpec {
    pub hostname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub domainname: String,
    pub layer: ConfigLayer,
}

impl HostnameSpec {
    /// Split a fully qualified name into host and domain at the first dot.
    /// One trailing dot of an absolute name is dropped.
    pub fn parse_fqdn(fqdn: &str) -> Result<Self> {
        let invalid = |reason: String| PlatformError::InvalidHostname {
            name: fqdn.into(),
            reason,
        };
        let name = fqdn.strip_suffix('.').unwrap_or(fqdn);
        let (hostname, domainname) = name.split_once('.').unwrap_or((name, ""));
        if hostname.is_empty() {
            return Err(invalid("hostname can't be empty".into()).into());
        }
        if hostname.len() > MAX_HOSTNAME_LEN {
            return Err(invalid(format!(
                "hostname can't be longer than {} characters",
                MAX_HOSTNAME_LEN
            ))
            .into());
        }
        if domainname.len() > MAX_DOMAINNAME_LEN {
            return Err(invalid(format!(
                "domainname can't be longer than {} characters",
                MAX_DOMAINNAME_LEN
            ))
            .into());
        }
        let labels = std::iter::once(hostname)
            .chain(domainname.split('.').filter(|_| !domainname.is_empty()));
        for label in labels {
            validate_label(label).map_err(invalid)?;
        }
        Ok(Self {
            hostname: hostname.into(),
            domainname: domainname.into(),
            layer: ConfigLayer::Platform,
        })
    }

    pub fn fqdn(&self) -> String {
        if self.domainname.is_empty() {
            self.hostname.clone()
        } else {
            format!("{}.{}", self.hostname, self.domainname)
        }
    }
}

fn validate_label(label: &str) -> std::result::Result<(), String> {
    if label.is_empty() {
        return Err("empty label".into());
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(format!("label {:?} can't start or end with '-'", label));
    }
    if let Some(c) = label
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(format!("label {:?} contains invalid character {:?}", label, c));
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformMetadata {
    pub platform: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub zone: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instance_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformNetworkConfig {
    pub links: Vec<LinkSpec>,
    pub addresses: Vec<AddressSpec>,
    pub routes: Vec<RouteSpec>,
    pub operators: Vec<OperatorSpec>,
    pub resolvers: Vec<ResolverSpec>,
    pub hostnames: Vec<HostnameSpec>,
    #[serde(rename = "externalIPs")]
    pub external_ips: Vec<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PlatformMetadata>,
}

impl PlatformNetworkConfig {
    /// Add a link, superseding an earlier link with the same name.
    pub fn add_link(&mut self, link: LinkSpec) {
        match self.links.iter_mut().find(|l| l.name == link.name) {
            Some(existing) => *existing = link,
            None => self.links.push(link),
        }
    }

    pub fn add_address(&mut self, address: AddressSpec) {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
    }

    /// Normalize and store a route.
    pub fn add_route(&mut self, mut route: RouteSpec) -> Result<()> {
        route.validate()?;
        route.normalize();
        self.routes.push(route);
        Ok(())
    }

    /// Add an operator, superseding one of the same kind on the same link.
    pub fn add_operator(&mut self, operator: OperatorSpec) {
        match self
            .operators
            .iter_mut()
            .find(|o| o.link_name == operator.link_name && o.kind == operator.kind)
        {
            Some(existing) => *existing = operator,
            None => self.operators.push(operator),
        }
    }

    pub fn add_resolver(&mut self, dns_servers: Vec<IpAddr>) {
        if !dns_servers.is_empty() {
            self.resolvers.push(ResolverSpec::new(dns_servers));
        }
    }

    pub fn add_hostname(&mut self, fqdn: &str) -> Result<()> {
        self.hostnames.push(HostnameSpec::parse_fqdn(fqdn)?);
        Ok(())
    }

    pub fn add_external_ip(&mut self, ip: IpAddr) {
        if !self.external_ips.contains(&ip) {
            self.external_ips.push(ip);
        }
    }
}

pub fn parse_addr(field: &str, value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("invalid {} address {:?}: {}", field, value, e))
}

/// Parse `address/length`. A bare address is rejected.
pub fn parse_prefix(value: &str) -> Result<IpNetwork> {
    let (addr, len) = value
        .trim()
        .split_once('/')
        .ok_or_else(|| anyhow!("invalid prefix {:?}: missing prefix length", value))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|e| anyhow!("invalid prefix {:?}: {}", value, e))?;
    let len: u8 = len
        .parse()
        .map_err(|e| anyhow!("invalid prefix length in {:?}: {}", value, e))?;
    IpNetwork::new(addr, len).map_err(|e| anyhow!("invalid prefix {:?}: {}", value, e))
}

/// Build a prefix from an address and a dotted netmask.
pub fn prefix_from_netmask(address: &str, netmask: &str) -> Result<IpNetwork> {
    let addr = parse_addr("subnet", address)?;
    let mask = parse_addr("netmask", netmask)?;
    let len = netmask_to_prefix(mask)?;
    if Family::of(&addr) != Family::of(&mask) {
        return Err(anyhow!(
            "netmask {} does not match the family of {}",
            netmask,
            address
        ));
    }
    IpNetwork::new(addr, len).map_err(|e| anyhow!("invalid address {:?}: {}", address, e))
}

fn netmask_to_prefix(mask: IpAddr) -> Result<u8> {
    let (ones, leading) = match mask {
        IpAddr::V4(m) => {
            let m = u32::from_be_bytes(m.octets());
            (m.count_ones(), m.leading_ones())
        }
        IpAddr::V6(m) => {
            let m = u128::from_be_bytes(m.octets());
            (m.count_ones(), m.leading_ones())
        }
    };
    if ones != leading {
        return Err(anyhow!("netmask {} is not contiguous", mask));
    }
    Ok(ones as u8)
}

pub fn default_destination(family: Family) -> IpNetwork {
    let addr = match family {
        Family::Inet4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Family::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    // A zero-length prefix is always valid.
    IpNetwork::new(addr, 0).unwrap_or_else(|_| unreachable!())
}
