//! The contract every infrastructure provider implements, and the closed set
//! of providers this crate knows about.

pub mod aws;
pub mod hcloud;
pub mod nocloud;
pub mod scaleway;

use std::fmt;

use anyhow::{Result, anyhow};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::error::PlatformError;
use crate::netconf::PlatformNetworkConfig;

pub use aws::Aws;
pub use hcloud::Hcloud;
pub use nocloud::Nocloud;
pub use scaleway::Scaleway;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Cloud,
    Container,
    Metal,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Cloud => write!(f, "cloud"),
            Mode::Container => write!(f, "container"),
            Mode::Metal => write!(f, "metal"),
        }
    }
}

/// A kernel parameter that may be repeated, e.g. `console=tty1 console=ttyS0`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelParam {
    pub key: String,
    pub values: Vec<String>,
}

impl KernelParam {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.into(),
            values: Vec::new(),
        }
    }

    pub fn append(mut self, value: &str) -> Self {
        self.values.push(value.into());
        self
    }
}

impl fmt::Display for KernelParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .values
            .iter()
            .map(|v| format!("{}={}", self.key, v))
            .collect::<Vec<_>>();
        write!(f, "{}", rendered.join(" "))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelArgs(pub Vec<KernelParam>);

impl KernelArgs {
    pub fn get(&self, key: &str) -> Option<&KernelParam> {
        self.0.iter().find(|p| p.key == key)
    }
}

impl fmt::Display for KernelArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self.0.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        write!(f, "{}", rendered.join(" "))
    }
}

pub(crate) fn console_params() -> KernelParam {
    KernelParam::new("console").append("tty1").append("ttyS0")
}

#[allow(async_fn_in_trait)]
pub trait Platform {
    /// Stable provider identifier.
    fn name(&self) -> &'static str;

    fn mode(&self) -> Mode;

    /// Boot parameters the provider needs, such as console devices.
    fn kernel_args(&self) -> KernelArgs;

    /// Raw machine configuration.
    ///
    /// Fails with [`PlatformError::NoConfigSource`] when the provider has none
    /// to offer, as opposed to failing to reach it.
    async fn configuration(&self, ctx: &CancellationToken) -> Result<Vec<u8>>;

    /// Fetch, parse and normalize platform metadata, then hand the result to
    /// `ch`. At most one configuration is sent per call.
    async fn network_configuration(
        &self,
        ctx: &CancellationToken,
        ch: &Sender<PlatformNetworkConfig>,
    ) -> Result<()>;
}

/// Hand `config` to the consumer unless `ctx` is cancelled first.
pub async fn deliver(
    ctx: &CancellationToken,
    ch: &Sender<PlatformNetworkConfig>,
    config: PlatformNetworkConfig,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(PlatformError::Cancelled.into()),
        res = ch.send(config) => {
            res.map_err(|_| anyhow!("network configuration receiver is closed"))
        }
    }
}

/// A missing or empty machine configuration is no configuration at all.
pub(crate) fn require_config(data: Option<Vec<u8>>) -> Result<Vec<u8>> {
    crate::cloudinit::non_empty(data).ok_or_else(|| PlatformError::NoConfigSource.into())
}

/// Value of the `platform=` kernel parameter.
pub fn current_platform_name(cmdline: &str) -> Option<&str> {
    cmdline
        .split_whitespace()
        .filter_map(|arg| arg.split_once('='))
        .filter(|(key, _)| *key == crate::constants::KERNEL_PARAM_PLATFORM)
        .map(|(_, value)| value)
        .last()
}

/// Every provider this crate supports, selected by name.
#[derive(Debug)]
pub enum AnyPlatform {
    Aws(Aws),
    Hcloud(Hcloud),
    Nocloud(Nocloud),
    Scaleway(Scaleway),
}

impl AnyPlatform {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            aws::NAME => Ok(AnyPlatform::Aws(Aws::new())),
            hcloud::NAME => Ok(AnyPlatform::Hcloud(Hcloud::new()?)),
            nocloud::NAME => Ok(AnyPlatform::Nocloud(Nocloud::new()?)),
            scaleway::NAME => Ok(AnyPlatform::Scaleway(Scaleway::new()?)),
            _ => Err(anyhow!("unknown platform {:?}", name)),
        }
    }
}

impl Platform for AnyPlatform {
    fn name(&self) -> &'static str {
        match self {
            AnyPlatform::Aws(p) => p.name(),
            AnyPlatform::Hcloud(p) => p.name(),
            AnyPlatform::Nocloud(p) => p.name(),
            AnyPlatform::Scaleway(p) => p.name(),
        }
    }

    fn mode(&self) -> Mode {
        match self {
            AnyPlatform::Aws(p) => p.mode(),
            AnyPlatform::Hcloud(p) => p.mode(),
            AnyPlatform::Nocloud(p) => p.mode(),
            AnyPlatform::Scaleway(p) => p.mode(),
        }
    }

    fn kernel_args(&self) -> KernelArgs {
        match self {
            AnyPlatform::Aws(p) => p.kernel_args(),
            AnyPlatform::Hcloud(p) => p.kernel_args(),
            AnyPlatform::Nocloud(p) => p.kernel_args(),
            AnyPlatform::Scaleway(p) => p.kernel_args(),
        }
    }

    async fn configuration(&self, ctx: &CancellationToken) -> Result<Vec<u8>> {
        match self {
            AnyPlatform::Aws(p) => p.configuration(ctx).await,
            AnyPlatform::Hcloud(p) => p.configuration(ctx).await,
            AnyPlatform::Nocloud(p) => p.configuration(ctx).await,
            AnyPlatform::Scaleway(p) => p.configuration(ctx).await,
        }
    }

    async fn network_configuration(
        &self,
        ctx: &CancellationToken,
        ch: &Sender<PlatformNetworkConfig>,
    ) -> Result<()> {
        match self {
            AnyPlatform::Aws(p) => p.network_configuration(ctx, ch).await,
            AnyPlatform::Hcloud(p) => p.network_configuration(ctx, ch).await,
            AnyPlatform::Nocloud(p) => p.network_configuration(ctx, ch).await,
            AnyPlatform::Scaleway(p) => p.network_configuration(ctx, ch).await,
        }
    }
}
