use std::fs;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use log::{debug, warn};
use rand::TryRngCore;
use rand::rngs::OsRng;
use reqwest::{StatusCode, Url};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryBackoff;
use crate::constants::FILE_SMBIOS_SERIAL;
use crate::error::PlatformError;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(2);
const PRIVILEGED_PORTS: RangeInclusive<u16> = 1..=1023;

/// Run `fut` unless `ctx` is cancelled first.
///
/// An already cancelled token wins without polling `fut`, so no I/O starts.
pub async fn cancellable<T, F>(ctx: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(PlatformError::Cancelled.into()),
        res = fut => res,
    }
}

/// HTTP GET of a whole document.
///
/// `Ok(None)` means the server answered 404. Every other failure is an error
/// naming the URL.
#[allow(async_fn_in_trait)]
pub trait Downloader {
    async fn download(&self, url: &str) -> Result<Option<Vec<u8>>>;
}

enum Attempt {
    Retry(anyhow::Error),
    Fatal(anyhow::Error),
}

fn fetch_error(url: &str, reason: impl ToString) -> anyhow::Error {
    PlatformError::Fetch {
        key: url.into(),
        reason: reason.to_string(),
    }
    .into()
}

// Ok(false) is a 404.
fn check_status(url: &str, status: StatusCode) -> std::result::Result<bool, Attempt> {
    if status == StatusCode::NOT_FOUND {
        return Ok(false);
    }
    if status.is_server_error() {
        return Err(Attempt::Retry(fetch_error(url, format!("status {}", status))));
    }
    if !status.is_success() {
        return Err(Attempt::Fatal(fetch_error(url, format!("status {}", status))));
    }
    Ok(true)
}

async fn with_retries<F, Fut>(
    url: &str,
    retry_timeout: Duration,
    mut attempt: F,
) -> Result<Option<Vec<u8>>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<Option<Vec<u8>>, Attempt>>,
{
    let start = Instant::now();
    let mut backoff = RetryBackoff::new(RETRY_BACKOFF_CAP);
    loop {
        match attempt().await {
            Ok(body) => {
                debug!(
                    "Fetched {} ({})",
                    url,
                    body.as_ref()
                        .map_or("not found".to_string(), |b| format!("{} bytes", b.len()))
                );
                return Ok(body);
            }
            Err(Attempt::Fatal(e)) => return Err(e),
            Err(Attempt::Retry(e)) => {
                if start.elapsed() >= retry_timeout {
                    return Err(e);
                }
                warn!("Fetching {} failed, retrying: {}", url, e);
                backoff.wait().await;
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpDownloader {
    client: reqwest::Client,
    retry_timeout: Duration,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        Self::with_timeouts(DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_TIMEOUT)
    }

    pub fn with_timeouts(request_timeout: Duration, retry_timeout: Duration) -> Result<Self> {
        // Metadata services are link-local, never behind a proxy.
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| anyhow!("unable to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            retry_timeout,
        })
    }

    async fn attempt(&self, url: &str) -> std::result::Result<Option<Vec<u8>>, Attempt> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Attempt::Retry(fetch_error(url, e)))?;
        if !check_status(url, resp.status())? {
            return Ok(None);
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| Attempt::Retry(fetch_error(url, e)))?;
        Ok(Some(body.to_vec()))
    }
}

impl Downloader for HttpDownloader {
    async fn download(&self, url: &str) -> Result<Option<Vec<u8>>> {
        with_retries(url, self.retry_timeout, || self.attempt(url)).await
    }
}

/// Plain HTTP GET sent from a privileged local port.
///
/// Scaleway hands out user-data only to clients connecting from a port
/// below 1024, which needs `CAP_NET_BIND_SERVICE`. The request is HTTP/1.0
/// so the body is never chunked and ends when the server closes.
#[derive(Clone, Debug)]
pub struct LowPortDownloader {
    ports: RangeInclusive<u16>,
    request_timeout: Duration,
    retry_timeout: Duration,
}

impl Default for LowPortDownloader {
    fn default() -> Self {
        Self::with_ports(PRIVILEGED_PORTS, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_TIMEOUT)
    }
}

impl LowPortDownloader {
    pub fn with_ports(
        ports: RangeInclusive<u16>,
        request_timeout: Duration,
        retry_timeout: Duration,
    ) -> Self {
        Self {
            ports,
            request_timeout,
            retry_timeout,
        }
    }

    /// Bind a free port from the range, starting at a random offset.
    async fn connect(&self, remote: SocketAddr) -> io::Result<TcpStream> {
        let first = *self.ports.start();
        let span = u32::from(self.ports.end().saturating_sub(first)) + 1;
        let offset = OsRng.try_next_u32().unwrap_or(0) % span;
        for i in 0..span {
            let port = first + ((offset + i) % span) as u16;
            let (socket, local) = match remote {
                SocketAddr::V4(_) => (
                    TcpSocket::new_v4()?,
                    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
                ),
                SocketAddr::V6(_) => (
                    TcpSocket::new_v6()?,
                    SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
                ),
            };
            match socket.bind(local) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e),
            }
            match socket.connect(remote).await {
                Ok(stream) => return Ok(stream),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("no free local port in {:?}", self.ports),
        ))
    }

    async fn exchange(&self, url: &Url) -> io::Result<Vec<u8>> {
        let host = url
            .host_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "URL has no host"))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let remote = tokio::net::lookup_host(format!("{}:{}", host, port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host))
            })?;

        let mut stream = self.connect(remote).await?;
        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let request = format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
            target, host
        );
        stream.write_all(request.as_bytes()).await?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        Ok(raw)
    }

    async fn attempt(
        &self,
        url: &str,
        parsed: &Url,
    ) -> std::result::Result<Option<Vec<u8>>, Attempt> {
        let raw = match tokio::time::timeout(self.request_timeout, self.exchange(parsed)).await {
            Err(_) => return Err(Attempt::Retry(fetch_error(url, "request timed out"))),
            Ok(Err(e)) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(Attempt::Fatal(fetch_error(url, e)));
            }
            Ok(Err(e)) => return Err(Attempt::Retry(fetch_error(url, e))),
            Ok(Ok(raw)) => raw,
        };
        let (status, body) =
            parse_response(&raw).map_err(|e| Attempt::Fatal(fetch_error(url, e)))?;
        if !check_status(url, status)? {
            return Ok(None);
        }
        Ok(Some(body.to_vec()))
    }
}

impl Downloader for LowPortDownloader {
    async fn download(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let parsed = Url::parse(url).map_err(|e| fetch_error(url, e))?;
        if parsed.scheme() != "http" {
            return Err(fetch_error(url, "only plain http is supported"));
        }
        with_retries(url, self.retry_timeout, || self.attempt(url, &parsed)).await
    }
}

fn parse_response(raw: &[u8]) -> Result<(StatusCode, &[u8])> {
    let end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("truncated HTTP response"))?;
    let head = std::str::from_utf8(&raw[..end]).context("HTTP response head is not UTF-8")?;
    let code = head
        .lines()
        .next()
        .filter(|line| line.starts_with("HTTP/"))
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or_else(|| anyhow!("malformed HTTP status line"))?;
    let status = StatusCode::from_bytes(code.as_bytes())
        .map_err(|e| anyhow!("invalid HTTP status {:?}: {}", code, e))?;
    Ok((status, &raw[end + 4..]))
}

/// Read access to the SMBIOS system information table.
pub trait Smbios {
    fn system_serial(&self) -> Result<String>;
}

#[derive(Clone, Debug)]
pub struct SysfsSmbios {
    serial_path: PathBuf,
}

impl Default for SysfsSmbios {
    fn default() -> Self {
        Self {
            serial_path: PathBuf::from(FILE_SMBIOS_SERIAL),
        }
    }
}

impl Smbios for SysfsSmbios {
    fn system_serial(&self) -> Result<String> {
        let serial = fs::read_to_string(&self.serial_path)
            .with_context(|| format!("unable to read SMBIOS serial from {:?}", self.serial_path))?;
        Ok(serial.trim_end().to_string())
    }
}
