use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::{Host, Url};

use crate::config::Config;

/// Various timeouts for the remote backend.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(1),
            max_download: Duration::from_secs(315),
        }
    }
}

fn is_shared_v4(addr: Ipv4Addr) -> bool {
    // 100.64.0.0/10
    let [a, b, ..] = addr.octets();
    a == 100 && (b & 0b1100_0000) == 64
}

/// Whether `ip` is a public address that may be connected to.
///
/// IPv6 addresses are never considered external.
fn is_external_ip(ip: IpAddr) -> bool {
    let IpAddr::V4(addr) = ip else {
        return false;
    };

    let reserved = addr.is_unspecified()
        || addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_documentation()
        || addr.is_multicast()
        || is_shared_v4(addr)
        || addr.octets()[0] >= 240;

    if reserved {
        metric!(counter("http.blocked_ip") += 1);
        tracing::debug!(
            "Blocked attempt to connect to reserved IP address: {}",
            addr
        );
    }

    !reserved
}

/// Checks that `url` does not point at a reserved IP address literal.
///
/// Host names are checked by the DNS resolver installed in [`create_client`], IP literals
/// never reach the resolver.
pub fn is_allowed_url(url: &Url, connect_to_reserved_ips: bool) -> bool {
    if connect_to_reserved_ips {
        return true;
    }
    match url.host() {
        Some(Host::Ipv4(addr)) => is_external_ip(IpAddr::V4(addr)),
        Some(Host::Ipv6(addr)) => is_external_ip(IpAddr::V6(addr)),
        Some(Host::Domain(_)) => true,
        None => false,
    }
}

/// A resolver that drops reserved IP addresses from DNS answers.
#[derive(Debug)]
struct ExternalResolver;

impl Resolve for ExternalResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((name.as_str(), 0))
                .await?
                .filter(|addr| is_external_ip(addr.ip()))
                .collect();

            if addrs.is_empty() {
                let message = format!("{} only resolves to reserved addresses", name.as_str());
                return Err(message.into());
            }

            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok(addrs)
        })
    }
}

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `timeouts` controls connection and download timeouts.
/// * `connect_to_reserved_ips` determines whether the client is allowed to
///   connect to reserved IPs.
/// * `headers` are sent along with every request.
pub fn create_client(
    timeouts: &DownloadTimeouts,
    connect_to_reserved_ips: bool,
    headers: &BTreeMap<String, String>,
) -> anyhow::Result<reqwest::Client> {
    let mut default_headers = HeaderMap::new();
    for (key, value) in headers {
        default_headers.insert(
            HeaderName::from_bytes(key.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }

    let mut builder = reqwest::ClientBuilder::new()
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .default_headers(default_headers);

    if !connect_to_reserved_ips {
        builder = builder.dns_resolver(Arc::new(ExternalResolver));
    }

    Ok(builder.build()?)
}
