//! Proxy-agent factory: construct an outbound dialer honoring
//! per-account proxy config and IPv4/IPv6 preference.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use reqwest::Client;
use tracing::warn;

use crate::domain::{ProxyConfig, ProxyProtocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
    Auto,
}

impl IpFamily {
    /// Accepts `true|false|4|6|"ipv4"|"ipv6"|"auto"`. IPv4 is the default
    /// when unset.
    pub fn parse(raw: Option<&str>, default_use_ipv4: bool) -> Self {
        match raw.map(str::trim) {
            None => {
                if default_use_ipv4 {
                    IpFamily::V4
                } else {
                    IpFamily::Auto
                }
            }
            Some("true") | Some("4") | Some("ipv4") => IpFamily::V4,
            Some("false") | Some("6") | Some("ipv6") => IpFamily::V6,
            Some("auto") => IpFamily::Auto,
            Some(_) => IpFamily::V4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProxyKey {
    protocol: ProxyProtocol,
    host: String,
    port: u16,
    family: (bool, bool, bool),
}

fn key_for(proxy: &ProxyConfig, family: IpFamily) -> ProxyKey {
    ProxyKey {
        protocol: proxy.protocol,
        host: proxy.host.clone(),
        port: proxy.port,
        family: match family {
            IpFamily::V4 => (true, false, false),
            IpFamily::V6 => (false, true, false),
            IpFamily::Auto => (false, false, true),
        },
    }
}

fn proxy_url(proxy: &ProxyConfig) -> String {
    let scheme = match proxy.protocol {
        ProxyProtocol::Http => "http",
        ProxyProtocol::Https => "https",
        ProxyProtocol::Socks5 => "socks5",
    };
    match &proxy.auth {
        Some(auth) => format!("{scheme}://{}:{}@{}:{}", auth.username, auth.password, proxy.host, proxy.port),
        None => format!("{scheme}://{}:{}", proxy.host, proxy.port),
    }
}

/// Builds (and caches) `reqwest::Client`s honoring each account's proxy
/// config. A `RwLock`-guarded map is used rather than `dashmap`.
pub struct ProxyAgentFactory {
    direct: Client,
    cached: RwLock<HashMap<ProxyKey, Client>>,
    timeout: Duration,
}

impl ProxyAgentFactory {
    pub fn new(timeout: Duration) -> Self {
        let direct = Client::builder().timeout(timeout).build().expect("direct client build");
        Self { direct, cached: RwLock::new(HashMap::new()), timeout }
    }

    /// `None` proxy config means the shared direct client.
    pub fn client_for(&self, proxy: Option<&ProxyConfig>, family_raw: Option<&str>, default_use_ipv4: bool) -> Client {
        let Some(proxy) = proxy else {
            return self.direct.clone();
        };

        let family = IpFamily::parse(family_raw, default_use_ipv4);
        let key = key_for(proxy, family);

        if let Some(client) = self.cached.read().expect("proxy cache poisoned").get(&key) {
            return client.clone();
        }

        let Some(client) = self.build_client(proxy, family) else {
            return self.direct.clone();
        };

        self.cached.write().expect("proxy cache poisoned").insert(key, client.clone());
        client
    }

    fn build_client(&self, proxy: &ProxyConfig, family: IpFamily) -> Option<Client> {
        let url = proxy_url(proxy);
        let proxy_impl = match proxy.protocol {
            ProxyProtocol::Http => reqwest::Proxy::http(&url),
            ProxyProtocol::Https => reqwest::Proxy::https(&url),
            ProxyProtocol::Socks5 => reqwest::Proxy::all(&url),
        };
        let proxy_impl = match proxy_impl {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, protocol = ?proxy.protocol, "proxy-agent factory: invalid proxy config, falling back to direct");
                return None;
            }
        };

        let mut builder = Client::builder().timeout(self.timeout).proxy(proxy_impl);
        builder = match family {
            IpFamily::V4 => builder.local_address(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
            IpFamily::V6 => builder.local_address(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)),
            IpFamily::Auto => builder,
        };

        match builder.build() {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "proxy-agent factory: client build failed, falling back to direct");
                None
            }
        }
    }
}
