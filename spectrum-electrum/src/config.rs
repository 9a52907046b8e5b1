//! Transport configuration: server endpoint, TLS, SOCKS5h proxy, and the
//! timing knobs of the worker loops.

use std::time::Duration;

use tracing::warn;

/// How long a `call` waits for its response before failing with `Timeout`.
/// Quadrupled over Tor.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// TCP connect deadline. Tor circuits need considerably longer.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONNECT_TIMEOUT_TOR: Duration = Duration::from_secs(20);
/// Receive deadline on the socket; a read timeout is a no-op for the reader.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
/// How often the pinger issues `server.ping`.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Consecutive ping failures before the pinger gives up on the socket.
pub const TRIES_THRESHOLD: u32 = 3;
/// Idle sleeps of the reader-side (notifier) and writer worker loops.
pub const SLEEP_RECV_LOOP: Duration = Duration::from_millis(10);
pub const SLEEP_WRITE_LOOP: Duration = Duration::from_millis(20);
/// Back-off before retrying a failed socket creation.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// A SOCKS5h proxy endpoint, typically a local Tor daemon.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Socks5Proxy {
    pub host: String,
    pub port: u16,
}

impl Socks5Proxy {
    /// Parse a proxy URL of the form `socks5h://host:port`. Any other
    /// scheme (including plain `socks5://`) fails the parse, and the
    /// transport proceeds without a proxy.
    pub fn parse(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("socks5h://")?;
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        let (host, port) = rest.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port = port.parse::<u16>().ok()?;
        Some(Self {
            host: host.to_owned(),
            port,
        })
    }
}

/// Configuration for one [`ElectrumSocket`](crate::ElectrumSocket).
#[derive(Clone, Debug)]
pub struct ElectrumConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub proxy: Option<Socks5Proxy>,
    /// See the module constants for the meaning of each knob. Tests shrink
    /// these to keep reconnect cycles fast.
    pub call_timeout: Duration,
    pub socket_timeout: Duration,
    pub ping_interval: Duration,
    pub tries_threshold: u32,
    pub reconnect_delay: Duration,
}

impl ElectrumConfig {
    pub fn new(host: impl Into<String>, port: u16, use_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls,
            proxy: None,
            call_timeout: CALL_TIMEOUT,
            socket_timeout: SOCKET_TIMEOUT,
            ping_interval: PING_INTERVAL,
            tries_threshold: TRIES_THRESHOLD,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    /// Configure a proxy from a URL, ignoring (with a warning) anything
    /// that isn't `socks5h://host:port`.
    pub fn with_proxy_url(mut self, url: Option<&str>) -> Self {
        self.proxy = url.and_then(|url| {
            let parsed = Socks5Proxy::parse(url);
            if parsed.is_none() {
                warn!("Ignoring unparseable proxy url: {url}");
            }
            parsed
        });
        self
    }

    /// Whether traffic is (presumably) routed over Tor. Timeouts stretch
    /// accordingly.
    pub fn uses_tor(&self) -> bool {
        self.proxy.is_some() || self.host.ends_with(".onion")
    }

    pub fn connect_timeout(&self) -> Duration {
        if self.uses_tor() {
            CONNECT_TIMEOUT_TOR
        } else {
            CONNECT_TIMEOUT
        }
    }

    pub fn call_timeout(&self) -> Duration {
        if self.uses_tor() {
            self.call_timeout * 4
        } else {
            self.call_timeout
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_socks5h_only() {
        let proxy = Socks5Proxy::parse("socks5h://127.0.0.1:9050").unwrap();
        assert_eq!(proxy.host, "127.0.0.1");
        assert_eq!(proxy.port, 9050);

        assert_eq!(Socks5Proxy::parse("socks5://127.0.0.1:9050"), None);
        assert_eq!(Socks5Proxy::parse("http://127.0.0.1:8080"), None);
        assert_eq!(Socks5Proxy::parse("socks5h://:9050"), None);
        assert_eq!(Socks5Proxy::parse("socks5h://localhost"), None);
        assert_eq!(Socks5Proxy::parse("socks5h://localhost:not_a_port"), None);
    }

    #[test]
    fn tor_stretches_timeouts() {
        let clearnet = ElectrumConfig::new("electrum.example.com", 50002, true);
        assert!(!clearnet.uses_tor());
        assert_eq!(clearnet.call_timeout(), CALL_TIMEOUT);
        assert_eq!(clearnet.connect_timeout(), CONNECT_TIMEOUT);

        let onion = ElectrumConfig::new("abcdef.onion", 50001, false);
        assert!(onion.uses_tor());

        let proxied = ElectrumConfig::new("electrum.example.com", 50002, true)
            .with_proxy_url(Some("socks5h://127.0.0.1:9050"));
        assert!(proxied.uses_tor());
        assert_eq!(proxied.call_timeout(), CALL_TIMEOUT * 4);
        assert_eq!(proxied.connect_timeout(), CONNECT_TIMEOUT_TOR);

        let bad_proxy = ElectrumConfig::new("electrum.example.com", 50002, true)
            .with_proxy_url(Some("socks5://127.0.0.1:9050"));
        assert!(!bad_proxy.uses_tor());
    }
}
