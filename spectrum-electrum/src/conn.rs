//! Socket creation: resolve + TCP connect, optional SOCKS5h tunnel,
//! optional TLS. Produces a boxed duplex stream the workers split between
//! themselves.

use std::{io, sync::Arc};

use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::ElectrumConfig;

/// Object-safe alias for the duplex stream handed to the workers.
pub(crate) trait AsyncStream:
    AsyncRead + AsyncWrite + Send + Unpin
{
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) type Stream = Box<dyn AsyncStream>;

/// Open a connection per the config. The whole dance (DNS, TCP, SOCKS5h,
/// TLS handshake) runs under the connect deadline.
pub(crate) async fn connect(config: &ElectrumConfig) -> io::Result<Stream> {
    let deadline = config.connect_timeout();
    timeout(deadline, connect_inner(config))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {}:{} timed out", config.host, config.port),
            )
        })?
}

async fn connect_inner(config: &ElectrumConfig) -> io::Result<Stream> {
    let host = config.host.as_str();
    let port = config.port;

    let tcp: Stream = match &config.proxy {
        Some(proxy) => {
            debug!(
                "Connecting to {host}:{port} via socks5h \
                 {}:{}",
                proxy.host, proxy.port
            );
            let proxy_addr = (proxy.host.as_str(), proxy.port);
            // socks5h: the proxy resolves the target hostname, which is
            // what keeps .onion addresses working.
            let stream =
                tokio_socks::tcp::Socks5Stream::connect(proxy_addr, (host, port))
                    .await
                    .map_err(|e| {
                        io::Error::new(io::ErrorKind::ConnectionRefused, e)
                    })?;
            Box::new(stream)
        }
        None => {
            debug!("Connecting to {host}:{port}");
            Box::new(TcpStream::connect((host, port)).await?)
        }
    };

    if !config.use_tls {
        return Ok(tcp);
    }

    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let tls = tls_connector().connect(server_name, tcp).await?;
    Ok(Box::new(tls))
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
