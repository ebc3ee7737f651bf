//! Opening sockets, directly or through a SOCKS5 hop, and bringing a pooled
//! connection's socket back to life when it went stale while parked.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, trace};

use crate::connection::ConnectionRef;
use crate::error::TransportError;
use crate::job::JobSlot;
use crate::lock;
use crate::transport::Connector;
use crate::types::{Destination, ProxyDescriptor};

/// Opens a plain TCP stream to `destination`, tunnelled through `proxy` if it
/// is not direct.
pub async fn tunnel(
    destination: &Destination,
    proxy: &ProxyDescriptor,
) -> Result<TcpStream, TransportError> {
    let target = (destination.host(), destination.port());

    match proxy {
        ProxyDescriptor::Direct => {
            TcpStream::connect(target)
                .await
                .map_err(|source| TransportError::Connect {
                    target: format!("{}:{}", destination.host(), destination.port()),
                    source,
                })
        }
        ProxyDescriptor::Socks5 {
            host,
            port,
            credentials,
        } => {
            let proxy_address = socket_address(host, *port);

            let stream = match credentials {
                Some(credentials) => {
                    Socks5Stream::connect_with_password(
                        proxy_address.as_str(),
                        target,
                        &credentials.username,
                        &credentials.password,
                    )
                    .await
                }
                None => Socks5Stream::connect(proxy_address.as_str(), target).await,
            }
            .map_err(|source| TransportError::Socks5 {
                target: format!("{}:{}", destination.host(), destination.port()),
                source,
            })?;

            trace!(%destination, proxy = %proxy_address, "Established SOCKS5 tunnel");
            Ok(stream.into_inner())
        }
    }
}

/// Opens a new transport for `destination`, bounded by `timeout`.
pub async fn open_transport<C: Connector>(
    connector: &C,
    destination: &Destination,
    proxy: &ProxyDescriptor,
    binding: &JobSlot,
    timeout: Duration,
) -> Result<C::Transport, TransportError> {
    let transport = tokio::time::timeout(timeout, connector.connect(destination, proxy, binding))
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

    trace!(%destination, %proxy, "Opened transport");
    Ok(transport)
}

/// Makes sure the connection has an open socket that has not seen EOF,
/// reopening it with the connection's own proxy settings if needed.
///
/// The old socket stays in place until a new one is ready, so on failure the
/// connection is exactly as it was before the call.
pub(crate) async fn ensure_transport_usable<C: Connector>(
    connector: &C,
    connection: &ConnectionRef<C::Transport>,
    destination: &Destination,
    timeout: Duration,
) -> Result<(), TransportError> {
    let (id, proxy, binding) = {
        let mut guard = lock(connection);
        if guard.transport_is_usable() {
            return Ok(());
        }
        (guard.id(), guard.proxy().clone(), guard.current_job().clone())
    };

    debug!(connection = %id, %destination, "Transport is closed, reconnecting");
    let transport = open_transport(connector, destination, &proxy, &binding, timeout).await?;
    lock(connection).install_transport(transport);

    Ok(())
}

fn socket_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
