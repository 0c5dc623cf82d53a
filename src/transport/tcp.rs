//! IPv6 link-local TCP fallback transport: discovered lazily while the
//! serial transport is primary, and fed to the server as secondary
//! listeners over a bounded channel.

use std::collections::HashSet;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use super::TransportListener;
use crate::config::{LINK_LOCAL_POLL_ATTEMPTS, LINK_LOCAL_POLL_INTERVAL, RPC_PORT};

/// Enumerates IPv6 link-local unicast addresses (`fe80::/10`) currently
/// assigned to any interface, each tagged with its interface scope id.
fn link_local_addresses() -> Vec<(Ipv6Addr, u32)> {
    let mut found = Vec::new();
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(iter) => iter,
        Err(_) => return found,
    };

    for ifaddr in addrs {
        let Some(address) = ifaddr.address else {
            continue;
        };
        let Some(sin6) = address.as_sockaddr_in6() else {
            continue;
        };
        let ip = sin6.ip();
        if is_link_local(&ip) {
            let scope_id = nix::net::if_::if_nametoindex(ifaddr.interface_name.as_str())
                .unwrap_or(0);
            found.push((ip, scope_id));
        }
    }
    found
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    // fe80::/10
    addr.segments()[0] & 0xffc0 == 0xfe80
}

/// Polls for freshly-appeared link-local addresses every
/// [`LINK_LOCAL_POLL_INTERVAL`], up to [`LINK_LOCAL_POLL_ATTEMPTS`] times,
/// binding a plain TCP listener for each one not seen before (the caller
/// wraps the accepted connections in TLS). Terminates early on cancellation.
pub async fn poll_link_local(tx: Sender<TransportListener>, cancel: CancellationToken) {
    let mut bound: HashSet<(Ipv6Addr, u32)> = HashSet::new();

    for _ in 0..LINK_LOCAL_POLL_ATTEMPTS {
        if cancel.is_cancelled() {
            return;
        }

        for (addr, scope_id) in link_local_addresses() {
            if !bound.insert((addr, scope_id)) {
                continue;
            }

            let socket_addr = SocketAddr::V6(SocketAddrV6::new(addr, RPC_PORT as u16, 0, scope_id));
            match tokio::net::TcpListener::bind(socket_addr).await {
                Ok(listener) => {
                    let label = format!("tcp:{socket_addr}");
                    tracing::info!(%label, "bound link-local TCP listener");
                    if tx
                        .send(TransportListener::Tcp { listener, label })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(%socket_addr, error = %e, "failed to bind link-local TCP listener");
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(LINK_LOCAL_POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_local_prefix_check() {
        assert!(is_link_local(&"fe80::1".parse().unwrap()));
        assert!(!is_link_local(&"2001:db8::1".parse().unwrap()));
        assert!(!is_link_local(&"::1".parse().unwrap()));
    }
}
