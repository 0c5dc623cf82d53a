//! One-shot interface bring-up/tear-down, run before the long-lived `serve`
//! loop. Looks for a NoCloud (`cidata`) seed volume, reads its
//! `network-config` document, and applies the matching interface's
//! addresses and routes directly through the same rtnetlink plumbing the
//! `Network` service uses at runtime.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::services::network::{addresses_for, link_index_by_name, open_handle};

const NOCLOUD_MARKER: &str = "ds=nocloud";
const CIDATA_LABEL: &str = "cidata";
const SEED_MOUNT_POINT: &str = "/run/guest-agent/seed";
const NETWORK_CONFIG_FILE: &str = "network-config";

#[derive(Debug, Deserialize)]
struct NetworkConfig {
    #[allow(dead_code)]
    version: Option<u32>,
    #[serde(default)]
    ethernets: HashMap<String, EthernetConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct EthernetConfig {
    #[serde(rename = "match", default)]
    match_: Option<MatchConfig>,
    #[serde(default)]
    addresses: Vec<String>,
    gateway4: Option<String>,
    gateway6: Option<String>,
    #[serde(default)]
    routes: Vec<StaticRoute>,
}

#[derive(Debug, Deserialize, Default)]
struct MatchConfig {
    macaddress: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StaticRoute {
    to: String,
    via: String,
}

/// Brings an interface up and applies its matching cloud-init network
/// configuration. Fails if the NoCloud marker, the seed volume, or a
/// matching MAC-address entry for `name` cannot be found: this command is
/// meant to run unconditionally from an init script, so a missing seed is
/// a configuration error, not something to shrug off.
pub async fn configure_iface(name: &str) -> Result<()> {
    let config = find_matching_config(name)?
        .ok_or_else(|| Error::Config(format!("no cloud-init network config for interface {name}")))?;

    let handle = open_handle().await?;
    let index = link_index_by_name(&handle, name).await?;

    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| Error::Netlink(e.to_string()))?;

    let existing = addresses_for(&handle, index).await?;
    let mut ip4_prefix_len: Option<u8> = None;
    let mut have_ip4 = false;
    let mut have_ip6 = false;

    for cidr in &config.addresses {
        let net: IpNet = cidr
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid address in seed config: {cidr}")))?;
        match net.addr() {
            IpAddr::V4(_) => {
                have_ip4 = true;
                ip4_prefix_len.get_or_insert(net.prefix_len());
            }
            IpAddr::V6(_) => have_ip6 = true,
        }

        if existing.iter().any(|a| a == cidr) {
            tracing::debug!(address = %cidr, "address already assigned");
            continue;
        }
        handle
            .address()
            .add(index, net.addr(), net.prefix_len())
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?;
    }

    if have_ip4 {
        if let Some(gateway) = config.gateway4.as_deref() {
            if ip4_prefix_len == Some(32) {
                add_link_route(&handle, index, gateway).await?;
            }
            add_default_route(&handle, index, gateway).await?;
        }
    }

    if have_ip6 {
        if let Some(gateway) = config.gateway6.as_deref() {
            add_default_route(&handle, index, gateway).await?;
        }
    }

    for route in &config.routes {
        if let Err(e) = add_static_route(&handle, index, route).await {
            tracing::warn!(to = %route.to, via = %route.via, error = %e, "failed to add cloud-init static route");
        }
    }

    Ok(())
}

/// Brings an interface down and strips every address currently assigned
/// to it. Used when the guest is shutting down or the seed is no longer
/// trusted.
pub async fn deconfigure_iface(name: &str) -> Result<()> {
    let handle = open_handle().await?;
    let index = link_index_by_name(&handle, name).await?;

    handle
        .link()
        .set(index)
        .down()
        .execute()
        .await
        .map_err(|e| Error::Netlink(e.to_string()))?;

    let mut addrs = handle.address().get().set_link_index_filter(index).execute();
    use futures::stream::TryStreamExt;
    while let Some(msg) = addrs
        .try_next()
        .await
        .map_err(|e| Error::Netlink(e.to_string()))?
    {
        handle
            .address()
            .del(msg)
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?;
    }

    Ok(())
}

/// A host route to the gateway itself, scoped to the link: needed when the
/// assigned address has no room for a neighbor (a /32, as cloud providers
/// commonly hand out) so the kernel has a way to reach the gateway before
/// the default route can be resolved.
async fn add_link_route(handle: &rtnetlink::Handle, index: u32, gateway: &str) -> Result<()> {
    let IpAddr::V4(addr) = gateway
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid gateway in seed config: {gateway}")))?
    else {
        return Err(Error::InvalidArgument(format!("expected ipv4 gateway: {gateway}")));
    };
    handle
        .route()
        .add()
        .v4()
        .destination_prefix(addr, 32)
        .output_interface(index)
        .execute()
        .await
        .map_err(|e| Error::Netlink(format!("link route to {gateway}: {e}")))
}

async fn add_default_route(handle: &rtnetlink::Handle, index: u32, gateway: &str) -> Result<()> {
    let gw: IpAddr = gateway
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid gateway in seed config: {gateway}")))?;
    match gw {
        IpAddr::V4(addr) => handle
            .route()
            .add()
            .v4()
            .gateway(addr)
            .output_interface(index)
            .execute()
            .await
            .map_err(|e| Error::Netlink(format!("default route via {gateway}: {e}"))),
        IpAddr::V6(addr) => handle
            .route()
            .add()
            .v6()
            .gateway(addr)
            .output_interface(index)
            .execute()
            .await
            .map_err(|e| Error::Netlink(format!("default route via {gateway}: {e}"))),
    }
}

async fn add_static_route(handle: &rtnetlink::Handle, index: u32, route: &StaticRoute) -> Result<()> {
    let dest: IpNet = route
        .to
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid route destination: {}", route.to)))?;
    let via: IpAddr = route
        .via
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid route gateway: {}", route.via)))?;

    match (dest.addr(), via) {
        (IpAddr::V4(dst), IpAddr::V4(gw)) => handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst, dest.prefix_len())
            .gateway(gw)
            .output_interface(index)
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string())),
        (IpAddr::V6(dst), IpAddr::V6(gw)) => handle
            .route()
            .add()
            .v6()
            .destination_prefix(dst, dest.prefix_len())
            .gateway(gw)
            .output_interface(index)
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string())),
        _ => Err(Error::InvalidArgument(format!(
            "address family mismatch in route {} via {}",
            route.to, route.via
        ))),
    }
}

/// Looks for a mounted/mountable NoCloud seed and returns the ethernet
/// config matching `iface_name`'s hardware address, if any.
fn find_matching_config(iface_name: &str) -> Result<Option<EthernetConfig>> {
    if !nocloud_marker_present() {
        return Ok(None);
    }

    let Some(seed_device) = find_cidata_device()? else {
        return Ok(None);
    };

    let doc = match mount_and_read(&seed_device) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!(device = %seed_device, error = %e, "failed to read cloud-init seed");
            return Ok(None);
        }
    };

    let config: NetworkConfig = serde_yaml::from_str(&doc)
        .map_err(|e| Error::Config(format!("invalid network-config yaml: {e}")))?;

    let iface_mac = read_iface_mac(iface_name)?;

    for eth in config.ethernets.into_values() {
        let wants = eth
            .match_
            .as_ref()
            .and_then(|m| m.macaddress.as_deref());
        match (wants, iface_mac.as_deref()) {
            (Some(want), Some(have)) if want.eq_ignore_ascii_case(have) => return Ok(Some(eth)),
            (None, _) => return Ok(Some(eth)),
            _ => continue,
        }
    }

    Ok(None)
}

/// Checks the product/board serial strings the kernel surfaces under
/// sysfs, which is where `ds=nocloud` ends up for NoCloud-by-SMBIOS
/// deployments, rather than parsing the raw SMBIOS Type 1 table directly.
fn nocloud_marker_present() -> bool {
    for path in ["/sys/class/dmi/id/product_serial", "/sys/class/dmi/id/board_serial"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if contents.contains(NOCLOUD_MARKER) {
                return true;
            }
        }
    }
    false
}

fn find_cidata_device() -> Result<Option<String>> {
    let block_dir = Path::new("/sys/class/block");
    let entries = match std::fs::read_dir(block_dir) {
        Ok(e) => e,
        Err(_) => return Ok(None),
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("loop") {
            continue;
        }
        let dev_path = format!("/dev/{name}");
        let label = blkid_label(&dev_path);
        if label.as_deref().map(|l| l.eq_ignore_ascii_case(CIDATA_LABEL)) == Some(true) {
            return Ok(Some(dev_path));
        }
    }
    Ok(None)
}

fn blkid_label(device: &str) -> Option<String> {
    let output = std::process::Command::new("blkid")
        .arg("-s")
        .arg("LABEL")
        .arg("-o")
        .arg("value")
        .arg(device)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

fn mount_and_read(device: &str) -> Result<String> {
    std::fs::create_dir_all(SEED_MOUNT_POINT)?;

    nix::mount::mount(
        Some(device),
        SEED_MOUNT_POINT,
        Some("iso9660"),
        nix::mount::MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| Error::Internal(format!("mount {device}: {e}")))?;

    let result = std::fs::read_to_string(Path::new(SEED_MOUNT_POINT).join(NETWORK_CONFIG_FILE))
        .map_err(Error::from);

    if let Err(e) = nix::mount::umount(SEED_MOUNT_POINT) {
        tracing::warn!(error = %e, "failed to unmount cloud-init seed");
    }

    result
}

fn read_iface_mac(name: &str) -> Result<Option<String>> {
    let path = format!("/sys/class/net/{name}/address");
    match std::fs::read_to_string(&path) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_network_config() {
        let yaml = r#"
version: 2
ethernets:
  eth0:
    match:
      macaddress: "52:54:00:12:34:56"
    addresses:
      - 10.0.2.15/24
    gateway4: 10.0.2.2
    routes:
      - to: 10.0.3.0/24
        via: 10.0.2.1
"#;
        let config: NetworkConfig = serde_yaml::from_str(yaml).unwrap();
        let eth0 = &config.ethernets["eth0"];
        assert_eq!(eth0.addresses, vec!["10.0.2.15/24".to_string()]);
        assert_eq!(eth0.gateway4.as_deref(), Some("10.0.2.2"));
        assert_eq!(eth0.routes.len(), 1);
        assert_eq!(
            eth0.match_.as_ref().and_then(|m| m.macaddress.as_deref()),
            Some("52:54:00:12:34:56")
        );
    }

    #[test]
    fn nocloud_marker_absent_by_default() {
        // Under test, /sys/class/dmi paths either don't exist or don't
        // contain the marker; this should never panic and should return
        // false rather than erroring.
        let _ = nocloud_marker_present();
    }
}
