//! Interface and routing table management, backed by `rtnetlink`: link
//! up/down, address add/del, route list/add/del.

use std::net::IpAddr;
use std::sync::Arc;

use futures::stream::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::{RouteAddress, RouteAttribute};
use netlink_packet_route::AddressFamily;
use rtnetlink::Handle;
use tonic::{Request, Response, Status};

use agent_proto::network_server::Network;
use agent_proto::{
    GetInterfacesResponse, GetRouteListResponse, IPAddrRequest, InetFamily, InterfaceInfo,
    InterfaceRequest, RouteInfo, RouteRequest,
};

use crate::error::{Error, Result};
use crate::server::ServerState;

pub struct NetworkService {
    #[allow(dead_code)]
    state: Arc<ServerState>,
}

impl NetworkService {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

pub(crate) async fn open_handle() -> Result<Handle> {
    let (conn, handle, _) =
        rtnetlink::new_connection().map_err(|e| Error::Netlink(e.to_string()))?;
    tokio::spawn(conn);
    Ok(handle)
}

pub(crate) async fn link_index_by_name(handle: &Handle, name: &str) -> Result<u32> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links
        .try_next()
        .await
        .map_err(|e| Error::Netlink(e.to_string()))?
    {
        Some(msg) => Ok(msg.header.index),
        None => Err(Error::NotFound(format!("no such interface: {name}"))),
    }
}

pub(crate) fn link_attrs(msg: &netlink_packet_route::link::LinkMessage) -> (String, String, bool) {
    let mut name = String::new();
    let mut hw_addr = String::new();
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = n.clone(),
            LinkAttribute::Address(bytes) => {
                hw_addr = bytes
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(":");
            }
            _ => {}
        }
    }
    let up = msg
        .header
        .flags
        .contains(netlink_packet_route::link::LinkFlags::Up);
    (name, hw_addr, up)
}

pub(crate) async fn addresses_for(handle: &Handle, index: u32) -> Result<Vec<String>> {
    let mut addrs = handle.address().get().set_link_index_filter(index).execute();
    let mut out = Vec::new();
    while let Some(msg) = addrs
        .try_next()
        .await
        .map_err(|e| Error::Netlink(e.to_string()))?
    {
        for attr in &msg.attributes {
            if let AddressAttribute::Address(addr) = attr {
                out.push(format!("{addr}/{}", msg.header.prefix_len));
            }
        }
    }
    Ok(out)
}

fn route_attrs(msg: &netlink_packet_route::route::RouteMessage) -> (Option<String>, Option<String>, Option<u32>) {
    let mut dst = None;
    let mut gw = None;
    let mut oif = None;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(RouteAddress::Inet(a)) => {
                dst = Some(format!("{a}/{}", msg.header.destination_prefix_length))
            }
            RouteAttribute::Destination(RouteAddress::Inet6(a)) => {
                dst = Some(format!("{a}/{}", msg.header.destination_prefix_length))
            }
            RouteAttribute::Gateway(RouteAddress::Inet(a)) => gw = Some(a.to_string()),
            RouteAttribute::Gateway(RouteAddress::Inet6(a)) => gw = Some(a.to_string()),
            RouteAttribute::Oif(idx) => oif = Some(*idx),
            _ => {}
        }
    }
    (dst, gw, oif)
}

#[tonic::async_trait]
impl Network for NetworkService {
    async fn get_interfaces(&self, _request: Request<()>) -> Result<Response<GetInterfacesResponse>, Status> {
        let handle = open_handle().await?;
        let mut links = handle.link().get().execute();
        let mut interfaces = Vec::new();
        while let Some(msg) = links
            .try_next()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?
        {
            let index = msg.header.index;
            let (name, hw_addr, up) = link_attrs(&msg);
            let addresses = addresses_for(&handle, index).await?;
            interfaces.push(InterfaceInfo {
                index,
                name,
                hw_addr,
                up,
                addresses,
            });
        }
        Ok(Response::new(GetInterfacesResponse { interfaces }))
    }

    async fn set_interface_link_up(&self, request: Request<InterfaceRequest>) -> Result<Response<()>, Status> {
        let name = request.into_inner().name;
        let handle = open_handle().await?;
        let index = link_index_by_name(&handle, &name).await?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?;
        Ok(Response::new(()))
    }

    async fn set_interface_link_down(&self, request: Request<InterfaceRequest>) -> Result<Response<()>, Status> {
        let name = request.into_inner().name;
        let handle = open_handle().await?;
        let index = link_index_by_name(&handle, &name).await?;
        handle
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?;
        Ok(Response::new(()))
    }

    async fn add_ip_addr(&self, request: Request<IPAddrRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        let net: IpNet = req
            .cidr
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid cidr: {}", req.cidr)))?;
        let handle = open_handle().await?;
        let index = link_index_by_name(&handle, &req.name).await?;
        handle
            .address()
            .add(index, net.addr(), net.prefix_len())
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?;
        Ok(Response::new(()))
    }

    async fn del_ip_addr(&self, request: Request<IPAddrRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        let net: IpNet = req
            .cidr
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid cidr: {}", req.cidr)))?;
        let handle = open_handle().await?;
        let index = link_index_by_name(&handle, &req.name).await?;

        let mut addrs = handle.address().get().set_link_index_filter(index).execute();
        while let Some(msg) = addrs
            .try_next()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?
        {
            let matches = msg.attributes.iter().any(|attr| {
                matches!(attr, AddressAttribute::Address(a) if *a == net.addr())
            });
            if matches {
                handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| Error::Netlink(e.to_string()))?;
                return Ok(Response::new(()));
            }
        }
        Err(Error::NotFound(format!("address not present: {}", req.cidr)).into())
    }

    async fn get_route_list(&self, _request: Request<()>) -> Result<Response<GetRouteListResponse>, Status> {
        let handle = open_handle().await?;
        let mut routes = Vec::new();
        for (family, inet_family) in [
            (AddressFamily::Inet, InetFamily::Inet),
            (AddressFamily::Inet6, InetFamily::Inet6),
        ] {
            let mut stream = handle.route().get(family).execute();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| Error::Netlink(e.to_string()))?
            {
                let (destination, gateway, oif) = route_attrs(&msg);
                routes.push(RouteInfo {
                    family: inet_family as i32,
                    destination: destination.unwrap_or_else(|| "0.0.0.0".to_string()),
                    gateway: gateway.unwrap_or_default(),
                    out_if_index: oif.unwrap_or(0),
                    table: msg.header.table as u32,
                    scope: msg.header.scope as u32,
                });
            }
        }
        Ok(Response::new(GetRouteListResponse { routes }))
    }

    async fn add_route(&self, request: Request<RouteRequest>) -> Result<Response<()>, Status> {
        apply_route(request.into_inner(), true).await?;
        Ok(Response::new(()))
    }

    async fn del_route(&self, request: Request<RouteRequest>) -> Result<Response<()>, Status> {
        apply_route(request.into_inner(), false).await?;
        Ok(Response::new(()))
    }
}

async fn apply_route(request: RouteRequest, add: bool) -> Result<()> {
    let route = request
        .route
        .ok_or_else(|| Error::InvalidArgument("missing route".to_string()))?;
    let handle = open_handle().await?;
    let dest: IpNet = route
        .destination
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid destination: {}", route.destination)))?;

    match dest.addr() {
        IpAddr::V4(addr) => {
            let mut req = if add {
                handle.route().add().v4()
            } else {
                return del_route_v4(&handle, &route).await;
            };
            req = req.destination_prefix(addr, dest.prefix_len());
            if !route.gateway.is_empty() {
                let gw: std::net::Ipv4Addr = route
                    .gateway
                    .parse()
                    .map_err(|_| Error::InvalidArgument(format!("invalid gateway: {}", route.gateway)))?;
                req = req.gateway(gw);
            }
            if route.out_if_index != 0 {
                req = req.output_interface(route.out_if_index);
            }
            if route.table != 0 {
                req = req.table_id(route.table);
            }
            req.execute().await.map_err(|e| Error::Netlink(e.to_string()))
        }
        IpAddr::V6(addr) => {
            let mut req = if add {
                handle.route().add().v6()
            } else {
                return del_route_v6(&handle, &route).await;
            };
            req = req.destination_prefix(addr, dest.prefix_len());
            if !route.gateway.is_empty() {
                let gw: std::net::Ipv6Addr = route
                    .gateway
                    .parse()
                    .map_err(|_| Error::InvalidArgument(format!("invalid gateway: {}", route.gateway)))?;
                req = req.gateway(gw);
            }
            if route.out_if_index != 0 {
                req = req.output_interface(route.out_if_index);
            }
            if route.table != 0 {
                req = req.table_id(route.table);
            }
            req.execute().await.map_err(|e| Error::Netlink(e.to_string()))
        }
    }
}

async fn del_route_v4(handle: &Handle, route: &RouteInfo) -> Result<()> {
    let mut stream = handle.route().get(AddressFamily::Inet).execute();
    while let Some(msg) = stream
        .try_next()
        .await
        .map_err(|e| Error::Netlink(e.to_string()))?
    {
        let (destination, _, _) = route_attrs(&msg);
        if destination.as_deref() == Some(route.destination.as_str()) {
            handle
                .route()
                .del(msg)
                .execute()
                .await
                .map_err(|e| Error::Netlink(e.to_string()))?;
            return Ok(());
        }
    }
    Err(Error::NotFound(format!("route not present: {}", route.destination)))
}

async fn del_route_v6(handle: &Handle, route: &RouteInfo) -> Result<()> {
    let mut stream = handle.route().get(AddressFamily::Inet6).execute();
    while let Some(msg) = stream
        .try_next()
        .await
        .map_err(|e| Error::Netlink(e.to_string()))?
    {
        let (destination, _, _) = route_attrs(&msg);
        if destination.as_deref() == Some(route.destination.as_str()) {
            handle
                .route()
                .del(msg)
                .execute()
                .await
                .map_err(|e| Error::Netlink(e.to_string()))?;
            return Ok(());
        }
    }
    Err(Error::NotFound(format!("route not present: {}", route.destination)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_route::link::{LinkFlags, LinkHeader, LinkMessage};

    #[test]
    fn link_attrs_extracts_name_and_hwaddr() {
        let mut msg = LinkMessage::default();
        msg.header = LinkHeader {
            flags: LinkFlags::Up | LinkFlags::Running,
            ..Default::default()
        };
        msg.attributes.push(LinkAttribute::IfName("eth0".to_string()));
        msg.attributes
            .push(LinkAttribute::Address(vec![0x02, 0x42, 0xac, 0x11, 0x00, 0x02]));

        let (name, hw_addr, up) = link_attrs(&msg);
        assert_eq!(name, "eth0");
        assert_eq!(hw_addr, "02:42:ac:11:00:02");
        assert!(up);
    }

    #[test]
    fn link_attrs_reports_down_when_flag_absent() {
        let msg = LinkMessage::default();
        let (_, _, up) = link_attrs(&msg);
        assert!(!up);
    }
}
