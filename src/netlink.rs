use std::net::{IpAddr, Ipv4Addr};

use netlink_packet_core::{
    NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST,
};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{
    InfoData, InfoKind, InfoVeth, LinkAttribute, LinkFlags, LinkInfo, LinkMessage,
};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteProtocol, RouteScope, RouteType,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use nix::errno::Errno;

use crate::{Error, Result};

/// Sends one rtnetlink request and collects the kernel's answers until
/// the ACK or the end of the dump. Kernel-reported errnos surface as
/// [`Error::Os`] so callers can tolerate EEXIST and friends.
fn request(message: RouteNetlinkMessage, flags: u16) -> Result<Vec<RouteNetlinkMessage>> {
    let mut socket = Socket::new(NETLINK_ROUTE)
        .map_err(|v| Error::NetlinkFailed(format!("cannot open socket: {v}")))?;
    socket
        .bind_auto()
        .map_err(|v| Error::NetlinkFailed(format!("cannot bind socket: {v}")))?;
    socket
        .connect(&SocketAddr::new(0, 0))
        .map_err(|v| Error::NetlinkFailed(format!("cannot connect socket: {v}")))?;

    let mut packet = NetlinkMessage::from(message);
    packet.header.flags = flags;
    packet.header.sequence_number = 1;
    packet.finalize();
    let mut buf = vec![0u8; packet.buffer_len()];
    packet.serialize(&mut buf);
    socket
        .send(&buf, 0)
        .map_err(|v| Error::NetlinkFailed(format!("cannot send request: {v}")))?;

    let mut responses = Vec::new();
    let mut recv_buf = vec![0u8; 65536];
    loop {
        let size = socket
            .recv(&mut &mut recv_buf[..], 0)
            .map_err(|v| Error::NetlinkFailed(format!("cannot receive response: {v}")))?;
        let mut offset = 0;
        while offset < size {
            let reply: NetlinkMessage<RouteNetlinkMessage> =
                NetlinkMessage::deserialize(&recv_buf[offset..])
                    .map_err(|v| Error::NetlinkFailed(format!("cannot parse response: {v}")))?;
            let length = reply.header.length as usize;
            match reply.payload {
                NetlinkPayload::Done(_) => return Ok(responses),
                NetlinkPayload::Error(err) => match err.code {
                    // An error message without a code is the ACK.
                    None => return Ok(responses),
                    Some(code) => return Err(Errno::from_raw(-code.get()).into()),
                },
                NetlinkPayload::InnerMessage(inner) => responses.push(inner),
                _ => {}
            }
            if length == 0 {
                break;
            }
            offset += length;
        }
    }
}

fn ack_request(message: RouteNetlinkMessage, flags: u16) -> Result<()> {
    request(message, flags)?;
    Ok(())
}

/// Dumps all links as `(index, name)` pairs.
pub(crate) fn links() -> Result<Vec<(u32, String)>> {
    let replies = request(
        RouteNetlinkMessage::GetLink(LinkMessage::default()),
        NLM_F_REQUEST | NLM_F_DUMP,
    )?;
    let mut links = Vec::new();
    for reply in replies {
        if let RouteNetlinkMessage::NewLink(link) = reply {
            for attr in &link.attributes {
                if let LinkAttribute::IfName(name) = attr {
                    links.push((link.header.index, name.clone()));
                    break;
                }
            }
        }
    }
    Ok(links)
}

pub(crate) fn link_index(name: &str) -> Result<Option<u32>> {
    Ok(links()?
        .into_iter()
        .find(|(_, ifname)| ifname == name)
        .map(|(index, _)| index))
}

/// First interface that is not loopback, if any has appeared yet.
pub(crate) fn first_non_loopback() -> Result<Option<(u32, String)>> {
    Ok(links()?.into_iter().find(|(_, name)| name != "lo"))
}

pub(crate) fn create_bridge(name: &str) -> Result<()> {
    let mut link = LinkMessage::default();
    link.attributes.push(LinkAttribute::IfName(name.to_owned()));
    link.attributes
        .push(LinkAttribute::LinkInfo(vec![LinkInfo::Kind(
            InfoKind::Bridge,
        )]));
    ack_request(
        RouteNetlinkMessage::NewLink(link),
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
    )
}

pub(crate) fn create_veth(name: &str, peer: &str) -> Result<()> {
    let mut peer_link = LinkMessage::default();
    peer_link
        .attributes
        .push(LinkAttribute::IfName(peer.to_owned()));
    let mut link = LinkMessage::default();
    link.attributes.push(LinkAttribute::IfName(name.to_owned()));
    link.attributes.push(LinkAttribute::LinkInfo(vec![
        LinkInfo::Kind(InfoKind::Veth),
        LinkInfo::Data(InfoData::Veth(InfoVeth::Peer(peer_link))),
    ]));
    ack_request(
        RouteNetlinkMessage::NewLink(link),
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
    )
}

pub(crate) fn delete_link(index: u32) -> Result<()> {
    let mut link = LinkMessage::default();
    link.header.index = index;
    ack_request(RouteNetlinkMessage::DelLink(link), NLM_F_REQUEST | NLM_F_ACK)
}

pub(crate) fn link_set_up(index: u32) -> Result<()> {
    let mut link = LinkMessage::default();
    link.header.index = index;
    link.header.flags = LinkFlags::Up;
    link.header.change_mask = LinkFlags::Up;
    ack_request(RouteNetlinkMessage::SetLink(link), NLM_F_REQUEST | NLM_F_ACK)
}

/// Enslaves a link to a bridge.
pub(crate) fn link_set_controller(index: u32, controller: u32) -> Result<()> {
    let mut link = LinkMessage::default();
    link.header.index = index;
    link.attributes.push(LinkAttribute::Controller(controller));
    ack_request(RouteNetlinkMessage::SetLink(link), NLM_F_REQUEST | NLM_F_ACK)
}

/// Moves a link into the network namespace of the given process.
pub(crate) fn link_set_netns(index: u32, pid: nix::libc::pid_t) -> Result<()> {
    let mut link = LinkMessage::default();
    link.header.index = index;
    link.attributes.push(LinkAttribute::NetNsPid(pid as u32));
    ack_request(RouteNetlinkMessage::SetLink(link), NLM_F_REQUEST | NLM_F_ACK)
}

/// Renames a link. The link must be down.
pub(crate) fn link_set_name(index: u32, name: &str) -> Result<()> {
    let mut link = LinkMessage::default();
    link.header.index = index;
    link.attributes.push(LinkAttribute::IfName(name.to_owned()));
    ack_request(RouteNetlinkMessage::SetLink(link), NLM_F_REQUEST | NLM_F_ACK)
}

/// Assigns an IPv4 address. Already-assigned is not an error.
pub(crate) fn address_add(index: u32, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
    let mut message = AddressMessage::default();
    message.header.family = AddressFamily::Inet;
    message.header.prefix_len = prefix_len;
    message.header.index = index;
    message
        .attributes
        .push(AddressAttribute::Local(IpAddr::V4(addr)));
    message
        .attributes
        .push(AddressAttribute::Address(IpAddr::V4(addr)));
    match ack_request(
        RouteNetlinkMessage::NewAddress(message),
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
    ) {
        Err(Error::Os(Errno::EEXIST)) => Ok(()),
        other => other,
    }
}

/// Installs the default route through the given gateway.
pub(crate) fn route_add_default(gateway: Ipv4Addr) -> Result<()> {
    let mut message = RouteMessage::default();
    message.header.address_family = AddressFamily::Inet;
    message.header.table = RouteHeader::RT_TABLE_MAIN;
    message.header.protocol = RouteProtocol::Boot;
    message.header.scope = RouteScope::Universe;
    message.header.kind = RouteType::Unicast;
    message
        .attributes
        .push(RouteAttribute::Gateway(RouteAddress::Inet(gateway)));
    match ack_request(
        RouteNetlinkMessage::NewRoute(message),
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
    ) {
        Err(Error::Os(Errno::EEXIST)) => Ok(()),
        other => other,
    }
}

/// Asks the kernel which interface a packet to `dest` would leave by.
pub(crate) fn route_lookup_oif(dest: Ipv4Addr) -> Result<Option<u32>> {
    let mut message = RouteMessage::default();
    message.header.address_family = AddressFamily::Inet;
    message.header.destination_prefix_length = 32;
    message
        .attributes
        .push(RouteAttribute::Destination(RouteAddress::Inet(dest)));
    let replies = request(
        RouteNetlinkMessage::GetRoute(message),
        NLM_F_REQUEST | NLM_F_ACK,
    )?;
    for reply in replies {
        if let RouteNetlinkMessage::NewRoute(route) = reply {
            for attr in &route.attributes {
                if let RouteAttribute::Oif(index) = attr {
                    return Ok(Some(*index));
                }
            }
        }
    }
    Ok(None)
}

/// Scans the main table for a default route's output interface.
pub(crate) fn default_route_oif() -> Result<Option<u32>> {
    let mut message = RouteMessage::default();
    message.header.address_family = AddressFamily::Inet;
    let replies = request(
        RouteNetlinkMessage::GetRoute(message),
        NLM_F_REQUEST | NLM_F_DUMP,
    )?;
    for reply in replies {
        if let RouteNetlinkMessage::NewRoute(route) = reply {
            if route.header.destination_prefix_length != 0 {
                continue;
            }
            if route.header.table != RouteHeader::RT_TABLE_MAIN {
                continue;
            }
            for attr in &route.attributes {
                if let RouteAttribute::Oif(index) = attr {
                    return Ok(Some(*index));
                }
            }
        }
    }
    Ok(None)
}

pub(crate) fn link_name(index: u32) -> Result<Option<String>> {
    Ok(links()?
        .into_iter()
        .find(|(ifindex, _)| *ifindex == index)
        .map(|(_, name)| name))
}
