//! Request/response driving over a netlink socket.

use std::net::Ipv4Addr;

use super::frame::{
    AF_INET, AddressInfo, DEFAULT_CHANGE, HEADER_LEN, IFA_ADDRESS, IFA_LOCAL, IFF_UP,
    IFLA_IFNAME, InterfaceInfo, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_MULTI,
    NLM_F_REQUEST, NLMSG_DONE, NLMSG_ERROR, NLMSG_NOOP, NLMSG_OVERRUN, NetlinkMessageHeader,
    RT_SCOPE_LINK, RT_SCOPE_UNIVERSE, RT_TABLE_MAIN, RTA_DST, RTA_GATEWAY, RTA_OIF, RTA_PREFSRC,
    RTM_GETLINK, RTM_NEWADDR, RTM_NEWLINK, RTM_NEWROUTE, RTN_UNICAST, RTPROT_BOOT, RTPROT_KERNEL,
    RouteInfo, RtAttribute, align4,
};
use super::socket::NetlinkSocket;
use crate::{Error, Ipv4Cidr, Result};

/// Receive buffer size; dumps arrive in datagrams up to this size.
const RECV_BUFFER: usize = 64 * 1024;

/// One interface from a link dump: its index plus raw attributes.
#[derive(Debug, Clone)]
pub struct Link {
    /// Kernel interface index.
    pub index: i32,
    /// Link attributes as received.
    pub attributes: Vec<RtAttribute>,
}

impl Link {
    /// The interface name from `IFLA_IFNAME`, when present.
    pub fn name(&self) -> Option<String> {
        self.attributes
            .iter()
            .find(|a| a.kind == IFLA_IFNAME)
            .and_then(RtAttribute::as_string)
    }
}

/// A synchronous rtnetlink session over one socket.
///
/// Single-owner: one outstanding request at a time, matching the
/// kernel's sequencing model.
#[derive(Debug)]
pub struct NetlinkSession<S: NetlinkSocket> {
    socket: S,
}

#[cfg(target_os = "linux")]
impl NetlinkSession<super::socket::RouteSocket> {
    /// Opens a session over a fresh `NETLINK_ROUTE` socket.
    pub fn route() -> Result<Self> {
        Ok(Self::new(super::socket::RouteSocket::new()?))
    }
}

impl<S: NetlinkSocket> NetlinkSession<S> {
    /// Wraps an existing socket.
    pub fn new(socket: S) -> Self {
        Self { socket }
    }

    /// Lists interfaces, optionally filtered by name.
    pub fn link_get(&mut self, interface: Option<&str>) -> Result<Vec<Link>> {
        let payload = InterfaceInfo::default().encode();
        let responses = self.round_trip(RTM_GETLINK, NLM_F_REQUEST | NLM_F_DUMP, &payload, &[])?;

        let mut links = Vec::new();
        for (header, body) in responses {
            if header.kind != RTM_NEWLINK {
                continue;
            }
            let info = InterfaceInfo::decode(&body)?;
            let attributes = RtAttribute::decode_list(&body[InterfaceInfo::LEN..])?;
            let link = Link {
                index: info.index,
                attributes,
            };
            if interface.is_none_or(|name| link.name().as_deref() == Some(name)) {
                links.push(link);
            }
        }
        Ok(links)
    }

    /// Toggles `IFF_UP` on the named interface.
    pub fn link_set(&mut self, interface: &str, up: bool) -> Result<()> {
        let index = self.interface_index(interface)?;
        let payload = InterfaceInfo {
            index,
            flags: if up { IFF_UP } else { 0 },
            change: DEFAULT_CHANGE,
            ..InterfaceInfo::default()
        }
        .encode();
        tracing::debug!(interface, up, "setting link state");
        self.round_trip(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, &payload, &[])?;
        Ok(())
    }

    /// Adds an IPv4 address with its prefix to an interface.
    pub fn address_add(&mut self, interface: &str, cidr: &Ipv4Cidr) -> Result<()> {
        let index = self.interface_index(interface)?;
        let payload = AddressInfo {
            family: AF_INET,
            prefix_len: cidr.prefix_length(),
            flags: 0,
            scope: RT_SCOPE_UNIVERSE,
            index: index as u32,
        }
        .encode();
        let address = cidr.address().octets();
        let attrs = [
            RtAttribute::new(IFA_LOCAL, address.to_vec()),
            RtAttribute::new(IFA_ADDRESS, address.to_vec()),
        ];
        tracing::debug!(interface, %cidr, "adding address");
        self.round_trip(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            &payload,
            &attrs,
        )?;
        Ok(())
    }

    /// Adds a link-scope route to `destination` sourced from
    /// `source`.
    pub fn route_add(
        &mut self,
        interface: &str,
        destination: &Ipv4Cidr,
        source: Ipv4Addr,
    ) -> Result<()> {
        let index = self.interface_index(interface)?;
        let payload = RouteInfo {
            family: AF_INET,
            dst_len: destination.prefix_length(),
            src_len: 0,
            tos: 0,
            table: RT_TABLE_MAIN,
            protocol: RTPROT_KERNEL,
            scope: RT_SCOPE_LINK,
            kind: RTN_UNICAST,
            flags: 0,
        }
        .encode();
        let attrs = [
            RtAttribute::new(RTA_DST, destination.lower().octets().to_vec()),
            RtAttribute::new(RTA_PREFSRC, source.octets().to_vec()),
            RtAttribute::new(RTA_OIF, (index as u32).to_le_bytes().to_vec()),
        ];
        tracing::debug!(interface, %destination, %source, "adding route");
        self.round_trip(
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            &payload,
            &attrs,
        )?;
        Ok(())
    }

    /// Adds the default route through `gateway`.
    pub fn route_add_default(&mut self, interface: &str, gateway: Ipv4Addr) -> Result<()> {
        let index = self.interface_index(interface)?;
        let payload = RouteInfo {
            family: AF_INET,
            dst_len: 0,
            src_len: 0,
            tos: 0,
            table: RT_TABLE_MAIN,
            protocol: RTPROT_BOOT,
            scope: RT_SCOPE_UNIVERSE,
            kind: RTN_UNICAST,
            flags: 0,
        }
        .encode();
        let attrs = [
            RtAttribute::new(RTA_GATEWAY, gateway.octets().to_vec()),
            RtAttribute::new(RTA_OIF, (index as u32).to_le_bytes().to_vec()),
        ];
        tracing::debug!(interface, %gateway, "adding default route");
        self.round_trip(
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            &payload,
            &attrs,
        )?;
        Ok(())
    }

    fn interface_index(&mut self, interface: &str) -> Result<i32> {
        let links = self.link_get(Some(interface))?;
        match links.as_slice() {
            [link] => Ok(link.index),
            [] => Err(Error::UnexpectedResultSet(format!(
                "no interface named {interface}"
            ))),
            _ => Err(Error::UnexpectedResultSet(format!(
                "{} interfaces named {interface}",
                links.len()
            ))),
        }
    }

    /// Sends one request and collects the response messages for its
    /// sequence number.
    fn round_trip(
        &mut self,
        kind: u16,
        flags: u16,
        payload: &[u8],
        attrs: &[RtAttribute],
    ) -> Result<Vec<(NetlinkMessageHeader, Vec<u8>)>> {
        let seq = next_sequence();
        let request = encode_request(kind, flags, seq, payload, attrs)?;
        self.socket.send(&request)?;

        let mut responses = Vec::new();
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut expect_more = true;
        while expect_more {
            let n = self.socket.recv(&mut buf)?;
            if n == 0 {
                return Err(Error::RecvUnmarshal("empty response datagram".into()));
            }
            let mut at = 0usize;
            while at + HEADER_LEN <= n {
                let header = NetlinkMessageHeader::decode(&buf[at..n])?;
                let total = header.len as usize;
                if total < HEADER_LEN || at + total > n {
                    return Err(Error::RecvUnmarshal(format!(
                        "message length {total} escapes the datagram"
                    )));
                }
                let body = &buf[at + HEADER_LEN..at + total];
                match header.kind {
                    NLMSG_ERROR => {
                        if body.len() < 4 {
                            return Err(Error::RecvUnmarshal(
                                "error message without a status".into(),
                            ));
                        }
                        let rc = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                        if rc != 0 {
                            return Err(Error::ResponseError(rc));
                        }
                        // rc 0 is the ACK terminating the exchange
                        return Ok(responses);
                    }
                    NLMSG_DONE => return Ok(responses),
                    NLMSG_NOOP | NLMSG_OVERRUN => {}
                    _ => responses.push((header, body.to_vec())),
                }
                expect_more = header.flags & NLM_F_MULTI != 0
                    && header.kind != NLMSG_DONE
                    && header.kind != NLMSG_ERROR
                    && header.kind != NLMSG_OVERRUN;
                at += align4(total);
            }
            if !expect_more {
                break;
            }
        }
        Ok(responses)
    }
}

/// Encodes one request frame: header, payload, aligned attributes.
pub(crate) fn encode_request(
    kind: u16,
    flags: u16,
    seq: u32,
    payload: &[u8],
    attrs: &[RtAttribute],
) -> Result<Vec<u8>> {
    let attrs_len: usize = attrs.iter().map(RtAttribute::wire_len).sum();
    let total = HEADER_LEN + payload.len() + attrs_len;
    let len = u32::try_from(total)
        .map_err(|_| Error::SendMarshal(format!("request of {total} bytes")))?;

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(
        &NetlinkMessageHeader {
            len,
            kind,
            flags,
            seq,
            pid: 0,
        }
        .encode(),
    );
    frame.extend_from_slice(payload);
    for attr in attrs {
        attr.encode_into(&mut frame);
    }
    Ok(frame)
}

/// Per-request pseudo-random sequence number.
fn next_sequence() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut h = RandomState::new().build_hasher();
    h.write_u64(u64::from(std::process::id()));
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    (h.finish() & 0xFFFF_FFFF) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted socket: records requests, replays queued responses.
    #[derive(Debug, Default)]
    struct ScriptedSocket {
        sent: Vec<Vec<u8>>,
        responses: VecDeque<Vec<u8>>,
    }

    impl NetlinkSocket for ScriptedSocket {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
            let Some(response) = self.responses.pop_front() else {
                return Err(Error::RecvUnmarshal("script exhausted".into()));
            };
            buf[..response.len()].copy_from_slice(&response);
            Ok(response.len())
        }
    }

    /// Builds an `NLMSG_ERROR` response echoing `request_header`.
    fn ack_for(request: &[u8], rc: i32) -> Vec<u8> {
        let request_header = NetlinkMessageHeader::decode(request).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(
            &NetlinkMessageHeader {
                len: (HEADER_LEN + 4 + HEADER_LEN) as u32,
                kind: NLMSG_ERROR,
                flags: 0,
                seq: request_header.seq,
                pid: 0,
            }
            .encode(),
        );
        frame.extend_from_slice(&rc.to_le_bytes());
        frame.extend_from_slice(&request_header.encode());
        frame
    }

    /// One RTM_NEWLINK dump record for (index, name), MULTI-flagged.
    fn link_record(index: i32, name: &str, seq: u32) -> Vec<u8> {
        let info = InterfaceInfo {
            index,
            flags: IFF_UP,
            ..InterfaceInfo::default()
        };
        let attr = RtAttribute::string(IFLA_IFNAME, name);
        let total = HEADER_LEN + InterfaceInfo::LEN + attr.wire_len();
        let mut frame = Vec::new();
        frame.extend_from_slice(
            &NetlinkMessageHeader {
                len: total as u32,
                kind: RTM_NEWLINK,
                flags: NLM_F_MULTI,
                seq,
                pid: 0,
            }
            .encode(),
        );
        frame.extend_from_slice(&info.encode());
        attr.encode_into(&mut frame);
        frame
    }

    fn done_frame(seq: u32) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(
            &NetlinkMessageHeader {
                len: (HEADER_LEN + 4) as u32,
                kind: NLMSG_DONE,
                flags: NLM_F_MULTI,
                seq,
                pid: 0,
            }
            .encode(),
        );
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame
    }

    #[test]
    fn link_set_encodes_golden_frame() {
        // golden wire image: header + ifinfomsg for index 3, IFF_UP,
        // full change mask
        let frame = encode_request(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK,
            0x01020304,
            &InterfaceInfo {
                index: 3,
                flags: IFF_UP,
                change: DEFAULT_CHANGE,
                ..InterfaceInfo::default()
            }
            .encode(),
            &[],
        )
        .unwrap();
        let golden: [u8; 32] = [
            32, 0, 0, 0, // len
            16, 0, // RTM_NEWLINK
            5, 0, // REQUEST | ACK
            4, 3, 2, 1, // seq
            0, 0, 0, 0, // pid
            0, 0, // family + pad
            0, 0, // device type
            3, 0, 0, 0, // index
            1, 0, 0, 0, // IFF_UP
            255, 255, 255, 255, // change mask
        ];
        assert_eq!(frame, golden);
    }

    #[test]
    fn link_dump_parses_multipart() {
        // dump records arrive in one datagram, DONE in the next; the
        // session ignores which seq the script chose
        let mut socket = ScriptedSocket::default();
        let mut datagram = link_record(3, "eth0", 7);
        datagram.extend_from_slice(&link_record(4, "lo", 7));
        socket.responses.push_back(datagram);
        socket.responses.push_back(done_frame(7));

        let mut session = NetlinkSession::new(socket);
        let links = session.link_get(None).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].index, 3);
        assert_eq!(links[0].name().as_deref(), Some("eth0"));
        assert_eq!(links[1].name().as_deref(), Some("lo"));
    }

    #[test]
    fn link_dump_filters_by_name() {
        let mut socket = ScriptedSocket::default();
        let mut datagram = link_record(3, "eth0", 7);
        datagram.extend_from_slice(&link_record(4, "lo", 7));
        socket.responses.push_back(datagram);
        socket.responses.push_back(done_frame(7));

        let mut session = NetlinkSession::new(socket);
        let links = session.link_get(Some("lo")).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].index, 4);
    }

    /// Socket that answers every request with a scripted reply built
    /// from the request itself.
    struct Autoresponder {
        replies: VecDeque<Vec<u8>>,
        on_send: Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>>>,
        sent: Vec<Vec<u8>>,
    }

    impl std::fmt::Debug for Autoresponder {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Autoresponder").finish()
        }
    }

    impl NetlinkSocket for Autoresponder {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sent.push(data.to_vec());
            for reply in (self.on_send)(data) {
                self.replies.push_back(reply);
            }
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
            let Some(reply) = self.replies.pop_front() else {
                return Err(Error::RecvUnmarshal("script exhausted".into()));
            };
            buf[..reply.len()].copy_from_slice(&reply);
            Ok(reply.len())
        }
    }

    fn autoresponder() -> Autoresponder {
        Autoresponder {
            replies: VecDeque::new(),
            sent: Vec::new(),
            on_send: Box::new(|request: &[u8]| {
                let header = NetlinkMessageHeader::decode(request).unwrap();
                if header.kind == RTM_GETLINK {
                    vec![link_record(3, "eth0", header.seq), done_frame(header.seq)]
                } else {
                    vec![ack_for(request, 0)]
                }
            }),
        }
    }

    #[test]
    fn link_set_sends_newlink_and_consumes_ack() {
        let mut session = NetlinkSession::new(autoresponder());
        session.link_set("eth0", true).unwrap();

        let sent = &session.socket.sent;
        assert_eq!(sent.len(), 2);
        // second frame is the RTM_NEWLINK set
        let header = NetlinkMessageHeader::decode(&sent[1]).unwrap();
        assert_eq!(header.kind, RTM_NEWLINK);
        assert_eq!(header.flags, NLM_F_REQUEST | NLM_F_ACK);
        let info = InterfaceInfo::decode(&sent[1][HEADER_LEN..]).unwrap();
        assert_eq!(info.index, 3);
        assert_eq!(info.flags, IFF_UP);
        assert_eq!(info.change, DEFAULT_CHANGE);
    }

    #[test]
    fn error_status_surfaces_as_response_error() {
        let mut responder = autoresponder();
        responder.on_send = Box::new(|request: &[u8]| {
            let header = NetlinkMessageHeader::decode(request).unwrap();
            if header.kind == RTM_GETLINK {
                vec![link_record(3, "eth0", header.seq), done_frame(header.seq)]
            } else {
                vec![ack_for(request, -17)] // -EEXIST
            }
        });
        let mut session = NetlinkSession::new(responder);
        let err = session
            .address_add("eth0", &Ipv4Cidr::parse("192.168.64.2/24").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::ResponseError(-17)));
    }

    #[test]
    fn address_add_wire_shape() {
        let mut session = NetlinkSession::new(autoresponder());
        session
            .address_add("eth0", &Ipv4Cidr::parse("192.168.64.2/24").unwrap())
            .unwrap();
        let sent = &session.socket.sent;
        let frame = &sent[1];
        let header = NetlinkMessageHeader::decode(frame).unwrap();
        assert_eq!(header.kind, RTM_NEWADDR);
        assert_eq!(
            header.flags,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL
        );
        let info = AddressInfo::decode(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(info.family, AF_INET);
        assert_eq!(info.prefix_len, 24);
        assert_eq!(info.index, 3);
        let attrs =
            RtAttribute::decode_list(&frame[HEADER_LEN + AddressInfo::LEN..]).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].kind, IFA_LOCAL);
        assert_eq!(attrs[0].data, vec![192, 168, 64, 2]);
        assert_eq!(attrs[1].kind, IFA_ADDRESS);
    }

    #[test]
    fn route_add_default_wire_shape() {
        let mut session = NetlinkSession::new(autoresponder());
        session
            .route_add_default("eth0", Ipv4Addr::new(192, 168, 64, 1))
            .unwrap();
        let frame = &session.socket.sent[1];
        let header = NetlinkMessageHeader::decode(frame).unwrap();
        assert_eq!(header.kind, RTM_NEWROUTE);
        let info = RouteInfo::decode(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(info.dst_len, 0);
        assert_eq!(info.protocol, RTPROT_BOOT);
        assert_eq!(info.scope, RT_SCOPE_UNIVERSE);
        assert_eq!(info.kind, RTN_UNICAST);
        let attrs = RtAttribute::decode_list(&frame[HEADER_LEN + RouteInfo::LEN..]).unwrap();
        assert_eq!(attrs[0].kind, RTA_GATEWAY);
        assert_eq!(attrs[0].data, vec![192, 168, 64, 1]);
        assert_eq!(attrs[1].kind, RTA_OIF);
        assert_eq!(attrs[1].data, 3u32.to_le_bytes().to_vec());
    }

    #[test]
    fn route_add_uses_kernel_protocol_and_link_scope() {
        let mut session = NetlinkSession::new(autoresponder());
        session
            .route_add(
                "eth0",
                &Ipv4Cidr::parse("192.168.64.0/24").unwrap(),
                Ipv4Addr::new(192, 168, 64, 2),
            )
            .unwrap();
        let frame = &session.socket.sent[1];
        let info = RouteInfo::decode(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(info.dst_len, 24);
        assert_eq!(info.protocol, RTPROT_KERNEL);
        assert_eq!(info.scope, RT_SCOPE_LINK);
        let attrs = RtAttribute::decode_list(&frame[HEADER_LEN + RouteInfo::LEN..]).unwrap();
        assert_eq!(attrs[0].kind, RTA_DST);
        assert_eq!(attrs[0].data, vec![192, 168, 64, 0]);
        assert_eq!(attrs[1].kind, RTA_PREFSRC);
    }

    #[test]
    fn missing_interface_is_unexpected_result_set() {
        let mut session = NetlinkSession::new(autoresponder());
        let err = session.link_set("wlan9", true).unwrap_err();
        assert!(matches!(err, Error::UnexpectedResultSet(_)));
    }
}
