//! rtnetlink wire structures.
//!
//! Exact layouts with explicit sizes (16, 16, 8, 12, 4 bytes), integers
//! little-endian, attributes padded to 4-byte boundaries. Nothing here
//! relies on host struct packing.

use crate::{Error, Result};

/// `NLMSG_NOOP` — ignored.
pub const NLMSG_NOOP: u16 = 1;
/// `NLMSG_ERROR` — status carrier; code 0 is an ACK.
pub const NLMSG_ERROR: u16 = 2;
/// `NLMSG_DONE` — terminates a multi-part dump.
pub const NLMSG_DONE: u16 = 3;
/// `NLMSG_OVERRUN` — receive buffer overrun.
pub const NLMSG_OVERRUN: u16 = 4;

/// `RTM_NEWLINK`.
pub const RTM_NEWLINK: u16 = 16;
/// `RTM_GETLINK`.
pub const RTM_GETLINK: u16 = 18;
/// `RTM_NEWADDR`.
pub const RTM_NEWADDR: u16 = 20;
/// `RTM_NEWROUTE`.
pub const RTM_NEWROUTE: u16 = 24;

/// Request flag.
pub const NLM_F_REQUEST: u16 = 0x0001;
/// More responses follow.
pub const NLM_F_MULTI: u16 = 0x0002;
/// Request an acknowledgment.
pub const NLM_F_ACK: u16 = 0x0004;
/// Dump the whole table (`ROOT | MATCH`).
pub const NLM_F_DUMP: u16 = 0x0300;
/// Create the object if it does not exist.
pub const NLM_F_CREATE: u16 = 0x0400;
/// Fail if the object already exists.
pub const NLM_F_EXCL: u16 = 0x0200;

/// Interface name attribute on link messages.
pub const IFLA_IFNAME: u16 = 3;
/// Peer address attribute on address messages.
pub const IFA_ADDRESS: u16 = 1;
/// Local address attribute on address messages.
pub const IFA_LOCAL: u16 = 2;
/// Route destination.
pub const RTA_DST: u16 = 1;
/// Route output interface.
pub const RTA_OIF: u16 = 4;
/// Route gateway.
pub const RTA_GATEWAY: u16 = 5;
/// Route preferred source address.
pub const RTA_PREFSRC: u16 = 7;

/// `AF_INET` for payload family fields.
pub const AF_INET: u8 = 2;
/// Interface is administratively up.
pub const IFF_UP: u32 = 0x1;
/// Change mask selecting every flag.
pub const DEFAULT_CHANGE: u32 = 0xFFFF_FFFF;
/// Main routing table.
pub const RT_TABLE_MAIN: u8 = 254;
/// Route installed by the kernel.
pub const RTPROT_KERNEL: u8 = 2;
/// Route installed during boot.
pub const RTPROT_BOOT: u8 = 3;
/// Global scope.
pub const RT_SCOPE_UNIVERSE: u8 = 0;
/// Link-local scope.
pub const RT_SCOPE_LINK: u8 = 253;
/// Unicast route.
pub const RTN_UNICAST: u8 = 1;

/// Size of [`NetlinkMessageHeader`] on the wire.
pub const HEADER_LEN: usize = 16;

/// Rounds a length up to the 4-byte attribute alignment.
pub const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// The 16-byte header fronting every netlink message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetlinkMessageHeader {
    /// Total message length, header included, padding included.
    pub len: u32,
    /// Message type.
    pub kind: u16,
    /// Request/response flags.
    pub flags: u16,
    /// Sequence number echoed by responses.
    pub seq: u32,
    /// Sending port id; 0 for the kernel.
    pub pid: u32,
}

impl NetlinkMessageHeader {
    /// Serializes the header.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut b = [0u8; HEADER_LEN];
        b[0..4].copy_from_slice(&self.len.to_le_bytes());
        b[4..6].copy_from_slice(&self.kind.to_le_bytes());
        b[6..8].copy_from_slice(&self.flags.to_le_bytes());
        b[8..12].copy_from_slice(&self.seq.to_le_bytes());
        b[12..16].copy_from_slice(&self.pid.to_le_bytes());
        b
    }

    /// Parses a header from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::RecvUnmarshal(format!(
                "{} bytes is too short for a netlink header",
                data.len()
            )));
        }
        Ok(Self {
            len: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            kind: u16::from_le_bytes([data[4], data[5]]),
            flags: u16::from_le_bytes([data[6], data[7]]),
            seq: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            pid: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
        })
    }
}

/// `ifinfomsg`, 16 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Address family; 0 for link operations.
    pub family: u8,
    /// Device type.
    pub kind: u16,
    /// Interface index; 0 matches any in dumps.
    pub index: i32,
    /// Device flags.
    pub flags: u32,
    /// Mask of flags to change.
    pub change: u32,
}

impl InterfaceInfo {
    /// Serialized size.
    pub const LEN: usize = 16;

    /// Serializes the payload.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0] = self.family;
        // byte 1 is padding
        b[2..4].copy_from_slice(&self.kind.to_le_bytes());
        b[4..8].copy_from_slice(&self.index.to_le_bytes());
        b[8..12].copy_from_slice(&self.flags.to_le_bytes());
        b[12..16].copy_from_slice(&self.change.to_le_bytes());
        b
    }

    /// Parses the payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(Error::UnexpectedInfo);
        }
        Ok(Self {
            family: data[0],
            kind: u16::from_le_bytes([data[2], data[3]]),
            index: i32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            flags: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            change: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
        })
    }
}

/// `ifaddrmsg`, 8 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressInfo {
    /// Address family.
    pub family: u8,
    /// Prefix length of the address.
    pub prefix_len: u8,
    /// Address flags.
    pub flags: u8,
    /// Address scope.
    pub scope: u8,
    /// Interface index.
    pub index: u32,
}

impl AddressInfo {
    /// Serialized size.
    pub const LEN: usize = 8;

    /// Serializes the payload.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0] = self.family;
        b[1] = self.prefix_len;
        b[2] = self.flags;
        b[3] = self.scope;
        b[4..8].copy_from_slice(&self.index.to_le_bytes());
        b
    }

    /// Parses the payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(Error::UnexpectedInfo);
        }
        Ok(Self {
            family: data[0],
            prefix_len: data[1],
            flags: data[2],
            scope: data[3],
            index: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}

/// `rtmsg`, 12 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteInfo {
    /// Address family.
    pub family: u8,
    /// Destination prefix length.
    pub dst_len: u8,
    /// Source prefix length.
    pub src_len: u8,
    /// Type of service.
    pub tos: u8,
    /// Routing table id.
    pub table: u8,
    /// Route origin protocol.
    pub protocol: u8,
    /// Route scope.
    pub scope: u8,
    /// Route type.
    pub kind: u8,
    /// Route flags.
    pub flags: u32,
}

impl RouteInfo {
    /// Serialized size.
    pub const LEN: usize = 12;

    /// Serializes the payload.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0] = self.family;
        b[1] = self.dst_len;
        b[2] = self.src_len;
        b[3] = self.tos;
        b[4] = self.table;
        b[5] = self.protocol;
        b[6] = self.scope;
        b[7] = self.kind;
        b[8..12].copy_from_slice(&self.flags.to_le_bytes());
        b
    }

    /// Parses the payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(Error::UnexpectedInfo);
        }
        Ok(Self {
            family: data[0],
            dst_len: data[1],
            src_len: data[2],
            tos: data[3],
            table: data[4],
            protocol: data[5],
            scope: data[6],
            kind: data[7],
            flags: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// One `rtattr`: a 4-byte header plus payload, padded to 4 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtAttribute {
    /// Attribute type.
    pub kind: u16,
    /// Attribute payload, unpadded.
    pub data: Vec<u8>,
}

impl RtAttribute {
    /// A new attribute from raw bytes.
    pub fn new(kind: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// A null-terminated string attribute (interface names).
    pub fn string(kind: u16, value: &str) -> Self {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        Self { kind, data }
    }

    /// The payload interpreted as a null-terminated string.
    pub fn as_string(&self) -> Option<String> {
        let end = self.data.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&self.data[..end]).ok().map(str::to_owned)
    }

    /// Serialized size including padding.
    pub fn wire_len(&self) -> usize {
        align4(4 + self.data.len())
    }

    /// Appends the encoded attribute to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let len = 4 + self.data.len();
        out.extend_from_slice(&(len as u16).to_le_bytes());
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(&self.data);
        out.resize(out.len() + (align4(len) - len), 0);
    }

    /// Parses a 4-byte-aligned attribute list.
    pub fn decode_list(mut data: &[u8]) -> Result<Vec<Self>> {
        let mut attrs = Vec::new();
        while !data.is_empty() {
            if data.len() < 4 {
                return Err(Error::UnexpectedOffset);
            }
            let len = usize::from(u16::from_le_bytes([data[0], data[1]]));
            let kind = u16::from_le_bytes([data[2], data[3]]);
            if len < 4 || len > data.len() {
                return Err(Error::UnexpectedOffset);
            }
            attrs.push(Self {
                kind,
                data: data[4..len].to_vec(),
            });
            let advance = align4(len).min(data.len());
            data = &data[advance..];
        }
        Ok(attrs)
    }
}
